//! devpulse-health: the health monitoring engine for local dev services.
//!
//! Classifies every service of a project as healthy, degraded, unhealthy,
//! starting, or unknown from racy signals (a PID without an exit code, a
//! port briefly unbound during a restart), and folds the verdicts back
//! into the process registry without regressing services already up.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor::check(filter)
//!   ├── report cache (moka, TTL)
//!   ├── build service list ← registry (ServiceRegistry) + manifest
//!   ├── one task per service, bounded by a semaphore
//!   │   └── HealthChecker::check_service
//!   │       ├── ServiceRateLimiter (governor token bucket)
//!   │       ├── CircuitBreaker (closed / open / half-open)
//!   │       ├── ProcessCheck (build / task / output / plain)
//!   │       ├── custom check (URL, CMD, CMD-SHELL, NONE)
//!   │       ├── HTTP discovery + EndpointCache
//!   │       ├── TCP connect
//!   │       └── PID liveness
//!   ├── HealthSummary
//!   └── reconcile → ServiceRegistry::transition_status
//! ```
//!
//! # Startup grace
//!
//! Inside the grace window (30s, or the service's `start_period`) a
//! failing or inconclusive check reports `starting` instead. A healthy
//! signal is never downgraded.

pub mod breaker;
pub mod checker;
pub mod collaborators;
pub mod endpoint_cache;
pub mod error;
pub mod keyed;
pub mod limiter;
pub mod logs;
pub mod monitor;
pub mod probe;
mod process;
pub mod reconcile;
pub mod types;

pub use breaker::{BreakerRejection, BreakerSettings, BreakerState, CircuitBreaker};
pub use checker::{CheckerConfig, HealthChecker, COMMON_HEALTH_PATHS};
pub use collaborators::{ContainerRuntime, DockerCli, ProcessInspector, ServiceRegistry, SystemProcesses};
pub use endpoint_cache::{CachedEndpoint, EndpointCache};
pub use error::CheckError;
pub use limiter::ServiceRateLimiter;
pub use logs::{LogBook, LogBuffer, LogDirectory, LogSource, RingLogBuffer};
pub use monitor::{HealthMonitor, MonitorConfig};
pub use probe::ExecOutput;
pub use types::*;
