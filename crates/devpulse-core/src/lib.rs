//! devpulse-core: shared types and manifest parsing for devpulse.
//!
//! The manifest (`devpulse.yaml`) describes the services of a local
//! development project. The health engine only consumes a structured
//! view of it: service type, run mode, port hints, and a
//! Docker-Compose-shaped health check block.

pub mod config;
pub mod duration;
pub mod types;

pub use config::{
    ConfigError, HealthTest, HealthcheckKind, HealthcheckSpec, Manifest, ServiceConfig,
    MANIFEST_FILE,
};
pub use duration::{parse_duration, DurationError};
pub use types::*;
