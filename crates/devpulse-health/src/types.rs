//! Health check data model: statuses, per-service descriptors, results,
//! and the aggregated report.

use std::fmt;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use devpulse_core::{HealthcheckSpec, RunMode, ServiceType};
use devpulse_state::RunStatus;

/// Health classification of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Starting,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Starting => "starting",
            HealthStatus::Unknown => "unknown",
        }
    }

    /// Whether the circuit breaker counts this outcome as a failure.
    ///
    /// `starting` and `unknown` carry no evidence either way and are
    /// treated as non-failures.
    pub fn is_breaker_failure(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy | HealthStatus::Degraded)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Which tier of the cascade produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Http,
    Tcp,
    Process,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            CheckKind::Http => "http",
            CheckKind::Tcp => "tcp",
            CheckKind::Process => "process",
        })
    }
}

/// Lifecycle label attached to process-based results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Building,
    Running,
    Built,
    Completed,
    Failed,
    WaitingForLogs,
    WaitingForPattern,
    PatternMatched,
    PatternNotMatched,
    Watching,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Building => "building",
            ProcessState::Running => "running",
            ProcessState::Built => "built",
            ProcessState::Completed => "completed",
            ProcessState::Failed => "failed",
            ProcessState::WaitingForLogs => "waiting_for_logs",
            ProcessState::WaitingForPattern => "waiting_for_pattern",
            ProcessState::PatternMatched => "pattern_matched",
            ProcessState::PatternNotMatched => "pattern_not_matched",
            ProcessState::Watching => "watching",
        }
    }
}

/// Structured details of a check. Fields from an HTTP health response
/// body land in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ProcessState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CheckDetails {
    pub fn with_state(state: ProcessState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }
}

/// Snapshot of one service for a single check cycle.
///
/// Rebuilt every cycle from the registry and the manifest; each check
/// task owns its own copy.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub started_at: Option<SystemTime>,
    pub ended_at: Option<SystemTime>,
    pub service_type: Option<ServiceType>,
    pub mode: Option<RunMode>,
    pub registry_status: Option<RunStatus>,
    pub exit_code: Option<i32>,
    pub healthcheck: Option<HealthcheckSpec>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port: None,
            pid: None,
            started_at: None,
            ended_at: None,
            service_type: None,
            mode: None,
            registry_status: None,
            exit_code: None,
            healthcheck: None,
        }
    }

    /// Services with no network endpoint are judged on process state only.
    ///
    /// Without an explicit type, a port-less service is a process unless
    /// its health check names something else to probe (a URL or a
    /// command). An output pattern always means a process check.
    pub fn is_process_type(&self) -> bool {
        match self.service_type {
            Some(ServiceType::Process) => true,
            Some(_) => false,
            None if self.port.is_some() => false,
            None => match &self.healthcheck {
                None => true,
                Some(hc) => hc.output_pattern().is_some() || hc.test.is_none(),
            },
        }
    }

    pub fn is_container(&self) -> bool {
        self.service_type == Some(ServiceType::Container)
    }

    /// Time since start, frozen at the end time once the process exited.
    pub fn uptime(&self) -> Option<Duration> {
        let started = self.started_at?;
        let until = self.ended_at.unwrap_or_else(SystemTime::now);
        until.duration_since(started).ok()
    }

    /// Time elapsed since start (regardless of exit).
    pub fn since_start(&self) -> Option<Duration> {
        SystemTime::now().duration_since(self.started_at?).ok()
    }
}

/// Outcome of checking one service in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub service_name: String,
    pub status: HealthStatus,
    pub check_type: CheckKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(with = "millis")]
    pub response_time: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<CheckDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_millis")]
    pub uptime: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<ServiceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_mode: Option<RunMode>,
}

impl CheckResult {
    pub fn new(service_name: impl Into<String>, status: HealthStatus, check_type: CheckKind) -> Self {
        Self {
            service_name: service_name.into(),
            status,
            check_type,
            endpoint: None,
            response_time: Duration::ZERO,
            status_code: None,
            error: None,
            timestamp: Utc::now(),
            details: None,
            port: None,
            pid: None,
            uptime: None,
            service_type: None,
            service_mode: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// The lifecycle label from the details, if any.
    pub fn state(&self) -> Option<ProcessState> {
        self.details.as_ref().and_then(|d| d.state)
    }
}

/// Aggregate counts over a set of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub overall: HealthStatus,
}

impl HealthSummary {
    /// Pure aggregation over result statuses. `starting` counts as unknown.
    pub fn from_results(results: &[CheckResult]) -> Self {
        let mut summary = HealthSummary {
            total: results.len(),
            healthy: 0,
            degraded: 0,
            unhealthy: 0,
            unknown: 0,
            overall: HealthStatus::Unknown,
        };

        for result in results {
            match result.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Starting | HealthStatus::Unknown => summary.unknown += 1,
            }
        }

        summary.overall = if summary.unhealthy > 0 {
            HealthStatus::Unhealthy
        } else if summary.degraded > 0 {
            HealthStatus::Degraded
        } else if summary.healthy > 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unknown
        };
        summary
    }
}

/// One full check cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub project: String,
    pub services: Vec<CheckResult>,
    pub summary: HealthSummary,
}

impl HealthReport {
    pub fn new(project: impl Into<String>, services: Vec<CheckResult>) -> Self {
        let summary = HealthSummary::from_results(&services);
        Self {
            timestamp: Utc::now(),
            project: project.into(),
            services,
            summary,
        }
    }
}

/// Durations on the wire are integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
