//! Domain types for the devpulse registry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use devpulse_core::{RunMode, ServiceType};

/// Lifecycle status of a registered service.
///
/// Health is not stored here; it is computed by health checks and only
/// folded back into this vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Starting,
    Ready,
    Running,
    Stopping,
    Stopped,
    Error,
    Degraded,
    Building,
    Built,
    Completed,
    Failed,
    Watching,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Starting => "starting",
            RunStatus::Ready => "ready",
            RunStatus::Running => "running",
            RunStatus::Stopping => "stopping",
            RunStatus::Stopped => "stopped",
            RunStatus::Error => "error",
            RunStatus::Degraded => "degraded",
            RunStatus::Building => "building",
            RunStatus::Built => "built",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Watching => "watching",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "starting" => RunStatus::Starting,
            "ready" => RunStatus::Ready,
            "running" => RunStatus::Running,
            "stopping" => RunStatus::Stopping,
            "stopped" => RunStatus::Stopped,
            "error" => RunStatus::Error,
            "degraded" => RunStatus::Degraded,
            "building" => RunStatus::Building,
            "built" => RunStatus::Built,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "watching" => RunStatus::Watching,
            other => return Err(format!("unknown run status: {other}")),
        };
        Ok(status)
    }
}

/// A running (or recently run) service as recorded by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceEntry {
    pub name: String,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub status: RunStatus,
    pub service_type: Option<ServiceType>,
    pub mode: Option<RunMode>,
    /// Unix timestamp (milliseconds) when the process was started.
    pub started_at_ms: Option<u64>,
    /// Unix timestamp (milliseconds) when the process exited.
    pub ended_at_ms: Option<u64>,
    /// Exit code of a finished build/task process (`None` while running
    /// or when the exit was not captured).
    pub exit_code: Option<i32>,
    /// Unix timestamp (milliseconds) of the last registry write.
    pub last_checked_ms: u64,
    pub error: Option<String>,
}

impl ServiceEntry {
    /// A fresh entry with only a name and status.
    pub fn new(name: impl Into<String>, status: RunStatus) -> Self {
        Self {
            name: name.into(),
            pid: None,
            port: None,
            url: None,
            status,
            service_type: None,
            mode: None,
            started_at_ms: None,
            ended_at_ms: None,
            exit_code: None,
            last_checked_ms: 0,
            error: None,
        }
    }
}

/// Published to subscribers whenever a service's status changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub name: String,
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Current Unix time in milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
