//! Shared types used across devpulse crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a service is run and reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    /// Serves HTTP on a port.
    Http,
    /// Listens on a TCP port without an HTTP surface.
    Tcp,
    /// A plain process with no network endpoint.
    Process,
    /// Runs inside a container.
    Container,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Http => "http",
            ServiceType::Tcp => "tcp",
            ServiceType::Process => "process",
            ServiceType::Container => "container",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(ServiceType::Http),
            "tcp" => Ok(ServiceType::Tcp),
            "process" => Ok(ServiceType::Process),
            "container" => Ok(ServiceType::Container),
            other => Err(format!("unknown service type: {other}")),
        }
    }
}

/// Lifecycle shape of a service process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Long-running server (the default).
    Service,
    /// One-shot build that exits when done.
    Build,
    /// One-shot task that exits when done.
    Task,
    /// Long-running watcher (compilers, bundlers in watch mode).
    Watch,
    /// Long-running background process.
    Daemon,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Service => "service",
            RunMode::Build => "build",
            RunMode::Task => "task",
            RunMode::Watch => "watch",
            RunMode::Daemon => "daemon",
        }
    }

    /// Build and task processes are expected to exit.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, RunMode::Build | RunMode::Task)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "service" => Ok(RunMode::Service),
            "build" => Ok(RunMode::Build),
            "task" => Ok(RunMode::Task),
            "watch" => Ok(RunMode::Watch),
            "daemon" => Ok(RunMode::Daemon),
            other => Err(format!("unknown run mode: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_type_round_trips_through_str() {
        for ty in [
            ServiceType::Http,
            ServiceType::Tcp,
            ServiceType::Process,
            ServiceType::Container,
        ] {
            assert_eq!(ty.as_str().parse::<ServiceType>().unwrap(), ty);
        }
        assert!("vm".parse::<ServiceType>().is_err());
    }

    #[test]
    fn one_shot_modes() {
        assert!(RunMode::Build.is_one_shot());
        assert!(RunMode::Task.is_one_shot());
        assert!(!RunMode::Watch.is_one_shot());
        assert!(!RunMode::Service.is_one_shot());
    }

    #[test]
    fn run_mode_serializes_snake_case() {
        let json = serde_json::to_string(&RunMode::Watch).unwrap();
        assert_eq!(json, "\"watch\"");
    }
}
