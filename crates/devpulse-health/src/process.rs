//! Health of services without a network endpoint, judged from PID
//! liveness, recorded exit codes, and log output.
//!
//! ```text
//! build / task  ── running ──▶ building|running (starting in grace)
//!               ── exit 0  ──▶ built|completed
//!               ── exit n  ──▶ failed
//!               ── exited, code not yet captured ──▶ healthy + note
//! output check  ── pattern in logs ──▶ pattern_matched
//!               ── no match after grace ──▶ watching (watch mode) | pattern_not_matched
//! plain         ── PID liveness
//! ```

use devpulse_core::RunMode;

use crate::collaborators::ProcessInspector;
use crate::logs::LogSource;
use crate::types::{CheckDetails, CheckKind, CheckResult, HealthStatus, ProcessState, ServiceDescriptor};

pub(crate) const NOTE_EXIT_CODE_NOT_CAPTURED: &str = "exit code not captured";

pub(crate) struct ProcessCheck<'a> {
    pub svc: &'a ServiceDescriptor,
    pub in_grace: bool,
    pub processes: &'a dyn ProcessInspector,
    pub logs: &'a dyn LogSource,
}

impl ProcessCheck<'_> {
    pub fn run(&self) -> CheckResult {
        let mut result = CheckResult::new(&self.svc.name, HealthStatus::Unknown, CheckKind::Process);
        result.uptime = self.svc.uptime();
        result.pid = self.svc.pid;

        let one_shot = self.svc.mode.is_some_and(|m| m.is_one_shot());
        if one_shot {
            self.build_or_task(result)
        } else if let Some(pattern) = self
            .svc
            .healthcheck
            .as_ref()
            .and_then(|hc| hc.output_pattern())
        {
            self.output(result, pattern)
        } else {
            self.plain(result)
        }
    }

    fn pid_running(&self) -> bool {
        self.svc.pid.is_some_and(|pid| self.processes.is_running(pid))
    }

    fn grace_or(&self, otherwise: HealthStatus) -> HealthStatus {
        if self.in_grace {
            HealthStatus::Starting
        } else {
            otherwise
        }
    }

    fn build_or_task(&self, mut result: CheckResult) -> CheckResult {
        let is_build = self.svc.mode == Some(RunMode::Build);
        let (active, done) = if is_build {
            (ProcessState::Building, ProcessState::Built)
        } else {
            (ProcessState::Running, ProcessState::Completed)
        };

        if self.pid_running() {
            result.status = self.grace_or(HealthStatus::Healthy);
            result.details = Some(CheckDetails::with_state(active));
            return result;
        }

        if let Some(code) = self.svc.exit_code {
            if code == 0 {
                result.status = HealthStatus::Healthy;
                result.details = Some(CheckDetails {
                    exit_code: Some(0),
                    ..CheckDetails::with_state(done)
                });
            } else {
                result.status = HealthStatus::Unhealthy;
                result.error = Some(format!("process exited with code {code}"));
                result.details = Some(CheckDetails {
                    exit_code: Some(code),
                    ..CheckDetails::with_state(ProcessState::Failed)
                });
            }
            return result;
        }

        if self.svc.pid.is_some() {
            // Exited before the orchestrator recorded its exit code.
            result.status = HealthStatus::Healthy;
            result.details = Some(CheckDetails {
                note: Some(NOTE_EXIT_CODE_NOT_CAPTURED.to_string()),
                ..CheckDetails::with_state(done)
            });
            return result;
        }

        result.status = self.grace_or(HealthStatus::Unknown);
        if !self.in_grace {
            result.error = Some("no process information available".to_string());
        }
        result
    }

    fn output(&self, mut result: CheckResult, pattern: &str) -> CheckResult {
        let mut details = CheckDetails {
            check_type: Some("output".to_string()),
            pattern: Some(pattern.to_string()),
            ..CheckDetails::default()
        };

        if self.svc.pid.is_some() && !self.pid_running() {
            match self.svc.exit_code {
                Some(0) => {
                    result.status = HealthStatus::Healthy;
                    details.state = Some(ProcessState::Completed);
                    details.exit_code = Some(0);
                }
                Some(code) => {
                    result.status = HealthStatus::Unhealthy;
                    result.error = Some(format!("process exited with code {code} before pattern matched"));
                    details.state = Some(ProcessState::Failed);
                    details.exit_code = Some(code);
                }
                None => {
                    result.status = self.grace_or(HealthStatus::Unhealthy);
                    if !self.in_grace {
                        result.error = Some("process not running".to_string());
                    }
                }
            }
            result.details = Some(details);
            return result;
        }

        let Some(buffer) = self.logs.get_buffer(&self.svc.name) else {
            if self.in_grace {
                result.status = HealthStatus::Starting;
                details.state = Some(ProcessState::WaitingForLogs);
            } else {
                result.status = HealthStatus::Unknown;
                result.error = Some("log buffer not available".to_string());
            }
            result.details = Some(details);
            return result;
        };

        if buffer.contains_pattern(pattern) {
            result.status = HealthStatus::Healthy;
            details.state = Some(ProcessState::PatternMatched);
        } else if self.in_grace {
            result.status = HealthStatus::Starting;
            details.state = Some(ProcessState::WaitingForPattern);
        } else if self.svc.mode == Some(RunMode::Watch) {
            result.status = HealthStatus::Healthy;
            details.state = Some(ProcessState::Watching);
        } else {
            result.status = HealthStatus::Unhealthy;
            result.error = Some(format!("pattern {pattern:?} not found in output"));
            details.state = Some(ProcessState::PatternNotMatched);
        }
        result.details = Some(details);
        result
    }

    fn plain(&self, mut result: CheckResult) -> CheckResult {
        match self.svc.pid {
            Some(pid) if self.processes.is_running(pid) => {
                result.status = HealthStatus::Healthy;
            }
            Some(pid) => {
                result.status = self.grace_or(HealthStatus::Unhealthy);
                result.error = Some(format!("process {pid} not running"));
            }
            None => {
                result.status = self.grace_or(HealthStatus::Unknown);
                result.error = Some("no process ID available for health check".to_string());
            }
        }
        result
    }
}
