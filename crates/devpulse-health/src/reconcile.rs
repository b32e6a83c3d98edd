//! Fold check results back into the registry's lifecycle vocabulary.

use devpulse_state::{RunStatus, StateError};
use tracing::{debug, warn};

use crate::collaborators::ServiceRegistry;
use crate::error::CheckError;
use crate::types::{CheckResult, HealthStatus, ProcessState};

/// The registry status a result should produce, or `None` to leave the
/// entry alone.
///
/// A stopped service is never resurrected, a `starting` result never
/// overwrites a service already known to be up, and a cancelled check
/// says nothing about the service at all.
pub fn reconciled_status(current: RunStatus, result: &CheckResult) -> Option<RunStatus> {
    if current == RunStatus::Stopped || is_cancelled(result) {
        return None;
    }
    if matches!(current, RunStatus::Running | RunStatus::Ready) && result.status == HealthStatus::Starting {
        return None;
    }

    let next = lifecycle_status(result).unwrap_or(match result.status {
        HealthStatus::Unhealthy => RunStatus::Error,
        HealthStatus::Degraded => RunStatus::Degraded,
        HealthStatus::Starting => RunStatus::Starting,
        HealthStatus::Healthy | HealthStatus::Unknown => RunStatus::Running,
    });
    (next != current).then_some(next)
}

fn is_cancelled(result: &CheckResult) -> bool {
    result.status == HealthStatus::Unknown
        && result.error.as_deref() == Some(CheckError::Cancelled.to_string().as_str())
}

/// Build/task results carry their own lifecycle label.
fn lifecycle_status(result: &CheckResult) -> Option<RunStatus> {
    if !result.service_mode.is_some_and(|m| m.is_one_shot()) {
        return None;
    }
    match result.state()? {
        ProcessState::Building => Some(RunStatus::Building),
        ProcessState::Built => Some(RunStatus::Built),
        ProcessState::Running => Some(RunStatus::Running),
        ProcessState::Completed => Some(RunStatus::Completed),
        ProcessState::Failed => Some(RunStatus::Failed),
        _ => None,
    }
}

/// Apply every result to the registry. Failures are logged and skipped.
///
/// Each decision is made against the status read in the same write
/// transaction, so a concurrent `stopped` is never overwritten.
pub fn reconcile(registry: &dyn ServiceRegistry, results: &[CheckResult]) {
    for result in results {
        let decide = |current: RunStatus| reconciled_status(current, result);
        match registry.transition_status(&result.service_name, &decide) {
            Ok(Some(change)) => {
                debug!(service = %change.name, from = %change.from, to = %change.to, "registry reconciled");
            }
            Ok(None) => {}
            Err(StateError::NotFound(_)) => {
                debug!(service = %result.service_name, "not in registry, skipping reconcile");
            }
            Err(e) => {
                warn!(service = %result.service_name, error = %e, "registry update failed");
            }
        }
    }
}
