//! Error types for the health engine.

use std::time::Duration;

use thiserror::Error;

/// Failures that abort a single check before it produces a result.
///
/// The checker folds every variant into a `CheckResult`; callers of
/// `HealthChecker::check_service` never see these directly. `Tls` only
/// comes out of client construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckError {
    #[error("context cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Http(String),

    #[error("command failed: {0}")]
    Exec(String),

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("internal error: {0}")]
    Internal(String),
}
