//! Errors returned by decode and thumbnail services

use std::time::Duration;

use thiserror::Error;

/// Failures reported by external decode and batch services
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The service ran but could not produce a result
    #[error("Decode failed: {0}")]
    Failed(String),

    /// The call did not finish in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The service is not reachable
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// A blocking fallback job aborted
    #[error("Fallback decode aborted: {0}")]
    Aborted(String),
}
