//! Error and result types shared across every subsystem.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// One variant per failure kind the core can surface. No operation in this
/// crate panics or uses exception-style control flow; every fallible path
/// returns one of these.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failure: {0}")]
    AuthFailure(String),

    #[error("chain integrity compromised at index {at_index}")]
    ChainIntegrityError { at_index: usize },

    #[error("kill-switch activated, refusing further security-sensitive operations")]
    KillSwitchTripped,

    #[error("admission denied: omega {omega:.4} below threshold {threshold:.4}")]
    AdmissionDenied { omega: f64, threshold: f64 },

    #[error("key rotation stalled: {0}")]
    RotationStalled(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("chain log write failed: {0}")]
    ChainWriteError(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}
