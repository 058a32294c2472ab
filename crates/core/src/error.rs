//! Error taxonomy shared by the reconcile path.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("malformed resource key: {0:?} (expect name or namespace/name)")]
    Malformed(String),
}

/// Failure of a single reconcile attempt.
///
/// The controller classifies on the variant: `Malformed` items are skipped,
/// `Transient` ones are retried under the rate limiter.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("malformed queued item: {0}")]
    Malformed(#[from] KeyError),
    #[error("transient: {0}")]
    Transient(String),
}

impl ReconcileError {
    pub fn transient(msg: impl Into<String>) -> Self { Self::Transient(msg.into()) }

    pub fn is_retryable(&self) -> bool { matches!(self, Self::Transient(_)) }
}
