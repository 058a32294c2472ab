//! kubeobserver receivers: pluggable notification sinks and the router that fans events out to them.

#![forbid(unsafe_code)]

use kobs_core::ReceiverEvent;
use thiserror::Error;

pub mod log;
pub mod registry;
pub mod router;

pub use log::LogReceiver;
pub use registry::ReceiverRegistry;
pub use router::{DispatchReport, EventRouter, RouterConfig};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReceiverError {
    #[error("delivery to {receiver} failed: {reason}")]
    Delivery { receiver: String, reason: String },
    #[error("receiver {receiver} timed out after {after_ms}ms")]
    Timeout { receiver: String, after_ms: u64 },
    #[error("receiver {receiver} panicked")]
    Panicked { receiver: String },
}

impl ReceiverError {
    pub fn delivery(receiver: &str, reason: impl Into<String>) -> Self {
        Self::Delivery { receiver: receiver.to_string(), reason: reason.into() }
    }
}

/// A notification backend.
///
/// `handle` resolves exactly once per event: `Ok(())` when delivered, an error
/// otherwise. The router waits for every receiver it dispatched to.
#[async_trait::async_trait]
pub trait Receiver: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &ReceiverEvent) -> Result<(), ReceiverError>;
}
