//! Receiver that writes events to the process log.

use kobs_core::ReceiverEvent;
use tracing::info;

use crate::{Receiver, ReceiverError};

pub const LOG_RECEIVER: &str = "log";

#[derive(Debug, Default, Clone)]
pub struct LogReceiver;

#[async_trait::async_trait]
impl Receiver for LogReceiver {
    fn name(&self) -> &str { LOG_RECEIVER }

    async fn handle(&self, event: &ReceiverEvent) -> Result<(), ReceiverError> {
        info!(
            key = %event.key,
            kind = %event.kind,
            crash_loop = event.metadata.crash_loop,
            users = ?event.metadata.user_ids,
            message = %event.message,
            "log receiver event"
        );
        Ok(())
    }
}
