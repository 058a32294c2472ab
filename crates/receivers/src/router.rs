//! Concurrent fan-out of one event to every receiver it is routed to.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use kobs_core::{ReceiverEvent, WatchAnnotations};
use metrics::{counter, histogram};
use tracing::{debug, error, warn};

use crate::registry::ReceiverRegistry;
use crate::ReceiverError;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Appended to every receiver list.
    pub default_receiver: String,
    /// Per-receiver delivery bound. `None` waits for every receiver indefinitely.
    pub receiver_timeout: Option<Duration>,
}

impl Default for RouterConfig {
    fn default() -> Self { Self { default_receiver: crate::log::LOG_RECEIVER.to_string(), receiver_timeout: None } }
}

/// Aggregated outcome of one dispatch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    pub failed: Vec<ReceiverError>,
    pub unknown: Vec<String>,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize { self.delivered.len() + self.failed.len() }

    pub fn is_clean(&self) -> bool { self.failed.is_empty() && self.unknown.is_empty() }
}

#[derive(Debug, Clone)]
pub struct EventRouter {
    registry: Arc<ReceiverRegistry>,
    config: RouterConfig,
}

impl EventRouter {
    pub fn new(registry: Arc<ReceiverRegistry>, config: RouterConfig) -> Self { Self { registry, config } }

    pub fn registry(&self) -> &ReceiverRegistry { &self.registry }

    pub fn config(&self) -> &RouterConfig { &self.config }

    /// Receivers requested by the object followed by the default receiver. Duplicates are kept.
    pub fn receiver_names(&self, annotations: &WatchAnnotations) -> Vec<String> {
        annotations.receiver_names(&self.config.default_receiver)
    }

    /// Resolve the receiver list from `annotations` and dispatch `event` to it.
    pub async fn route(&self, annotations: &WatchAnnotations, event: ReceiverEvent) -> DispatchReport {
        let names = self.receiver_names(annotations);
        debug!(key = %event.key, kind = %event.kind, receivers = %names.join(","), "routing event");
        self.dispatch(&names, event).await
    }

    /// Deliver `event` to every named receiver concurrently and wait for all of them.
    ///
    /// Unknown names are skipped. Delivery failures are logged and reported, never returned as errors.
    pub async fn dispatch(&self, names: &[String], event: ReceiverEvent) -> DispatchReport {
        let started = Instant::now();
        let event = Arc::new(event);
        let mut report = DispatchReport::default();
        let mut pending = Vec::with_capacity(names.len());

        for name in names {
            let Some(receiver) = self.registry.get(name) else {
                warn!(receiver = %name, key = %event.key, "event requested for unknown receiver");
                counter!("kobs_receiver_unknown_total", 1);
                report.unknown.push(name.clone());
                continue;
            };
            let ev = Arc::clone(&event);
            let timeout = self.config.receiver_timeout;
            let receiver_name = name.clone();
            let task = tokio::spawn(async move {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, receiver.handle(&ev)).await.unwrap_or_else(|_| {
                        Err(ReceiverError::Timeout { receiver: receiver_name, after_ms: limit.as_millis() as u64 })
                    }),
                    None => receiver.handle(&ev).await,
                }
            });
            pending.push((name.clone(), task));
        }

        let outcomes = join_all(pending.into_iter().map(|(name, task)| async move { (name, task.await) })).await;
        for (name, outcome) in outcomes {
            match outcome {
                Ok(Ok(())) => {
                    debug!(receiver = %name, elapsed_ms = started.elapsed().as_millis() as u64, "receiver done");
                    report.delivered.push(name);
                }
                Ok(Err(e)) => {
                    error!(receiver = %name, error = %e, "an error occurred while sending event to a receiver");
                    counter!("kobs_receiver_errors_total", 1);
                    report.failed.push(e);
                }
                Err(join) => {
                    error!(receiver = %name, error = %join, "receiver task did not complete");
                    counter!("kobs_receiver_errors_total", 1);
                    report.failed.push(ReceiverError::Panicked { receiver: name });
                }
            }
        }

        histogram!("kobs_dispatch_ms", started.elapsed().as_secs_f64() * 1000.0);
        // Fallback sink: the full event, visible at debug level.
        match serde_json::to_string(&*event) {
            Ok(json) => debug!(event = %json, "dispatched event"),
            Err(e) => debug!(error = %e, "dispatched event (not serializable)"),
        }
        report
    }
}
