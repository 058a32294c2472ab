//! Controller loop: cache-sync barrier, worker pool and the retry policy.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use kobs_core::{ChangeEvent, ReconcileError, ResourceKey, Snapshot};
use kobs_receivers::EventRouter;
use kobs_store::{ChangeQueue, Informer, SnapshotCache, WatchSource};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::reconciler::Reconciler;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub workers: usize,
    pub cache_sync_timeout: Duration,
    /// Requeues allowed before an item is dropped.
    pub max_retries: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self { Self { workers: 2, cache_sync_timeout: Duration::from_secs(60), max_retries: 5 } }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControllerError {
    #[error("timed out waiting for {kind} cache to sync after {waited:?}")]
    CacheSyncTimeout { kind: &'static str, waited: Duration },
    #[error("{kind} controller stopped before its cache synced")]
    StoppedBeforeSync { kind: &'static str },
}

pub struct Controller<S: Snapshot> {
    kind: &'static str,
    cache: Arc<SnapshotCache<S>>,
    queue: Arc<ChangeQueue<ResourceKey>>,
    reconciler: Arc<dyn Reconciler<S>>,
    router: Arc<EventRouter>,
    config: ControllerConfig,
}

impl<S: Snapshot> Controller<S> {
    pub fn new(reconciler: Arc<dyn Reconciler<S>>, router: Arc<EventRouter>, config: ControllerConfig) -> Self {
        let kind = reconciler.kind();
        Self {
            kind,
            cache: Arc::new(SnapshotCache::new(kind)),
            queue: Arc::new(ChangeQueue::new(kind)),
            reconciler,
            router,
            config,
        }
    }

    /// Replace the default queue, e.g. to use a different rate limiter.
    pub fn with_queue(mut self, queue: ChangeQueue<ResourceKey>) -> Self {
        self.queue = Arc::new(queue);
        self
    }

    pub fn kind(&self) -> &'static str { self.kind }

    pub fn cache(&self) -> &Arc<SnapshotCache<S>> { &self.cache }

    pub fn queue(&self) -> &Arc<ChangeQueue<ResourceKey>> { &self.queue }

    pub fn is_synced(&self) -> bool { self.cache.has_synced() }

    /// The delivery-side handle a watch source feeds, filtered by the reconciler.
    pub fn informer(&self) -> Informer<S> {
        let reconciler = Arc::clone(&self.reconciler);
        Informer::new(Arc::clone(&self.cache), Arc::clone(&self.queue))
            .with_filter(Arc::new(move |key: &ResourceKey, obj: &S| reconciler.should_watch(key, obj)))
    }

    /// Start `source`, wait for the initial cache sync, then process the queue with
    /// `config.workers` workers until `stop` fires. In-flight items finish before this returns.
    pub async fn run(self: Arc<Self>, source: Box<dyn WatchSource<S>>, stop: CancellationToken) -> Result<(), ControllerError> {
        let kind = self.kind;
        let informer = self.informer();
        let described = source.describe();
        let watch_task = tokio::spawn(async move {
            match source.run(informer).await {
                Ok(()) => warn!(kind, source = %described, "watch source ended"),
                Err(e) => error!(kind, source = %described, error = ?e, "watch source failed"),
            }
        });

        info!(kind, "waiting for controller cache to sync");
        let timeout = self.config.cache_sync_timeout;
        let synced = tokio::select! {
            synced = self.cache.wait_for_sync(timeout) => synced,
            _ = stop.cancelled() => {
                watch_task.abort();
                self.queue.shut_down();
                return Err(ControllerError::StoppedBeforeSync { kind });
            }
        };
        if !synced {
            watch_task.abort();
            self.queue.shut_down();
            error!(kind, timeout_secs = timeout.as_secs(), "timed out waiting for caches to sync");
            return Err(ControllerError::CacheSyncTimeout { kind, waited: timeout });
        }

        let workers = self.config.workers.max(1);
        info!(kind, workers, objects = self.cache.len(), "controller is ready and starting");
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let this = Arc::clone(&self);
                tokio::spawn(async move { this.run_worker(id).await })
            })
            .collect();

        stop.cancelled().await;
        info!(kind, "stopping controller");
        self.queue.shut_down();
        for h in handles {
            if let Err(e) = h.await {
                error!(kind, error = %e, "worker task failed");
            }
        }
        watch_task.abort();
        info!(kind, "controller stopped");
        Ok(())
    }

    async fn run_worker(&self, id: usize) {
        debug!(kind = self.kind, worker = id, "worker started");
        while self.process_next().await {}
        debug!(kind = self.kind, worker = id, "worker stopped");
    }

    /// Pull one key and process it. `false` once the queue is shut down.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let started = Instant::now();
        let change = self.cache.take_change(&key);
        let result = match (key.validate(), &change) {
            (Err(e), _) => Err(ReconcileError::from(e)),
            (Ok(()), None) => {
                debug!(kind = self.kind, key = %key, "no pending change; nothing to do");
                Ok(())
            }
            (Ok(()), Some(ch)) => AssertUnwindSafe(self.reconcile_and_dispatch(ch))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(ReconcileError::transient(format!("reconciler panicked: {}", panic_message(&panic))))),
        };
        histogram!("kobs_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => self.kind);
        let retrying = self.handle_result(&key, change, result);
        if !retrying && self.cache.has_pending(&key) {
            // Re-marks the in-flight key so `done` surfaces it again.
            self.queue.add(key.clone());
        }
        self.queue.done(&key);
        true
    }

    async fn reconcile_and_dispatch(&self, change: &ChangeEvent<S>) -> Result<(), ReconcileError> {
        let Some(notification) = self.reconciler.reconcile(change)? else {
            return Ok(());
        };
        let report = self.router.route(&notification.annotations, notification.event).await;
        debug!(
            kind = self.kind,
            key = %change.key,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            unknown = report.unknown.len(),
            "notification dispatched"
        );
        Ok(())
    }

    /// Apply the retry policy. `true` when the key was scheduled for a rate-limited retry.
    fn handle_result(&self, key: &ResourceKey, change: Option<ChangeEvent<S>>, result: Result<(), ReconcileError>) -> bool {
        let kind = self.kind;
        let err = match result {
            Ok(()) => {
                self.queue.forget(key);
                counter!("kobs_reconcile_total", 1, "kind" => kind, "outcome" => "ok");
                return false;
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            self.queue.forget(key);
            error!(kind, key = %key, error = %err, "skipping item that cannot be processed");
            counter!("kobs_reconcile_total", 1, "kind" => kind, "outcome" => "skipped");
            return false;
        }

        let requeues = self.queue.num_requeues(key);
        if requeues < self.config.max_retries {
            warn!(kind, key = %key, attempt = requeues + 1, error = %err, "error syncing; will retry");
            if let Some(ch) = change {
                self.cache.restore_change(ch);
            }
            self.queue.add_rate_limited(key.clone());
            counter!("kobs_reconcile_total", 1, "kind" => kind, "outcome" => "retry");
            return true;
        }

        self.queue.forget(key);
        error!(kind, key = %key, retries = requeues, error = %err, "dropping item out of the queue after retries");
        counter!("kobs_reconcile_total", 1, "kind" => kind, "outcome" => "dropped");
        false
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
