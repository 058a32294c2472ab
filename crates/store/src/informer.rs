//! Bridge between a watch delivery path and the cache + queue pair.

use std::sync::Arc;

use kobs_core::{ChangeEvent, ResourceKey, Snapshot};
use tracing::{debug, trace};

use crate::cache::SnapshotCache;
use crate::queue::ChangeQueue;

/// Decides whether a change of an object should be enqueued at all.
pub type WatchFilter<S> = Arc<dyn Fn(&ResourceKey, &S) -> bool + Send + Sync>;

/// Receives list+watch deliveries, keeps the cache current and enqueues keys.
pub struct Informer<S> {
    cache: Arc<SnapshotCache<S>>,
    queue: Arc<ChangeQueue<ResourceKey>>,
    filter: Option<WatchFilter<S>>,
}

impl<S> Clone for Informer<S> {
    fn clone(&self) -> Self {
        Self { cache: Arc::clone(&self.cache), queue: Arc::clone(&self.queue), filter: self.filter.clone() }
    }
}

impl<S: Snapshot> Informer<S> {
    pub fn new(cache: Arc<SnapshotCache<S>>, queue: Arc<ChangeQueue<ResourceKey>>) -> Self {
        Self { cache, queue, filter: None }
    }

    pub fn with_filter(mut self, filter: WatchFilter<S>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn cache(&self) -> &Arc<SnapshotCache<S>> { &self.cache }

    pub fn queue(&self) -> &Arc<ChangeQueue<ResourceKey>> { &self.queue }

    /// Object created or modified. Add vs update is resolved against the cache.
    pub fn on_apply(&self, obj: S) {
        if let Some(ev) = self.cache.upsert(obj) {
            self.enqueue(ev);
        }
    }

    /// Object removed; `last` is its final observed state.
    pub fn on_delete(&self, last: S) {
        let key = last.key();
        let ev = self.cache.remove(&key, Some(last));
        self.enqueue(ev);
    }

    /// Full relist. The first one completes the initial sync.
    pub fn on_restart(&self, list: Vec<S>) {
        let count = list.len();
        for ev in self.cache.replace(list) {
            self.enqueue(ev);
        }
        debug!(queue = self.queue.name(), count, "relist applied");
        self.cache.mark_synced();
    }

    pub fn has_synced(&self) -> bool { self.cache.has_synced() }

    fn enqueue(&self, ev: ChangeEvent<S>) {
        let subject = ev.new.as_deref().or(ev.old.as_deref());
        if let (Some(filter), Some(obj)) = (&self.filter, subject) {
            if !filter(&ev.key, obj) {
                trace!(queue = self.queue.name(), key = %ev.key, kind = %ev.kind, "change filtered out");
                return;
            }
        }
        let key = ev.key.clone();
        self.cache.record(ev);
        self.queue.add(key);
    }
}

/// Something that lists and watches one resource type and feeds an [`Informer`].
///
/// Implementations must call [`Informer::on_restart`] with the initial list before
/// anything else; that completes the cache sync the controller waits for.
#[async_trait::async_trait]
pub trait WatchSource<S: Snapshot>: Send + 'static {
    fn describe(&self) -> String;

    /// Run the delivery loop until the underlying stream ends or fails.
    async fn run(self: Box<Self>, informer: Informer<S>) -> anyhow::Result<()>;
}
