//! Thread-safe keyed store of the latest known object per key.
//!
//! Besides the objects, the cache keeps a ledger of the transitions each key
//! went through since it was last dequeued. Rapid mutations of one object fold
//! into a single change carrying the first `old` and the latest `new`; a delete
//! and a recreation under the same key stay two entries, taken in order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use kobs_core::{ChangeEvent, ResourceKey, Snapshot};
use metrics::gauge;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tracing::{debug, info};

struct CacheState<S> {
    objects: FxHashMap<ResourceKey, Arc<S>>,
    pending: FxHashMap<ResourceKey, VecDeque<ChangeEvent<S>>>,
}

pub struct SnapshotCache<S> {
    kind: &'static str,
    state: RwLock<CacheState<S>>,
    synced_tx: watch::Sender<bool>,
}

impl<S: Snapshot> SnapshotCache<S> {
    pub fn new(kind: &'static str) -> Self {
        let (synced_tx, _) = watch::channel(false);
        gauge!("kobs_cache_synced", 0.0, "kind" => kind);
        Self { kind, state: RwLock::new(CacheState { objects: FxHashMap::default(), pending: FxHashMap::default() }), synced_tx }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Arc<S>> { self.state.read().objects.get(key).cloned() }

    pub fn len(&self) -> usize { self.state.read().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<_> = self.state.read().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Store `obj` as the latest state of its key.
    ///
    /// Returns the transition it represents, or `None` when nothing observable changed.
    pub fn upsert(&self, obj: S) -> Option<ChangeEvent<S>> {
        let key = obj.key();
        let new = Arc::new(obj);
        let mut st = self.state.write();
        let prev = st.objects.insert(key.clone(), Arc::clone(&new));
        gauge!("kobs_cache_objects", st.objects.len() as f64, "kind" => self.kind);
        match prev {
            None => Some(ChangeEvent::added(key, new)),
            Some(old) if new.changed_since(&old) => Some(ChangeEvent::updated(key, old, new)),
            Some(_) => None,
        }
    }

    /// Drop `key`. `last` is the final state reported by the watch, if any.
    pub fn remove(&self, key: &ResourceKey, last: Option<S>) -> ChangeEvent<S> {
        let mut st = self.state.write();
        let prev = st.objects.remove(key);
        gauge!("kobs_cache_objects", st.objects.len() as f64, "kind" => self.kind);
        ChangeEvent::deleted(key.clone(), last.map(Arc::new).or(prev))
    }

    /// Replace the whole content with a fresh list, returning the implied transitions.
    pub fn replace(&self, list: Vec<S>) -> Vec<ChangeEvent<S>> {
        let listed: FxHashSet<ResourceKey> = list.iter().map(|o| o.key()).collect();
        let mut out = Vec::with_capacity(list.len());
        for obj in list {
            if let Some(ev) = self.upsert(obj) {
                out.push(ev);
            }
        }
        let gone: Vec<ResourceKey> =
            self.state.read().objects.keys().filter(|k| !listed.contains(*k)).cloned().collect();
        for key in gone {
            out.push(self.remove(&key, None));
        }
        debug!(kind = self.kind, changes = out.len(), objects = self.len(), "cache replaced from list");
        out
    }

    /// Fold `ev` into the newest pending transition of its key.
    pub fn record(&self, ev: ChangeEvent<S>) {
        let mut st = self.state.write();
        let list = st.pending.entry(ev.key.clone()).or_default();
        match list.pop_back() {
            Some(prev) => match prev.coalesce(ev) {
                Ok(merged) => list.push_back(merged),
                Err((prev, ev)) => {
                    list.push_back(prev);
                    list.push_back(ev);
                }
            },
            None => list.push_back(ev),
        }
    }

    /// Take the oldest pending transition of `key` for processing.
    pub fn take_change(&self, key: &ResourceKey) -> Option<ChangeEvent<S>> {
        let mut st = self.state.write();
        let list = st.pending.get_mut(key)?;
        let ev = list.pop_front();
        if list.is_empty() {
            st.pending.remove(key);
        }
        ev
    }

    /// Whether `key` still has transitions waiting after the one taken.
    pub fn has_pending(&self, key: &ResourceKey) -> bool { self.state.read().pending.contains_key(key) }

    /// Put back a transition whose processing failed, ahead of anything recorded since.
    pub fn restore_change(&self, ev: ChangeEvent<S>) {
        let mut st = self.state.write();
        let list = st.pending.entry(ev.key.clone()).or_default();
        match list.pop_front() {
            Some(newer) => match ev.coalesce(newer) {
                Ok(merged) => list.push_front(merged),
                Err((ev, newer)) => {
                    list.push_front(newer);
                    list.push_front(ev);
                }
            },
            None => list.push_front(ev),
        }
    }

    /// Number of transitions waiting across all keys.
    pub fn pending_len(&self) -> usize { self.state.read().pending.values().map(VecDeque::len).sum() }

    /// Open the initial-sync barrier. Idempotent.
    pub fn mark_synced(&self) {
        if !*self.synced_tx.borrow() {
            info!(kind = self.kind, objects = self.len(), "cache synced");
            gauge!("kobs_cache_synced", 1.0, "kind" => self.kind);
        }
        self.synced_tx.send_replace(true);
    }

    pub fn has_synced(&self) -> bool { *self.synced_tx.borrow() }

    /// Wait until the initial list has been applied, or `timeout` elapses.
    pub async fn wait_for_sync(&self, timeout: Duration) -> bool {
        let mut rx = self.synced_tx.subscribe();
        let synced = matches!(tokio::time::timeout(timeout, rx.wait_for(|synced| *synced)).await, Ok(Ok(_)));
        synced
    }
}
