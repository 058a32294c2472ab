//! Deduplicating, rate-limited work queue keyed by resource identity.
//!
//! A key is in at most one of three places: waiting in `queue`, being processed
//! (`processing`), or both processing and marked `dirty` for a re-run once
//! `done` is called. That keeps two workers from ever holding the same key.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::ratelimit::{default_controller_rate_limiter, RateLimiter};

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    shutting_down: bool,
}

pub struct ChangeQueue<K> {
    name: &'static str,
    state: Mutex<QueueState<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K> ChangeQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(name: &'static str) -> Self { Self::with_rate_limiter(name, Box::new(default_controller_rate_limiter())) }

    pub fn with_rate_limiter(name: &'static str, limiter: Box<dyn RateLimiter<K>>) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter,
        }
    }

    pub fn name(&self) -> &'static str { self.name }

    /// Mark `key` for processing. No-op if it is already pending; if it is being
    /// processed it is surfaced again after the current `done`.
    pub fn add(&self, key: K) {
        let mut st = self.state.lock();
        if st.shutting_down {
            trace!(queue = self.name, ?key, "add after shutdown ignored");
            return;
        }
        if !st.dirty.insert(key.clone()) {
            trace!(queue = self.name, ?key, "already pending");
            return;
        }
        counter!("kobs_queue_adds_total", 1, "queue" => self.name);
        if st.processing.contains(&key) {
            return;
        }
        st.queue.push_back(key);
        gauge!("kobs_queue_depth", st.queue.len() as f64, "queue" => self.name);
        drop(st);
        self.notify.notify_one();
    }

    /// Wait for the next key. `None` once the queue has been shut down.
    ///
    /// Every `Some` must be paired with exactly one [`ChangeQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    gauge!("kobs_queue_depth", st.queue.len() as f64, "queue" => self.name);
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release the in-flight marker for `key`, re-queueing it if it was
    /// mutated while being processed.
    pub fn done(&self, key: &K) {
        let mut st = self.state.lock();
        st.processing.remove(key);
        if st.dirty.contains(key) && !st.shutting_down {
            st.queue.push_back(key.clone());
            drop(st);
            self.notify.notify_one();
        }
    }

    /// Re-add `key` after `delay`. Dropped if the queue is shut down meanwhile.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Re-add `key` after the delay chosen by the rate limiter.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = self.limiter.when(&key);
        debug!(queue = self.name, ?key, delay_ms = delay.as_millis() as u64, "requeue rate limited");
        self.add_after(key, delay);
    }

    /// Reset the failure history of `key`.
    pub fn forget(&self, key: &K) { self.limiter.forget(key); }

    pub fn num_requeues(&self, key: &K) -> u32 { self.limiter.num_requeues(key) }

    /// Stop handing out work. Pending `get` callers return `None`; in-flight keys may still call `done`.
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
        debug!(queue = self.name, "queue shut down");
    }

    pub fn is_shutting_down(&self) -> bool { self.state.lock().shutting_down }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize { self.state.lock().queue.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn in_flight(&self) -> usize { self.state.lock().processing.len() }
}
