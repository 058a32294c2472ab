//! Name to receiver map, built once at startup and shared read-only.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::Receiver;

#[derive(Clone, Default)]
pub struct ReceiverRegistry {
    receivers: BTreeMap<String, Arc<dyn Receiver>>,
}

impl ReceiverRegistry {
    pub fn new() -> Self { Self::default() }

    /// Register under the receiver's own name, replacing any previous entry.
    pub fn register(&mut self, receiver: Arc<dyn Receiver>) -> &mut Self {
        let name = receiver.name().to_string();
        if self.receivers.insert(name.clone(), receiver).is_some() {
            warn!(receiver = %name, "receiver registered twice; keeping the latest");
        } else {
            info!(receiver = %name, "receiver registered");
        }
        self
    }

    pub fn with(mut self, receiver: Arc<dyn Receiver>) -> Self {
        self.register(receiver);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Receiver>> { self.receivers.get(name).cloned() }

    pub fn contains(&self, name: &str) -> bool { self.receivers.contains_key(name) }

    pub fn names(&self) -> Vec<&str> { self.receivers.keys().map(String::as_str).collect() }

    pub fn len(&self) -> usize { self.receivers.len() }

    pub fn is_empty(&self) -> bool { self.receivers.is_empty() }
}

impl std::fmt::Debug for ReceiverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverRegistry").field("receivers", &self.names()).finish()
    }
}
