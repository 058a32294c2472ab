//! kubeobserver core types: resource keys, change events, derived messages

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod annotations;
pub mod error;
pub mod snapshot;

pub use annotations::WatchAnnotations;
pub use error::{KeyError, ReconcileError};
pub use snapshot::{AutoscalerSnapshot, ContainerState, ContainerStatus, OwnerRef, PodSnapshot, Snapshot, SnapshotMeta};

/// Identity of a watched object: `namespace/name`, or bare `name` when cluster-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn namespace(&self) -> Option<&str> {
        self.0.split_once('/').map(|(ns, _)| ns)
    }

    pub fn name(&self) -> &str {
        self.0.split_once('/').map(|(_, n)| n).unwrap_or(&self.0)
    }

    /// Validate the textual form. Queued keys are re-validated on dequeue.
    pub fn validate(&self) -> Result<(), KeyError> {
        let parts: Vec<&str> = self.0.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(()),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(()),
            _ => Err(KeyError::Malformed(self.0.clone())),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl FromStr for ResourceKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = Self(s.to_string());
        key.validate()?;
        Ok(key)
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = KeyError;

    fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
}

impl From<ResourceKey> for String {
    fn from(k: ResourceKey) -> Self { k.0 }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Add => "Add",
            ChangeKind::Update => "Update",
            ChangeKind::Delete => "Delete",
        };
        f.write_str(s)
    }
}

/// One observed transition of a watched object.
///
/// `Update` carries both sides; `Add` only `new`; `Delete` the last known state in `old`.
#[derive(Debug, Clone)]
pub struct ChangeEvent<S> {
    pub kind: ChangeKind,
    pub key: ResourceKey,
    pub old: Option<Arc<S>>,
    pub new: Option<Arc<S>>,
}

impl<S> ChangeEvent<S> {
    pub fn added(key: ResourceKey, new: Arc<S>) -> Self {
        Self { kind: ChangeKind::Add, key, old: None, new: Some(new) }
    }

    pub fn updated(key: ResourceKey, old: Arc<S>, new: Arc<S>) -> Self {
        Self { kind: ChangeKind::Update, key, old: Some(old), new: Some(new) }
    }

    pub fn deleted(key: ResourceKey, old: Option<Arc<S>>) -> Self {
        Self { kind: ChangeKind::Delete, key, old, new: None }
    }

    /// Fold a later transition of the same key into this pending one.
    ///
    /// The earliest `old` survives, the latest `new` wins. A delete never absorbs
    /// what follows it: the object was gone, so a later add or update belongs to a
    /// new incarnation and both transitions come back unmerged in `Err`.
    pub fn coalesce(self, later: ChangeEvent<S>) -> Result<ChangeEvent<S>, (ChangeEvent<S>, ChangeEvent<S>)> {
        use ChangeKind::*;
        match (self.kind, later.kind) {
            (Delete, Add) | (Delete, Update) => Err((self, later)),
            (Add, Update) | (Add, Add) | (Update, Add) => Ok(ChangeEvent { kind: Add, key: later.key, old: None, new: later.new }),
            (Update, Update) => Ok(ChangeEvent { kind: Update, key: later.key, old: self.old, new: later.new }),
            (_, Delete) => {
                Ok(ChangeEvent { kind: Delete, key: later.key, old: later.old.or(self.new).or(self.old), new: None })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
}

/// A human readable description derived from one change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DerivedMessage {
    pub severity: Severity,
    pub text: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl DerivedMessage {
    pub fn info(text: impl Into<String>) -> Self {
        Self { severity: Severity::Info, text: text.into(), fields: serde_json::Map::new() }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self { severity: Severity::Warning, text: text.into(), fields: serde_json::Map::new() }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }
}

/// Routing hints that travel next to the message text.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventMetadata {
    #[serde(default)]
    pub crash_loop: bool,
    #[serde(default)]
    pub user_ids: Vec<String>,
}

/// The unit handed to every receiver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiverEvent {
    pub kind: ChangeKind,
    pub key: ResourceKey,
    pub message: String,
    pub metadata: EventMetadata,
}

pub mod prelude {
    pub use super::{
        ChangeEvent, ChangeKind, DerivedMessage, EventMetadata, ReceiverEvent, ResourceKey, Severity, Snapshot,
        WatchAnnotations,
    };
}
