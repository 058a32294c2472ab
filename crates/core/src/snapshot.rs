//! Immutable, projected copies of watched objects.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceKey;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

/// Metadata shared by every snapshot kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub namespace: Option<String>,
    pub name: String,
    pub uid: Option<String>,
    pub creation_ts: Option<DateTime<Utc>>,
    pub annotations: BTreeMap<String, String>,
    /// First owner reference (the controlling workload for pods).
    pub owner: Option<OwnerRef>,
    pub resource_version: Option<String>,
}

impl SnapshotMeta {
    pub fn key(&self) -> ResourceKey { ResourceKey::new(self.namespace.as_deref(), &self.name) }

    pub fn annotation(&self, name: &str) -> Option<&str> { self.annotations.get(name).map(|s| s.as_str()) }
}

/// Anything the cache can hold.
pub trait Snapshot: Clone + Send + Sync + 'static {
    fn meta(&self) -> &SnapshotMeta;

    fn key(&self) -> ResourceKey { self.meta().key() }

    /// Whether two snapshots describe the same object instance (not a recreation under the same key).
    fn same_object(&self, other: &Self) -> bool {
        let (a, b) = (self.meta(), other.meta());
        let uid_matches = match (&a.uid, &b.uid) {
            (Some(x), Some(y)) => x == y,
            _ => true,
        };
        uid_matches && a.creation_ts == b.creation_ts
    }

    /// Whether the observable state moved between two deliveries of the same key.
    fn changed_since(&self, other: &Self) -> bool;
}

/// Tri-state container condition as reported by the kubelet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ContainerState {
    Waiting {
        reason: Option<String>,
        message: Option<String>,
    },
    Running {
        started_at: Option<DateTime<Utc>>,
    },
    Terminated {
        exit_code: i32,
        finished_at: Option<DateTime<Utc>>,
        reason: Option<String>,
        message: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerStatus {
    pub name: String,
    pub state: Option<ContainerState>,
    pub restart_count: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodSnapshot {
    pub meta: SnapshotMeta,
    pub init_container_statuses: Vec<ContainerStatus>,
    pub container_statuses: Vec<ContainerStatus>,
}

impl Snapshot for PodSnapshot {
    fn meta(&self) -> &SnapshotMeta { &self.meta }

    fn changed_since(&self, other: &Self) -> bool { self != other }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoscalerSnapshot {
    pub meta: SnapshotMeta,
    pub current_replicas: i32,
    pub desired_replicas: i32,
}

impl Snapshot for AutoscalerSnapshot {
    fn meta(&self) -> &SnapshotMeta { &self.meta }

    fn changed_since(&self, other: &Self) -> bool { self != other }
}
