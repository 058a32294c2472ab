//! kubeobserver controller: queue-driven workers that reconcile watched resources into notifications

#![forbid(unsafe_code)]

pub mod autoscaler;
pub mod controller;
pub mod health;
pub mod pod;
pub mod reconciler;

use chrono::{DateTime, Utc};

pub use autoscaler::AutoscalerReconciler;
pub use controller::{Controller, ControllerConfig, ControllerError};
pub use health::{Health, SyncStatus};
pub use pod::PodReconciler;
pub use reconciler::{Notification, Reconciler};

/// Process-wide settings the reconcilers render into messages.
#[derive(Debug, Clone)]
pub struct ObserverSettings {
    pub cluster_name: String,
    /// Adds of objects created before this instant are not reported.
    pub init_time: DateTime<Utc>,
    /// Pods whose key contains any of these substrings are never enqueued.
    pub exclude_pod_name_patterns: Vec<String>,
}

impl ObserverSettings {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self { cluster_name: cluster_name.into(), init_time: Utc::now(), exclude_pod_name_patterns: Vec::new() }
    }

    /// Whether an object created at `created` counts as new for this process.
    pub fn created_after_start(&self, created: Option<DateTime<Utc>>) -> bool {
        created.map(|t| self.init_time < t).unwrap_or(false)
    }
}
