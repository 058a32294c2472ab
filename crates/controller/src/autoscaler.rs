//! Autoscaler replica-trend notifications.

use kobs_core::{
    AutoscalerSnapshot, ChangeEvent, ChangeKind, DerivedMessage, EventMetadata, ReceiverEvent, ReconcileError, ResourceKey,
    Snapshot, WatchAnnotations,
};
use kobs_diff::{classify_replicas, ReplicaTrend, Replicas};
use tracing::debug;

use crate::reconciler::{Notification, Reconciler};
use crate::ObserverSettings;

pub struct AutoscalerReconciler {
    settings: ObserverSettings,
}

fn replicas(s: &AutoscalerSnapshot) -> Replicas { Replicas::new(s.current_replicas, s.desired_replicas) }

impl AutoscalerReconciler {
    pub fn new(settings: ObserverSettings) -> Self { Self { settings } }

    fn render_trend(&self, key: &ResourceKey, trend: ReplicaTrend, now: Replicas) -> String {
        let cluster = &self.settings.cluster_name;
        let counts = format!("current-replicas:`{}` desired-replicas:`{}`", now.current, now.desired);
        match trend {
            ReplicaTrend::ScaleUpInProgress => {
                format!("HorizontalPodAutoscaler[`{key}`] scale `UP` event progress has updated in `{cluster}` cluster. {counts}")
            }
            ReplicaTrend::ScaleUpFinished => {
                format!("HorizontalPodAutoscaler[`{key}`] scale `UP` event has finished in `{cluster}` cluster. {counts}")
            }
            ReplicaTrend::ScaleDownInProgress => {
                format!("HorizontalPodAutoscaler[`{key}`] scale `DOWN` event progress has updated in `{cluster}` cluster. {counts}")
            }
            ReplicaTrend::ScaleDownFinished => {
                format!("HorizontalPodAutoscaler[`{key}`] scale `DOWN` event has finished in `{cluster}` cluster. {counts}")
            }
            ReplicaTrend::NewScaleUpDetected => format!(
                "scale `UP` event has been detected by HorizontalPodAutoscaler[`{key}`] in `{cluster}` cluster. starting to `increase` pod number. {counts}"
            ),
            ReplicaTrend::NewScaleDownDetected => format!(
                "scale `DOWN` event has been detected by HorizontalPodAutoscaler[`{key}`] in `{cluster}` cluster. starting to `decrease` pod number. {counts}"
            ),
        }
    }

    fn message(&self, change: &ChangeEvent<AutoscalerSnapshot>) -> Option<DerivedMessage> {
        let key = &change.key;
        let cluster = &self.settings.cluster_name;
        match change.kind {
            ChangeKind::Add => {
                let created = change.new.as_deref().and_then(|n| n.meta.creation_ts);
                if !self.settings.created_after_start(created) {
                    debug!(key = %key, "autoscaler predates startup; add not reported");
                    return None;
                }
                Some(DerivedMessage::info(format!("New HorizontalPodAutoscaler resource [`{key}`] added to `{cluster}` cluster")))
            }
            ChangeKind::Delete => Some(DerivedMessage::info(format!(
                "HorizontalPodAutoscaler resource [`{key}`] has been deleted from `{cluster}` cluster"
            ))),
            ChangeKind::Update => {
                let (old, new) = (change.old.as_deref()?, change.new.as_deref()?);
                if !old.same_object(new) {
                    debug!(key = %key, "update spans a recreated autoscaler; discarded");
                    return None;
                }
                let (before, now) = (replicas(old), replicas(new));
                debug!(key = %key, ?before, ?now, "autoscaler replica status");
                let trend = classify_replicas(before, now)?;
                Some(
                    DerivedMessage::info(self.render_trend(key, trend, now))
                        .with_field("trend", trend.to_string())
                        .with_field("current_replicas", now.current)
                        .with_field("desired_replicas", now.desired),
                )
            }
        }
    }
}

impl Reconciler<AutoscalerSnapshot> for AutoscalerReconciler {
    fn kind(&self) -> &'static str { "autoscaler" }

    fn reconcile(&self, change: &ChangeEvent<AutoscalerSnapshot>) -> Result<Option<Notification>, ReconcileError> {
        let Some(subject) = change.new.as_deref().or(change.old.as_deref()) else {
            return Err(ReconcileError::transient(format!("{} change for {} carries no snapshot", change.kind, change.key)));
        };
        let Some(message) = self.message(change) else {
            return Ok(None);
        };
        let annotations = WatchAnnotations::for_autoscaler(&subject.meta);
        let user_ids = if change.kind == ChangeKind::Update { annotations.user_ids.clone() } else { Vec::new() };
        let event = ReceiverEvent {
            kind: change.kind,
            key: change.key.clone(),
            message: message.text.clone(),
            metadata: EventMetadata { crash_loop: false, user_ids },
        };
        Ok(Some(Notification { event, annotations, messages: vec![message] }))
    }
}
