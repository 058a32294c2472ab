//! Pod lifecycle notifications.

use kobs_core::{
    ChangeEvent, ChangeKind, DerivedMessage, EventMetadata, PodSnapshot, ReceiverEvent, ReconcileError, ResourceKey,
    Snapshot, WatchAnnotations,
};
use kobs_diff::{container_transitions, mentions_crash_loop};
use tracing::debug;

use crate::reconciler::{Notification, Reconciler};
use crate::ObserverSettings;

pub struct PodReconciler {
    settings: ObserverSettings,
}

impl PodReconciler {
    pub fn new(settings: ObserverSettings) -> Self { Self { settings } }

    /// StatefulSet pods reuse names across incarnations, so they get their uid appended.
    fn display_name(key: &ResourceKey, pod: &PodSnapshot) -> String {
        match (&pod.meta.owner, &pod.meta.uid) {
            (Some(owner), Some(uid)) if owner.kind == "StatefulSet" => format!("{}-{}", key, uid),
            _ => key.to_string(),
        }
    }

    fn owner(pod: &PodSnapshot) -> (&str, &str) {
        pod.meta.owner.as_ref().map(|o| (o.kind.as_str(), o.name.as_str())).unwrap_or(("", ""))
    }

    fn added(&self, key: &ResourceKey, pod: &PodSnapshot) -> Vec<DerivedMessage> {
        if !self.settings.created_after_start(pod.meta.creation_ts) {
            debug!(key = %key, created = ?pod.meta.creation_ts, "pod predates startup; add not reported");
            return Vec::new();
        }
        let (owner_kind, owner_name) = Self::owner(pod);
        let text = format!(
            "A `pod` in namespace `{}` has been `Created`\nPod name:`{}`\nEnvironment:`{}`\nController kind:`{}`. Controller name:`{}`",
            key.namespace().unwrap_or(""),
            Self::display_name(key, pod),
            self.settings.cluster_name,
            owner_kind,
            owner_name,
        );
        vec![DerivedMessage::info(text)]
    }

    fn deleted(&self, key: &ResourceKey) -> Vec<DerivedMessage> {
        vec![DerivedMessage::info(format!(
            "The pod `{}` in `{}` cluster has been deleted",
            key, self.settings.cluster_name
        ))]
    }

    /// Container transitions, init containers first when they are watched.
    fn updated(old: &PodSnapshot, new: &PodSnapshot, annotations: &WatchAnnotations) -> Vec<DerivedMessage> {
        let mut updates = Vec::new();
        if annotations.watch_init_containers {
            updates.extend(container_transitions(&old.init_container_statuses, &new.init_container_statuses));
        }
        updates.extend(container_transitions(&old.container_statuses, &new.container_statuses));
        updates
            .into_iter()
            .map(|text| {
                if mentions_crash_loop([text.as_str()]) {
                    DerivedMessage::warning(text).with_field("crash_loop", true)
                } else {
                    DerivedMessage::info(text)
                }
            })
            .collect()
    }

    fn compose_update(&self, key: &ResourceKey, pod: &PodSnapshot, updates: &[DerivedMessage]) -> String {
        let (owner_kind, owner_name) = Self::owner(pod);
        let mut text = format!(
            "A `pod` in namespace `{}` has been `Updated`. Pod-Name:`{}`. Environment:`{}`.\nController kind:`{}`. Controller name:`{}`. Updates:",
            key.namespace().unwrap_or(""),
            Self::display_name(key, pod),
            self.settings.cluster_name,
            owner_kind,
            owner_name,
        );
        for u in updates {
            text.push_str("\n- ");
            text.push_str(&u.text);
        }
        text
    }
}

impl Reconciler<PodSnapshot> for PodReconciler {
    fn kind(&self) -> &'static str { "pod" }

    fn should_watch(&self, key: &ResourceKey, pod: &PodSnapshot) -> bool {
        let ignored = WatchAnnotations::for_pod(&pod.meta).ignore;
        let excluded = self.settings.exclude_pod_name_patterns.iter().any(|p| !p.is_empty() && key.as_str().contains(p.as_str()));
        if ignored || excluded {
            debug!(key = %key, ignored, excluded, "pod-watcher: ignoring pod event");
            return false;
        }
        true
    }

    fn reconcile(&self, change: &ChangeEvent<PodSnapshot>) -> Result<Option<Notification>, ReconcileError> {
        let key = &change.key;
        let Some(subject) = change.new.as_deref().or(change.old.as_deref()) else {
            return Err(ReconcileError::transient(format!("{} change for {} carries no snapshot", change.kind, key)));
        };
        let annotations = WatchAnnotations::for_pod(&subject.meta);

        let (messages, text) = match change.kind {
            ChangeKind::Add => {
                let messages = self.added(key, subject);
                let text = messages.first().map(|m| m.text.clone());
                (messages, text)
            }
            ChangeKind::Delete => {
                let messages = self.deleted(key);
                let text = messages.first().map(|m| m.text.clone());
                (messages, text)
            }
            ChangeKind::Update => {
                let (Some(old), Some(new)) = (change.old.as_deref(), change.new.as_deref()) else {
                    return Ok(None);
                };
                if !old.same_object(new) {
                    debug!(key = %key, "update spans a recreated pod; discarded");
                    return Ok(None);
                }
                let updates = Self::updated(old, new, &annotations);
                let text = (!updates.is_empty()).then(|| self.compose_update(key, new, &updates));
                (updates, text)
            }
        };

        let Some(text) = text else {
            return Ok(None);
        };
        let crash_loop = mentions_crash_loop([text.as_str()]);
        // Update events are opt-in, except for crash loops which are always reported.
        if change.kind == ChangeKind::Update && !annotations.watch_updates && !crash_loop {
            debug!(key = %key, "pod updates not watched; skipping");
            return Ok(None);
        }

        // Watchers are only paged about updates.
        let user_ids = if change.kind == ChangeKind::Update { annotations.user_ids.clone() } else { Vec::new() };
        let event = ReceiverEvent { kind: change.kind, key: key.clone(), message: text, metadata: EventMetadata { crash_loop, user_ids } };
        Ok(Some(Notification { event, annotations, messages }))
    }
}
