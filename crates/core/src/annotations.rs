//! Annotation-driven routing and watch flags, resolved once per event.

use smallvec::SmallVec;

use crate::snapshot::SnapshotMeta;

pub const RECEIVERS: &str = "kubeobserver.io/receivers";
pub const POD_IGNORE: &str = "pod-kubeobserver.io/ignore";
pub const POD_WATCH_UPDATES: &str = "pod-update-kubeobserver.io/watch";
pub const POD_WATCH_INIT_CONTAINERS: &str = "pod-init-container-kubeobserver.io/watch";
pub const POD_USER_IDS: &str = "pod-watch-kubeobserver.io/slack_users_id";
pub const AUTOSCALER_USER_IDS: &str = "hpa-watch-kubeobserver.io/slack_users_id";

/// Typed view over the reserved annotations of one object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchAnnotations {
    /// Receivers requested by the object, in annotation order. Duplicates are kept.
    pub receivers: SmallVec<[String; 4]>,
    pub ignore: bool,
    pub watch_updates: bool,
    pub watch_init_containers: bool,
    pub user_ids: Vec<String>,
}

impl WatchAnnotations {
    pub fn for_pod(meta: &SnapshotMeta) -> Self {
        Self {
            receivers: split_list(meta.annotation(RECEIVERS)).collect(),
            ignore: flag(meta.annotation(POD_IGNORE)),
            watch_updates: flag(meta.annotation(POD_WATCH_UPDATES)),
            watch_init_containers: flag(meta.annotation(POD_WATCH_INIT_CONTAINERS)),
            user_ids: split_list(meta.annotation(POD_USER_IDS)).collect(),
        }
    }

    /// Autoscalers always report updates and have no ignore or init-container flags.
    pub fn for_autoscaler(meta: &SnapshotMeta) -> Self {
        Self {
            receivers: split_list(meta.annotation(RECEIVERS)).collect(),
            ignore: false,
            watch_updates: true,
            watch_init_containers: false,
            user_ids: split_list(meta.annotation(AUTOSCALER_USER_IDS)).collect(),
        }
    }

    /// Requested receivers followed by the default one.
    pub fn receiver_names(&self, default_receiver: &str) -> Vec<String> {
        let mut out: Vec<String> = self.receivers.iter().cloned().collect();
        out.push(default_receiver.to_string());
        out
    }
}

fn flag(v: Option<&str>) -> bool { v.map(|s| s.trim() == "true").unwrap_or(false) }

fn split_list(v: Option<&str>) -> impl Iterator<Item = String> + '_ {
    v.unwrap_or("").split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> SnapshotMeta {
        SnapshotMeta {
            name: "x".into(),
            annotations: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn no_annotation_yields_default_only() {
        let a = WatchAnnotations::for_pod(&meta(&[]));
        assert_eq!(a.receiver_names("log"), vec!["log".to_string()]);
        assert!(!a.ignore && !a.watch_updates && !a.watch_init_containers);
    }

    #[test]
    fn requested_receivers_precede_default() {
        let a = WatchAnnotations::for_pod(&meta(&[(RECEIVERS, "a, b")]));
        assert_eq!(a.receiver_names("log"), vec!["a", "b", "log"]);
    }

    #[test]
    fn duplicates_are_preserved() {
        let a = WatchAnnotations::for_autoscaler(&meta(&[(RECEIVERS, "log")]));
        assert_eq!(a.receiver_names("log"), vec!["log", "log"]);
    }

    #[test]
    fn pod_flags_and_users() {
        let a = WatchAnnotations::for_pod(&meta(&[
            (POD_IGNORE, "true"),
            (POD_WATCH_UPDATES, "true"),
            (POD_WATCH_INIT_CONTAINERS, "false"),
            (POD_USER_IDS, "U1,U2"),
        ]));
        assert!(a.ignore);
        assert!(a.watch_updates);
        assert!(!a.watch_init_containers);
        assert_eq!(a.user_ids, vec!["U1", "U2"]);
    }
}
