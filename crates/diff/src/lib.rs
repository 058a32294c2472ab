//! kubeobserver state differencer
//!
//! Pure comparisons of two snapshots of the same object. Nothing here logs
//! above trace level or touches shared state.

#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use kobs_core::{ContainerState, ContainerStatus};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Marker the kubelet puts in waiting reasons of crash-looping containers.
pub const CRASH_LOOP_BACK_OFF: &str = "CrashLoopBackOff";

fn ts(t: &Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)).unwrap_or_else(|| "an unknown time".to_string())
}

fn non_empty(s: &Option<String>) -> Option<&str> { s.as_deref().filter(|s| !s.is_empty()) }

/// Human readable condition of one container.
///
/// `None` for containers without state, and for terminated containers that
/// report neither a reason nor a message.
pub fn condition(state: &ContainerState) -> Option<String> {
    match state {
        ContainerState::Waiting { reason, message } => {
            let reason = reason.as_deref().unwrap_or("");
            Some(match non_empty(message) {
                Some(msg) => format!("is waiting since {} with following info: {}", reason, msg),
                None => format!("is waiting since {}", reason),
            })
        }
        ContainerState::Running { started_at } => Some(format!("has started at {}", ts(started_at))),
        ContainerState::Terminated { exit_code, finished_at, reason, message } => {
            let why = non_empty(reason).or_else(|| non_empty(message))?;
            Some(format!("has been terminated at {} with exit code {}. Reason:`{}`", ts(finished_at), exit_code, why))
        }
    }
}

fn describe(statuses: &[ContainerStatus]) -> FxHashMap<&str, String> {
    statuses
        .iter()
        .filter_map(|c| {
            let cond = condition(c.state.as_ref()?)?;
            Some((c.name.as_str(), format!("the container {} {}", c.name, cond)))
        })
        .collect()
}

/// One description per container whose condition changed between `old` and `new`.
///
/// Containers are matched by name; a container absent (or undescribable) on the
/// old side counts as having no prior state. Output order is unspecified.
pub fn container_transitions(old: &[ContainerStatus], new: &[ContainerStatus]) -> Vec<String> {
    let before = describe(old);
    let after = describe(new);
    after
        .into_iter()
        .filter(|(name, now)| {
            let changed = before.get(name) != Some(now);
            if changed {
                trace!(container = %name, old = ?before.get(name), new = %now, "container state changed");
            }
            changed
        })
        .map(|(_, now)| now)
        .collect()
}

/// Whether any description reports a crash-looping container.
pub fn mentions_crash_loop<'a>(descriptions: impl IntoIterator<Item = &'a str>) -> bool {
    descriptions.into_iter().any(|d| d.contains(CRASH_LOOP_BACK_OFF))
}

/// Replica counts of a scale-capable resource at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replicas {
    pub current: i32,
    pub desired: i32,
}

impl Replicas {
    pub fn new(current: i32, desired: i32) -> Self { Self { current, desired } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicaTrend {
    ScaleUpInProgress,
    ScaleUpFinished,
    ScaleDownInProgress,
    ScaleDownFinished,
    NewScaleUpDetected,
    NewScaleDownDetected,
}

impl ReplicaTrend {
    pub fn is_scale_up(self) -> bool {
        matches!(self, Self::ScaleUpInProgress | Self::ScaleUpFinished | Self::NewScaleUpDetected)
    }
}

impl fmt::Display for ReplicaTrend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ScaleUpInProgress => "scale-up-in-progress",
            Self::ScaleUpFinished => "scale-up-finished",
            Self::ScaleDownInProgress => "scale-down-in-progress",
            Self::ScaleDownFinished => "scale-down-finished",
            Self::NewScaleUpDetected => "new-scale-up-detected",
            Self::NewScaleDownDetected => "new-scale-down-detected",
        };
        f.write_str(s)
    }
}

/// Classify the replica movement between two observations.
///
/// Guards are evaluated in order: a scale-up that was under way, then a
/// scale-down that was under way, and only if neither applies the bare
/// new-side comparison, which also catches a movement that started and
/// settled between two observations.
pub fn classify_replicas(old: Replicas, new: Replicas) -> Option<ReplicaTrend> {
    let mut trend = None;

    if old.current < old.desired {
        if new.current < new.desired {
            trend = Some(ReplicaTrend::ScaleUpInProgress);
        }
        if new.current == new.desired {
            trend = Some(ReplicaTrend::ScaleUpFinished);
        }
    }

    if old.current > old.desired {
        if new.current > new.desired {
            trend = Some(ReplicaTrend::ScaleDownInProgress);
        }
        if new.current == new.desired {
            trend = Some(ReplicaTrend::ScaleDownFinished);
        }
    }

    if trend.is_none() {
        if new.current > new.desired {
            trend = Some(ReplicaTrend::NewScaleDownDetected);
        }
        if new.current < new.desired {
            trend = Some(ReplicaTrend::NewScaleUpDetected);
        }
    }

    trend
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> Option<DateTime<Utc>> { DateTime::from_timestamp(secs, 0) }

    fn status(name: &str, state: ContainerState) -> ContainerStatus {
        ContainerStatus { name: name.into(), state: Some(state), restart_count: 0 }
    }

    fn terminated(code: i32, reason: Option<&str>, message: Option<&str>, finished: i64) -> ContainerState {
        ContainerState::Terminated {
            exit_code: code,
            finished_at: at(finished),
            reason: reason.map(Into::into),
            message: message.map(Into::into),
        }
    }

    #[test]
    fn terminated_to_running_yields_one_running_description() {
        let old = vec![status("a", terminated(1, Some("Error"), None, 10))];
        let new = vec![status("a", ContainerState::Running { started_at: at(20) })];
        let out = container_transitions(&old, &new);
        assert_eq!(out.len(), 1);
        assert!(out[0].starts_with("the container a has started at"), "{}", out[0]);
        assert!(out[0].contains("1970-01-01T00:00:20Z"));
    }

    #[test]
    fn identical_sides_yield_nothing() {
        let s = vec![
            status("a", ContainerState::Running { started_at: at(5) }),
            status("b", ContainerState::Waiting { reason: Some("ContainerCreating".into()), message: None }),
        ];
        assert!(container_transitions(&s, &s).is_empty());
    }

    #[test]
    fn silent_termination_is_not_reported() {
        let old = vec![status("a", terminated(0, None, None, 10))];
        let new = vec![status("a", terminated(0, Some(""), Some(""), 99))];
        assert!(container_transitions(&old, &new).is_empty());
        assert_eq!(condition(&terminated(0, None, None, 1)), None);
    }

    #[test]
    fn terminated_falls_back_to_message() {
        let c = condition(&terminated(137, None, Some("OOM"), 0)).expect("described");
        assert!(c.contains("exit code 137"));
        assert!(c.ends_with("Reason:`OOM`"));
    }

    #[test]
    fn waiting_includes_message_when_present() {
        let plain = ContainerState::Waiting { reason: Some(CRASH_LOOP_BACK_OFF.into()), message: None };
        let detailed = ContainerState::Waiting { reason: Some("ErrImagePull".into()), message: Some("not found".into()) };
        assert_eq!(condition(&plain).as_deref(), Some("is waiting since CrashLoopBackOff"));
        assert_eq!(condition(&detailed).as_deref(), Some("is waiting since ErrImagePull with following info: not found"));
    }

    #[test]
    fn containers_only_on_new_side_are_new_transitions() {
        let new = vec![status("sidecar", ContainerState::Running { started_at: at(1) })];
        assert_eq!(container_transitions(&[], &new).len(), 1);
        assert!(container_transitions(&new, &[]).is_empty());
    }

    #[test]
    fn crash_loop_detection() {
        let old = vec![status("a", ContainerState::Running { started_at: at(1) })];
        let new = vec![status("a", ContainerState::Waiting { reason: Some(CRASH_LOOP_BACK_OFF.into()), message: None })];
        let out = container_transitions(&old, &new);
        assert!(mentions_crash_loop(out.iter().map(String::as_str)));
        assert!(!mentions_crash_loop(["the container a has started at x"]));
    }

    #[test]
    fn scale_up_lifecycle() {
        use ReplicaTrend::*;
        assert_eq!(classify_replicas(Replicas::new(2, 2), Replicas::new(2, 4)), Some(NewScaleUpDetected));
        assert_eq!(classify_replicas(Replicas::new(2, 4), Replicas::new(3, 4)), Some(ScaleUpInProgress));
        assert_eq!(classify_replicas(Replicas::new(3, 4), Replicas::new(4, 4)), Some(ScaleUpFinished));
    }

    #[test]
    fn scale_down_lifecycle() {
        use ReplicaTrend::*;
        assert_eq!(classify_replicas(Replicas::new(4, 4), Replicas::new(4, 2)), Some(NewScaleDownDetected));
        assert_eq!(classify_replicas(Replicas::new(4, 2), Replicas::new(3, 2)), Some(ScaleDownInProgress));
        assert_eq!(classify_replicas(Replicas::new(3, 2), Replicas::new(2, 2)), Some(ScaleDownFinished));
    }

    #[test]
    fn stable_or_reversed_movements() {
        use ReplicaTrend::*;
        assert_eq!(classify_replicas(Replicas::new(3, 3), Replicas::new(3, 3)), None);
        // A scale-up interrupted by a lower target is a new scale-down.
        assert_eq!(classify_replicas(Replicas::new(2, 4), Replicas::new(3, 1)), Some(NewScaleDownDetected));
        assert!(NewScaleUpDetected.is_scale_up());
        assert_eq!(ScaleDownFinished.to_string(), "scale-down-finished");
    }
}
