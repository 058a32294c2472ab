//! API objects to snapshots.

use anyhow::{anyhow, Result};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1 as core_v1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kobs_core::{AutoscalerSnapshot, ContainerState, ContainerStatus, OwnerRef, PodSnapshot, Snapshot, SnapshotMeta};

/// A watched API type that projects onto a snapshot.
pub trait IntoSnapshot {
    type Snapshot: Snapshot;

    fn to_snapshot(&self) -> Result<Self::Snapshot>;
}

fn meta_from(meta: &ObjectMeta) -> Result<SnapshotMeta> {
    let name = meta.name.clone().ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let refs = meta.owner_references.as_deref().unwrap_or_default();
    let owner = refs
        .iter()
        .find(|r| r.controller == Some(true))
        .or_else(|| refs.first())
        .map(|r| OwnerRef { kind: r.kind.clone(), name: r.name.clone() });
    Ok(SnapshotMeta {
        namespace: meta.namespace.clone(),
        name,
        uid: meta.uid.clone(),
        creation_ts: meta.creation_timestamp.as_ref().map(|t| t.0),
        annotations: meta.annotations.clone().unwrap_or_default(),
        owner,
        resource_version: meta.resource_version.clone(),
    })
}

/// Waiting wins over running, running over terminated.
fn container_state(state: &core_v1::ContainerState) -> Option<ContainerState> {
    if let Some(w) = &state.waiting {
        return Some(ContainerState::Waiting { reason: w.reason.clone(), message: w.message.clone() });
    }
    if let Some(r) = &state.running {
        return Some(ContainerState::Running { started_at: r.started_at.as_ref().map(|t| t.0) });
    }
    state.terminated.as_ref().map(|t| ContainerState::Terminated {
        exit_code: t.exit_code,
        finished_at: t.finished_at.as_ref().map(|t| t.0),
        reason: t.reason.clone(),
        message: t.message.clone(),
    })
}

fn statuses(list: Option<&Vec<core_v1::ContainerStatus>>) -> Vec<ContainerStatus> {
    list.map(|l| {
        l.iter()
            .map(|s| ContainerStatus {
                name: s.name.clone(),
                state: s.state.as_ref().and_then(container_state),
                restart_count: s.restart_count,
            })
            .collect()
    })
    .unwrap_or_default()
}

impl IntoSnapshot for core_v1::Pod {
    type Snapshot = PodSnapshot;

    fn to_snapshot(&self) -> Result<PodSnapshot> {
        let status = self.status.as_ref();
        Ok(PodSnapshot {
            meta: meta_from(&self.metadata)?,
            init_container_statuses: statuses(status.and_then(|s| s.init_container_statuses.as_ref())),
            container_statuses: statuses(status.and_then(|s| s.container_statuses.as_ref())),
        })
    }
}

impl IntoSnapshot for HorizontalPodAutoscaler {
    type Snapshot = AutoscalerSnapshot;

    fn to_snapshot(&self) -> Result<AutoscalerSnapshot> {
        let status = self.status.as_ref();
        Ok(AutoscalerSnapshot {
            meta: meta_from(&self.metadata)?,
            current_replicas: status.and_then(|s| s.current_replicas).unwrap_or(0),
            desired_replicas: status.map(|s| s.desired_replicas).unwrap_or(0),
        })
    }
}
