//! kubeobserver kubehub: list+watch sources backed by the Kubernetes API

#![forbid(unsafe_code)]

pub mod convert;

use std::fmt::Debug;

use anyhow::{Context, Result};
use futures::{Stream, StreamExt};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    runtime::WatchStreamExt,
    Client, Resource,
};
use kobs_store::{Informer, WatchSource};
use metrics::counter;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

pub use convert::IntoSnapshot;

/// Connect using the ambient kubeconfig or in-cluster service account.
pub async fn connect() -> Result<Client> { Client::try_default().await.context("creating kubernetes client") }

/// Watches one namespaced resource type, cluster-wide or in a single namespace.
pub struct KubeWatchSource<K: Resource> {
    api: Api<K>,
    kind: &'static str,
    namespace: Option<String>,
}

impl<K> KubeWatchSource<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    pub fn new(client: Client, kind: &'static str, namespace: Option<&str>) -> Self {
        let api = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        Self { api, kind, namespace: namespace.map(str::to_string) }
    }
}

pub fn pod_source(client: Client, namespace: Option<&str>) -> KubeWatchSource<Pod> { KubeWatchSource::new(client, "pod", namespace) }

pub fn autoscaler_source(client: Client, namespace: Option<&str>) -> KubeWatchSource<HorizontalPodAutoscaler> {
    KubeWatchSource::new(client, "autoscaler", namespace)
}

fn project<K: IntoSnapshot>(kind: &'static str, obj: &K) -> Option<K::Snapshot> {
    match obj.to_snapshot() {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(kind, error = %e, "skipping object that cannot be projected");
            counter!("kobs_watch_skipped_total", 1, "kind" => kind);
            None
        }
    }
}

/// Feed watch events into `informer` until the stream ends. Errors are logged and skipped.
async fn pump<K, St>(kind: &'static str, stream: St, informer: &Informer<K::Snapshot>)
where
    K: IntoSnapshot,
    St: Stream<Item = Result<Event<K>, watcher::Error>>,
{
    futures::pin_mut!(stream);
    while let Some(item) = stream.next().await {
        // The watcher recovers on its own after an error; the backoff spaces out its retries.
        let ev = match item {
            Ok(ev) => ev,
            Err(e) => {
                warn!(kind, error = %e, "watch error; retrying");
                counter!("kobs_watch_errors_total", 1, "kind" => kind);
                continue;
            }
        };
        match ev {
            Event::Applied(o) => {
                counter!("kobs_watch_events_total", 1, "kind" => kind, "event" => "applied");
                if let Some(s) = project(kind, &o) {
                    informer.on_apply(s);
                }
            }
            Event::Deleted(o) => {
                counter!("kobs_watch_events_total", 1, "kind" => kind, "event" => "deleted");
                if let Some(s) = project(kind, &o) {
                    informer.on_delete(s);
                }
            }
            Event::Restarted(list) => {
                counter!("kobs_watch_events_total", 1, "kind" => kind, "event" => "restarted");
                debug!(kind, count = list.len(), "watch restart");
                informer.on_restart(list.iter().filter_map(|o| project(kind, o)).collect());
            }
        }
    }
}

#[async_trait::async_trait]
impl<K> WatchSource<K::Snapshot> for KubeWatchSource<K>
where
    K: Resource + IntoSnapshot + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    fn describe(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{} watcher in namespace {}", self.kind, ns),
            None => format!("{} watcher in all namespaces", self.kind),
        }
    }

    async fn run(self: Box<Self>, informer: Informer<K::Snapshot>) -> Result<()> {
        let kind = self.kind;
        let stream = watcher::watcher(self.api.clone(), watcher::Config::default()).default_backoff();
        info!(kind, ns = ?self.namespace, "watcher started");
        pump(kind, stream, &informer).await;
        warn!(kind, "watcher stream ended");
        Ok(())
    }
}
