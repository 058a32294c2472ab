use std::net::SocketAddr;
use std::time::Duration;

use clap::{ArgAction, Parser};
use kobs_controller::{ControllerConfig, ObserverSettings};
use kobs_receivers::RouterConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "kubeobserver", version, about = "Watch pods and autoscalers and notify receivers about their lifecycle")]
pub struct Config {
    /// Cluster name rendered into every notification
    #[arg(long = "cluster-name", env = "K8S_CLUSTER_NAME")]
    pub cluster_name: String,

    /// Receiver every event is sent to in addition to annotated ones
    #[arg(long = "default-receiver", env = "DEFAULT_RECEIVER", default_value = "log")]
    pub default_receiver: String,

    /// Pods whose namespace/name contains any of these are never watched
    #[arg(long = "exclude-pod-name-patterns", env = "EXCLUDE_POD_NAME_PATTERNS", value_delimiter = ',')]
    pub exclude_pod_name_patterns: Vec<String>,

    /// Worker tasks per controller
    #[arg(long = "workers", env = "WORKERS", default_value_t = 2)]
    pub workers: usize,

    #[arg(long = "cache-sync-timeout-secs", env = "CACHE_SYNC_TIMEOUT_SECS", default_value_t = 60)]
    pub cache_sync_timeout_secs: u64,

    /// Per-receiver delivery bound (unbounded when unset)
    #[arg(long = "receiver-timeout-secs", env = "RECEIVER_TIMEOUT_SECS")]
    pub receiver_timeout_secs: Option<u64>,

    /// Restrict watches to one namespace (default: all)
    #[arg(long = "namespace", env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    #[arg(long = "no-pods", action = ArgAction::SetTrue)]
    pub no_pods: bool,

    #[arg(long = "no-autoscalers", action = ArgAction::SetTrue)]
    pub no_autoscalers: bool,

    /// Prometheus exporter listen address, e.g. 0.0.0.0:9000
    #[arg(long = "metrics-addr", env = "METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Fallback log filter when KUBEOBSERVER_LOG is unset
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn settings(&self) -> ObserverSettings {
        let mut s = ObserverSettings::new(self.cluster_name.clone());
        s.exclude_pod_name_patterns =
            self.exclude_pod_name_patterns.iter().map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect();
        s
    }

    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers.max(1),
            cache_sync_timeout: Duration::from_secs(self.cache_sync_timeout_secs),
            ..ControllerConfig::default()
        }
    }

    pub fn router(&self) -> RouterConfig {
        RouterConfig {
            default_receiver: self.default_receiver.clone(),
            receiver_timeout: self.receiver_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_resolve_into_component_configs() {
        let cfg = Config::try_parse_from([
            "kubeobserver",
            "--cluster-name",
            "staging",
            "--exclude-pod-name-patterns",
            "kube-system/, ,istio",
            "--workers",
            "0",
            "--receiver-timeout-secs",
            "3",
            "--no-autoscalers",
        ])
        .expect("parse");
        assert_eq!(cfg.settings().exclude_pod_name_patterns, vec!["kube-system/", "istio"]);
        assert_eq!(cfg.controller().workers, 1);
        assert_eq!(cfg.controller().cache_sync_timeout, Duration::from_secs(60));
        assert_eq!(cfg.router().receiver_timeout, Some(Duration::from_secs(3)));
        assert_eq!(cfg.router().default_receiver, "log");
        assert!(cfg.no_autoscalers && !cfg.no_pods);
    }

    #[test]
    fn cluster_name_is_required() {
        std::env::remove_var("K8S_CLUSTER_NAME");
        assert!(Config::try_parse_from(["kubeobserver"]).is_err());
    }
}
