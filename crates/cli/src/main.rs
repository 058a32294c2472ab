use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use futures::future::join_all;
use kobs_controller::{AutoscalerReconciler, Controller, ControllerError, Health, PodReconciler};
use kobs_core::Snapshot;
use kobs_receivers::{EventRouter, LogReceiver, ReceiverRegistry};
use kobs_store::WatchSource;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;

use config::Config;

fn init_tracing(fallback: &str) {
    let env = std::env::var("KUBEOBSERVER_LOG").unwrap_or_else(|_| fallback.to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(cfg: &Config) {
    if let Some(sock) = cfg.metrics_addr {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(()) => info!(addr = %sock, "Prometheus metrics exporter listening"),
            Err(e) => warn!(error = %e, "failed to install metrics exporter"),
        }
    }
}

fn registry() -> ReceiverRegistry { ReceiverRegistry::new().with(Arc::new(LogReceiver)) }

type ControllerTask = (&'static str, JoinHandle<Result<(), ControllerError>>);

/// Run `ctrl` on its own task. A controller that fails to start is logged and
/// leaves the others running.
fn spawn_controller<S: Snapshot>(ctrl: Arc<Controller<S>>, source: Box<dyn WatchSource<S>>, stop: CancellationToken) -> ControllerTask {
    let kind = ctrl.kind();
    let handle = tokio::spawn(async move {
        let res = ctrl.run(source, stop).await;
        match &res {
            Ok(()) => info!(kind, "controller exited"),
            Err(e) => error!(kind, error = %e, "controller failed; other controllers keep running"),
        }
        res
    });
    (kind, handle)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_tracing(&cfg.log_level);
    init_metrics(&cfg);
    info!(
        cluster = %cfg.cluster_name,
        default_receiver = %cfg.default_receiver,
        exclude = ?cfg.exclude_pod_name_patterns,
        workers = cfg.workers,
        cache_sync_timeout_secs = cfg.cache_sync_timeout_secs,
        receiver_timeout_secs = ?cfg.receiver_timeout_secs,
        namespace = ?cfg.namespace,
        pods = !cfg.no_pods,
        autoscalers = !cfg.no_autoscalers,
        "kubeobserver starting"
    );

    let registry = Arc::new(registry());
    if !registry.contains(&cfg.default_receiver) {
        warn!(receiver = %cfg.default_receiver, known = ?registry.names(), "default receiver is not registered; events will only reach annotated receivers");
    }
    let router = Arc::new(EventRouter::new(registry, cfg.router()));
    let settings = cfg.settings();
    let client = kobs_kubehub::connect().await?;
    let ns = cfg.namespace.as_deref();
    let stop = CancellationToken::new();
    let mut health = Health::new();
    let mut tasks: Vec<ControllerTask> = Vec::new();

    if !cfg.no_pods {
        let ctrl = Arc::new(Controller::new(Arc::new(PodReconciler::new(settings.clone())), Arc::clone(&router), cfg.controller()));
        health.watch(ctrl.clone());
        let source = Box::new(kobs_kubehub::pod_source(client.clone(), ns));
        tasks.push(spawn_controller(ctrl, source, stop.clone()));
    }
    if !cfg.no_autoscalers {
        let ctrl = Arc::new(Controller::new(Arc::new(AutoscalerReconciler::new(settings.clone())), Arc::clone(&router), cfg.controller()));
        health.watch(ctrl.clone());
        let source = Box::new(kobs_kubehub::autoscaler_source(client.clone(), ns));
        tasks.push(spawn_controller(ctrl, source, stop.clone()));
    }
    if tasks.is_empty() {
        bail!("nothing to watch: both --no-pods and --no-autoscalers are set");
    }

    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("interrupt received; shutting down");
            }
            stop.cancel();
        });
    }
    {
        let stop = stop.clone();
        let health = health.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
            while !health.is_healthy() {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = stop.cancelled() => return,
                }
            }
            info!(controllers = ?health.report(), "all caches synced");
        });
    }

    let (kinds, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
    let results = join_all(handles).await;
    let failed: Vec<&str> = kinds
        .into_iter()
        .zip(results)
        .filter_map(|(kind, res)| match res {
            Ok(Ok(())) => None,
            Ok(Err(_)) => Some(kind),
            Err(e) => {
                error!(kind, error = %e, "controller task panicked");
                Some(kind)
            }
        })
        .collect();
    // Controllers that never started do not end the process; it serves until interrupted.
    stop.cancelled().await;
    if !failed.is_empty() {
        warn!(failed = ?failed, "some controllers did not run");
    }
    info!("kubeobserver stopped");
    Ok(())
}
