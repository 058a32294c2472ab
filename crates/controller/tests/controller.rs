#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kobs_controller::{Controller, ControllerConfig, ControllerError, Notification, ObserverSettings, PodReconciler, Reconciler};
use kobs_core::{
    ChangeEvent, ChangeKind, ContainerState, ContainerStatus, EventMetadata, OwnerRef, PodSnapshot, ReceiverEvent,
    ReconcileError, ResourceKey, SnapshotMeta, WatchAnnotations,
};
use kobs_receivers::{EventRouter, Receiver, ReceiverError, ReceiverRegistry, RouterConfig};
use kobs_store::{ChangeQueue, ExponentialFailureRateLimiter, Informer, WatchSource};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Lists `initial`, then applies whatever arrives on the channel.
struct ScriptedSource {
    initial: Vec<PodSnapshot>,
    updates: mpsc::UnboundedReceiver<PodSnapshot>,
}

#[async_trait::async_trait]
impl WatchSource<PodSnapshot> for ScriptedSource {
    fn describe(&self) -> String { "scripted pods".into() }

    async fn run(mut self: Box<Self>, informer: Informer<PodSnapshot>) -> anyhow::Result<()> {
        informer.on_restart(std::mem::take(&mut self.initial));
        while let Some(pod) = self.updates.recv().await {
            informer.on_apply(pod);
        }
        Ok(())
    }
}

/// Never completes its initial list.
struct StuckSource;

#[async_trait::async_trait]
impl WatchSource<PodSnapshot> for StuckSource {
    fn describe(&self) -> String { "stuck".into() }

    async fn run(self: Box<Self>, _informer: Informer<PodSnapshot>) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Fails the first `failures` attempts, then emits a notification.
struct Flaky {
    failures: usize,
    attempts: AtomicUsize,
}

impl Flaky {
    fn new(failures: usize) -> Arc<Self> { Arc::new(Self { failures, attempts: AtomicUsize::new(0) }) }

    fn attempts(&self) -> usize { self.attempts.load(Ordering::SeqCst) }
}

impl Reconciler<PodSnapshot> for Flaky {
    fn kind(&self) -> &'static str { "pod" }

    fn reconcile(&self, change: &ChangeEvent<PodSnapshot>) -> Result<Option<Notification>, ReconcileError> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(ReconcileError::transient("api unavailable"));
        }
        let meta = change.new.as_deref().or(change.old.as_deref()).map(|p| p.meta.clone()).unwrap_or_default();
        Ok(Some(Notification {
            event: ReceiverEvent {
                kind: change.kind,
                key: change.key.clone(),
                message: format!("{} {}", change.kind, change.key),
                metadata: EventMetadata::default(),
            },
            annotations: WatchAnnotations::for_pod(&meta),
            messages: Vec::new(),
        }))
    }
}

struct Counter {
    hits: AtomicUsize,
}

#[async_trait::async_trait]
impl Receiver for Counter {
    fn name(&self) -> &str { "log" }

    async fn handle(&self, _event: &ReceiverEvent) -> Result<(), ReceiverError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Forwards every delivered event to a channel.
struct Recorder(mpsc::UnboundedSender<ReceiverEvent>);

#[async_trait::async_trait]
impl Receiver for Recorder {
    fn name(&self) -> &str { "log" }

    async fn handle(&self, event: &ReceiverEvent) -> Result<(), ReceiverError> {
        let _ = self.0.send(event.clone());
        Ok(())
    }
}

struct Broken;

#[async_trait::async_trait]
impl Receiver for Broken {
    fn name(&self) -> &str { "log" }

    async fn handle(&self, _event: &ReceiverEvent) -> Result<(), ReceiverError> {
        Err(ReceiverError::delivery("log", "connection refused"))
    }
}

fn pod(name: &str, started_at: i64) -> PodSnapshot {
    PodSnapshot {
        meta: SnapshotMeta {
            namespace: Some("ns".into()),
            name: name.into(),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        init_container_statuses: Vec::new(),
        container_statuses: vec![ContainerStatus {
            name: "app".into(),
            state: Some(ContainerState::Running { started_at: chrono::DateTime::from_timestamp(started_at, 0) }),
            restart_count: 0,
        }],
    }
}

fn controller(
    reconciler: Arc<dyn Reconciler<PodSnapshot>>,
    receiver: Arc<dyn Receiver>,
    config: ControllerConfig,
) -> Arc<Controller<PodSnapshot>> {
    let router = Arc::new(EventRouter::new(Arc::new(ReceiverRegistry::new().with(receiver)), RouterConfig::default()));
    let limiter = ExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_millis(10));
    let queue = ChangeQueue::with_rate_limiter("pod", Box::new(limiter));
    Arc::new(Controller::new(reconciler, router, config).with_queue(queue))
}

fn counter() -> Arc<Counter> { Arc::new(Counter { hits: AtomicUsize::new(0) }) }

async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_item_is_retried_five_times_then_dropped() {
    let flaky = Flaky::new(usize::MAX);
    let ctrl = controller(flaky.clone(), counter(), ControllerConfig::default());
    let (tx, rx) = mpsc::unbounded_channel();
    let stop = CancellationToken::new();
    let run = tokio::spawn(Arc::clone(&ctrl).run(Box::new(ScriptedSource { initial: vec![pod("a", 1)], updates: rx }), stop.clone()));

    assert!(eventually(|| flaky.attempts() == 6).await, "attempts: {}", flaky.attempts());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(flaky.attempts(), 6, "no attempts after the item is dropped");
    assert_eq!(ctrl.queue().num_requeues(&ResourceKey::new(Some("ns"), "a")), 0);

    // A fresh mutation starts a new retry cycle.
    tx.send(pod("a", 2)).expect("send");
    assert!(eventually(|| flaky.attempts() == 12).await, "attempts: {}", flaky.attempts());

    stop.cancel();
    assert_eq!(run.await.expect("join"), Ok(()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn success_after_failures_delivers_once_and_resets_history() {
    let flaky = Flaky::new(2);
    let sink = counter();
    let ctrl = controller(flaky.clone(), sink.clone(), ControllerConfig::default());
    let (_tx, rx) = mpsc::unbounded_channel();
    let stop = CancellationToken::new();
    let run = tokio::spawn(Arc::clone(&ctrl).run(Box::new(ScriptedSource { initial: vec![pod("a", 1)], updates: rx }), stop.clone()));

    assert!(eventually(|| sink.hits.load(Ordering::SeqCst) == 1).await);
    assert_eq!(flaky.attempts(), 3);
    assert_eq!(ctrl.queue().num_requeues(&ResourceKey::new(Some("ns"), "a")), 0);
    assert_eq!(ctrl.cache().pending_len(), 0);

    stop.cancel();
    assert_eq!(run.await.expect("join"), Ok(()));
}

#[tokio::test]
async fn cache_sync_timeout_is_an_error() {
    let cfg = ControllerConfig { cache_sync_timeout: Duration::from_millis(50), ..ControllerConfig::default() };
    let ctrl = controller(Flaky::new(0), counter(), cfg);
    let err = Arc::clone(&ctrl).run(Box::new(StuckSource), CancellationToken::new()).await.unwrap_err();
    assert_eq!(err, ControllerError::CacheSyncTimeout { kind: "pod", waited: Duration::from_millis(50) });
    assert!(!ctrl.is_synced());
    assert!(ctrl.queue().is_shutting_down());
}

#[tokio::test]
async fn stop_before_sync_returns_promptly() {
    let ctrl = controller(Flaky::new(0), counter(), ControllerConfig::default());
    let stop = CancellationToken::new();
    stop.cancel();
    let err = Arc::clone(&ctrl).run(Box::new(StuckSource), stop).await.unwrap_err();
    assert_eq!(err, ControllerError::StoppedBeforeSync { kind: "pod" });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_listed_object_is_processed() {
    let flaky = Flaky::new(0);
    let sink = counter();
    let ctrl = controller(flaky.clone(), sink.clone(), ControllerConfig { workers: 4, ..ControllerConfig::default() });
    let (_tx, rx) = mpsc::unbounded_channel();
    let stop = CancellationToken::new();
    let initial = (0..20).map(|i| pod(&format!("p{i}"), 1)).collect();
    let run = tokio::spawn(Arc::clone(&ctrl).run(Box::new(ScriptedSource { initial, updates: rx }), stop.clone()));

    assert!(eventually(|| sink.hits.load(Ordering::SeqCst) == 20).await);
    assert!(ctrl.is_synced());
    assert_eq!(ctrl.cache().len(), 20);

    stop.cancel();
    assert_eq!(run.await.expect("join"), Ok(()));
    assert!(ctrl.queue().is_shutting_down());
    assert_eq!(ctrl.queue().in_flight(), 0);
}

fn stateful_pod(uid: &str, created: i64) -> PodSnapshot {
    let mut p = pod("web-0", 1);
    p.meta.uid = Some(uid.into());
    p.meta.creation_ts = chrono::DateTime::from_timestamp(created, 0);
    p.meta.owner = Some(OwnerRef { kind: "StatefulSet".into(), name: "web".into() });
    p
}

#[tokio::test]
async fn delete_and_recreation_before_dequeue_are_both_reported() {
    let mut settings = ObserverSettings::new("staging");
    settings.init_time = chrono::DateTime::from_timestamp(1_000, 0).expect("ts");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctrl = controller(Arc::new(PodReconciler::new(settings)), Arc::new(Recorder(tx)), ControllerConfig::default());
    let informer = ctrl.informer();

    informer.on_restart(vec![stateful_pod("u1", 10)]);
    assert!(ctrl.process_next().await);
    assert!(rx.try_recv().is_err(), "pods older than startup are not announced");

    informer.on_delete(stateful_pod("u1", 10));
    informer.on_apply(stateful_pod("u2", 2_000));
    assert_eq!(ctrl.cache().pending_len(), 2);
    assert_eq!(ctrl.queue().len(), 1);

    assert!(ctrl.process_next().await);
    assert!(ctrl.process_next().await);
    let deleted = rx.try_recv().expect("delete notification");
    assert_eq!(deleted.kind, ChangeKind::Delete);
    assert_eq!(deleted.message, "The pod `ns/web-0` in `staging` cluster has been deleted");
    let created = rx.try_recv().expect("add notification");
    assert_eq!(created.kind, ChangeKind::Add);
    assert!(created.message.contains("Pod name:`ns/web-0-u2`"), "{}", created.message);
    assert!(ctrl.queue().is_empty());
    assert_eq!(ctrl.cache().pending_len(), 0);
}

#[tokio::test]
async fn receiver_failure_does_not_fail_the_reconcile() {
    let flaky = Flaky::new(0);
    let ctrl = controller(flaky.clone(), Arc::new(Broken), ControllerConfig::default());
    ctrl.informer().on_restart(vec![pod("a", 1)]);

    assert!(ctrl.process_next().await);
    assert_eq!(flaky.attempts(), 1);
    assert_eq!(ctrl.queue().num_requeues(&ResourceKey::new(Some("ns"), "a")), 0);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(ctrl.queue().is_empty(), "delivery errors never requeue");
    assert_eq!(ctrl.cache().pending_len(), 0);
}

#[tokio::test]
async fn malformed_key_is_skipped_without_retry() {
    let flaky = Flaky::new(0);
    let ctrl = controller(flaky.clone(), counter(), ControllerConfig::default());
    ctrl.informer().on_restart(vec![pod("bad/name", 1)]);
    let key = ResourceKey::new(Some("ns"), "bad/name");
    assert!(key.validate().is_err());

    assert!(ctrl.process_next().await);
    assert_eq!(flaky.attempts(), 0);
    assert_eq!(ctrl.queue().num_requeues(&key), 0);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(ctrl.queue().is_empty());
    assert_eq!(ctrl.cache().pending_len(), 0);
}
