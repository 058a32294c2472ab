use kobs_core::{ChangeEvent, DerivedMessage, ReceiverEvent, ReconcileError, ResourceKey, WatchAnnotations};

/// A derived event ready to be routed.
#[derive(Debug, Clone)]
pub struct Notification {
    pub event: ReceiverEvent,
    /// Routing and flag annotations of the object the event is about.
    pub annotations: WatchAnnotations,
    /// The individual descriptions `event.message` was composed from.
    pub messages: Vec<DerivedMessage>,
}

/// Per-resource-type business logic.
///
/// `reconcile` is pure: it turns one pending change into at most one
/// notification. Delivery is the controller's job.
pub trait Reconciler<S>: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    /// Enqueue filter applied on the watch delivery path.
    fn should_watch(&self, _key: &ResourceKey, _obj: &S) -> bool { true }

    fn reconcile(&self, change: &ChangeEvent<S>) -> Result<Option<Notification>, ReconcileError>;
}
