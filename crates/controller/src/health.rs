//! Cache-sync status of every running controller, for liveness and readiness checks.

use std::sync::Arc;

use kobs_core::Snapshot;

use crate::controller::Controller;

pub trait SyncStatus: Send + Sync {
    fn kind(&self) -> &'static str;
    fn is_synced(&self) -> bool;
}

impl<S: Snapshot> SyncStatus for Controller<S> {
    fn kind(&self) -> &'static str { Controller::kind(self) }

    fn is_synced(&self) -> bool { Controller::is_synced(self) }
}

#[derive(Clone, Default)]
pub struct Health {
    controllers: Vec<Arc<dyn SyncStatus>>,
}

impl Health {
    pub fn new() -> Self { Self::default() }

    pub fn watch(&mut self, ctrl: Arc<dyn SyncStatus>) { self.controllers.push(ctrl); }

    /// Healthy once every watched controller has synced its cache.
    pub fn is_healthy(&self) -> bool { self.controllers.iter().all(|p| p.is_synced()) }

    pub fn report(&self) -> Vec<(&'static str, bool)> { self.controllers.iter().map(|p| (p.kind(), p.is_synced())).collect() }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    struct Flag(&'static str, AtomicBool);

    impl SyncStatus for Flag {
        fn kind(&self) -> &'static str { self.0 }

        fn is_synced(&self) -> bool { self.1.load(Ordering::SeqCst) }
    }

    #[test]
    fn healthy_only_when_every_controller_synced() {
        let pods = Arc::new(Flag("pod", AtomicBool::new(true)));
        let hpas = Arc::new(Flag("autoscaler", AtomicBool::new(false)));
        let mut health = Health::new();
        health.watch(pods);
        health.watch(hpas.clone());
        assert!(!health.is_healthy());
        assert_eq!(health.report(), vec![("pod", true), ("autoscaler", false)]);
        hpas.1.store(true, Ordering::SeqCst);
        assert!(health.is_healthy());
    }
}
