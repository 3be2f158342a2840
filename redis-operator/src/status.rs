//! Workload status tracking.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

const METRIC_WORKLOAD_ACTIVE: &str = "redis_operator_workload_active";

/// The operator's assessment of the managed workload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum Status {
    /// The workload is up and serving.
    Active,
    /// The workload is not yet serving, typically during startup or while
    /// peer data is being provisioned.
    Waiting(String),
    /// The workload can not make progress without operator intervention.
    Blocked(String),
}

/// A handle for publishing and reading the current workload status.
///
/// Cheap to clone and share across tasks. Writers swap the whole status,
/// readers get a consistent snapshot.
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<ArcSwap<Status>>,
}

impl StatusHandle {
    /// Create a new handle, starting in the waiting state.
    pub fn new() -> Self {
        metrics::register_gauge!(
            METRIC_WORKLOAD_ACTIVE,
            metrics::Unit::Count,
            "a gauge indicating if the managed workload is active, where 1.0 indicates active"
        );
        let handle = Self {
            inner: Arc::new(ArcSwap::from_pointee(Status::Waiting(redis_core::WAITING_MESSAGE.into()))),
        };
        metrics::gauge!(METRIC_WORKLOAD_ACTIVE, 0.0);
        handle
    }

    /// Publish a new status, logging transitions.
    pub fn set(&self, status: Status) {
        let old = self.inner.swap(Arc::new(status.clone()));
        if *old != status {
            tracing::info!(from = ?old, to = ?status, "workload status changed");
        }
        metrics::gauge!(METRIC_WORKLOAD_ACTIVE, if matches!(status, Status::Active) { 1.0 } else { 0.0 });
    }

    /// Get a snapshot of the current status.
    pub fn get(&self) -> Arc<Status> {
        self.inner.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_with_state_and_message() {
        let active = serde_json::to_value(&Status::Active).unwrap();
        assert_eq!(active["state"], "active");

        let waiting = serde_json::to_value(&Status::Waiting("Waiting for Redis...".into())).unwrap();
        assert_eq!(waiting["state"], "waiting");
        assert_eq!(waiting["message"], "Waiting for Redis...");

        let blocked = serde_json::to_value(&Status::Blocked("certificates missing".into())).unwrap();
        assert_eq!(blocked["state"], "blocked");
        assert_eq!(blocked["message"], "certificates missing");
    }

    #[test]
    fn handle_swaps_and_snapshots() {
        let handle = StatusHandle::new();
        assert!(matches!(*handle.get(), Status::Waiting(_)));

        handle.set(Status::Active);
        assert_eq!(*handle.get(), Status::Active);

        let snapshot = handle.get();
        handle.set(Status::Blocked("certificates missing".into()));
        assert_eq!(*snapshot, Status::Active, "snapshots must not observe later writes");
        assert!(matches!(*handle.get(), Status::Blocked(_)));
    }
}
