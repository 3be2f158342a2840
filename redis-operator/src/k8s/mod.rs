//! Kubernetes controller.
//!
//! The controller watches the workload objects it manages, caches the state
//! which applies to this group, and reconciles the observed state against the
//! desired state whenever either side changes.
//!
//! Every replica of the operator runs the controller, but only the current
//! holder of the coordination lease performs writes. Reconciliation tasks are
//! delivered through a queue and failed tasks are redelivered after a delay
//! instead of being retried in place.

mod coordination;
mod reconcile;
mod store;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::prelude::*;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube_runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream, ReceiverStream, WatchStream};

use crate::config::Config;
use crate::k8s::coordination::{LeaderElectionConfig, LeaderElector, LeaderState};
use crate::status::{Status, StatusHandle};
use crate::workload;

pub use store::SecretPeerStore;

/// The app name used by the operator.
const APP_NAME: &str = "redis-operator";
/// The timeout duration used before redelivering a failed reconciliation task.
const RESCHEDULE_TIMEOUT: Duration = Duration::from_secs(5);

type EventResult<T> = std::result::Result<Event<T>, WatcherError>;

/// The duration which leader elector clients should wait between action retries.
///
/// Core K8s clients default this value to 2 seconds.
const LEASE_RETRY_SECONDS: i64 = 2;

/// A reconciliation task to be performed by the group leader.
#[derive(Debug)]
pub enum ReconcileTask {
    /// Ensure the group's peer data records are provisioned.
    EnsurePeerData,
    /// Ensure the workload objects match their desired state.
    ReconcileWorkload,
}

/// The name of the coordination lease for the given managed app.
pub fn generate_lease_name(config: &Config) -> String {
    format!("{}-operator", config.app_name)
}

/// Set the canonical labels on an object controlled by this operator.
pub(crate) fn set_workload_labels(labels: &mut BTreeMap<String, String>, config: &Config) {
    labels.insert("app".into(), config.app_name.clone());
    labels.insert("app.kubernetes.io/managed-by".into(), APP_NAME.into());
}

/// Kubernetes controller for the managed Redis group.
pub struct Controller {
    /// K8s client.
    client: Client,
    /// Runtime config.
    config: Arc<Config>,
    /// The group's peer data store.
    store: SecretPeerStore,
    /// Handle for publishing the workload status.
    status: StatusHandle,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
    /// The configuration used to drive the leader election system, moved out after being spawned.
    leader_election_config: Option<LeaderElectionConfig>,
    /// The currently known leader state.
    leader_state: Option<LeaderState>,

    /// A channel of reconciliation tasks.
    tasks_tx: mpsc::Sender<ReconcileTask>,
    /// A channel of reconciliation tasks.
    tasks_rx: ReceiverStream<ReconcileTask>,

    /// The workload StatefulSet, as last observed.
    statefulset: Option<StatefulSet>,
    /// The workload's governing Service, as last observed.
    service: Option<Service>,
    /// The peer data Secret, as last observed.
    secret: Option<Secret>,
}

impl Controller {
    /// Create a new instance.
    pub fn new(
        client: Client, config: Arc<Config>, store: SecretPeerStore, status: StatusHandle, shutdown_tx: broadcast::Sender<()>,
    ) -> Result<Self> {
        let elect_conf = LeaderElectionConfig::new(
            &config.namespace,
            generate_lease_name(&config),
            config.pod_name.clone(),
            chrono::Duration::seconds(config.lease_duration_seconds as i64),
            chrono::Duration::seconds(config.lease_renew_seconds as i64),
            chrono::Duration::seconds(LEASE_RETRY_SECONDS),
        )
        .context("invalid lease coordination config")?;
        let (tasks_tx, tasks_rx) = mpsc::channel(1000);
        Ok(Self {
            client,
            config,
            store,
            status,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            leader_election_config: Some(elect_conf),
            leader_state: None,
            tasks_tx,
            tasks_rx: ReceiverStream::new(tasks_rx),
            statefulset: None,
            service: None,
            secret: None,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        // Spawn leader elector.
        let elect_config = match self.leader_election_config.take() {
            Some(elect_config) => elect_config,
            None => anyhow::bail!("error accessing leader election config, this should never happen"),
        };
        let lease = Self::generate_lease(&self.config);
        let (elector, state_rx_raw) = LeaderElector::new(
            lease,
            elect_config,
            self.config.pod_name.as_str(),
            self.client.clone(),
            self.shutdown_tx.subscribe(),
        );
        let (elector, mut state_rx) = (elector.spawn(), WatchStream::new(state_rx_raw.clone()));

        // Build watcher streams, each scoped to the single object this
        // controller manages.
        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let statefulsets_watcher = watcher(statefulsets, self.list_params_for(&self.config.app_name));
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let services_watcher = watcher(services, self.list_params_for(&self.config.app_name));
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let secrets_watcher = watcher(secrets, self.list_params_for(&self.config.peers_secret_name()));
        tokio::pin!(statefulsets_watcher, services_watcher, secrets_watcher);

        // Periodic workload health checks.
        let mut status_ticks = IntervalStream::new(tokio::time::interval(Duration::from_secs(
            self.config.status_check_interval_seconds,
        )));

        tracing::info!("k8s controller initialized");
        loop {
            tokio::select! {
                Some(k8s_event_res) = statefulsets_watcher.next() => self.handle_sts_event(k8s_event_res).await,
                Some(k8s_event_res) = services_watcher.next() => self.handle_service_event(k8s_event_res).await,
                Some(k8s_event_res) = secrets_watcher.next() => self.handle_secret_event(k8s_event_res).await,
                Some(new_leader_state) = state_rx.next() => {
                    tracing::debug!(state = ?new_leader_state, "new leader state detected");
                    self.leader_state = Some(new_leader_state.clone());
                    // On gaining leadership, drive a full pass over the managed
                    // objects in case the previous leader left work outstanding.
                    if matches!(&self.leader_state, Some(LeaderState::Leading)) {
                        self.spawn_task(ReconcileTask::EnsurePeerData, false);
                        self.spawn_task(ReconcileTask::ReconcileWorkload, false);
                    }
                }
                Some(task) = self.tasks_rx.next() => {
                    let state = { state_rx_raw.borrow().clone() }; // Ensure borrow ref doesn't leak read lock.
                    self.handle_reconcile_task(task, state).await;
                }
                Some(_) = status_ticks.next() => self.spawn_status_check(),
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("k8s controller shutting down");
        if let Err(err) = elector.await {
            tracing::error!(error = ?err, "error shutting down leader elector");
        }

        tracing::debug!("k8s controller shutdown");
        Ok(())
    }

    /// Handle reconciliation tasks. Only the leader acts on them.
    async fn handle_reconcile_task(&mut self, task: ReconcileTask, state: LeaderState) {
        if !matches!(state, LeaderState::Leading) {
            return;
        }
        match task {
            ReconcileTask::EnsurePeerData => self.ensure_peer_data().await,
            ReconcileTask::ReconcileWorkload => self.reconcile_workload().await,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_sts_event(&mut self, res: EventResult<StatefulSet>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from statefulset watcher stream");
                return;
            }
        };
        match event {
            Event::Applied(sts) => self.statefulset = Some(sts),
            Event::Deleted(_) => self.statefulset = None,
            Event::Restarted(mut objects) => self.statefulset = objects.pop(),
        }
        self.spawn_task(ReconcileTask::ReconcileWorkload, false);
    }

    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_service_event(&mut self, res: EventResult<Service>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from service watcher stream");
                return;
            }
        };
        match event {
            Event::Applied(service) => self.service = Some(service),
            Event::Deleted(_) => self.service = None,
            Event::Restarted(mut objects) => self.service = objects.pop(),
        }
        self.spawn_task(ReconcileTask::ReconcileWorkload, false);
    }

    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_secret_event(&mut self, res: EventResult<Secret>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from secret watcher stream");
                return;
            }
        };
        match event {
            Event::Applied(secret) => self.secret = Some(secret),
            Event::Deleted(_) => self.secret = None,
            Event::Restarted(mut objects) => self.secret = objects.pop(),
        }
        // The rendered workload layer depends on the peer data, so both the
        // records and the workload need a pass.
        self.spawn_task(ReconcileTask::EnsurePeerData, false);
        self.spawn_task(ReconcileTask::ReconcileWorkload, false);
    }

    /// Probe the managed workload on a background task and publish the
    /// resulting status.
    ///
    /// Runs on every replica, as probing is read-only. The probe pass takes
    /// up to the per-instance timeout for each replica of the group, so it
    /// must not be awaited inline on the control loop.
    fn spawn_status_check(&self) {
        let (client, config, store, status) =
            (self.client.clone(), self.config.clone(), self.store.clone(), self.status.clone());
        tokio::spawn(async move {
            if matches!(*status.get(), Status::Blocked(_)) {
                return;
            }
            match workload::check_managed(&client, &config, &store).await {
                Ok(info) => {
                    tracing::debug!(version = %info.version, "workload health check passed");
                    status.set(Status::Active);
                }
                Err(err) => {
                    tracing::debug!(error = ?err, "workload health check failed");
                    status.set(Status::Waiting(redis_core::WAITING_MESSAGE.into()));
                }
            }
        });
    }

    /// Spawn a task which emits a new reconciliation task.
    ///
    /// This indirection is used to ensure that we don't use an unlimited
    /// amount of memory with an unbounded queue, and also so that we do not
    /// block the controller from making progress and dead-locking when we hit
    /// the task queue cap.
    fn spawn_task(&self, task: ReconcileTask, is_retry: bool) {
        let tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            if is_retry {
                tokio::time::sleep(RESCHEDULE_TIMEOUT).await;
            }
            let _res = tx.send(task).await;
        });
    }

    /// Create a list params object which selects the single named object.
    fn list_params_for(&self, name: &str) -> ListParams {
        ListParams {
            field_selector: Some(format!("metadata.name={}", name)),
            ..Default::default()
        }
    }

    /// Generate a lease object to be used with the leader coordination system.
    fn generate_lease(config: &Config) -> Lease {
        let now = chrono::Utc::now();
        let mut labels = BTreeMap::new();
        set_workload_labels(&mut labels, config);
        Lease {
            metadata: ObjectMeta {
                name: Some(generate_lease_name(config)),
                namespace: Some(config.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                acquire_time: Some(MicroTime(now)),
                holder_identity: Some(config.pod_name.clone()),
                lease_duration_seconds: Some(config.lease_duration_seconds as i32),
                lease_transitions: Some(0),
                renew_time: Some(MicroTime(now)),
            }),
        }
    }
}
