//! Leader election over the `coordination.k8s.io/v1` API.
//!
//! One operator replica at a time holds the group leader role, arbitrated
//! through a K8s `Lease` object. The protocol follows the upstream Go client
//! implementation: holders renew the lease ahead of its expiry, candidates
//! take it over once a full lease duration has elapsed without an observed
//! change.
//!
//! Holding the lease is not a lock. Before acting on leadership, callers
//! re-check the lease through `SecretPeerStore::fence`, which closes the
//! window between losing the lease and observing the loss.

use anyhow::{ensure, Context, Result};
use chrono::{prelude::*, Duration};
use futures::prelude::*;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube_runtime::watcher::{watcher, Error as WatcherError, Event};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::BroadcastStream;

type DateTimeUtc = DateTime<Utc>;

const JITTER_FACTOR: f64 = 1.2;

const METRIC_IS_LEADER: &str = "redis_operator_is_leader";
const METRIC_LEADERSHIP_CHANGE: &str = "redis_operator_num_leadership_changes";

/// The leadership states an elector may report.
#[derive(Clone, Debug, PartialEq)]
pub enum LeaderState {
    /// This replica holds the lease.
    Leading,
    /// Another replica holds the lease, identified by the encapsulated string.
    Following(String),
    /// The lease state is unknown, or the elector task is starting or stopping.
    Standby,
}

/// Configuration for leader election.
pub struct LeaderElectionConfig {
    /// The name of the lease object.
    name: String,
    /// The namespace of the lease object.
    namespace: String,
    /// The identity to use when the lease is acquired.
    identity: String,
    /// The duration candidates wait without an observed lease change before
    /// force-acquiring leadership.
    ///
    /// Core K8s clients default this value to 15 seconds. Keep it as short as
    /// clock skew tolerance allows, as it bounds how long the group can go
    /// without a leader after a crash.
    lease_duration: Duration,
    /// The interval at which the current holder refreshes the lease.
    ///
    /// Core K8s clients default this value to 10 seconds.
    renew_deadline: Duration,
    /// The duration clients wait between retries of lease actions.
    ///
    /// Core K8s clients default this value to 2 seconds.
    #[allow(dead_code)]
    retry_period: Duration,
}

impl LeaderElectionConfig {
    /// Create a new config, validating the given durations against each other.
    pub fn new(
        namespace: impl AsRef<str>, name: impl AsRef<str>, identity: String, lease_duration: Duration, renew_deadline: Duration,
        retry_period: Duration,
    ) -> Result<Self> {
        ensure!(lease_duration > renew_deadline, "lease_duration must be greater than renew_deadline");
        ensure!(
            renew_deadline > Duration::seconds((JITTER_FACTOR * retry_period.num_seconds() as f64) as i64),
            "renew_deadline must be greater than retry_period*{}",
            JITTER_FACTOR,
        );
        ensure!(lease_duration.num_seconds() >= 1, "lease_duration must be at least 1 second");
        ensure!(renew_deadline.num_seconds() >= 1, "renew_deadline must be at least 1 second");
        ensure!(retry_period.num_seconds() >= 1, "retry_period must be at least 1 second");
        Ok(Self {
            name: name.as_ref().to_string(),
            namespace: namespace.as_ref().to_string(),
            identity,
            lease_duration,
            renew_deadline,
            retry_period,
        })
    }
}

/// A task which acquires and maintains a `coordination.k8s.io/v1` `Lease` to
/// establish the group leader role.
pub struct LeaderElector {
    /// An K8s API wrapper around the client.
    api: Api<Lease>,
    /// The name to use for managing lease fields for Server-Side Apply.
    manager: String,
    /// Leader election config.
    config: LeaderElectionConfig,
    /// Sender for the current state of the leadership coordination system.
    state_tx: watch::Sender<LeaderState>,
    /// The last known leader state.
    state: LeaderState,
    /// A broadcast channel used to trigger task shutdown.
    shutdown: BroadcastStream<()>,

    /// The lease as last observed.
    last_observed_lease: Lease,
    /// The last time a change was observed on the lease.
    last_observed_change: DateTimeUtc,
}

impl LeaderElector {
    /// Create a new instance along with a channel of leadership state changes.
    pub fn new(
        lease: Lease, config: LeaderElectionConfig, manager: impl AsRef<str>, client: Client, shutdown: broadcast::Receiver<()>,
    ) -> (Self, watch::Receiver<LeaderState>) {
        metrics::register_gauge!(
            METRIC_LEADERSHIP_CHANGE,
            metrics::Unit::Count,
            "the number of leadership changes in the operator group"
        );
        metrics::register_gauge!(
            METRIC_IS_LEADER,
            metrics::Unit::Count,
            "a gauge indicating if this replica is the leader, where 1.0 indicates leadership, any other value does not"
        );
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        (
            LeaderElector {
                api: kube::Api::namespaced(client, &config.namespace),
                last_observed_lease: lease,
                last_observed_change: Utc::now(),
                config,
                manager: manager.as_ref().to_string(),
                state_tx,
                state: LeaderState::Standby,
                shutdown: BroadcastStream::new(shutdown),
            },
            state_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!("leader elector task started");

        // Initial pass at acquiring / renewing the lease.
        if let Err(err) = self.try_acquire_or_renew().await {
            tracing::error!(error = ?err, "error attempting to acquire/renew lease");
        }

        let lease_watcher = watcher(
            self.api.clone(),
            ListParams {
                field_selector: Some(format!("metadata.name={}", self.config.name)),
                ..Default::default()
            },
        );
        tokio::pin!(lease_watcher);

        loop {
            let delay_duration = self.get_next_acquire_renew_time();
            tracing::debug!("delaying for {}s", delay_duration.as_secs());
            let delay = tokio::time::sleep(delay_duration);
            tokio::pin!(delay);
            tokio::select! {
                Some(lease_change_res) = lease_watcher.next() => self.handle_lease_watcher_change(lease_change_res).await,
                _ = &mut delay => {
                    if let Err(err) = self.try_acquire_or_renew().await {
                        tracing::error!(error = ?err, "error during call to try_acquire_or_renew");
                        if !matches!(&self.state, LeaderState::Standby) {
                            self.set_state(LeaderState::Standby);
                        }
                        self.last_observed_change = Utc::now();
                    }
                }
                _ = self.shutdown.next() => break,
            }
        }

        tracing::info!("leader elector task stopped");
    }

    /// Handle a change from the lease watcher.
    #[tracing::instrument(level = "debug", skip(self, res))]
    async fn handle_lease_watcher_change(&mut self, res: std::result::Result<Event<Lease>, WatcherError>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                tracing::error!(error = ?err, "error from lease watcher stream");
                return;
            }
        };
        let lease = match event {
            Event::Applied(lease) => lease,
            _ => return,
        };
        if let Some(Some(transitions)) = lease.spec.as_ref().map(|spec| spec.lease_transitions) {
            metrics::gauge!(METRIC_LEADERSHIP_CHANGE, transitions as f64);
        }
        if lease != self.last_observed_lease {
            tracing::debug!("lease update observed from watcher stream");
            self.last_observed_change = Utc::now();
            self.update_lease_from_api(lease);
        }
    }

    /// Ensure that the target lease exists.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn ensure_lease(&mut self) -> Result<()> {
        // Attempt to fetch the target lease, updating our last observed info on the lease.
        let now = Utc::now();
        let get_res = timeout(Self::timeout(), self.api.get(&self.config.name))
            .await
            .context("timeout fetching lease")?
            .context("error fetching lease");
        if let Ok(lease) = get_res {
            if self.last_observed_lease == lease {
                return Ok(()); // Nothing to do.
            }

            // Changes in the lease have been detected, update observation info.
            self.last_observed_change = now;
            self.update_lease_from_api(lease);
            return Ok(());
        }

        // Attempt to create the lease if it does not already exist.
        let lease = timeout(Self::timeout(), self.api.create(&Default::default(), &self.last_observed_lease))
            .await
            .context("timeout creating lease")?
            .context("error creating lease")?;
        self.last_observed_change = now;
        self.update_lease_from_api(lease);
        Ok(())
    }

    /// Attempt to acquire or renew the target lease.
    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn try_acquire_or_renew(&mut self) -> Result<()> {
        // 1. Ensure lease exists and update observation info as needed.
        self.ensure_lease().await.context("error ensuring lease exists")?;

        // 2. Determine what type of update needs to be made to the lease. If following a
        // non-expired leader, then we are done here.
        let now = Utc::now();
        let deadline_as_follower = self.last_observed_change + self.config.lease_duration;
        let updated_lease = match &self.state {
            LeaderState::Following(other) if deadline_as_follower > now => {
                tracing::debug!("leadership lease is held by {} and has not yet expired", other);
                return Ok(());
            }
            state => {
                let mut lease = self.last_observed_lease.clone();
                let spec = lease.spec.get_or_insert_with(Default::default);
                spec.lease_duration_seconds = Some(self.config.lease_duration.num_seconds() as i32); // i64 as i32 will take only lower bits.
                spec.renew_time = Some(MicroTime(now));
                if !matches!(state, LeaderState::Leading) {
                    spec.holder_identity = Some(self.config.identity.clone());
                    spec.acquire_time = Some(MicroTime(now));
                    spec.lease_transitions = Some(spec.lease_transitions.map(|val| val + 1).unwrap_or(0));
                }
                lease.metadata.managed_fields = None; // Can not pass this along for update.
                lease
            }
        };

        // 3. Now we need to update the lease in K8s with the updated lease value here.
        let mut params = PatchParams::apply(&self.manager);
        params.force = true; // This will still be blocked by the server if we do not have the most up-to-date lease info.
        let lease = timeout(Self::timeout(), self.api.patch(&self.config.name, &params, &Patch::Apply(updated_lease)))
            .await
            .context("timeout while updating lease")?
            .context("error updating lease")?;
        self.last_observed_change = now;
        self.update_lease_from_api(lease);

        Ok(())
    }

    /// Update the lease object as observed from the API.
    ///
    /// This will also handle updating this object's leadership state and will
    /// emit state change events as needed.
    #[tracing::instrument(level = "debug", skip(self, lease))]
    fn update_lease_from_api(&mut self, lease: Lease) {
        self.last_observed_lease = lease;
        let holder = self
            .last_observed_lease
            .spec
            .as_ref()
            .map(|spec| {
                if let Some(transitions) = spec.lease_transitions {
                    metrics::gauge!(METRIC_LEADERSHIP_CHANGE, transitions as f64);
                }
                spec.holder_identity.as_deref().unwrap_or_default()
            })
            .unwrap_or_default();
        let lease_is_held = holder == self.config.identity;
        let state_opt = match &self.state {
            LeaderState::Leading if lease_is_held => None,
            LeaderState::Following(id) if id == holder => None,
            LeaderState::Following(_) if lease_is_held => Some(LeaderState::Leading),
            LeaderState::Standby if lease_is_held => Some(LeaderState::Leading),
            LeaderState::Leading | LeaderState::Following(_) | LeaderState::Standby => Some(LeaderState::Following(holder.into())),
        };
        if let Some(state) = state_opt {
            self.set_state(state);
        }
    }

    /// Get the duration to delay before attempting the next lease update.
    fn get_next_acquire_renew_time(&mut self) -> std::time::Duration {
        let now = Utc::now();
        let addend = match &self.state {
            LeaderState::Leading => self.config.renew_deadline,
            _ => self.config.lease_duration,
        };
        let deadline = self.last_observed_change + addend;
        if deadline > now {
            // Deadline is in the future, so delay until deadline.
            let delta = deadline - now;
            std::time::Duration::from_secs(delta.num_seconds() as u64)
        } else {
            std::time::Duration::from_secs(0)
        }
    }

    /// Set the current leader state & emit a state update.
    fn set_state(&mut self, state: LeaderState) {
        self.state = state;
        let _ = self.state_tx.send(self.state.clone());
        metrics::gauge!(METRIC_IS_LEADER, if matches!(self.state, LeaderState::Leading) { 1.0 } else { 0.0 });
    }

    /// The default timeout to use for interacting with the K8s API.
    fn timeout() -> std::time::Duration {
        std::time::Duration::from_secs(10)
    }
}
