//! The Secret-backed peer data store.
//!
//! Peer data shared by the workload group lives in a single K8s Secret. The
//! store exposes plain reads to every caller, while writes are fenced on the
//! coordination lease and made conditional on the observed state of the
//! Secret, so concurrent writers of the same key can not clobber each other.
//! A conditional write rejected by the API server is resolved by re-reading
//! the record instead of retrying the write.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::client::Client;
use kube::Resource;
use tokio::time::timeout;

use crate::config::Config;
use crate::k8s::set_workload_labels;
use redis_core::credential::{PeerStore, SetOutcome};
use redis_core::StoreError;

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// A peer data store backed by a namespaced K8s Secret.
#[derive(Clone)]
pub struct SecretPeerStore {
    client: Client,
    config: Arc<Config>,
    /// The name of the backing Secret.
    secret_name: String,
    /// The name of the lease fencing writes to the store.
    lease_name: String,
}

impl SecretPeerStore {
    /// Create a new instance.
    pub fn new(client: Client, config: Arc<Config>, lease_name: String) -> Self {
        let secret_name = config.peers_secret_name();
        Self { client, config, secret_name, lease_name }
    }

    fn api(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    /// Fetch the backing Secret, mapping a missing object to `None`.
    async fn fetch(&self) -> Result<Option<Secret>> {
        let res = timeout(API_TIMEOUT, self.api().get(&self.secret_name))
            .await
            .context("timeout while fetching peer data secret")?;
        match res {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(err)) if err.code == http::StatusCode::NOT_FOUND => Ok(None),
            Err(err) => Err(err).context("error fetching peer data secret"),
        }
    }

    /// The identity currently holding the coordination lease, if any.
    async fn lease_holder(&self) -> Result<Option<String>> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let lease = timeout(API_TIMEOUT, api.get(&self.lease_name))
            .await
            .context("timeout while fetching coordination lease")?
            .context("error fetching coordination lease")?;
        Ok(lease.spec.and_then(|spec| spec.holder_identity))
    }

    /// Ensure this pod still holds the coordination lease.
    ///
    /// Called before every write. Leadership observed through the elector's
    /// state channel may be stale by the time a write is issued, so the lease
    /// is re-checked against the API at the fencing point.
    pub async fn fence(&self) -> Result<(), StoreError> {
        let holder = self.lease_holder().await?;
        if holder.as_deref() != Some(self.config.pod_name.as_str()) {
            return Err(StoreError::NotLeader);
        }
        Ok(())
    }

    /// Resolve a conditional write which was rejected by the API server.
    ///
    /// Another writer got there first. Whatever it stored under the key is
    /// the record of truth now.
    async fn lost_write(&self, key: &str) -> Result<SetOutcome, StoreError> {
        tracing::debug!(%key, "conditional write lost, re-reading peer data");
        let secret = self.fetch().await?;
        match secret.as_ref().and_then(|secret| decode(secret, key)).filter(|value| !value.is_empty()) {
            Some(value) => Ok(SetOutcome::AlreadyPresent(value)),
            None => Err(StoreError::Unavailable(anyhow!(
                "conditional write for key {} was rejected but no value is present",
                key
            ))),
        }
    }
}

#[async_trait]
impl PeerStore for SecretPeerStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let secret = self.fetch().await?;
        Ok(secret.as_ref().and_then(|secret| decode(secret, key)))
    }

    #[tracing::instrument(level = "debug", skip(self, value))]
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<SetOutcome, StoreError> {
        self.fence().await?;
        let api = self.api();
        let mut secret = match self.fetch().await? {
            Some(secret) => secret,
            None => {
                // No Secret yet, so creation itself is the conditional write.
                let secret = build_peers_secret(&self.config, key, value);
                let res = timeout(API_TIMEOUT, api.create(&PostParams::default(), &secret))
                    .await
                    .map_err(|err| StoreError::Unavailable(anyhow!(err).context("timeout while creating peer data secret")))?;
                return match res {
                    Ok(_) => {
                        tracing::info!(name = %self.secret_name, %key, "created peer data secret");
                        Ok(SetOutcome::Written)
                    }
                    Err(kube::Error::Api(err)) if err.code == http::StatusCode::CONFLICT => self.lost_write(key).await,
                    Err(err) => Err(StoreError::Unavailable(anyhow!(err).context("error creating peer data secret"))),
                };
            }
        };

        if let Some(existing) = decode(&secret, key).filter(|value| !value.is_empty()) {
            return Ok(SetOutcome::AlreadyPresent(existing));
        }

        // Replace the Secret pinned to the resourceVersion just observed. The
        // API server rejects the write if anything changed in between.
        let data = secret.data.get_or_insert_with(Default::default);
        data.insert(key.into(), ByteString(value.as_bytes().to_vec()));
        secret.metadata.managed_fields = None;
        let res = timeout(API_TIMEOUT, api.replace(&self.secret_name, &PostParams::default(), &secret))
            .await
            .map_err(|err| StoreError::Unavailable(anyhow!(err).context("timeout while updating peer data secret")))?;
        match res {
            Ok(_) => {
                tracing::info!(name = %self.secret_name, %key, "updated peer data secret");
                Ok(SetOutcome::Written)
            }
            Err(kube::Error::Api(err)) if err.code == http::StatusCode::CONFLICT => self.lost_write(key).await,
            Err(err) => Err(StoreError::Unavailable(anyhow!(err).context("error updating peer data secret"))),
        }
    }
}

/// Decode the value stored under the given key of a peer data Secret.
pub(super) fn decode(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
}

/// Build a new peer data Secret seeded with the given record.
pub(super) fn build_peers_secret(config: &Config, key: &str, value: &str) -> Secret {
    let mut secret = Secret::default();
    secret.meta_mut().name = Some(config.peers_secret_name());
    secret.meta_mut().namespace = Some(config.namespace.clone());
    let labels = secret.meta_mut().labels.get_or_insert_with(Default::default);
    set_workload_labels(labels, config);
    let data: &mut BTreeMap<String, ByteString> = secret.data.get_or_insert_with(Default::default);
    data.insert(key.into(), ByteString(value.as_bytes().to_vec()));
    secret
}
