//! Coordinated credential provisioning for a replicated workload group.
//!
//! Exactly one admin credential is generated per group, by the first instance
//! which holds the group leader role while the record is still absent. Every
//! replica, including ones added later by scale-out, reads the same value from
//! the group's shared peer data store.
//!
//! Leadership is arbitrated externally and is treated here as a point-in-time
//! capability, not a held lock. The window between the read and the write is
//! therefore closed by making the write path conditional: the store contract
//! is `set_if_absent`, and a concurrent writer winning the race is reported
//! back as a success (the record is populated either way). The coordinator
//! never retries internally. Failed calls are redelivered by the hosting
//! event loop.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;

use crate::error::StoreError;

/// The length of generated admin credentials.
pub const CREDENTIAL_LEN: usize = 16;

/// The group-scoped peer data store: a replicated map of string keys to
/// string values, readable by all group members.
///
/// The store does not enforce access control itself. Implementations are
/// expected to fence writes on the caller's leader role and surface
/// [`StoreError::NotLeader`] when the role has been lost.
#[async_trait]
pub trait PeerStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write `value` under `key` only if no value is currently present.
    ///
    /// This must be atomic with respect to concurrent writers of the same key.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<SetOutcome, StoreError>;
}

#[async_trait]
impl<S: PeerStore + ?Sized> PeerStore for std::sync::Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.as_ref().get(key).await
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<SetOutcome, StoreError> {
        self.as_ref().set_if_absent(key, value).await
    }
}

/// The outcome of a conditional store write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetOutcome {
    /// The value was written. The record was previously absent.
    Written,
    /// A value was already present and the write was skipped. The
    /// encapsulated string is the value currently stored.
    AlreadyPresent(String),
}

/// The outcome of a provisioning call.
///
/// Per group the transition `Provisioned` fires at most once for the lifetime
/// of the backing store. Everything after that is `AlreadyProvisioned`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// This call generated and stored the group's credential.
    Provisioned,
    /// The credential was already in place. No write was performed.
    AlreadyProvisioned,
}

/// Coordinator for one credential record of a replica group.
pub struct CredentialCoordinator<S> {
    store: S,
    key: String,
}

impl<S: PeerStore> CredentialCoordinator<S> {
    /// Create a new instance over the given store handle and record key.
    pub fn new(store: S, key: impl Into<String>) -> Self {
        Self { store, key: key.into() }
    }

    /// Ensure the group's credential record is populated.
    ///
    /// Only the current group leader should call this. A non-empty record is
    /// left untouched. An absent or empty record triggers generation of a new
    /// credential and a conditional write. Losing the conditional write to a
    /// concurrent leader is success: the group has a credential either way.
    pub async fn ensure_provisioned(&self) -> Result<ProvisionOutcome, StoreError> {
        if let Some(value) = self.store.get(&self.key).await? {
            if !value.is_empty() {
                return Ok(ProvisionOutcome::AlreadyProvisioned);
            }
        }
        let credential = generate_credential();
        match self.store.set_if_absent(&self.key, &credential).await? {
            SetOutcome::Written => {
                tracing::info!(key = %self.key, "credential provisioned for group");
                Ok(ProvisionOutcome::Provisioned)
            }
            SetOutcome::AlreadyPresent(_) => Ok(ProvisionOutcome::AlreadyProvisioned),
        }
    }

    /// Fetch the group's current credential, if provisioned.
    ///
    /// Pure read. Callable by any replica regardless of role. An empty stored
    /// value is reported as absent.
    pub async fn retrieve(&self) -> Result<Option<String>, StoreError> {
        Ok(self.store.get(&self.key).await?.filter(|value| !value.is_empty()))
    }
}

/// Generate a random credential of [`CREDENTIAL_LEN`] alphanumeric characters.
///
/// Drawn from the OS entropy source, as the value is used for workload
/// authentication.
pub fn generate_credential() -> String {
    OsRng.sample_iter(&Alphanumeric).take(CREDENTIAL_LEN).map(char::from).collect()
}
