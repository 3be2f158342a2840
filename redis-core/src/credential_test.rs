use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::credential::*;
use crate::error::StoreError;

/// An in-memory peer store which records every write performed against it.
#[derive(Default)]
struct MemoryStore {
    data: Mutex<BTreeMap<String, String>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    fn with_entry(key: &str, value: &str) -> Self {
        let store = Self::default();
        store.data.lock().unwrap().insert(key.into(), value.into());
        store
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<SetOutcome, StoreError> {
        let mut data = self.data.lock().unwrap();
        if let Some(existing) = data.get(key) {
            if !existing.is_empty() {
                return Ok(SetOutcome::AlreadyPresent(existing.clone()));
            }
        }
        data.insert(key.into(), value.into());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(SetOutcome::Written)
    }
}

/// A store wrapper simulating the external leadership arbiter: writes are
/// rejected with `NotLeader` while the role flag is unset.
struct FencedStore {
    inner: MemoryStore,
    is_leader: AtomicBool,
}

impl FencedStore {
    fn new(is_leader: bool) -> Self {
        Self { inner: MemoryStore::default(), is_leader: AtomicBool::new(is_leader) }
    }
}

#[async_trait]
impl PeerStore for FencedStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<SetOutcome, StoreError> {
        if !self.is_leader.load(Ordering::SeqCst) {
            return Err(StoreError::NotLeader);
        }
        self.inner.set_if_absent(key, value).await
    }
}

fn assert_is_credential(value: &str) {
    assert_eq!(value.len(), CREDENTIAL_LEN, "unexpected credential length, got {}", value.len());
    assert!(
        value.chars().all(|c| c.is_ascii_alphanumeric()),
        "credential contains non-alphanumeric characters: {}",
        value
    );
}

#[test]
fn generated_credentials_are_alphanumeric_and_distinct() {
    let mut seen = std::collections::BTreeSet::new();
    for _ in 0..1000 {
        let credential = generate_credential();
        assert_is_credential(&credential);
        seen.insert(credential);
    }
    assert_eq!(seen.len(), 1000, "expected 1000 distinct credentials, got {}", seen.len());
}

#[tokio::test]
async fn retrieve_before_provisioning_returns_none() -> Result<()> {
    let coordinator = CredentialCoordinator::new(MemoryStore::default(), "redis-password");
    assert_eq!(coordinator.retrieve().await?, None);
    Ok(())
}

#[tokio::test]
async fn first_provisioning_writes_once_and_is_stable() -> Result<()> {
    let coordinator = CredentialCoordinator::new(MemoryStore::default(), "redis-password");

    let outcome = coordinator.ensure_provisioned().await?;
    assert_eq!(outcome, ProvisionOutcome::Provisioned);

    let value = coordinator.retrieve().await?.expect("credential should be present");
    assert_is_credential(&value);

    // Reads are stable across any number of calls.
    for _ in 0..10 {
        assert_eq!(coordinator.retrieve().await?.as_deref(), Some(value.as_str()));
    }
    Ok(())
}

#[tokio::test]
async fn second_provisioning_call_is_a_noop() -> Result<()> {
    let store = Arc::new(MemoryStore::default());
    let coordinator = CredentialCoordinator::new(store.clone(), "redis-password");

    assert_eq!(coordinator.ensure_provisioned().await?, ProvisionOutcome::Provisioned);
    let first = coordinator.retrieve().await?;

    // Second call from a later leadership grant, possibly on another replica.
    let second_replica = CredentialCoordinator::new(store.clone(), "redis-password");
    assert_eq!(second_replica.ensure_provisioned().await?, ProvisionOutcome::AlreadyProvisioned);

    assert_eq!(store.writes(), 1, "expected exactly one store write, got {}", store.writes());
    assert_eq!(coordinator.retrieve().await?, first, "stored value must not change");
    Ok(())
}

#[tokio::test]
async fn empty_record_is_treated_as_unprovisioned() -> Result<()> {
    let store = MemoryStore::with_entry("redis-password", "");
    let coordinator = CredentialCoordinator::new(store, "redis-password");

    assert_eq!(coordinator.retrieve().await?, None);
    assert_eq!(coordinator.ensure_provisioned().await?, ProvisionOutcome::Provisioned);
    assert!(coordinator.retrieve().await?.is_some());
    Ok(())
}

#[tokio::test]
async fn concurrent_provisioning_converges_on_one_value() -> Result<()> {
    const CONCURRENCY: usize = 16;

    let store = Arc::new(MemoryStore::default());
    let barrier = Arc::new(tokio::sync::Barrier::new(CONCURRENCY));

    let mut handles = Vec::with_capacity(CONCURRENCY);
    for _ in 0..CONCURRENCY {
        let (store, barrier) = (store.clone(), barrier.clone());
        handles.push(tokio::spawn(async move {
            let coordinator = CredentialCoordinator::new(store, "redis-password");
            barrier.wait().await;
            coordinator.ensure_provisioned().await
        }));
    }

    let mut provisioned = 0;
    for handle in handles {
        if handle.await?? == ProvisionOutcome::Provisioned {
            provisioned += 1;
        }
    }

    assert_eq!(provisioned, 1, "exactly one caller must win the race, got {}", provisioned);
    assert_eq!(store.writes(), 1, "expected exactly one store write, got {}", store.writes());

    // Every replica observes the same value afterwards.
    let value = store.get("redis-password").await?.expect("credential should be present");
    assert_is_credential(&value);
    for _ in 0..CONCURRENCY {
        let coordinator = CredentialCoordinator::new(store.clone(), "redis-password");
        assert_eq!(coordinator.retrieve().await?.as_deref(), Some(value.as_str()));
    }
    Ok(())
}

#[tokio::test]
async fn lost_leadership_aborts_the_write_and_is_retriable() -> Result<()> {
    let store = Arc::new(FencedStore::new(false));
    let coordinator = CredentialCoordinator::new(store.clone(), "redis-password");

    // Role lost between the triggering event and the write: abort, no mutation.
    match coordinator.ensure_provisioned().await {
        Err(StoreError::NotLeader) => (),
        other => panic!("expected NotLeader, got {:?}", other),
    }
    assert_eq!(coordinator.retrieve().await?, None);

    // The event is redelivered once leadership is re-acquired.
    store.is_leader.store(true, Ordering::SeqCst);
    assert_eq!(coordinator.ensure_provisioned().await?, ProvisionOutcome::Provisioned);
    let value = coordinator.retrieve().await?.expect("credential should be present");

    // A later call without the role is still a read-only no-op success.
    store.is_leader.store(false, Ordering::SeqCst);
    assert_eq!(coordinator.ensure_provisioned().await?, ProvisionOutcome::AlreadyProvisioned);
    assert_eq!(coordinator.retrieve().await?.as_deref(), Some(value.as_str()));
    Ok(())
}

#[tokio::test]
async fn record_survives_replica_teardown() -> Result<()> {
    let store = Arc::new(MemoryStore::default());

    let value = {
        let coordinator = CredentialCoordinator::new(store.clone(), "redis-password");
        coordinator.ensure_provisioned().await?;
        coordinator.retrieve().await?.expect("credential should be present")
    };

    // All replicas gone; the store outlives them. A fresh replica scaling back
    // up still observes the original value.
    let coordinator = CredentialCoordinator::new(store, "redis-password");
    assert_eq!(coordinator.retrieve().await?.as_deref(), Some(value.as_str()));
    assert_eq!(coordinator.ensure_provisioned().await?, ProvisionOutcome::AlreadyProvisioned);
    Ok(())
}
