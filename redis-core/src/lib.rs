//! Core domain types shared across the Redis operator.

pub mod credential;
#[cfg(test)]
mod credential_test;
pub mod error;
pub mod layer;
#[cfg(test)]
mod layer_test;

pub use error::StoreError;

/// The key under which the admin credential is stored in the peer data store.
pub const PEER_PASSWORD_KEY: &str = "redis-password";
/// The key under which the current master hostname is stored in the peer data store.
pub const LEADER_HOST_KEY: &str = "leader-host";

/// The port on which redis-server listens.
pub const REDIS_PORT: u16 = 6379;

/// Status message used while the workload is not yet answering health checks.
pub const WAITING_MESSAGE: &str = "Waiting for Redis...";
