//! Error abstractions for peer store interactions.

use thiserror::Error;

/// Errors which may arise from interacting with the group's peer data store.
///
/// A provisioning attempt which finds the record already populated is not an
/// error. It is surfaced as a success outcome by the coordinator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the call for a transient reason.
    ///
    /// Safe to retry on the next triggering event.
    #[error("peer store is unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
    /// The caller no longer holds the group leader role, so the write was aborted.
    ///
    /// The record was not modified. Safe to retry once leadership is re-acquired.
    #[error("group leader role is not held, write aborted")]
    NotLeader,
}
