//! Durable key-value storage for sessions, cost records and benchmark
//! manifests, backed by `sled` (a WAL-capable embedded store, sufficient
//! given the core assumes a single writer per process and short
//! transactions).

mod cost_store;
mod manifest_store;
mod run_store;
mod session_store;

pub use cost_store::{CostStore, SledCostStore};
pub use manifest_store::{ManifestStore, SledManifestStore};
pub use run_store::{RunStore, SledRunStore};
pub use session_store::{SessionFilter, SessionStore, SledSessionStore};

#[cfg(test)]
pub use cost_store::MockCostStore;
#[cfg(test)]
pub use manifest_store::MockManifestStore;
#[cfg(test)]
pub use run_store::MockRunStore;
#[cfg(test)]
pub use session_store::MockSessionStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A non-terminal Session already exists for this `(consumer_id,
    /// offer_id)` pair; carries its id so the caller can surface
    /// `duplicate-session`.
    #[error("duplicate active session {existing_id}")]
    DuplicateActive { existing_id: String },

    #[error("no record with id '{0}'")]
    NotFound(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub(crate) fn backend(err: impl Into<anyhow::Error>) -> Self {
        StoreError::Backend(err.into())
    }
}
