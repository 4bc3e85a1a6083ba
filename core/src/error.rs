//! Error taxonomy shared across the core crate. Kinds here are the ones
//! observable at API boundaries or by the lifecycle/benchmark callers; they
//! are deliberately distinct from the catch-all `anyhow::Error` used for
//! internal plumbing failures.

use thiserror::Error;

/// The session-facing error kinds a caller of the provisioner, destroyer or
/// session store needs to branch on.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A non-terminal Session already exists for this `(consumer_id,
    /// offer_id)` pair.
    #[error("duplicate session {existing_id} for consumer/offer pair")]
    DuplicateSession { existing_id: String },

    /// The selected offer evaporated upstream between listing and create;
    /// retryable with a different offer.
    #[error("offer is stale on provider {provider}")]
    StaleInventory { provider: String },

    /// No registered Provider with the given name.
    #[error("no such provider '{0}'")]
    ProviderNotFound(String),

    /// `Provider::create_instance` failed for a reason other than stale
    /// inventory; not retryable at this layer.
    #[error("create instance failed: {0}")]
    CreateFailed(#[source] anyhow::Error),

    /// The readiness deadline elapsed before a probe succeeded.
    #[error("verification timeout for session {session_id} after {elapsed_secs}s")]
    VerificationTimeout {
        session_id: String,
        elapsed_secs: u64,
    },

    /// Teardown could not be confirmed after exhausting `destroy_retries`.
    #[error(
        "destroy verification failed for session {session_id} (provider instance {provider_instance_id}) after {attempts} attempts"
    )]
    DestroyVerificationFailed {
        session_id: String,
        provider_instance_id: String,
        attempts: u32,
    },

    /// No Session with the given id.
    #[error("no such session '{0}'")]
    SessionNotFound(String),

    /// A lifecycle operation (e.g. extend, heartbeat) was invoked on a
    /// Session that has not yet reached `running`.
    #[error("session {0} is not ready")]
    NotReady(String),

    /// Any other internal failure; not part of the caller-observable
    /// taxonomy, wrapped for context only.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BrokerError {
    /// A short, stable, machine-readable tag for API responses and logs,
    /// matching the kind names enumerated in the error taxonomy.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::DuplicateSession { .. } => "duplicate-session",
            BrokerError::StaleInventory { .. } => "stale-inventory",
            BrokerError::ProviderNotFound(_) => "provider-not-found",
            BrokerError::CreateFailed(_) => "create-failed",
            BrokerError::VerificationTimeout { .. } => "verification-timeout",
            BrokerError::DestroyVerificationFailed { .. } => "destroy-verification-failed",
            BrokerError::SessionNotFound(_) => "session-not-found",
            BrokerError::NotReady(_) => "not-ready",
            BrokerError::Other(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_taxonomy() {
        let err = BrokerError::DuplicateSession {
            existing_id: "s1".into(),
        };
        assert_eq!(err.kind(), "duplicate-session");
    }
}
