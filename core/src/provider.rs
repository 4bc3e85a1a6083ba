//! The `Provider` port: the only supported extension point for new
//! marketplaces. A marketplace implementation registers under a name and
//! is otherwise opaque to the provisioner, verifiers and lifecycle
//! manager.

use crate::models::{Offer, OfferFilter};
use async_trait::async_trait;
use thiserror::Error;

/// Request to create an instance from a previously listed `Offer`.
#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    /// Used by providers that support idempotent creation to de-duplicate
    /// retried calls.
    pub session_id: String,
    pub offer_id: String,
    pub ssh_public_key: String,
    /// Tags applied to the upstream resource so that reconciliation can
    /// find orphans: `ShopperSessionID`, `ShopperDeploymentID`,
    /// `ShopperExpiresAt`, `ShopperConsumerID`.
    pub tags: InstanceTags,
}

#[derive(Debug, Clone)]
pub struct InstanceTags {
    pub session_id: String,
    pub deployment_id: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub consumer_id: String,
}

/// What `CreateInstance` hands back once the upstream call succeeds.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub provider_instance_id: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    /// Set for marketplaces that expose the workload over a bare HTTP
    /// endpoint instead of (or alongside) SSH; mutually usable with
    /// `host`/`port`, the readiness verifier prefers this pair when set.
    pub api_endpoint: Option<String>,
    pub api_port: Option<u16>,
    /// Present when the marketplace returns a concrete price that should
    /// override the offer's advertised `price_per_hour`.
    pub price_per_hour: Option<f64>,
}

/// Result of `GetInstanceStatus`.
#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub running: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub api_endpoint: Option<String>,
    pub api_port: Option<u16>,
}

/// An upstream instance surfaced by a deployment-scoped listing, used by
/// the lifecycle manager's reconciliation sweep to find orphans. The
/// reconciler must filter by deployment id to avoid touching instances of
/// other deployments sharing the same marketplace account; `Provider`
/// implementations are expected to apply that filter themselves given the
/// deployment id argument.
#[derive(Debug, Clone)]
pub struct TaggedInstance {
    pub provider_instance_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Static capability bits a provider may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    Ssh,
    HttpHealth,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The selected offer evaporated upstream; retryable with a different
    /// offer, never the same one.
    #[error("offer {offer_id} is no longer available")]
    StaleInventory { offer_id: String },

    /// Definitive proof that the upstream no longer knows this instance;
    /// used by the destruction verifier as confirmation of teardown.
    #[error("instance {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A marketplace integration. Implementations must be safe to call
/// concurrently for distinct instances; the core applies its own timeouts
/// at every call and never retries inside this trait's methods.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier used in `Session.provider` and in configuration
    /// (`providers.<name>`).
    fn name(&self) -> &str;

    async fn list_offers(&self, filter: &OfferFilter) -> Result<Vec<Offer>, ProviderError>;

    async fn create_instance(
        &self,
        req: CreateInstanceRequest,
    ) -> Result<InstanceInfo, ProviderError>;

    async fn get_instance_status(
        &self,
        provider_instance_id: &str,
    ) -> Result<InstanceStatus, ProviderError>;

    /// Must be safe to call repeatedly, including on an already-destroyed
    /// or never-existent instance.
    async fn destroy_instance(&self, provider_instance_id: &str) -> Result<(), ProviderError>;

    /// Lists upstream instances tagged with `deployment_id`, for the
    /// lifecycle manager's reconciliation sweep. Implementations are
    /// expected to apply the deployment-id filter themselves so that the
    /// reconciler never touches another deployment's instances on a
    /// shared marketplace account.
    async fn list_tagged_instances(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<TaggedInstance>, ProviderError>;

    fn supports_feature(&self, feature: Feature) -> bool;
}
