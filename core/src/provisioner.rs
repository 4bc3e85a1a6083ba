//! The two-phase provisioner: creates a Session such that either no
//! upstream resource exists, or the upstream resource is recorded in
//! durable state. Never both-untrue, never both-true-but-unlinked.

use crate::config::LifecycleConfig;
use crate::error::BrokerError;
use crate::keys::{generate_agent_token, generate_keypair, DEFAULT_KEY_BITS};
use crate::models::{Session, SessionStatus, StoragePolicy, WorkloadType};
use crate::provider::{CreateInstanceRequest, InstanceTags, Provider, ProviderError};
use crate::store::{SessionStore, StoreError};
use crate::verifier::ReadinessVerifier;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Caller-supplied request to create a new Session.
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub consumer_id: String,
    pub provider: String,
    pub offer_id: String,
    pub gpu_type: String,
    pub gpu_count: u32,
    pub workload_type: WorkloadType,
    pub reservation_hours: f64,
    pub hard_max_override_hours: Option<f64>,
    pub idle_threshold_minutes: Option<u64>,
    pub storage_policy: Option<StoragePolicy>,
    pub price_per_hour: f64,
    pub key_bits: Option<usize>,
}

/// What the provisioner hands back to the API layer: the durable Session
/// plus the in-memory-only private key, which is never persisted.
#[derive(Debug, Clone)]
pub struct ProvisionedSession {
    pub session: Session,
    pub private_key_pem: String,
    pub agent_token: String,
}

/// Creates Sessions against a registry of named `Provider`s, handing
/// readiness off to a detached `ReadinessVerifier` task so that a client
/// disconnect cannot abort verification.
pub struct Provisioner {
    store: Arc<dyn SessionStore>,
    providers: HashMap<String, Arc<dyn Provider>>,
    verifier: Arc<ReadinessVerifier>,
    deployment_id: String,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn SessionStore>,
        providers: HashMap<String, Arc<dyn Provider>>,
        verifier: Arc<ReadinessVerifier>,
        lifecycle: &LifecycleConfig,
    ) -> Self {
        Provisioner {
            store,
            providers,
            verifier,
            deployment_id: lifecycle.deployment_id.clone(),
        }
    }

    pub async fn create_session(
        &self,
        req: CreateSessionRequest,
    ) -> Result<ProvisionedSession, BrokerError> {
        // Phase: guard.
        if let Some(existing) = self
            .store
            .get_active_by_consumer_and_offer(&req.consumer_id, &req.offer_id)
            .await
            .map_err(store_err)?
        {
            return Err(BrokerError::DuplicateSession {
                existing_id: existing.id,
            });
        }

        let provider = self
            .providers
            .get(&req.provider)
            .cloned()
            .ok_or_else(|| BrokerError::ProviderNotFound(req.provider.clone()))?;

        // Key material.
        let key_pair = generate_keypair(req.key_bits.unwrap_or(DEFAULT_KEY_BITS))
            .map_err(BrokerError::Other)?;
        let agent_token = generate_agent_token();

        // Phase A: durable intent.
        let now = Utc::now();
        let expires_at = now + ChronoDuration::seconds((req.reservation_hours * 3600.0) as i64);
        let mut session = Session {
            id: Uuid::new_v4().to_string(),
            consumer_id: req.consumer_id.clone(),
            provider: req.provider.clone(),
            offer_id: req.offer_id.clone(),
            provider_instance_id: None,
            gpu_type: req.gpu_type.clone(),
            gpu_count: req.gpu_count,
            workload_type: req.workload_type,
            status: SessionStatus::Pending,
            ssh_host: None,
            ssh_port: None,
            ssh_user: None,
            ssh_public_key: Some(key_pair.public_key_openssh.clone()),
            api_endpoint: None,
            api_port: None,
            reservation_hours: req.reservation_hours,
            hard_max_override_hours: req.hard_max_override_hours,
            idle_threshold_minutes: req.idle_threshold_minutes,
            storage_policy: req.storage_policy.unwrap_or_default(),
            price_per_hour: req.price_per_hour,
            created_at: now,
            expires_at,
            last_heartbeat: None,
            last_idle_seconds: 0,
            stopped_at: None,
            failure_reason: None,
        };

        match self.store.create(session.clone()).await {
            Ok(()) => {}
            Err(StoreError::DuplicateActive { existing_id }) => {
                return Err(BrokerError::DuplicateSession { existing_id })
            }
            Err(other) => return Err(store_err(other)),
        }

        // Phase B: upstream call.
        session.status = SessionStatus::Provisioning;
        self.store.update(session.clone()).await.map_err(store_err)?;

        let create_req = CreateInstanceRequest {
            session_id: session.id.clone(),
            offer_id: req.offer_id.clone(),
            ssh_public_key: key_pair.public_key_openssh.clone(),
            tags: InstanceTags {
                session_id: session.id.clone(),
                deployment_id: self.deployment_id.clone(),
                expires_at: session.effective_deadline(),
                consumer_id: req.consumer_id.clone(),
            },
        };

        let instance = match provider.create_instance(create_req).await {
            Ok(instance) => instance,
            Err(ProviderError::StaleInventory { offer_id }) => {
                session.status = SessionStatus::Failed;
                session.stopped_at = Some(Utc::now());
                session.failure_reason = Some("stale-inventory".to_string());
                self.store.update(session).await.map_err(store_err)?;
                return Err(BrokerError::StaleInventory {
                    provider: offer_id,
                });
            }
            Err(err) => {
                session.status = SessionStatus::Failed;
                session.stopped_at = Some(Utc::now());
                session.failure_reason = Some(format!("create-failed: {}", err));
                self.store.update(session).await.map_err(store_err)?;
                return Err(BrokerError::CreateFailed(err.into()));
            }
        };

        // Phase C: link.
        session.provider_instance_id = Some(instance.provider_instance_id.clone());
        session.ssh_host = instance.host.clone();
        session.ssh_port = instance.port;
        session.ssh_user = instance.user.clone();
        session.api_endpoint = instance.api_endpoint.clone();
        session.api_port = instance.api_port;
        if let Some(price) = instance.price_per_hour {
            session.price_per_hour = price;
        }
        if let Err(err) = self.store.update(session.clone()).await {
            // Orphan is recoverable only via reconciliation; never attempt
            // a compensating teardown from the request path.
            log::error!(
                "CRITICAL: failed to link session {} to provider instance {}: {:?}",
                session.id,
                instance.provider_instance_id,
                err
            );
            return Err(store_err(err));
        }

        // Phase D: async verify handoff. The private key lives only in
        // this task's stack; it is never written back to the store.
        self.verifier.spawn_for(
            session.id.clone(),
            provider,
            key_pair.private_key_pem.clone(),
        );

        Ok(ProvisionedSession {
            session,
            private_key_pem: key_pair.private_key_pem,
            agent_token,
        })
    }
}

fn store_err(err: StoreError) -> BrokerError {
    match err {
        StoreError::DuplicateActive { existing_id } => BrokerError::DuplicateSession { existing_id },
        StoreError::NotFound(id) => BrokerError::SessionNotFound(id),
        StoreError::Backend(err) => BrokerError::Other(err),
    }
}
