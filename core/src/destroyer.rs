//! The destruction verifier: guarantees at-most-once resource leaks by
//! confirming upstream teardown before a Session is marked terminal.
//! Called from the Session API's `DELETE` handler and from lifecycle
//! triggers alike.

use crate::config::DestroyConfig;
use crate::error::BrokerError;
use crate::metrics::BrokerMetrics;
use crate::models::{DestroyReason, Session, SessionStatus};
use crate::provider::{Provider, ProviderError};
use crate::store::SessionStore;
use crate::util::AsyncSleeping;
use chrono::Utc;
use std::sync::Arc;

pub struct DestructionVerifier {
    store: Arc<dyn SessionStore>,
    config: DestroyConfig,
    sleeper: Arc<dyn AsyncSleeping>,
    metrics: Option<Arc<BrokerMetrics>>,
}

impl DestructionVerifier {
    pub fn new(
        store: Arc<dyn SessionStore>,
        config: DestroyConfig,
        sleeper: Arc<dyn AsyncSleeping>,
    ) -> Self {
        DestructionVerifier {
            store,
            config,
            sleeper,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<BrokerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Destroys `session` on `provider`, retrying the destroy-then-confirm
    /// loop for up to `destroy_retries` attempts with linear backoff.
    pub async fn destroy(
        &self,
        mut session: Session,
        provider: &dyn Provider,
        reason: DestroyReason,
    ) -> Result<(), BrokerError> {
        let provider_instance_id = match session.provider_instance_id.clone() {
            None => {
                session.status = SessionStatus::Stopped;
                session.stopped_at = Some(Utc::now());
                self.store.update(session).await.map_err(|err| BrokerError::Other(err.into()))?;
                if let Some(metrics) = &self.metrics {
                    metrics.session_destroyed(reason);
                }
                return Ok(());
            }
            Some(id) => id,
        };

        session.status = SessionStatus::Stopping;
        self.store
            .update(session.clone())
            .await
            .map_err(|err| BrokerError::Other(err.into()))?;

        for attempt in 0..self.config.retries {
            if let Err(err) = provider.destroy_instance(&provider_instance_id).await {
                log::warn!(
                    "destroyer: destroy_instance for {} failed (absorbed, attempt {}): {:?}",
                    provider_instance_id,
                    attempt,
                    err
                );
            }

            self.sleeper
                .sleep(self.config.retry_base * (attempt + 1))
                .await;

            match provider.get_instance_status(&provider_instance_id).await {
                Err(ProviderError::NotFound(_)) => {
                    return self.finish(session, reason).await;
                }
                Ok(status) if !status.running => {
                    return self.finish(session, reason).await;
                }
                Ok(_) => continue,
                Err(err) => {
                    log::debug!(
                        "destroyer: status poll for {} absorbed: {:?}",
                        provider_instance_id,
                        err
                    );
                    continue;
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.destroy_verification_failed();
        }
        Err(BrokerError::DestroyVerificationFailed {
            session_id: session.id.clone(),
            provider_instance_id,
            attempts: self.config.retries,
        })
    }

    async fn finish(&self, mut session: Session, reason: DestroyReason) -> Result<(), BrokerError> {
        session.status = SessionStatus::Stopped;
        session.stopped_at = Some(Utc::now());
        self.store
            .update(session)
            .await
            .map_err(|err| BrokerError::Other(err.into()))?;
        if let Some(metrics) = &self.metrics {
            metrics.session_destroyed(reason);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_util::new_session;
    use crate::provider::{InstanceStatus, MockProvider};
    use crate::store::MockSessionStore;
    use crate::testutil::InstantSleep;
    use std::time::Duration;

    fn config() -> DestroyConfig {
        DestroyConfig {
            retry_base: Duration::from_millis(1),
            retries: 3,
        }
    }

    #[tokio::test]
    async fn succeeds_immediately_with_no_provider_instance() {
        let mut store = MockSessionStore::new();
        store.expect_update().returning(|_| Ok(()));
        let verifier = DestructionVerifier::new(Arc::new(store), config(), Arc::new(InstantSleep::default()));

        let session = new_session("c1", "o1");
        let provider = MockProvider::new();
        verifier
            .destroy(session, &provider, DestroyReason::ConsumerRequested)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retries_until_not_found_then_succeeds() {
        let mut store = MockSessionStore::new();
        store.expect_update().returning(|_| Ok(()));
        let verifier = DestructionVerifier::new(Arc::new(store), config(), Arc::new(InstantSleep::default()));

        let mut session = new_session("c1", "o1");
        session.provider_instance_id = Some("inst-1".to_string());

        let mut provider = MockProvider::new();
        provider.expect_destroy_instance().returning(|_| Ok(()));
        let mut call_count = 0;
        provider.expect_get_instance_status().returning(move |_| {
            call_count += 1;
            if call_count < 3 {
                Ok(InstanceStatus {
                    running: true,
                    host: None,
                    port: None,
                    user: None,
                    api_endpoint: None,
                    api_port: None,
                })
            } else {
                Err(ProviderError::NotFound("inst-1".to_string()))
            }
        });

        verifier
            .destroy(session, &provider, DestroyReason::Expired)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn surfaces_destroy_verification_failed_after_exhausting_retries() {
        let mut store = MockSessionStore::new();
        store.expect_update().returning(|_| Ok(()));
        let verifier = DestructionVerifier::new(Arc::new(store), config(), Arc::new(InstantSleep::default()));

        let mut session = new_session("c1", "o1");
        session.provider_instance_id = Some("inst-1".to_string());

        let mut provider = MockProvider::new();
        provider.expect_destroy_instance().returning(|_| Ok(()));
        provider.expect_get_instance_status().returning(|_| {
            Ok(InstanceStatus {
                running: true,
                host: None,
                port: None,
                user: None,
                api_endpoint: None,
                api_port: None,
            })
        });

        let err = verifier
            .destroy(session, &provider, DestroyReason::Expired)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "destroy-verification-failed");
    }
}
