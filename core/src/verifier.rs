//! The readiness verifier: drives a Session from "instance allocated" to
//! "usable by consumer" via polled SSH or HTTP probes with progressive
//! backoff. One task per Session; runs concurrently with others; suspends
//! during sleeps, never while holding locks.

use crate::config::VerificationConfig;
use crate::metrics::BrokerMetrics;
use crate::models::{Session, SessionStatus};
use crate::provider::{Feature, Provider};
use crate::store::SessionStore;
use crate::util::{AsyncSleeping, Backoff};
use chrono::{Duration as ChronoDuration, Utc};
use std::io::Read as _;
use std::net::TcpStream;
use std::sync::Arc;

/// Drives readiness verification for Sessions handed off by the
/// provisioner. Held behind an `Arc` so that `spawn_for` can detach a task
/// that outlives the request that created it.
pub struct ReadinessVerifier {
    store: Arc<dyn SessionStore>,
    config: VerificationConfig,
    sleeper: Arc<dyn AsyncSleeping>,
    metrics: Option<Arc<BrokerMetrics>>,
}

impl ReadinessVerifier {
    pub fn new(
        store: Arc<dyn SessionStore>,
        config: VerificationConfig,
        sleeper: Arc<dyn AsyncSleeping>,
    ) -> Self {
        ReadinessVerifier {
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

    /// Hands a Session off to a detached verification task. `private_key_pem`
    /// lives only in this task's stack; it is never written to the store.
    pub fn spawn_for(
        self: &Arc<Self>,
        session_id: String,
        provider: Arc<dyn Provider>,
        private_key_pem: String,
    ) {
        let verifier = Arc::clone(self);
        tokio::spawn(async move {
            verifier.run(session_id, provider, private_key_pem).await;
        });
    }

    async fn run(&self, session_id: String, provider: Arc<dyn Provider>, private_key_pem: String) {
        let timeout = if provider.supports_feature(Feature::Ssh) {
            self.config.ssh_timeout
        } else {
            self.config.api_timeout
        };
        let deadline = Utc::now() + ChronoDuration::from_std(timeout).unwrap_or_default();
        let mut backoff = Backoff::new(
            self.config.initial_interval,
            self.config.max_interval,
            self.config.backoff_multiplier,
        );
        let start = Utc::now();
        let mut last_host: Option<String> = None;

        loop {
            let session = match self.store.get(&session_id).await {
                Ok(Some(session)) => session,
                Ok(None) => return,
                Err(err) => {
                    log::warn!("verifier: failed to load session {}: {:?}", session_id, err);
                    self.sleeper.sleep(backoff.current()).await;
                    backoff.advance();
                    continue;
                }
            };
            if session.status.is_terminal() {
                return;
            }

            if session.ssh_host.is_none() && session.api_endpoint.is_none() {
                match provider.get_instance_status(
                    session
                        .provider_instance_id
                        .as_deref()
                        .unwrap_or_default(),
                ).await {
                    Ok(status) => {
                        if status.host.is_some() || status.api_endpoint.is_some() {
                            let mut updated = session.clone();
                            updated.ssh_host = status.host.clone();
                            updated.ssh_port = status.port;
                            updated.ssh_user = status.user;
                            updated.api_endpoint = status.api_endpoint.clone();
                            updated.api_port = status.api_port;
                            if let Err(err) = self.store.update(updated).await {
                                log::warn!(
                                    "verifier: failed to record coordinates for {}: {:?}",
                                    session_id,
                                    err
                                );
                            }
                            let coordinates = status.host.or(status.api_endpoint);
                            if last_host != coordinates {
                                backoff.reset(self.config.initial_interval);
                                last_host = coordinates;
                            }
                        }
                    }
                    Err(err) => {
                        log::debug!(
                            "verifier: status poll for {} absorbed: {:?}",
                            session_id,
                            err
                        );
                    }
                }
            } else if self.probe_once(&session, &private_key_pem).await {
                let elapsed = (Utc::now() - start).num_milliseconds() as f64 / 1000.0;
                let mut updated = session.clone();
                updated.status = SessionStatus::Running;
                if let Err(err) = self.store.update(updated).await {
                    log::error!(
                        "CRITICAL: failed to mark session {} running: {:?}",
                        session_id,
                        err
                    );
                }
                if let Some(metrics) = &self.metrics {
                    metrics.verification_succeeded(elapsed);
                }
                return;
            }

            if Utc::now() >= deadline {
                if let Some(provider_instance_id) = &session.provider_instance_id {
                    if let Err(err) = provider.destroy_instance(provider_instance_id).await {
                        log::warn!(
                            "verifier: destroy on timeout for {} failed (absorbed): {:?}",
                            session_id,
                            err
                        );
                    }
                }
                let mut updated = session.clone();
                updated.status = SessionStatus::Failed;
                updated.stopped_at = Some(Utc::now());
                updated.failure_reason = Some("verification timeout".to_string());
                if let Err(err) = self.store.update(updated).await {
                    log::error!(
                        "CRITICAL: failed to mark session {} failed on timeout: {:?}",
                        session_id,
                        err
                    );
                }
                if let Some(metrics) = &self.metrics {
                    metrics.verification_timed_out();
                }
                return;
            }

            self.sleeper.sleep(backoff.current()).await;
            backoff.advance();
        }
    }

    /// A single probe attempt, no inner retry: SSH handshake plus a
    /// trivial command, or an HTTP GET accepting 2xx/404.
    async fn probe_once(&self, session: &Session, private_key_pem: &str) -> bool {
        if let (Some(host), Some(port)) = (&session.api_endpoint, session.api_port) {
            let url = format!("http://{}:{}/", host, port);
            let client = match crate::http::HttpFactory::default().create() {
                Ok(client) => client,
                Err(err) => {
                    log::warn!("verifier: failed to build http client: {:?}", err);
                    return false;
                }
            };
            return client.probe_alive(url.as_str()).await.unwrap_or(false);
        }

        let (host, port, user) = match (&session.ssh_host, session.ssh_port, &session.ssh_user) {
            (Some(host), Some(port), Some(user)) => {
                (host.clone(), port, user.clone())
            }
            (Some(host), None, Some(user)) => (host.clone(), 22, user.clone()),
            _ => return false,
        };
        let private_key_pem = private_key_pem.to_string();

        tokio::task::spawn_blocking(move || ssh_probe(&host, port, &user, &private_key_pem))
            .await
            .unwrap_or(false)
    }
}

fn ssh_probe(host: &str, port: u16, user: &str, private_key_pem: &str) -> bool {
    let tcp = match TcpStream::connect((host, port)) {
        Ok(tcp) => tcp,
        Err(_) => return false,
    };
    let mut session = match ssh2::Session::new() {
        Ok(session) => session,
        Err(_) => return false,
    };
    session.set_tcp_stream(tcp);
    if session.handshake().is_err() {
        return false;
    }
    if session
        .userauth_pubkey_memory(user, None, private_key_pem, None)
        .is_err()
    {
        return false;
    }

    let mut channel = match session.channel_session() {
        Ok(channel) => channel,
        Err(_) => return false,
    };
    if channel.exec("echo ready").is_err() {
        return false;
    }
    let mut output = String::new();
    if channel.read_to_string(&mut output).is_err() {
        return false;
    }
    let _ = channel.wait_close();
    output.trim() == "ready"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_util::new_session;
    use crate::provider::{InstanceStatus, MockProvider};
    use crate::store::MockSessionStore;
    use crate::testutil::InstantSleep;
    use std::time::Duration;

    #[tokio::test]
    async fn adopts_coordinates_and_resets_backoff() {
        let mut store = MockSessionStore::new();
        let mut session = new_session("c1", "o1");
        session.status = SessionStatus::Provisioning;
        session.provider_instance_id = Some("inst-1".to_string());
        let session_for_get = session.clone();

        store
            .expect_get()
            .returning(move |_| Ok(Some(session_for_get.clone())));
        store.expect_update().returning(|_| Ok(()));

        let mut provider = MockProvider::new();
        provider.expect_supports_feature().returning(|_| true);
        provider.expect_get_instance_status().returning(|_| {
            Ok(InstanceStatus {
                running: true,
                host: Some("10.0.0.1".to_string()),
                port: Some(22),
                user: Some("broker".to_string()),
                api_endpoint: None,
                api_port: None,
            })
        });
        provider.expect_destroy_instance().returning(|_| Ok(()));

        let sleeper = Arc::new(InstantSleep::default());
        let config = VerificationConfig {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            backoff_multiplier: 1.5,
            ssh_timeout: Duration::from_millis(1),
            api_timeout: Duration::from_millis(1),
        };
        let verifier = Arc::new(
            ReadinessVerifier::new(Arc::new(store), config, sleeper.clone()),
        );

        verifier
            .run(session.id.clone(), Arc::new(provider), "irrelevant".to_string())
            .await;

        // The deadline was effectively zero, so the task should have
        // recorded at least the adoption-then-timeout path without
        // panicking; backoff sleeps were recorded via InstantSleep.
        assert!(!sleeper.recorded.lock().unwrap().is_empty());
    }
}
