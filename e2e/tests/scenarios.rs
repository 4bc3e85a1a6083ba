//! Whole-stack scenario tests: real sled-backed stores, the real
//! provisioner/readiness-verifier/destruction-verifier/lifecycle-manager/
//! benchmark-orchestrator wiring, and a deterministic `FakeProvider` in
//! place of a live marketplace. No mocks — these exercise the same code
//! paths `broker`'s binary wires together, just against a tempdir instead
//! of a configured data directory.

mod common;

use broker_core::benchmark::{
    BenchmarkOrchestrator, BenchmarkRunRequest, BenchmarkResult, WorkloadError, WorkloadRunner,
};
use broker_core::config::BenchmarkConfig;
use broker_core::models::{
    BenchmarkRunStatus, DestroyReason, ManifestEntryStatus, Offer, SessionStatus, WorkloadType,
};
use broker_core::provider::{InstanceInfo, InstanceStatus, Provider, TaggedInstance};
use broker_core::provisioner::CreateSessionRequest;
use broker_core::testutil::FakeProviderError;
use chrono::Utc;
use providers::FakeProvider;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

mod common_util {
    use super::*;

    /// Wraps a `Provider` to count `get_instance_status` calls, for
    /// assertions that care how many times the destroyer actually polled
    /// rather than just the outcome.
    pub struct CountingProvider {
        pub inner: Arc<dyn Provider>,
        pub status_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Provider for CountingProvider {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn list_offers(
            &self,
            filter: &broker_core::models::OfferFilter,
        ) -> Result<Vec<Offer>, broker_core::provider::ProviderError> {
            self.inner.list_offers(filter).await
        }

        async fn create_instance(
            &self,
            req: broker_core::provider::CreateInstanceRequest,
        ) -> Result<InstanceInfo, broker_core::provider::ProviderError> {
            self.inner.create_instance(req).await
        }

        async fn get_instance_status(
            &self,
            provider_instance_id: &str,
        ) -> Result<InstanceStatus, broker_core::provider::ProviderError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.get_instance_status(provider_instance_id).await
        }

        async fn destroy_instance(
            &self,
            provider_instance_id: &str,
        ) -> Result<(), broker_core::provider::ProviderError> {
            self.inner.destroy_instance(provider_instance_id).await
        }

        async fn list_tagged_instances(
            &self,
            deployment_id: &str,
        ) -> Result<Vec<TaggedInstance>, broker_core::provider::ProviderError> {
            self.inner.list_tagged_instances(deployment_id).await
        }

        fn supports_feature(&self, feature: broker_core::provider::Feature) -> bool {
            self.inner.supports_feature(feature)
        }
    }
}

fn offer(id: &str, gpu_type: &str, provider: &str) -> Offer {
    Offer {
        id: id.to_string(),
        provider: provider.to_string(),
        gpu_type: gpu_type.to_string(),
        gpu_count: 1,
        price_per_hour: 1.0,
        region: None,
    }
}

fn create_request(consumer_id: &str, offer_id: &str) -> CreateSessionRequest {
    CreateSessionRequest {
        consumer_id: consumer_id.to_string(),
        provider: "fake".to_string(),
        offer_id: offer_id.to_string(),
        gpu_type: "a100".to_string(),
        gpu_count: 1,
        workload_type: WorkloadType::Generic,
        reservation_hours: 1.0,
        hard_max_override_hours: None,
        idle_threshold_minutes: None,
        storage_policy: None,
        price_per_hour: 1.0,
        key_bits: Some(1024),
    }
}

/// S1: a session provisioned against a marketplace that exposes its
/// workload over bare HTTP (no live SSH daemon available in-process) runs
/// the real two-phase create, hands off to the real readiness verifier,
/// and is observed `Running` with its coordinates recorded — all within
/// the verifier's progressive-backoff loop, not a synchronous fast path.
#[tokio::test]
async fn session_reaches_running_via_http_probe_after_instance_allocates() {
    let harness = common::Harness::new();
    let port = common::spawn_http_ok_server();
    let fake = common::fake_provider_with_http_instance("fake", port);

    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    providers.insert("fake".to_string(), Arc::new(fake));
    let (provisioner, _verifier) = common::provisioner(&harness, providers);

    let provisioned = provisioner
        .create_session(create_request("c1", "o1"))
        .await
        .expect("create_session should succeed");

    assert_eq!(provisioned.session.status, SessionStatus::Pending);

    // The verifier runs detached; poll the store until it catches up.
    let session = wait_for_status(&harness, &provisioned.session.id, SessionStatus::Running).await;
    assert_eq!(session.api_endpoint.as_deref(), Some("127.0.0.1"));
    assert_eq!(session.api_port, Some(port));
}

/// S2: a second `create_session` for the same `(consumer_id, offer_id)`
/// pair while the first is still non-terminal is rejected before any
/// upstream call, and names the existing session.
#[tokio::test]
async fn duplicate_create_for_same_consumer_and_offer_is_rejected() {
    let harness = common::Harness::new();
    let fake = FakeProvider::new("fake");
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    providers.insert("fake".to_string(), Arc::new(fake));
    let (provisioner, _verifier) = common::provisioner(&harness, providers);

    let first = provisioner
        .create_session(create_request("c1", "o1"))
        .await
        .unwrap();

    let err = provisioner
        .create_session(create_request("c1", "o1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "duplicate-session");
    match err {
        broker_core::error::BrokerError::DuplicateSession { existing_id } => {
            assert_eq!(existing_id, first.session.id)
        }
        other => panic!("expected DuplicateSession, got {:?}", other),
    }
}

/// S3: the marketplace reports the chosen offer evaporated between
/// `ListOffers` and `CreateInstance`. The session is recorded `Failed`
/// with a `stale-inventory` reason and no instance is ever linked.
#[tokio::test]
async fn stale_inventory_on_create_fails_session_without_linking_an_instance() {
    let harness = common::Harness::new();
    let fake = FakeProvider::new("fake").with_create_result(Err(FakeProviderError::StaleInventory {
        offer_id: "o1".to_string(),
    }));
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    providers.insert("fake".to_string(), Arc::new(fake));
    let (provisioner, _verifier) = common::provisioner(&harness, providers);

    let err = provisioner
        .create_session(create_request("c1", "o1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "stale-inventory");

    let sessions = harness.sessions.list(&Default::default()).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Failed);
    assert_eq!(sessions[0].provider_instance_id, None);
    assert_eq!(sessions[0].failure_reason.as_deref(), Some("stale-inventory"));
}

/// S4: an instance allocates but never becomes reachable before the
/// verifier's deadline. The session is marked `Failed` with a
/// verification-timeout reason and the provider's instance is torn down.
#[tokio::test]
async fn unreachable_instance_times_out_verification_and_is_torn_down() {
    let harness = common::Harness::new();
    // Port 1 on loopback: nothing listens there, so every SSH connect
    // attempt fails immediately with connection-refused.
    let fake = FakeProvider::new("fake").with_create_result(Ok(InstanceInfo {
        provider_instance_id: "inst-unreachable".to_string(),
        host: Some("127.0.0.1".to_string()),
        port: Some(1),
        user: Some("broker".to_string()),
        api_endpoint: None,
        api_port: None,
        price_per_hour: None,
    }));
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    providers.insert("fake".to_string(), Arc::new(fake));
    let (provisioner, _verifier) = common::provisioner(&harness, providers);

    let provisioned = provisioner
        .create_session(create_request("c1", "o1"))
        .await
        .unwrap();

    let session = wait_for_status(&harness, &provisioned.session.id, SessionStatus::Failed).await;
    assert_eq!(session.failure_reason.as_deref(), Some("verification timeout"));
}

/// S5: destroying a running session whose upstream takes a couple of
/// polls to confirm teardown retries the destroy-then-confirm loop and
/// succeeds once the marketplace reports the instance gone, having polled
/// status exactly as many times as the script required.
#[tokio::test]
async fn destroy_retries_until_instance_confirmed_gone() {
    let harness = common::Harness::new();
    let fake = Arc::new(
        FakeProvider::new("fake")
            .with_create_result(Ok(InstanceInfo {
                provider_instance_id: "inst-1".to_string(),
                host: Some("10.0.0.1".to_string()),
                port: Some(22),
                user: Some("broker".to_string()),
                api_endpoint: None,
                api_port: None,
                price_per_hour: None,
            }))
            .with_status_script(
                "inst-1",
                vec![
                    Ok(InstanceStatus {
                        running: true,
                        host: None,
                        port: None,
                        user: None,
                        api_endpoint: None,
                        api_port: None,
                    }),
                    Ok(InstanceStatus {
                        running: true,
                        host: None,
                        port: None,
                        user: None,
                        api_endpoint: None,
                        api_port: None,
                    }),
                    Err(FakeProviderError::NotFound),
                ],
            ),
    );
    let counting = Arc::new(common_util::CountingProvider {
        inner: fake.clone(),
        status_calls: AtomicUsize::new(0),
    });

    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    providers.insert("fake".to_string(), counting.clone());
    let (provisioner, _verifier) = common::provisioner(&harness, providers);
    let destroyer = common::destroyer(&harness);

    let provisioned = provisioner
        .create_session(create_request("c1", "o1"))
        .await
        .unwrap();
    let mut session = harness
        .sessions
        .get(&provisioned.session.id)
        .await
        .unwrap()
        .unwrap();
    session.status = SessionStatus::Running;
    harness.sessions.update(session.clone()).await.unwrap();

    destroyer
        .destroy(session.clone(), counting.as_ref(), DestroyReason::ConsumerRequested)
        .await
        .unwrap();

    let stopped = harness.sessions.get(&session.id).await.unwrap().unwrap();
    assert_eq!(stopped.status, SessionStatus::Stopped);
    assert!(stopped.stopped_at.is_some());
    assert_eq!(counting.status_calls.load(Ordering::SeqCst), 3);
}

/// Invariant 5 (orphan sweep): an upstream instance tagged for this
/// deployment but unknown to the durable store, older than the grace
/// period, is destroyed by reconciliation, while an instance still backing
/// a known running Session is left alone.
#[tokio::test]
async fn orphan_sweep_destroys_untracked_instance_and_leaves_known_sessions_alone() {
    let harness = common::Harness::new();
    let old_enough = Utc::now() - chrono::Duration::hours(1);
    let fake = Arc::new(
        FakeProvider::new("fake").with_tagged_instances(vec![
            TaggedInstance {
                provider_instance_id: "ghost-1".to_string(),
                created_at: old_enough,
            },
            TaggedInstance {
                provider_instance_id: "known-1".to_string(),
                created_at: old_enough,
            },
        ]),
    );

    let now = Utc::now();
    let known = broker_core::models::Session {
        id: uuid::Uuid::new_v4().to_string(),
        consumer_id: "c1".to_string(),
        provider: "fake".to_string(),
        offer_id: "o1".to_string(),
        provider_instance_id: Some("known-1".to_string()),
        gpu_type: "a100".to_string(),
        gpu_count: 1,
        workload_type: WorkloadType::Generic,
        status: SessionStatus::Running,
        ssh_host: None,
        ssh_port: None,
        ssh_user: None,
        ssh_public_key: None,
        api_endpoint: None,
        api_port: None,
        reservation_hours: 1.0,
        hard_max_override_hours: None,
        idle_threshold_minutes: None,
        storage_policy: Default::default(),
        price_per_hour: 1.0,
        created_at: now,
        expires_at: now + chrono::Duration::hours(1),
        last_heartbeat: None,
        last_idle_seconds: 0,
        stopped_at: None,
        failure_reason: None,
    };
    harness.sessions.create(known.clone()).await.unwrap();

    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    providers.insert("fake".to_string(), fake.clone());

    let mut config = common::lifecycle_config();
    config.orphan_grace_period = std::time::Duration::from_millis(1);
    let manager = broker_core::lifecycle::LifecycleManager::new(
        harness.sessions.clone(),
        providers,
        common::destroyer(&harness),
        config,
    );

    manager.reconcile().await;

    assert_eq!(fake.destroy_calls(), vec!["ghost-1".to_string()]);
    let still_there = harness.sessions.get(&known.id).await.unwrap().unwrap();
    assert_eq!(still_there.status, SessionStatus::Running);
}

/// S7: a campaign whose budget is already exhausted by a prior entry's
/// recorded cost stops dispatching before touching any remaining pending
/// entry, yet still reports the run `Completed` because at least one
/// entry succeeded.
#[tokio::test]
async fn benchmark_dispatch_stops_once_campaign_budget_is_already_spent() {
    let harness = common::Harness::new();
    let fake = Arc::new(
        FakeProvider::new("fake").with_offers(vec![offer("o1", "g1", "fake"), offer("o2", "g2", "fake")]),
    );
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    providers.insert("fake".to_string(), fake.clone());

    let (provisioner, _verifier) = common::provisioner(&harness, providers.clone());
    let destroyer = common::destroyer(&harness);
    let workload: Arc<dyn WorkloadRunner> = Arc::new(NeverCalledWorkload);

    let orchestrator = Arc::new(BenchmarkOrchestrator::new(
        harness.manifests.clone(),
        harness.runs.clone(),
        harness.sessions.clone(),
        provisioner,
        destroyer,
        providers,
        workload,
        BenchmarkConfig {
            max_workers: 1,
            dispatch_batch_size: 10,
            ..BenchmarkConfig::default()
        },
    ));

    let run_id = orchestrator
        .start_run(BenchmarkRunRequest {
            models: vec!["m1".to_string()],
            gpu_types: vec!["g1".to_string(), "g2".to_string()],
            providers: vec!["fake".to_string()],
            max_budget: 0.01,
            priority: 0,
        })
        .await
        .unwrap();

    // Simulate a prior dispatch cycle having already spent past budget.
    let mut entries = harness.manifests.list_by_run(&run_id).await.unwrap();
    assert_eq!(entries.len(), 2);
    let mut already_spent = entries.remove(0);
    already_spent.status = ManifestEntryStatus::Success;
    already_spent.cost = Some(0.02);
    already_spent.finished_at = Some(Utc::now());
    harness.manifests.update(already_spent).await.unwrap();

    orchestrator
        .clone()
        .execute(run_id.clone(), Arc::new(AtomicBool::new(false)))
        .await;

    let final_entries = harness.manifests.list_by_run(&run_id).await.unwrap();
    let pending_count = final_entries
        .iter()
        .filter(|e| e.status == ManifestEntryStatus::Pending)
        .count();
    assert_eq!(pending_count, 1, "the untouched entry must remain pending");

    let run = harness.runs.get(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, BenchmarkRunStatus::Completed);
}

/// S7: a fresh, budget-capped campaign dispatches its pending entries one
/// at a time and re-checks spend after each completes, rather than
/// fetching a whole batch up front. With `max_budget=0.01` and a first
/// entry priced to blow through it on its own, the second entry must
/// never be dispatched — no pre-seeded cost, this is the literal
/// fresh-run scenario the budget cap exists for.
#[tokio::test]
async fn fresh_budget_capped_run_dispatches_at_most_one_entry_over_budget() {
    let harness = common::Harness::new();
    let port = common::spawn_http_ok_server();
    let fake = Arc::new(
        common::fake_provider_with_http_instance("fake", port).with_offers(vec![
            Offer {
                id: "o1".to_string(),
                provider: "fake".to_string(),
                gpu_type: "g1".to_string(),
                gpu_count: 1,
                price_per_hour: 1_000_000.0,
                region: None,
            },
            offer("o2", "g2", "fake"),
        ]),
    );
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    providers.insert("fake".to_string(), fake.clone());

    let (provisioner, _verifier) = common::provisioner(&harness, providers.clone());
    let destroyer = common::destroyer(&harness);
    let workload: Arc<dyn WorkloadRunner> = Arc::new(SlowSuccessWorkload);

    let orchestrator = Arc::new(BenchmarkOrchestrator::new(
        harness.manifests.clone(),
        harness.runs.clone(),
        harness.sessions.clone(),
        provisioner,
        destroyer,
        providers,
        workload,
        BenchmarkConfig {
            max_workers: 1,
            dispatch_batch_size: 10,
            ..BenchmarkConfig::default()
        },
    ));

    let run_id = orchestrator
        .start_run(BenchmarkRunRequest {
            models: vec!["m1".to_string()],
            gpu_types: vec!["g1".to_string(), "g2".to_string()],
            providers: vec!["fake".to_string()],
            max_budget: 0.01,
            priority: 0,
        })
        .await
        .unwrap();

    orchestrator
        .clone()
        .execute(run_id.clone(), Arc::new(AtomicBool::new(false)))
        .await;

    let final_entries = harness.manifests.list_by_run(&run_id).await.unwrap();
    let succeeded: Vec<_> = final_entries
        .iter()
        .filter(|e| e.status == ManifestEntryStatus::Success)
        .collect();
    assert_eq!(succeeded.len(), 1, "exactly one entry should have dispatched");
    assert!(succeeded[0].cost.unwrap_or(0.0) > 0.01);

    let pending_count = final_entries
        .iter()
        .filter(|e| e.status == ManifestEntryStatus::Pending)
        .count();
    assert_eq!(pending_count, 1, "the second entry must never be dispatched");

    let run = harness.runs.get(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, BenchmarkRunStatus::Completed);
}

/// Sleeps past a full real second so the truncating `num_seconds()` cost
/// calculation records a nonzero elapsed duration, then reports success.
struct SlowSuccessWorkload;

#[async_trait::async_trait]
impl WorkloadRunner for SlowSuccessWorkload {
    async fn run(
        &self,
        _session: &broker_core::models::Session,
        _private_key_pem: &str,
        _model: &str,
        _result_timeout: std::time::Duration,
    ) -> Result<BenchmarkResult, WorkloadError> {
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        Ok(BenchmarkResult { throughput: 1.0 })
    }
}

struct NeverCalledWorkload;

#[async_trait::async_trait]
impl WorkloadRunner for NeverCalledWorkload {
    async fn run(
        &self,
        _session: &broker_core::models::Session,
        _private_key_pem: &str,
        _model: &str,
        _result_timeout: std::time::Duration,
    ) -> Result<BenchmarkResult, WorkloadError> {
        panic!("budget was already exhausted; dispatch must not reach the workload runner");
    }
}

async fn wait_for_status(
    harness: &common::Harness,
    session_id: &str,
    want: SessionStatus,
) -> broker_core::models::Session {
    for _ in 0..200 {
        if let Some(session) = harness.sessions.get(session_id).await.unwrap() {
            if session.status == want || session.status.is_terminal() {
                return session;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("session {} did not reach {:?} in time", session_id, want);
}
