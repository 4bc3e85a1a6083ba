//! The benchmark orchestrator: runs a bounded-parallel campaign of
//! `(model x gpu_type x provider)` manifest entries against the
//! provisioner, respecting a campaign budget and a worker-concurrency
//! ceiling.

use crate::config::BenchmarkConfig;
use crate::destroyer::DestructionVerifier;
use crate::models::{
    BenchmarkRun, BenchmarkRunStatus, DestroyReason, ManifestEntry, ManifestEntryStatus,
    OfferFilter, SessionStatus, WorkloadType,
};
use crate::provider::Provider;
use crate::provisioner::{CreateSessionRequest, Provisioner};
use crate::store::{ManifestStore, RunStore, SessionStore};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Caller-supplied request to start a benchmark campaign. An empty
/// `gpu_types` expands from current inventory; an empty `providers` uses
/// all known providers.
#[derive(Debug, Clone)]
pub struct BenchmarkRunRequest {
    pub models: Vec<String>,
    pub gpu_types: Vec<String>,
    pub providers: Vec<String>,
    pub max_budget: f64,
    pub priority: i32,
}

/// What a `WorkloadRunner` produces once the remote completion marker is
/// observed and parsed.
#[derive(Debug, Clone)]
pub struct BenchmarkResult {
    pub throughput: f64,
}

/// Failure from a `WorkloadRunner`, carrying the stage name recorded on
/// the manifest entry (`"deploy"` or `"result"`).
#[derive(Debug, Clone)]
pub struct WorkloadError {
    pub stage: &'static str,
    pub message: String,
}

/// Deploys the benchmark-client workload over SSH and polls for its
/// completion marker. Abstracted the same way `Provider` is, so the
/// dispatch loop can be exercised deterministically in tests without a
/// live SSH session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkloadRunner: Send + Sync {
    async fn run(
        &self,
        session: &crate::models::Session,
        private_key_pem: &str,
        model: &str,
        result_timeout: Duration,
    ) -> Result<BenchmarkResult, WorkloadError>;
}

/// Runs manifest entries for one `BenchmarkRun` to completion, dispatching
/// onto a bounded worker pool and destroying every session it provisions.
pub struct BenchmarkOrchestrator {
    manifests: Arc<dyn ManifestStore>,
    runs: Arc<dyn RunStore>,
    sessions: Arc<dyn SessionStore>,
    provisioner: Arc<Provisioner>,
    destroyer: Arc<DestructionVerifier>,
    providers: HashMap<String, Arc<dyn Provider>>,
    workload: Arc<dyn WorkloadRunner>,
    config: BenchmarkConfig,
    metrics: Option<Arc<crate::metrics::BrokerMetrics>>,
}

impl BenchmarkOrchestrator {
    pub fn new(
        manifests: Arc<dyn ManifestStore>,
        runs: Arc<dyn RunStore>,
        sessions: Arc<dyn SessionStore>,
        provisioner: Arc<Provisioner>,
        destroyer: Arc<DestructionVerifier>,
        providers: HashMap<String, Arc<dyn Provider>>,
        workload: Arc<dyn WorkloadRunner>,
        config: BenchmarkConfig,
    ) -> Self {
        BenchmarkOrchestrator {
            manifests,
            runs,
            sessions,
            provisioner,
            destroyer,
            providers,
            workload,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<crate::metrics::BrokerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Expands `req` into the `models x gpu_types x providers` manifest,
    /// persists a `pending` entry per triple plus the owning `BenchmarkRun`,
    /// and returns the run id. Dispatch is driven separately by `execute`.
    pub async fn start_run(&self, req: BenchmarkRunRequest) -> anyhow::Result<String> {
        let run_id = Uuid::new_v4().to_string();
        let gpu_types = if req.gpu_types.is_empty() {
            self.known_gpu_types().await
        } else {
            req.gpu_types.clone()
        };
        let providers = if req.providers.is_empty() {
            self.providers.keys().cloned().collect()
        } else {
            req.providers.clone()
        };

        let run = BenchmarkRun {
            id: run_id.clone(),
            models: req.models.clone(),
            gpu_types: gpu_types.clone(),
            providers: providers.clone(),
            max_budget: req.max_budget,
            priority: req.priority,
            status: BenchmarkRunStatus::Running,
            created_at: Utc::now(),
            finished_at: None,
        };
        self.runs.insert(run).await?;

        for model in &req.models {
            for gpu_type in &gpu_types {
                for provider in &providers {
                    let entry = ManifestEntry {
                        id: Uuid::new_v4().to_string(),
                        run_id: run_id.clone(),
                        gpu_type: gpu_type.clone(),
                        provider: provider.clone(),
                        model: model.clone(),
                        priority: req.priority,
                        status: ManifestEntryStatus::Pending,
                        worker_id: None,
                        session_id: None,
                        throughput: None,
                        cost: None,
                        failure_stage: None,
                        created_at: Utc::now(),
                        started_at: None,
                        finished_at: None,
                    };
                    self.manifests.insert(entry).await?;
                }
            }
        }

        Ok(run_id)
    }

    async fn known_gpu_types(&self) -> Vec<String> {
        let mut gpu_types = std::collections::HashSet::new();
        for provider in self.providers.values() {
            if let Ok(offers) = provider.list_offers(&OfferFilter::default()).await {
                gpu_types.extend(offers.into_iter().map(|offer| offer.gpu_type));
            }
        }
        gpu_types.into_iter().collect()
    }

    /// Drives `run_id`'s manifest to completion: repeatedly fetches up to
    /// `dispatch_batch_size` pending entries in priority order, stops
    /// dispatching once recorded cost meets `max_budget`, and dispatches
    /// each entry onto the `max_workers`-capacity semaphore. Returns once
    /// every entry has left `pending`/`running`, or `cancel` is signalled.
    ///
    /// A run's recorded cost only exists once an entry *finishes* — fetching
    /// and dispatching a whole batch up front would let every entry in that
    /// batch start before the budget ever saw a single dollar spent. So a
    /// budget-capped run (`max_budget > 0`) dispatches one entry at a time
    /// and waits for it to finish before re-checking the budget, trading
    /// batch concurrency for an accurate stop-at-the-cap. An uncapped run
    /// keeps the full batch/worker-pool concurrency.
    pub async fn execute(self: Arc<Self>, run_id: String, cancel: Arc<AtomicBool>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        let mut in_flight = Vec::new();

        loop {
            if cancel.load(Ordering::SeqCst) {
                break;
            }

            let run = match self.runs.get(&run_id).await {
                Ok(Some(run)) => run,
                Ok(None) => break,
                Err(err) => {
                    log::warn!("benchmark run {}: failed to load run: {:?}", run_id, err);
                    break;
                }
            };
            let capped = run.max_budget > 0.0;
            if capped && self.spent(&run_id).await >= run.max_budget {
                log::info!("benchmark run {}: budget exhausted, stopping dispatch", run_id);
                break;
            }

            let batch_size = if capped { 1 } else { self.config.dispatch_batch_size };
            let pending = match self.manifests.list_pending(&run_id, batch_size).await {
                Ok(entries) => entries,
                Err(err) => {
                    log::warn!("benchmark run {}: failed to list pending entries: {:?}", run_id, err);
                    break;
                }
            };
            if pending.is_empty() {
                break;
            }

            for entry in pending {
                let worker_id = Uuid::new_v4().to_string();
                let won = match self
                    .manifests
                    .mark_running(&entry.id, &worker_id, Utc::now())
                    .await
                {
                    Ok(won) => won,
                    Err(err) => {
                        log::warn!("benchmark entry {}: dispatch guard failed: {:?}", entry.id, err);
                        continue;
                    }
                };
                if !won {
                    // Another dispatch loop already took this entry.
                    continue;
                }

                let permit = Arc::clone(&semaphore);
                let this = Arc::clone(&self);
                let mut entry = entry;
                entry.worker_id = Some(worker_id);
                let handle = tokio::spawn(async move {
                    let _permit = permit.acquire_owned().await.expect("semaphore closed");
                    this.run_entry(entry).await;
                });
                if capped {
                    // Serialize under a budget cap so the next iteration's
                    // budget check sees this entry's recorded cost.
                    let _ = handle.await;
                } else {
                    in_flight.push(handle);
                }
            }

            in_flight.retain(|handle| !handle.is_finished());
        }

        for handle in in_flight {
            let _ = handle.await;
        }

        self.finalize_run(&run_id, cancel.load(Ordering::SeqCst)).await;
    }

    /// Sums recorded cost across every entry in the run so far.
    async fn spent(&self, run_id: &str) -> f64 {
        match self.manifests.list_by_run(run_id).await {
            Ok(entries) => entries.iter().filter_map(|entry| entry.cost).sum(),
            Err(_) => 0.0,
        }
    }

    async fn run_entry(&self, mut entry: ManifestEntry) {
        let provider = match self.providers.get(&entry.provider) {
            Some(provider) => provider.clone(),
            None => {
                self.fail_entry(entry, "find_offer", "unknown provider").await;
                return;
            }
        };

        let filter = OfferFilter {
            gpu_type: Some(entry.gpu_type.clone()),
            ..Default::default()
        };
        let offers = match provider.list_offers(&filter).await {
            Ok(offers) => offers,
            Err(err) => {
                self.fail_entry(entry, "find_offer", &err.to_string()).await;
                return;
            }
        };
        let offer = match crate::inventory::first_fit(&offers, &filter) {
            Some(offer) => offer.clone(),
            None => {
                self.fail_entry(entry, "find_offer", "no matching offer").await;
                return;
            }
        };

        let provisioned = match self
            .provisioner
            .create_session(CreateSessionRequest {
                consumer_id: format!("benchmark-{}", entry.run_id),
                provider: entry.provider.clone(),
                offer_id: offer.id.clone(),
                gpu_type: entry.gpu_type.clone(),
                gpu_count: offer.gpu_count,
                workload_type: WorkloadType::Benchmark,
                reservation_hours: 1.0,
                hard_max_override_hours: None,
                idle_threshold_minutes: None,
                storage_policy: None,
                price_per_hour: offer.price_per_hour,
                key_bits: None,
            })
            .await
        {
            Ok(provisioned) => provisioned,
            Err(err) => {
                self.fail_entry(entry, "provision", &err.to_string()).await;
                return;
            }
        };
        entry.session_id = Some(provisioned.session.id.clone());

        let ready = self
            .poll_until_ready(&provisioned.session.id, self.config.ready_timeout)
            .await;
        let session = match ready {
            Some(session) => session,
            None => {
                self.teardown(&provisioned.session.id, &provider).await;
                self.timeout_entry(entry, "ready").await;
                return;
            }
        };

        let result = self
            .workload
            .run(
                &session,
                &provisioned.private_key_pem,
                &entry.model,
                self.config.result_timeout,
            )
            .await;

        self.teardown(&session.id, &provider).await;

        match result {
            Ok(result) => {
                let cost = (Utc::now() - session.created_at).num_seconds() as f64 / 3600.0
                    * session.price_per_hour;
                entry.status = ManifestEntryStatus::Success;
                entry.throughput = Some(result.throughput);
                entry.cost = Some(cost);
                entry.finished_at = Some(Utc::now());
                if let Err(err) = self.manifests.update(entry).await {
                    log::warn!("benchmark: failed to record success: {:?}", err);
                }
                if let Some(metrics) = &self.metrics {
                    metrics.benchmark_entry_finished("success");
                }
            }
            Err(err) if err.stage == "result-timeout" => {
                self.timeout_entry(entry, err.stage).await;
            }
            Err(err) => {
                self.fail_entry(entry, err.stage, &err.message).await;
            }
        }
    }

    async fn poll_until_ready(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Option<crate::models::Session> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.sessions.get(session_id).await {
                Ok(Some(session)) if session.status == SessionStatus::Running => {
                    return Some(session)
                }
                Ok(Some(session)) if session.status.is_terminal() => return None,
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    async fn teardown(&self, session_id: &str, provider: &Arc<dyn Provider>) {
        let session = match self.sessions.get(session_id).await {
            Ok(Some(session)) => session,
            _ => return,
        };
        if let Err(err) = self
            .destroyer
            .destroy(session, provider.as_ref(), DestroyReason::ConsumerRequested)
            .await
        {
            log::warn!(
                "benchmark: teardown for session {} failed (absorbed): {:?}",
                session_id,
                err
            );
        }
    }

    async fn fail_entry(&self, mut entry: ManifestEntry, stage: &str, message: &str) {
        log::warn!("benchmark entry {} failed at {}: {}", entry.id, stage, message);
        entry.status = ManifestEntryStatus::Failed;
        entry.failure_stage = Some(stage.to_string());
        entry.finished_at = Some(Utc::now());
        if let Err(err) = self.manifests.update(entry).await {
            log::warn!("benchmark: failed to record failure: {:?}", err);
        }
        if let Some(metrics) = &self.metrics {
            metrics.benchmark_entry_finished("failed");
        }
    }

    /// Distinct from `fail_entry`: a deadline elapsing (readiness or result)
    /// is a `timeout[stage]`, not a `failed[stage]` — the two are
    /// observably different terminal states per the manifest entry lifecycle.
    async fn timeout_entry(&self, mut entry: ManifestEntry, stage: &str) {
        log::warn!("benchmark entry {} timed out at {}", entry.id, stage);
        entry.status = ManifestEntryStatus::Timeout;
        entry.failure_stage = Some(stage.to_string());
        entry.finished_at = Some(Utc::now());
        if let Err(err) = self.manifests.update(entry).await {
            log::warn!("benchmark: failed to record timeout: {:?}", err);
        }
        if let Some(metrics) = &self.metrics {
            metrics.benchmark_entry_finished("timeout");
        }
    }

    async fn finalize_run(&self, run_id: &str, cancelled: bool) {
        let run = match self.runs.get(run_id).await {
            Ok(Some(run)) => run,
            _ => return,
        };
        let entries = match self.manifests.list_by_run(run_id).await {
            Ok(entries) => entries,
            Err(_) => return,
        };

        let status = if cancelled {
            BenchmarkRunStatus::Cancelled
        } else if entries.iter().any(|e| e.status == ManifestEntryStatus::Success) {
            BenchmarkRunStatus::Completed
        } else {
            BenchmarkRunStatus::Failed
        };

        let mut run = run;
        run.status = status;
        run.finished_at = Some(Utc::now());
        let _ = self.runs.update(run).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LifecycleConfig;
    use crate::models::{BenchmarkRunStatus, Offer};
    use crate::store::{MockManifestStore, MockRunStore, MockSessionStore};
    use crate::testutil::FakeProvider;
    use crate::util::AsyncSleep;
    use crate::verifier::ReadinessVerifier;
    use std::sync::Mutex;

    fn offer() -> Offer {
        Offer {
            id: "o1".to_string(),
            provider: "fake".to_string(),
            gpu_type: "g1".to_string(),
            gpu_count: 1,
            price_per_hour: 1.0,
            region: None,
        }
    }

    struct ScriptedWorkload {
        result: Mutex<Option<Result<BenchmarkResult, WorkloadError>>>,
    }

    #[async_trait]
    impl WorkloadRunner for ScriptedWorkload {
        async fn run(
            &self,
            _session: &crate::models::Session,
            _private_key_pem: &str,
            _model: &str,
            _result_timeout: Duration,
        ) -> Result<BenchmarkResult, WorkloadError> {
            self.result.lock().unwrap().take().unwrap()
        }
    }

    fn orchestrator(
        manifests: MockManifestStore,
        runs: MockRunStore,
        sessions: Arc<dyn SessionStore>,
        provider: Arc<dyn Provider>,
        workload: Arc<dyn WorkloadRunner>,
    ) -> BenchmarkOrchestrator {
        let verifier = Arc::new(ReadinessVerifier::new(
            sessions.clone(),
            Default::default(),
            Arc::new(AsyncSleep),
        ));
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert("fake".to_string(), provider.clone());

        let provisioner = Arc::new(Provisioner::new(
            sessions.clone(),
            providers.clone(),
            verifier,
            &LifecycleConfig::default(),
        ));
        let destroyer = Arc::new(DestructionVerifier::new(
            sessions.clone(),
            Default::default(),
            Arc::new(AsyncSleep),
        ));

        BenchmarkOrchestrator::new(
            Arc::new(manifests),
            Arc::new(runs),
            sessions,
            provisioner,
            destroyer,
            providers,
            workload,
            BenchmarkConfig {
                max_workers: 1,
                ready_timeout: Duration::from_millis(50),
                result_timeout: Duration::from_millis(50),
                dispatch_batch_size: 10,
            },
        )
    }

    #[tokio::test]
    async fn stops_dispatch_once_budget_exhausted() {
        let mut runs = MockRunStore::new();
        runs.expect_get().returning(|_| {
            Ok(Some(BenchmarkRun {
                id: "run1".to_string(),
                models: vec!["m1".to_string()],
                gpu_types: vec!["g1".to_string()],
                providers: vec!["fake".to_string()],
                max_budget: 0.01,
                priority: 0,
                status: BenchmarkRunStatus::Running,
                created_at: Utc::now(),
                finished_at: None,
            }))
        });
        runs.expect_update().returning(|_| Ok(()));

        let mut manifests = MockManifestStore::new();
        manifests.expect_list_by_run().returning(|_| {
            Ok(vec![ManifestEntry {
                id: "e1".to_string(),
                run_id: "run1".to_string(),
                gpu_type: "g1".to_string(),
                provider: "fake".to_string(),
                model: "m1".to_string(),
                priority: 0,
                status: ManifestEntryStatus::Success,
                worker_id: None,
                session_id: None,
                throughput: Some(1.0),
                cost: Some(0.02),
                failure_stage: None,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            }])
        });

        let sessions: Arc<dyn SessionStore> = Arc::new(MockSessionStore::new());
        let provider: Arc<dyn Provider> = Arc::new(FakeProvider::new("fake").with_offers(vec![offer()]));
        let workload: Arc<dyn WorkloadRunner> = Arc::new(ScriptedWorkload {
            result: Mutex::new(None),
        });

        let orchestrator = Arc::new(orchestrator(manifests, runs, sessions, provider, workload));
        let cancel = Arc::new(AtomicBool::new(false));
        orchestrator.execute("run1".to_string(), cancel).await;
    }

    #[tokio::test]
    async fn entry_fails_when_no_offer_matches() {
        let mut runs = MockRunStore::new();
        runs.expect_get().returning(|_| {
            Ok(Some(BenchmarkRun {
                id: "run1".to_string(),
                models: vec!["m1".to_string()],
                gpu_types: vec!["g1".to_string()],
                providers: vec!["fake".to_string()],
                max_budget: 0.0,
                priority: 0,
                status: BenchmarkRunStatus::Running,
                created_at: Utc::now(),
                finished_at: None,
            }))
        });
        runs.expect_update().returning(|_| Ok(()));

        let entry = ManifestEntry {
            id: "e1".to_string(),
            run_id: "run1".to_string(),
            gpu_type: "g1".to_string(),
            provider: "fake".to_string(),
            model: "m1".to_string(),
            priority: 0,
            status: ManifestEntryStatus::Pending,
            worker_id: None,
            session_id: None,
            throughput: None,
            cost: None,
            failure_stage: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        let mut manifests = MockManifestStore::new();
        let mut first_call = true;
        manifests.expect_list_pending().returning(move |_, _| {
            if first_call {
                first_call = false;
                Ok(vec![entry.clone()])
            } else {
                Ok(vec![])
            }
        });
        manifests.expect_mark_running().returning(|_, _, _| Ok(true));
        let failed = Arc::new(Mutex::new(false));
        let failed_clone = failed.clone();
        manifests.expect_update().returning(move |entry| {
            assert_eq!(entry.status, ManifestEntryStatus::Failed);
            assert_eq!(entry.failure_stage.as_deref(), Some("find_offer"));
            *failed_clone.lock().unwrap() = true;
            Ok(())
        });
        manifests.expect_list_by_run().returning(|_| Ok(vec![]));

        let sessions: Arc<dyn SessionStore> = Arc::new(MockSessionStore::new());
        // No offers registered: the fake provider returns an empty list.
        let provider: Arc<dyn Provider> = Arc::new(FakeProvider::new("fake"));
        let workload: Arc<dyn WorkloadRunner> = Arc::new(ScriptedWorkload {
            result: Mutex::new(None),
        });

        let orchestrator = Arc::new(orchestrator(manifests, runs, sessions, provider, workload));
        let cancel = Arc::new(AtomicBool::new(false));
        orchestrator.execute("run1".to_string(), cancel).await;

        assert!(*failed.lock().unwrap());
    }
}
