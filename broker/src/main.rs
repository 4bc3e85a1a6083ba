mod api;
mod benchmarks;
mod health;
mod ssh_workload;

use broker_core::benchmark::BenchmarkOrchestrator;
use broker_core::config::Config;
use broker_core::cost_tracker::CostTracker;
use broker_core::destroyer::DestructionVerifier;
use broker_core::http::HttpFactory;
use broker_core::http_server::{DefaultRouter, RouilleServer, Serving};
use broker_core::lifecycle::LifecycleManager;
use broker_core::logging::{self, LogFormat};
use broker_core::metrics::{BrokerMetrics, MetricsHandler};
use broker_core::provider::Provider;
use broker_core::provisioner::Provisioner;
use broker_core::store::{SledCostStore, SledManifestStore, SledRunStore, SledSessionStore};
use broker_core::util::AsyncSleep;
use broker_core::verifier::ReadinessVerifier;
use health::ReadinessFlag;
use prometheus::Registry;
use ssh_workload::SshWorkloadRunner;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use structopt::StructOpt;
use url::Url;

#[derive(Debug, StructOpt)]
#[structopt(name = "gpu-broker", rename_all = "kebab")]
struct Options {
    /// Path to the TOML configuration file. All other settings live there;
    /// this binary takes no per-section overrides.
    #[structopt(long, env = "CONFIG_FILE", default_value = "broker.toml", parse(from_os_str))]
    config_file: PathBuf,

    /// The log filter to use, `slog-envlogger` syntax (e.g.
    /// 'info,gpu_broker=debug'). Overrides `logging.level` from the
    /// config file.
    #[structopt(long, env = "LOG_FILTER")]
    log_filter: Option<String>,

    #[structopt(long, env = "BIND_ADDRESS")]
    bind_address: Option<SocketAddr>,
}

fn main() {
    let options = Options::from_args();

    let mut config = if options.config_file.exists() {
        Config::from_file(&options.config_file).expect("failed to load configuration")
    } else {
        Config::default()
    };
    if let Some(bind_address) = options.bind_address {
        config.server.host = bind_address.ip().to_string();
        config.server.port = bind_address.port();
    }

    let log_filter = options.log_filter.unwrap_or_else(|| config.logging.level.clone());
    let log_format = LogFormat::from_str(&config.logging.format).unwrap_or(LogFormat::Term);
    let (_logger, _guard) = logging::init(&log_filter, log_format);
    log::info!("starting gpu-broker with config from {:?}", options.config_file);

    let db = sled::open(&config.database.path).expect("failed to open database");
    let sessions: Arc<dyn broker_core::store::SessionStore> =
        Arc::new(SledSessionStore::new(&db).expect("failed to open sessions tree"));
    let costs: Arc<dyn broker_core::store::CostStore> =
        Arc::new(SledCostStore::new(&db).expect("failed to open cost tree"));
    let manifests: Arc<dyn broker_core::store::ManifestStore> =
        Arc::new(SledManifestStore::new(&db).expect("failed to open manifest tree"));
    let runs: Arc<dyn broker_core::store::RunStore> =
        Arc::new(SledRunStore::new(&db).expect("failed to open benchmark run tree"));

    let http_factory = HttpFactory::new(config.verification.api_timeout);
    let providers = build_providers(&config, &http_factory);

    let registry = Arc::new(Registry::new());
    let metrics = Arc::new(BrokerMetrics::new(&registry).expect("failed to register metrics"));

    let readiness_verifier = Arc::new(
        ReadinessVerifier::new(sessions.clone(), config.verification.clone(), Arc::new(AsyncSleep))
            .with_metrics(metrics.clone()),
    );
    let provisioner = Arc::new(Provisioner::new(
        sessions.clone(),
        providers.clone(),
        readiness_verifier,
        &config.lifecycle,
    ));
    let destroyer = Arc::new(
        DestructionVerifier::new(sessions.clone(), config.destroy.clone(), Arc::new(AsyncSleep))
            .with_metrics(metrics.clone()),
    );
    let lifecycle = Arc::new(LifecycleManager::new(
        sessions.clone(),
        providers.clone(),
        destroyer.clone(),
        config.lifecycle.clone(),
    ));
    let cost_tracker = Arc::new(
        CostTracker::new(sessions.clone(), costs, std::time::Duration::from_secs(3600))
            .with_metrics(metrics.clone()),
    );
    let benchmark_orchestrator = Arc::new(
        BenchmarkOrchestrator::new(
            manifests.clone(),
            runs.clone(),
            sessions.clone(),
            provisioner.clone(),
            destroyer.clone(),
            providers.clone(),
            Arc::new(SshWorkloadRunner),
            config.benchmark.clone(),
        )
        .with_metrics(metrics.clone()),
    );

    let readiness = Arc::new(ReadinessFlag::new());
    let monitoring_metrics = Arc::new(MetricsHandler::new(registry));
    RouilleServer::new(DefaultRouter {
        metrics: monitoring_metrics,
        health_readiness: readiness.clone(),
    })
    .start_in_background();

    let api_state = Arc::new(api::ApiState {
        provisioner,
        sessions,
        destroyer,
        providers,
    });
    let benchmark_state = Arc::new(benchmarks::BenchmarkState {
        orchestrator: benchmark_orchestrator.clone(),
        runs,
        manifests,
    });
    let bind_address: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .expect("invalid server.host/port");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (sweep_done_tx, sweep_done_rx) = tokio::sync::oneshot::channel();
    let lifecycle_task = runtime.spawn(lifecycle.run_with_ready(shutdown_rx.clone(), Some(sweep_done_tx)));
    let cost_task = runtime.spawn(cost_tracker.run(shutdown_rx));
    let benchmark_task_handle = {
        let orchestrator = benchmark_orchestrator.clone();
        async move {
            // The orchestrator dispatches only once a run is requested via
            // the benchmark CLI's durable manifest rows; nothing to do at
            // startup beyond keeping `orchestrator` alive for `Arc` use
            // elsewhere in this process's lifetime.
            std::future::pending::<()>().await;
            drop(orchestrator);
        }
    };
    let benchmark_task = runtime.spawn(benchmark_task_handle);

    let filter = api::all(api_state).or(benchmarks::all(benchmark_state));
    let serve_task = runtime.spawn(warp::serve(filter).run(bind_address));

    log::info!("gpu-broker listening on {}, waiting for startup sweep", bind_address);
    runtime.block_on(async move {
        let _ = sweep_done_rx.await;
        readiness.set_ready();
        log::info!("gpu-broker ready on {}", bind_address);
        tokio::select! {
            _ = lifecycle_task => log::error!("lifecycle manager task exited"),
            _ = cost_task => log::error!("cost tracker task exited"),
            _ = benchmark_task => log::error!("benchmark orchestrator task exited"),
            _ = serve_task => log::error!("session API server task exited"),
        }
        let _ = shutdown_tx.send(true);
    });
}

fn build_providers(config: &Config, http_factory: &HttpFactory) -> HashMap<String, Arc<dyn Provider>> {
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    for (name, provider_config) in &config.providers {
        if !provider_config.enabled {
            continue;
        }
        let kind = provider_config
            .credentials
            .get("kind")
            .map(String::as_str)
            .unwrap_or("rest");
        let provider: Arc<dyn Provider> = match kind {
            "fake" => Arc::new(broker_core::testutil::FakeProvider::new(name.clone())),
            _ => {
                let base_url = provider_config
                    .credentials
                    .get("base_url")
                    .unwrap_or_else(|| panic!("provider '{}' is missing credentials.base_url", name));
                let api_key = provider_config
                    .credentials
                    .get("api_key")
                    .cloned()
                    .unwrap_or_default();
                let url = Url::parse(base_url)
                    .unwrap_or_else(|err| panic!("provider '{}' has invalid base_url: {}", name, err));
                Arc::new(
                    providers::RestProvider::new(name.clone(), url, api_key, http_factory)
                        .unwrap_or_else(|err| panic!("failed to build provider '{}': {}", name, err)),
                )
            }
        };
        providers.insert(name.clone(), provider);
    }
    providers
}
