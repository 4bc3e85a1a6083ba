//! The benchmark campaign admin surface: `POST /benchmarks` starts a
//! manifest-driven campaign and hands dispatch off to a detached task
//! (mirroring the Session API's own fire-and-forget verification
//! handoff); `GET /benchmarks/{id}` reports run + manifest-entry status.
//! Not part of the externally-specified Session API; an operator-facing
//! surface for the Benchmark Orchestrator.

use broker_core::benchmark::{BenchmarkOrchestrator, BenchmarkRunRequest};
use broker_core::models::{BenchmarkRun, ManifestEntry};
use broker_core::store::{ManifestStore, RunStore};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use warp::{Filter, Rejection, Reply};

pub struct BenchmarkState {
    pub orchestrator: Arc<BenchmarkOrchestrator>,
    pub runs: Arc<dyn RunStore>,
    pub manifests: Arc<dyn ManifestStore>,
}

#[derive(Debug, Deserialize)]
struct StartRunBody {
    #[serde(default)]
    models: Vec<String>,
    #[serde(default)]
    gpu_types: Vec<String>,
    #[serde(default)]
    providers: Vec<String>,
    #[serde(default)]
    max_budget: f64,
    #[serde(default)]
    priority: i32,
}

#[derive(Debug, Serialize)]
struct StartedRun {
    run_id: String,
}

#[derive(Debug, Serialize)]
struct RunView {
    run: BenchmarkRun,
    entries: Vec<ManifestEntry>,
}

pub fn all(state: Arc<BenchmarkState>) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    start_run(state.clone())
        .or(get_run(state))
        .unify()
        .recover(handle_rejection)
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (code, message) = if err.is_not_found() {
        (warp::http::StatusCode::NOT_FOUND, "invalid url path".to_string())
    } else if err.find::<warp::filters::body::BodyDeserializeError>().is_some() {
        (warp::http::StatusCode::BAD_REQUEST, "invalid request body".to_string())
    } else {
        log::warn!("unhandled benchmark rejection: {:?}", err);
        (warp::http::StatusCode::INTERNAL_SERVER_ERROR, "unexpected internal error".to_string())
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "message": message })),
        code,
    ))
}

fn with_state(
    state: Arc<BenchmarkState>,
) -> impl Filter<Extract = (Arc<BenchmarkState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn start_run(
    state: Arc<BenchmarkState>,
) -> impl Filter<Extract = (Box<dyn Reply>,), Error = Infallible> + Clone {
    warp::path!("benchmarks")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(handle_start)
}

fn get_run(
    state: Arc<BenchmarkState>,
) -> impl Filter<Extract = (Box<dyn Reply>,), Error = Infallible> + Clone {
    warp::path!("benchmarks" / String)
        .and(warp::get())
        .and(with_state(state))
        .and_then(handle_get)
}

async fn handle_start(body: StartRunBody, state: Arc<BenchmarkState>) -> Result<Box<dyn Reply>, Infallible> {
    let req = BenchmarkRunRequest {
        models: body.models,
        gpu_types: body.gpu_types,
        providers: body.providers,
        max_budget: body.max_budget,
        priority: body.priority,
    };

    match state.orchestrator.start_run(req).await {
        Ok(run_id) => {
            let orchestrator = state.orchestrator.clone();
            let dispatch_id = run_id.clone();
            tokio::spawn(async move {
                orchestrator.execute(dispatch_id, Arc::new(AtomicBool::new(false))).await;
            });
            Ok(Box::new(warp::reply::with_status(
                warp::reply::json(&StartedRun { run_id }),
                warp::http::StatusCode::ACCEPTED,
            )))
        }
        Err(err) => {
            log::warn!("failed to start benchmark run: {:?}", err);
            Ok(Box::new(warp::reply::with_status(
                warp::reply::json(&serde_json::json!({ "message": err.to_string() })),
                warp::http::StatusCode::BAD_REQUEST,
            )))
        }
    }
}

async fn handle_get(id: String, state: Arc<BenchmarkState>) -> Result<Box<dyn Reply>, Infallible> {
    let run = match state.runs.get(&id).await {
        Ok(Some(run)) => run,
        Ok(None) => {
            return Ok(Box::new(warp::reply::with_status(
                warp::reply::json(&serde_json::json!({ "message": "no such run" })),
                warp::http::StatusCode::NOT_FOUND,
            )))
        }
        Err(err) => {
            return Ok(Box::new(warp::reply::with_status(
                warp::reply::json(&serde_json::json!({ "message": err.to_string() })),
                warp::http::StatusCode::INTERNAL_SERVER_ERROR,
            )))
        }
    };
    let entries = state.manifests.list_by_run(&id).await.unwrap_or_default();
    Ok(Box::new(warp::reply::json(&RunView { run, entries })))
}
