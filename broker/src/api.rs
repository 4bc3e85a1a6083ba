//! The session-facing API: `POST /sessions`, `GET /sessions/{id}`, `DELETE
//! /sessions/{id}`, `POST /sessions/{id}/done`, `POST
//! /sessions/{id}/extend`. Deserializes requests and maps `BrokerError`
//! kinds to HTTP statuses; every decision is made in `broker_core`. Filter
//! tree and rejection handling follow the same shape as the teacher's
//! `warp` API (`warp::path!`, `.and_then()`, a single `recover()`).

use broker_core::destroyer::DestructionVerifier;
use broker_core::error::BrokerError;
use broker_core::models::{DestroyReason, Session, SessionStatus, StoragePolicy, WorkloadType};
use broker_core::provider::Provider;
use broker_core::provisioner::{CreateSessionRequest, Provisioner};
use broker_core::store::SessionStore;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

pub struct ApiState {
    pub provisioner: Arc<Provisioner>,
    pub sessions: Arc<dyn SessionStore>,
    pub destroyer: Arc<DestructionVerifier>,
    pub providers: HashMap<String, Arc<dyn Provider>>,
}

#[derive(Debug)]
struct ApiError(BrokerError);
impl warp::reject::Reject for ApiError {}

fn reject(err: BrokerError) -> Rejection {
    warp::reject::custom(ApiError(err))
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    consumer_id: String,
    provider: String,
    offer_id: String,
    gpu_type: String,
    gpu_count: u32,
    workload_type: WorkloadType,
    reservation_hours: f64,
    hard_max_override_hours: Option<f64>,
    idle_threshold_minutes: Option<u64>,
    storage_policy: Option<StoragePolicy>,
    price_per_hour: f64,
    key_bits: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ExtendBody {
    additional_hours: f64,
}

#[derive(Debug, Serialize)]
struct SessionView {
    id: String,
    consumer_id: String,
    provider: String,
    offer_id: String,
    gpu_type: String,
    gpu_count: u32,
    workload_type: WorkloadType,
    status: SessionStatus,
    ssh_host: Option<String>,
    ssh_port: Option<u16>,
    ssh_user: Option<String>,
    price_per_hour: f64,
    created_at: chrono::DateTime<Utc>,
    expires_at: chrono::DateTime<Utc>,
}

impl From<&Session> for SessionView {
    fn from(session: &Session) -> Self {
        SessionView {
            id: session.id.clone(),
            consumer_id: session.consumer_id.clone(),
            provider: session.provider.clone(),
            offer_id: session.offer_id.clone(),
            gpu_type: session.gpu_type.clone(),
            gpu_count: session.gpu_count,
            workload_type: session.workload_type,
            status: session.status,
            ssh_host: session.ssh_host.clone(),
            ssh_port: session.ssh_port,
            ssh_user: session.ssh_user.clone(),
            price_per_hour: session.price_per_hour,
            created_at: session.created_at,
            expires_at: session.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreatedSessionView {
    #[serde(flatten)]
    session: SessionView,
    private_key_pem: String,
    agent_token: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

pub fn all(state: Arc<ApiState>) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    warp::path("sessions")
        .and(
            create_session(state.clone())
                .or(get_session(state.clone()))
                .or(delete_session(state.clone()))
                .or(done_session(state.clone()))
                .or(extend_session(state)),
        )
        .recover(handle_rejection)
}

fn with_state(
    state: Arc<ApiState>,
) -> impl Filter<Extract = (Arc<ApiState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn create_session(
    state: Arc<ApiState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path::end()
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(handle_create)
        .with(warp::log("gpu_broker::api::create_session"))
}

fn get_session(
    state: Arc<ApiState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!(String)
        .and(warp::get())
        .and(with_state(state))
        .and_then(handle_get)
        .with(warp::log("gpu_broker::api::get_session"))
}

fn delete_session(
    state: Arc<ApiState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!(String)
        .and(warp::delete())
        .and(with_state(state))
        .and_then(handle_terminate)
        .with(warp::log("gpu_broker::api::delete_session"))
}

fn done_session(
    state: Arc<ApiState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!(String / "done")
        .and(warp::post())
        .and(with_state(state))
        .and_then(handle_terminate)
        .with(warp::log("gpu_broker::api::done_session"))
}

fn extend_session(
    state: Arc<ApiState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!(String / "extend")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(handle_extend)
        .with(warp::log("gpu_broker::api::extend_session"))
}

async fn handle_create(body: CreateSessionBody, state: Arc<ApiState>) -> Result<impl Reply, Rejection> {
    let req = CreateSessionRequest {
        consumer_id: body.consumer_id,
        provider: body.provider,
        offer_id: body.offer_id,
        gpu_type: body.gpu_type,
        gpu_count: body.gpu_count,
        workload_type: body.workload_type,
        reservation_hours: body.reservation_hours,
        hard_max_override_hours: body.hard_max_override_hours,
        idle_threshold_minutes: body.idle_threshold_minutes,
        storage_policy: body.storage_policy,
        price_per_hour: body.price_per_hour,
        key_bits: body.key_bits,
    };

    let provisioned = state
        .provisioner
        .create_session(req)
        .await
        .map_err(reject)?;

    let view = CreatedSessionView {
        session: SessionView::from(&provisioned.session),
        private_key_pem: provisioned.private_key_pem,
        agent_token: provisioned.agent_token,
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&view),
        StatusCode::CREATED,
    ))
}

async fn handle_get(id: String, state: Arc<ApiState>) -> Result<impl Reply, Rejection> {
    let session = state
        .sessions
        .get(&id)
        .await
        .map_err(|err| reject(BrokerError::Other(err.into())))?
        .ok_or_else(|| reject(BrokerError::SessionNotFound(id.clone())))?;
    Ok(warp::reply::json(&SessionView::from(&session)))
}

/// Shared by `DELETE /sessions/{id}` and `POST /sessions/{id}/done`: both
/// are consumer-initiated completion signals and tear the session down
/// through the same destroy-then-confirm path.
async fn handle_terminate(id: String, state: Arc<ApiState>) -> Result<impl Reply, Rejection> {
    let session = state
        .sessions
        .get(&id)
        .await
        .map_err(|err| reject(BrokerError::Other(err.into())))?
        .ok_or_else(|| reject(BrokerError::SessionNotFound(id.clone())))?;

    if session.status.is_terminal() {
        return Ok(warp::reply::with_status(
            warp::reply::json(&SessionView::from(&session)),
            StatusCode::OK,
        ));
    }

    let provider = state
        .providers
        .get(&session.provider)
        .cloned()
        .ok_or_else(|| reject(BrokerError::ProviderNotFound(session.provider.clone())))?;

    let view = SessionView::from(&session);
    state
        .destroyer
        .destroy(session, provider.as_ref(), DestroyReason::ConsumerRequested)
        .await
        .map_err(reject)?;
    Ok(warp::reply::with_status(
        warp::reply::json(&view),
        StatusCode::OK,
    ))
}

async fn handle_extend(id: String, body: ExtendBody, state: Arc<ApiState>) -> Result<impl Reply, Rejection> {
    let mut session = state
        .sessions
        .get(&id)
        .await
        .map_err(|err| reject(BrokerError::Other(err.into())))?
        .ok_or_else(|| reject(BrokerError::SessionNotFound(id.clone())))?;

    if session.status != SessionStatus::Running {
        return Err(reject(BrokerError::NotReady(id)));
    }

    session.expires_at = session.expires_at
        + ChronoDuration::seconds((body.additional_hours * 3600.0) as i64);
    state
        .sessions
        .update(session.clone())
        .await
        .map_err(|err| reject(BrokerError::Other(err.into())))?;
    Ok(warp::reply::json(&SessionView::from(&session)))
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    if err.is_not_found() {
        return Ok(warp::reply::with_status(
            warp::reply::json(&ErrorBody {
                kind: "not-found",
                message: "invalid url path".to_string(),
            }),
            StatusCode::NOT_FOUND,
        ));
    }
    if err.find::<warp::filters::body::BodyDeserializeError>().is_some() {
        return Ok(warp::reply::with_status(
            warp::reply::json(&ErrorBody {
                kind: "bad-request",
                message: "invalid request body".to_string(),
            }),
            StatusCode::BAD_REQUEST,
        ));
    }
    if let Some(ApiError(err)) = err.find() {
        let status = match err {
            BrokerError::DuplicateSession { .. } => StatusCode::CONFLICT,
            BrokerError::StaleInventory { .. } => StatusCode::CONFLICT,
            BrokerError::ProviderNotFound(_) => StatusCode::BAD_REQUEST,
            BrokerError::CreateFailed(_) => StatusCode::BAD_GATEWAY,
            BrokerError::VerificationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            BrokerError::DestroyVerificationFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::NotReady(_) => StatusCode::CONFLICT,
            BrokerError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        return Ok(warp::reply::with_status(
            warp::reply::json(&ErrorBody {
                kind: err.kind(),
                message: err.to_string(),
            }),
            status,
        ));
    }

    log::warn!("unhandled rejection: {:?}", err);
    Ok(warp::reply::with_status(
        warp::reply::json(&ErrorBody {
            kind: "internal",
            message: "unexpected internal error".to_string(),
        }),
        StatusCode::INTERNAL_SERVER_ERROR,
    ))
}
