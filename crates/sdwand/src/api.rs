//! HTTP API
//!
//! Routes:
//! - `GET  /api/keys/wireguard`, `/api/keys/identity`: our base64 identity
//! - `GET  /api/keys/ssh`: published SSH keys
//! - `POST /api/link`: inbound pairing request
//! - `GET  /api/sdwan`: streaming topology export
//! - `GET  /api/links`: local link summaries
//! - `GET  /api/health`, `/api/health/{time}`: diagnostics verdicts and transcripts
//! - `POST /api/completions`: chat proxy to the inference backend

use crate::diagnostics::{DiagnosticsError, HealthRegistry};
use crate::inference::{render_prompt, ChatMessage, Inference, InferenceError};
use crate::pairing::{
    check_content_length, parse_link_body, LinkOutcome, PairingError, PendingLinks, MAX_LINK_BODY,
};
use crate::probe::SnapshotSource;
use crate::sync::Exporter;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use futures::{StreamExt, TryStreamExt};
use sdwan_core::{Identity, LinkSummary};
use sdwan_net::{FrameError, JsonArrayCodec};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

/// Deadline attached to a request by the front door
#[derive(Clone, Copy, Debug)]
pub struct RequestDeadline(pub tokio::time::Instant);

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub identity: Identity,
    pub ssh_keys: Arc<str>,
    pub pending: Arc<PendingLinks>,
    pub exporter: Arc<Exporter>,
    pub source: Arc<dyn SnapshotSource>,
    pub health: Option<HealthRegistry>,
    pub inference: Option<Arc<dyn Inference>>,
}

/// API errors, mapped onto status codes
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error("Malformed request body: {0}")]
    BadBody(String),
    #[error("Not found")]
    NotFound,
    #[error("{0} is disabled on this node")]
    Disabled(&'static str),
    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Pairing(PairingError::BadLength(_) | PairingError::Malformed(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::Pairing(PairingError::Conflict { .. }) => StatusCode::UNAUTHORIZED,
            Self::BadBody(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Disabled(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Inference(_) => StatusCode::BAD_GATEWAY,
            Self::Pairing(_) | Self::Diagnostics(_) | Self::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        } else {
            debug!("Request rejected ({}): {}", status, self);
        }
        (status, self.to_string()).into_response()
    }
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/keys/ssh", get(ssh_keys))
        .route("/api/keys/wireguard", get(identity))
        .route("/api/keys/identity", get(identity))
        .route("/api/link", post(link))
        .route("/api/sdwan", get(export))
        .route("/api/links", get(links))
        .route("/api/health", get(health_list))
        .route("/api/health/{time}", get(health_transcript))
        .route("/api/completions", post(completions))
        .with_state(state)
}

async fn ssh_keys(State(state): State<AppState>) -> String {
    state.ssh_keys.to_string()
}

async fn identity(State(state): State<AppState>) -> String {
    state.identity.to_base64()
}

async fn link(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<&'static str, ApiError> {
    let length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    // the body is left unread when the length is wrong
    check_content_length(length)?;

    let body = axum::body::to_bytes(body, MAX_LINK_BODY)
        .await
        .map_err(|e| ApiError::BadBody(e.to_string()))?;
    let requester = parse_link_body(&body)?;

    // directory scans block
    let pending = state.pending.clone();
    let outcome = tokio::task::spawn_blocking(move || pending.submit(&requester)).await??;
    match outcome {
        LinkOutcome::Created => Ok("pending\n"),
        LinkOutcome::AlreadyPending => Ok("already pending\n"),
    }
}

async fn export(
    State(state): State<AppState>,
    deadline: Option<Extension<RequestDeadline>>,
) -> Response {
    let deadline = deadline.map(|Extension(RequestDeadline(at))| at);
    (
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(state.exporter.stream(deadline)),
    )
        .into_response()
}

async fn links(State(state): State<AppState>) -> Json<Vec<LinkSummary>> {
    let snapshot = state.source.snapshot().await;
    let summaries = snapshot
        .links()
        .iter()
        .map(|link| LinkSummary::of(link.as_ref()))
        .collect();
    Json(summaries)
}

async fn health_list(State(state): State<AppState>) -> Result<Json<BTreeMap<i64, bool>>, ApiError> {
    match &state.health {
        Some(registry) => Ok(Json(registry.list().await?)),
        None => Ok(Json(BTreeMap::new())),
    }
}

async fn health_transcript(
    State(state): State<AppState>,
    Path(time): Path<i64>,
) -> Result<Response, ApiError> {
    let registry = state.health.as_ref().ok_or(ApiError::NotFound)?;
    let muxer = registry.get(time).await?.ok_or(ApiError::NotFound)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(muxer.reader().into_stream()),
    )
        .into_response())
}

async fn completions(State(state): State<AppState>, body: Body) -> Result<Response, ApiError> {
    let inference = state.inference.clone().ok_or(ApiError::Disabled("inference"))?;

    let reader = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
    let messages: Vec<ChatMessage> = FramedRead::new(reader, JsonArrayCodec::<ChatMessage>::new())
        .try_collect()
        .await
        .map_err(|e: FrameError| ApiError::BadBody(e.to_string()))?;

    let tokens = inference.complete(&render_prompt(&messages)).await?;
    let body = tokens.map(|token| token.map(Bytes::from).map_err(std::io::Error::other));
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response())
}
