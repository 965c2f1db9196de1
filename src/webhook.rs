//! HTTP surface: orchestrator webhooks and the two trigger endpoints.
//!
//! Handlers authenticate and parse, then hand a [`Command`] to the ingest
//! task. Nothing here touches the store directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use md5::{Digest, Md5};
use sha2::Sha256;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::ingest::Command;
use crate::store::QueueId;

pub const SIGNATURE_HEADER: &str = "x-uipath-signature";

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct WebhookState {
    pub sender: mpsc::Sender<Command>,
    pub secret_key: Arc<str>,
}

impl WebhookState {
    pub fn new(sender: mpsc::Sender<Command>, secret_key: &str) -> Self {
        Self {
            sender,
            secret_key: Arc::from(secret_key),
        }
    }

    async fn dispatch(&self, command: Command) -> Result<(), WebhookError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| WebhookError::Unavailable)
    }
}

#[derive(Debug)]
enum WebhookError {
    BadSignature,
    BadSecret,
    BadRequest(String),
    Unavailable,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        match self {
            WebhookError::BadSignature => {
                (StatusCode::UNAUTHORIZED, "invalid signature").into_response()
            }
            WebhookError::BadSecret => (StatusCode::UNAUTHORIZED, "invalid secret").into_response(),
            WebhookError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            WebhookError::Unavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response()
            }
        }
    }
}

type WebhookResult = Result<StatusCode, WebhookError>;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JobRef {
    id: i64,
    release_name: String,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JobsCreated {
    jobs: Vec<JobRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JobFinished {
    job: JobRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueueItemRef {
    id: i64,
    queue_definition_id: QueueId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueueItemsCreated {
    queue_items: Vec<QueueItemRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueueItemCompleted {
    queue_item: QueueItemRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    process_name: String,
    env_name: String,
    #[serde(default)]
    process_args: Option<serde_json::Value>,
    #[serde(default = "one")]
    count: u32,
    secret: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest {
    process_name: String,
    count: u32,
    secret: String,
}

fn one() -> u32 {
    1
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Check `x-uipath-signature` against base64(HMAC-SHA256(key, body)).
fn verify_signature(
    secret_key: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), WebhookError> {
    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(WebhookError::BadSignature)?;
    let provided = BASE64
        .decode(provided.trim())
        .map_err(|_| WebhookError::BadSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| WebhookError::BadSignature)?;
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| WebhookError::BadSignature)
}

/// Lowercase hex MD5 of the secret key, the shared secret callers of the
/// trigger endpoints present.
fn secret_digest(secret_key: &str) -> String {
    Md5::digest(secret_key.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn verify_secret(secret_key: &str, provided: &str) -> Result<(), WebhookError> {
    if provided == secret_digest(secret_key) {
        Ok(())
    } else {
        Err(WebhookError::BadSecret)
    }
}

/// Verify the signature, then parse the body.
fn signed_payload<T: DeserializeOwned>(
    state: &WebhookState,
    route: &'static str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<T, WebhookError> {
    if let Err(e) = verify_signature(&state.secret_key, headers, body) {
        tracing::warn!(route, "webhook signature mismatch");
        return Err(e);
    }
    parse(body)
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, WebhookError> {
    serde_json::from_slice(body).map_err(|e| WebhookError::BadRequest(e.to_string()))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn root() -> &'static str {
    "ok"
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn jobs_created(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult {
    let payload: JobsCreated = signed_payload(&state, "jobs.created", &headers, &body)?;
    for job in payload.jobs {
        tracing::debug!(job_id = job.id, process = %job.release_name, "job created");
        state
            .dispatch(Command::JobCreated {
                job_id: job.id,
                process: job.release_name,
            })
            .await?;
    }
    Ok(StatusCode::OK)
}

async fn job_finished(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult {
    let payload: JobFinished = signed_payload(&state, "job.finished", &headers, &body)?;
    let job = payload.job;
    tracing::debug!(
        job_id = job.id,
        process = %job.release_name,
        state = job.state.as_deref().unwrap_or("unknown"),
        "job finished"
    );
    state
        .dispatch(Command::JobFinished {
            job_id: job.id,
            process: job.release_name,
        })
        .await?;
    Ok(StatusCode::OK)
}

async fn queue_items_created(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult {
    let payload: QueueItemsCreated =
        signed_payload(&state, "queue.items.created", &headers, &body)?;

    let mut by_queue: BTreeMap<QueueId, Vec<i64>> = BTreeMap::new();
    for item in payload.queue_items {
        by_queue
            .entry(item.queue_definition_id)
            .or_default()
            .push(item.id);
    }
    for (queue_id, item_ids) in by_queue {
        tracing::debug!(queue_id, count = item_ids.len(), "queue items created");
        state
            .dispatch(Command::QueueItemsCreated { queue_id, item_ids })
            .await?;
    }
    Ok(StatusCode::OK)
}

async fn queue_item_completed(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult {
    let payload: QueueItemCompleted =
        signed_payload(&state, "queue.item.completed", &headers, &body)?;
    let item = payload.queue_item;
    tracing::debug!(
        item_id = item.id,
        queue_id = item.queue_definition_id,
        "queue item completed"
    );
    state
        .dispatch(Command::QueueItemCompleted { item_id: item.id })
        .await?;
    Ok(StatusCode::OK)
}

async fn start_job(State(state): State<WebhookState>, body: Bytes) -> WebhookResult {
    let request: StartRequest = parse(&body)?;
    if let Err(e) = verify_secret(&state.secret_key, &request.secret) {
        tracing::warn!(process = %request.process_name, "start request with bad secret");
        return Err(e);
    }
    state
        .dispatch(Command::StartJob {
            process: request.process_name,
            env: request.env_name,
            count: request.count,
            args: request.process_args,
        })
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn request_runs(State(state): State<WebhookState>, body: Bytes) -> WebhookResult {
    let request: RunRequest = parse(&body)?;
    if let Err(e) = verify_secret(&state.secret_key, &request.secret) {
        tracing::warn!(process = %request.process_name, "run request with bad secret");
        return Err(e);
    }
    if request.count == 0 {
        return Err(WebhookError::BadRequest("count must be positive".into()));
    }
    state
        .dispatch(Command::RequestRuns {
            process: request.process_name,
            count: request.count,
        })
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn not_found(method: Method, uri: Uri) -> StatusCode {
    tracing::warn!(%method, %uri, "no route");
    StatusCode::NOT_FOUND
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/webhooks/jobs/created", post(jobs_created))
        .route("/webhooks/jobs/finished", post(job_finished))
        .route("/webhooks/queues/items/created", post(queue_items_created))
        .route("/webhooks/queues/items/completed", post(queue_item_completed))
        .route("/webhooks/jobs/start", post(start_job))
        .route("/webhooks/jobs/request", post(request_runs))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
