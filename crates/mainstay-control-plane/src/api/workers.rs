//! Worker endpoints: registration, SSE dispatch, claim, checkpoint, secrets

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use mainstay_core::worker::WorkerRegistration;
use mainstay_core::ExecutionContext;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::{require_bootstrap, require_session};
use crate::dispatcher;
use crate::error::ApiError;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workers/register", post(register))
        .route("/workers/:name/connect", get(connect))
        .route("/workers/:name/claim/:execution_id", post(claim))
        .route("/workers/:name/checkpoint/:execution_id", post(checkpoint))
        .route("/workers/:name/secrets", post(resolve_secrets))
        .with_state(state)
}

/// POST /workers/register - Register a worker with the bootstrap token
///
/// Issues a fresh session token on every registration; the previous token
/// stops working immediately.
#[utoipa::path(
    post,
    path = "/workers/register",
    responses(
        (status = 200, description = "Worker registered, session token issued"),
        (status = 401, description = "Missing or malformed authorization"),
        (status = 403, description = "Invalid bootstrap token")
    ),
    tag = "workers"
)]
pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(registration): Json<WorkerRegistration>,
) -> Result<impl IntoResponse, ApiError> {
    require_bootstrap(&state, &headers)?;

    let worker = state.workers.register(registration).await?;
    tracing::info!(worker = %worker.name, "worker registered");
    Ok(Json(json!({
        "name": worker.name,
        "session_token": worker.session_token,
    })))
}

/// GET /workers/{name}/connect - Long-lived SSE dispatch channel
///
/// Emits `execution_scheduled`, `execution_cancelled`, `keep-alive` and
/// `error` events; see [`dispatcher`] for the polling cadence.
#[utoipa::path(
    get,
    path = "/workers/{name}/connect",
    params(("name" = String, Path, description = "Worker name")),
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream"),
        (status = 403, description = "Invalid session token")
    ),
    tag = "workers"
)]
pub async fn connect(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let worker = require_session(&state, &name, &headers).await?;
    tracing::info!(worker = %worker.name, "worker connected");
    Ok(dispatcher::worker_stream(state, worker))
}

/// POST /workers/{name}/claim/{execution_id} - Take exclusive ownership
#[utoipa::path(
    post,
    path = "/workers/{name}/claim/{execution_id}",
    params(
        ("name" = String, Path, description = "Worker name"),
        ("execution_id" = Uuid, Path, description = "Execution ID")
    ),
    responses(
        (status = 200, description = "Execution claimed"),
        (status = 404, description = "Execution not claimable by this worker")
    ),
    tag = "workers"
)]
pub async fn claim(
    State(state): State<AppState>,
    Path((name, execution_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let worker = require_session(&state, &name, &headers).await?;
    let ctx = state.contexts.claim(execution_id, &worker).await?;
    tracing::info!(worker = %name, execution_id = %execution_id, "execution claimed");
    Ok(Json(serde_json::to_value(ctx.summary()).unwrap_or_default()))
}

/// POST /workers/{name}/checkpoint/{execution_id} - Persist a context snapshot
#[utoipa::path(
    post,
    path = "/workers/{name}/checkpoint/{execution_id}",
    params(
        ("name" = String, Path, description = "Worker name"),
        ("execution_id" = Uuid, Path, description = "Execution ID")
    ),
    responses(
        (status = 200, description = "Checkpoint persisted"),
        (status = 404, description = "Execution not found")
    ),
    tag = "workers"
)]
pub async fn checkpoint(
    State(state): State<AppState>,
    Path((name, execution_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
    Json(ctx): Json<ExecutionContext>,
) -> Result<impl IntoResponse, ApiError> {
    require_session(&state, &name, &headers).await?;

    if ctx.execution_id != execution_id {
        return Err(ApiError::bad_request(
            "context execution_id does not match the path",
        ));
    }
    // Upsert: sub-workflow contexts checkpoint through the same endpoint
    // and create their rows on first save.
    let saved = state.contexts.save(&ctx).await?;
    tracing::debug!(
        worker = %name,
        execution_id = %execution_id,
        events = saved.events.len(),
        "checkpoint persisted"
    );
    Ok(Json(serde_json::to_value(saved.summary()).unwrap_or_default()))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ResolveSecretsRequest {
    pub names: Vec<String>,
}

/// POST /workers/{name}/secrets - Resolve secrets for a running task
///
/// Values are decrypted server-side and returned only to an authenticated
/// worker session; they are never written into event logs.
#[utoipa::path(
    post,
    path = "/workers/{name}/secrets",
    params(("name" = String, Path, description = "Worker name")),
    responses(
        (status = 200, description = "Resolved secret values"),
        (status = 404, description = "A requested secret does not exist")
    ),
    tag = "workers"
)]
pub async fn resolve_secrets(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ResolveSecretsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_session(&state, &name, &headers).await?;
    let secrets = state.secrets.get(&request.names).await?;
    Ok(Json(json!({ "secrets": secrets })))
}
