//! Workflow endpoints: upload, listing, run, status, cancel

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::stream::{self, Stream};
use mainstay_core::resources::ResourceRequest;
use mainstay_core::{ExecutionContext, ExecutionError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workflows", post(save_workflow).get(list_workflows))
        .route("/workflows/:name", get(get_workflow))
        .route("/workflows/:name/run/:mode", post(run_workflow))
        .route("/workflows/:name/status/:execution_id", get(status))
        .route("/workflows/:name/cancel/:execution_id", post(cancel))
        .with_state(state)
}

// ============================================
// Requests / responses
// ============================================

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SaveWorkflowRequest {
    pub name: String,
    /// Base64-encoded source bundle.
    pub source: String,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub imports: Option<Value>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub requests: Option<ResourceRequest>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct WorkflowResponse {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
}

#[derive(Debug, Default, Deserialize, utoipa::ToSchema)]
pub struct RunRequest {
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub input: Option<Value>,
    /// Resume an existing execution instead of starting a new one.
    #[serde(default)]
    pub execution_id: Option<Uuid>,
    /// Payload delivered to the pending pause point on resume.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub resume_payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct DetailQuery {
    #[serde(default)]
    pub detailed: bool,
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    #[serde(default)]
    pub mode: Option<String>,
}

fn context_response(ctx: &ExecutionContext, detailed: bool) -> Value {
    if detailed {
        serde_json::to_value(ctx).unwrap_or_else(|_| json!({}))
    } else {
        serde_json::to_value(ctx.summary()).unwrap_or_else(|_| json!({}))
    }
}

// ============================================
// Handlers
// ============================================

/// POST /workflows - Save a source bundle as a new version
#[utoipa::path(
    post,
    path = "/workflows",
    request_body = SaveWorkflowRequest,
    responses(
        (status = 201, description = "Workflow saved", body = WorkflowResponse),
        (status = 400, description = "Invalid bundle")
    ),
    tag = "workflows"
)]
pub async fn save_workflow(
    State(state): State<AppState>,
    Json(request): Json<SaveWorkflowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("workflow name must not be empty"));
    }
    let source = BASE64
        .decode(&request.source)
        .map_err(|e| ApiError::bad_request(format!("source is not valid base64: {e}")))?;

    let record = state
        .catalog
        .save(&request.name, source, request.imports, request.requests)
        .await?;

    tracing::info!(workflow = %record.name, version = record.version, "workflow saved");
    Ok((
        StatusCode::CREATED,
        Json(WorkflowResponse {
            id: record.id,
            name: record.name,
            version: record.version,
        }),
    ))
}

/// GET /workflows - List workflows with their latest version
#[utoipa::path(
    get,
    path = "/workflows",
    responses((status = 200, description = "Workflow listing")),
    tag = "workflows"
)]
pub async fn list_workflows(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let workflows = state.catalog.list().await?;
    Ok(Json(json!({ "workflows": workflows })))
}

#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    #[serde(default)]
    pub version: Option<i32>,
}

/// GET /workflows/{name} - Fetch one workflow record
#[utoipa::path(
    get,
    path = "/workflows/{name}",
    params(
        ("name" = String, Path, description = "Workflow name"),
        ("version" = Option<i32>, Query, description = "Specific version, latest when omitted")
    ),
    responses(
        (status = 200, description = "Workflow record"),
        (status = 404, description = "Workflow not found")
    ),
    tag = "workflows"
)]
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<VersionQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.catalog.get(&name, query.version).await?;
    Ok(Json(json!({
        "id": record.id,
        "name": record.name,
        "version": record.version,
        "imports": record.imports,
        "requests": record.requests,
        "source": BASE64.encode(&record.source),
    })))
}

/// POST /workflows/{name}/run/{mode} - Start or resume an execution
///
/// `mode` selects the reply shape: `async` returns as soon as the execution
/// is persisted, `sync` polls to a stopping point, `stream` emits SSE state
/// transitions.
#[utoipa::path(
    post,
    path = "/workflows/{name}/run/{mode}",
    params(
        ("name" = String, Path, description = "Workflow name"),
        ("mode" = String, Path, description = "sync | async | stream"),
        ("detailed" = Option<bool>, Query, description = "Return the full context")
    ),
    request_body = RunRequest,
    responses(
        (status = 200, description = "Execution context"),
        (status = 404, description = "Workflow not found")
    ),
    tag = "workflows"
)]
pub async fn run_workflow(
    State(state): State<AppState>,
    Path((name, mode)): Path<(String, String)>,
    Query(query): Query<DetailQuery>,
    Json(request): Json<RunRequest>,
) -> Result<axum::response::Response, ApiError> {
    let ctx = prepare_execution(&state, &name, request).await?;

    match mode.as_str() {
        "async" => Ok(Json(context_response(&ctx, query.detailed)).into_response()),
        "sync" => {
            let finished = poll_until_settled(&state, ctx.execution_id).await?;
            Ok(Json(context_response(&finished, query.detailed)).into_response())
        }
        "stream" => Ok(stream_execution(state, name, ctx.execution_id, query.detailed)
            .await
            .into_response()),
        other => Err(ApiError::bad_request(format!(
            "unknown run mode '{other}', expected sync, async or stream"
        ))),
    }
}

/// Create a fresh execution, or mark an existing paused one for resumption.
async fn prepare_execution(
    state: &AppState,
    name: &str,
    request: RunRequest,
) -> Result<ExecutionContext, ApiError> {
    match request.execution_id {
        Some(execution_id) => {
            let ctx = state.contexts.get(execution_id).await?;
            if ctx.has_finished() {
                // Idempotent re-entry on finished executions.
                return Ok(ctx);
            }
            Ok(state
                .contexts
                .request_resume(execution_id, request.resume_payload)
                .await?)
        }
        None => {
            let record = state.catalog.get(name, None).await?;
            let mut ctx = ExecutionContext::new(name.to_string(), request.input);
            if let Some(requests) = record.requests {
                ctx = ctx.with_requests(requests);
            }
            tracing::info!(workflow = %name, execution_id = %ctx.execution_id, "execution created");
            Ok(state.contexts.save(&ctx).await?)
        }
    }
}

/// Poll the store until the execution reaches a stopping point (terminal or
/// paused), with exponential backoff.
async fn poll_until_settled(
    state: &AppState,
    execution_id: Uuid,
) -> Result<ExecutionContext, ExecutionError> {
    let mut delay = Duration::from_millis(100);
    let max_delay = Duration::from_secs(2);

    loop {
        let ctx = state.contexts.get(execution_id).await?;
        if ctx.has_finished() || ctx.is_paused() {
            return Ok(ctx);
        }
        tokio::time::sleep(delay).await;
        delay = std::cmp::min(delay.mul_f64(1.5), max_delay);
    }
}

/// SSE stream of `"<workflow>.execution.<state>"` transitions until the
/// execution settles.
async fn stream_execution(
    state: AppState,
    workflow_name: String,
    execution_id: Uuid,
    detailed: bool,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    struct PollState {
        state: AppState,
        last_state: Option<String>,
        done: bool,
    }

    let initial = PollState {
        state,
        last_state: None,
        done: false,
    };

    let stream = stream::unfold(initial, move |mut poll| {
        let workflow_name = workflow_name.clone();
        async move {
            if poll.done {
                return None;
            }
            loop {
                match poll.state.contexts.get(execution_id).await {
                    Ok(ctx) => {
                        let state_label = ctx.state.to_string().to_lowercase();
                        let settled = ctx.has_finished() || ctx.is_paused();
                        if poll.last_state.as_deref() != Some(state_label.as_str()) {
                            poll.last_state = Some(state_label.clone());
                            poll.done = settled;
                            let event = SseEvent::default()
                                .event(format!("{workflow_name}.execution.{state_label}"))
                                .data(context_response(&ctx, detailed).to_string());
                            return Some((Ok(event), poll));
                        }
                        if settled {
                            return None;
                        }
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Err(err) => {
                        poll.done = true;
                        let event = SseEvent::default().event("error").data(err.to_string());
                        return Some((Ok(event), poll));
                    }
                }
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /workflows/{name}/status/{execution_id} - Current execution state
#[utoipa::path(
    get,
    path = "/workflows/{name}/status/{execution_id}",
    params(
        ("name" = String, Path, description = "Workflow name"),
        ("execution_id" = Uuid, Path, description = "Execution ID"),
        ("detailed" = Option<bool>, Query, description = "Return the full context")
    ),
    responses(
        (status = 200, description = "Execution context"),
        (status = 404, description = "Execution not found")
    ),
    tag = "workflows"
)]
pub async fn status(
    State(state): State<AppState>,
    Path((_name, execution_id)): Path<(String, Uuid)>,
    Query(query): Query<DetailQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = state.contexts.get(execution_id).await?;
    Ok(Json(context_response(&ctx, query.detailed)))
}

/// POST /workflows/{name}/cancel/{execution_id} - Request cancellation
///
/// `mode=async` (default) returns once the execution is CANCELLING;
/// `mode=sync` polls until it reaches a terminal state.
#[utoipa::path(
    post,
    path = "/workflows/{name}/cancel/{execution_id}",
    params(
        ("name" = String, Path, description = "Workflow name"),
        ("execution_id" = Uuid, Path, description = "Execution ID"),
        ("mode" = Option<String>, Query, description = "sync | async")
    ),
    responses(
        (status = 200, description = "Execution context"),
        (status = 404, description = "Execution not found"),
        (status = 409, description = "Execution already finished")
    ),
    tag = "workflows"
)]
pub async fn cancel(
    State(state): State<AppState>,
    Path((_name, execution_id)): Path<(String, Uuid)>,
    Query(query): Query<CancelQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let mut ctx = state.contexts.begin_cancel(execution_id).await?;
    tracing::info!(execution_id = %execution_id, "cancellation requested");

    // No worker holds the execution, so there is nobody to deliver the
    // signal to; the control plane finalizes it directly.
    if ctx.current_worker.is_none() {
        ctx.cancel("control-plane", "operation cancelled")?;
        ctx = state.contexts.save(&ctx).await?;
    }

    match query.mode.as_deref() {
        None | Some("async") => Ok(Json(context_response(&ctx, false))),
        Some("sync") => {
            let mut delay = Duration::from_millis(100);
            let max_delay = Duration::from_secs(2);
            loop {
                let ctx = state.contexts.get(execution_id).await?;
                if ctx.has_finished() {
                    return Ok(Json(context_response(&ctx, false)));
                }
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay.mul_f64(1.5), max_delay);
            }
        }
        Some(other) => Err(ApiError::bad_request(format!(
            "unknown cancel mode '{other}', expected sync or async"
        ))),
    }
}
