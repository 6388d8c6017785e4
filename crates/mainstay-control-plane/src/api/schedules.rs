//! Schedule CRUD and pause/resume

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use mainstay_core::schedule::{Schedule, ScheduleSpec, ScheduleStatus};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/schedules", post(create_schedule).get(list_schedules))
        .route(
            "/schedules/:id",
            get(get_schedule).put(update_schedule).delete(delete_schedule),
        )
        .route("/schedules/:id/pause", post(pause_schedule))
        .route("/schedules/:id/resume", post(resume_schedule))
        .with_state(state)
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreateScheduleRequest {
    pub workflow_name: String,
    #[serde(flatten)]
    pub spec: ScheduleSpec,
    #[serde(default)]
    pub input: Option<Value>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct UpdateScheduleRequest {
    #[serde(flatten)]
    pub spec: ScheduleSpec,
    #[serde(default)]
    pub input: Option<Value>,
}

/// POST /schedules - Create a schedule for an existing workflow
#[utoipa::path(
    post,
    path = "/schedules",
    responses(
        (status = 201, description = "Schedule created"),
        (status = 400, description = "Invalid schedule definition"),
        (status = 404, description = "Workflow not found")
    ),
    tag = "schedules"
)]
pub async fn create_schedule(
    State(state): State<AppState>,
    Json(request): Json<CreateScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // The workflow must exist before it can be scheduled.
    state.catalog.get(&request.workflow_name, None).await?;

    let schedule = Schedule::new(
        request.workflow_name,
        request.spec,
        request.input,
        Utc::now(),
    )?;
    let schedule = state.schedules.create(schedule).await?;
    tracing::info!(schedule_id = %schedule.id, workflow = %schedule.workflow_name, "schedule created");
    Ok((StatusCode::CREATED, Json(schedule)))
}

/// GET /schedules - List all schedules
#[utoipa::path(
    get,
    path = "/schedules",
    responses((status = 200, description = "Schedule listing")),
    tag = "schedules"
)]
pub async fn list_schedules(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let schedules = state.schedules.list().await?;
    Ok(Json(json!({ "schedules": schedules })))
}

/// GET /schedules/{id} - Fetch one schedule
#[utoipa::path(
    get,
    path = "/schedules/{id}",
    params(("id" = Uuid, Path, description = "Schedule ID")),
    responses(
        (status = 200, description = "Schedule"),
        (status = 404, description = "Schedule not found")
    ),
    tag = "schedules"
)]
pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.schedules.get(id).await?))
}

/// PUT /schedules/{id} - Replace the firing rule and input template
#[utoipa::path(
    put,
    path = "/schedules/{id}",
    params(("id" = Uuid, Path, description = "Schedule ID")),
    responses(
        (status = 200, description = "Schedule updated"),
        (status = 404, description = "Schedule not found")
    ),
    tag = "schedules"
)]
pub async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut schedule = state.schedules.get(id).await?;
    request.spec.validate()?;
    schedule.next_run_at = request.spec.next_run_after(Utc::now())?;
    schedule.spec = request.spec;
    schedule.input = request.input;
    let schedule = state.schedules.update(schedule).await?;
    Ok(Json(schedule))
}

/// DELETE /schedules/{id} - Remove a schedule
#[utoipa::path(
    delete,
    path = "/schedules/{id}",
    params(("id" = Uuid, Path, description = "Schedule ID")),
    responses(
        (status = 204, description = "Schedule deleted"),
        (status = 404, description = "Schedule not found")
    ),
    tag = "schedules"
)]
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.schedules.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /schedules/{id}/pause - Stop firing without deleting
#[utoipa::path(
    post,
    path = "/schedules/{id}/pause",
    params(("id" = Uuid, Path, description = "Schedule ID")),
    responses(
        (status = 200, description = "Schedule paused"),
        (status = 404, description = "Schedule not found")
    ),
    tag = "schedules"
)]
pub async fn pause_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let mut schedule = state.schedules.get(id).await?;
    schedule.status = ScheduleStatus::Paused;
    Ok(Json(state.schedules.update(schedule).await?))
}

/// POST /schedules/{id}/resume - Reactivate and recompute the next fire
#[utoipa::path(
    post,
    path = "/schedules/{id}/resume",
    params(("id" = Uuid, Path, description = "Schedule ID")),
    responses(
        (status = 200, description = "Schedule resumed"),
        (status = 404, description = "Schedule not found")
    ),
    tag = "schedules"
)]
pub async fn resume_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let mut schedule = state.schedules.get(id).await?;
    schedule.status = ScheduleStatus::Active;
    schedule.next_run_at = schedule.spec.next_run_after(Utc::now())?;
    Ok(Json(state.schedules.update(schedule).await?))
}
