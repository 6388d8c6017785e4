//! OpenAPI document and Swagger UI

use axum::Router;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Mainstay API",
        version = "1.0.0",
        description = "Durable workflow orchestration control plane"
    ),
    paths(
        api::workflows::save_workflow,
        api::workflows::list_workflows,
        api::workflows::get_workflow,
        api::workflows::run_workflow,
        api::workflows::status,
        api::workflows::cancel,
        api::workers::register,
        api::workers::connect,
        api::workers::claim,
        api::workers::checkpoint,
        api::workers::resolve_secrets,
        api::schedules::create_schedule,
        api::schedules::list_schedules,
        api::schedules::get_schedule,
        api::schedules::update_schedule,
        api::schedules::delete_schedule,
        api::schedules::pause_schedule,
        api::schedules::resume_schedule,
    ),
    components(schemas(
        api::workflows::SaveWorkflowRequest,
        api::workflows::WorkflowResponse,
        api::workflows::RunRequest,
    )),
    tags(
        (name = "workflows", description = "Workflow catalog and executions"),
        (name = "workers", description = "Worker registration and dispatch"),
        (name = "schedules", description = "Standing schedules")
    )
)]
pub struct ApiDoc;

pub fn routes() -> Router {
    Router::new().merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}
