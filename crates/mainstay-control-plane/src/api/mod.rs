//! HTTP route assembly

pub mod schedules;
pub mod workers;
pub mod workflows;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(workflows::routes(state.clone()))
        .merge(workers::routes(state.clone()))
        .merge(schedules::routes(state))
        .merge(crate::openapi::routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
