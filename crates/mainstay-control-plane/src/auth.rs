//! Bearer-token authentication
//!
//! Two tiers: the shared bootstrap token authorizes worker registration;
//! the per-registration session token authorizes every other worker call.

use axum::http::{header, HeaderMap, StatusCode};
use mainstay_core::worker::WorkerInfo;

use crate::error::ApiError;
use crate::state::AppState;

/// Pull the bearer token out of the Authorization header.
pub fn extract_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Authorization header missing"))?;
    value
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "invalid authorization format"))
}

/// Validate the shared bootstrap token used at registration.
pub fn require_bootstrap(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = extract_token(headers)?;
    if token != state.config.workers.bootstrap_token {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "invalid bootstrap token"));
    }
    Ok(())
}

/// Look up the worker and validate its session token.
pub async fn require_session(
    state: &AppState,
    name: &str,
    headers: &HeaderMap,
) -> Result<WorkerInfo, ApiError> {
    let token = extract_token(headers)?;
    state
        .workers
        .authenticate(name, token)
        .await
        .map_err(|_| ApiError::new(StatusCode::FORBIDDEN, "invalid session token"))
}
