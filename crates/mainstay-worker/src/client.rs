//! Control-plane HTTP client

use std::collections::HashMap;

use eventsource_stream::{Event as SseEvent, Eventsource};
use futures::{Stream, StreamExt};
use mainstay_core::worker::WorkerRegistration;
use mainstay_core::{ExecutionContext, ExecutionError, ExecutionSummary};
use parking_lot::RwLock;
use serde_json::json;
use uuid::Uuid;

fn http_err(message: impl std::fmt::Display) -> ExecutionError {
    ExecutionError::Database {
        kind: "http".to_string(),
        message: message.to_string(),
    }
}

/// Client for the worker-facing control-plane surface. Holds the session
/// token issued at registration and attaches it to every subsequent call.
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
    worker_name: String,
    bootstrap_token: String,
    session_token: RwLock<Option<String>>,
}

impl ControlPlaneClient {
    pub fn new(
        server_url: impl Into<String>,
        worker_name: impl Into<String>,
        bootstrap_token: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: server_url.into().trim_end_matches('/').to_string(),
            worker_name: worker_name.into(),
            bootstrap_token: bootstrap_token.into(),
            session_token: RwLock::new(None),
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    fn session_token(&self) -> Result<String, ExecutionError> {
        self.session_token
            .read()
            .clone()
            .ok_or_else(|| http_err("worker is not registered"))
    }

    /// Register with the bootstrap token; stores the issued session token.
    pub async fn register(
        &self,
        registration: &WorkerRegistration,
    ) -> Result<(), ExecutionError> {
        let response = self
            .http
            .post(format!("{}/workers/register", self.base_url))
            .bearer_auth(&self.bootstrap_token)
            .json(registration)
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?;

        let body: serde_json::Value = response.json().await.map_err(http_err)?;
        let token = body["session_token"]
            .as_str()
            .ok_or_else(|| http_err("registration response missing session_token"))?;
        *self.session_token.write() = Some(token.to_string());
        Ok(())
    }

    /// Open the SSE dispatch subscription.
    pub async fn connect(
        &self,
    ) -> Result<impl Stream<Item = Result<SseEvent, ExecutionError>>, ExecutionError> {
        let token = self.session_token()?;
        let response = self
            .http
            .get(format!(
                "{}/workers/{}/connect",
                self.base_url, self.worker_name
            ))
            .bearer_auth(token)
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?;

        Ok(response
            .bytes_stream()
            .eventsource()
            .map(|item| item.map_err(http_err)))
    }

    pub async fn claim(&self, execution_id: Uuid) -> Result<ExecutionSummary, ExecutionError> {
        let token = self.session_token()?;
        let response = self
            .http
            .post(format!(
                "{}/workers/{}/claim/{}",
                self.base_url, self.worker_name, execution_id
            ))
            .bearer_auth(token)
            .send()
            .await
            .map_err(http_err)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ExecutionError::ContextNotFound {
                execution_id: execution_id.to_string(),
            });
        }
        let response = response.error_for_status().map_err(http_err)?;
        response.json().await.map_err(http_err)
    }

    /// Full context, event log included.
    pub async fn fetch_context(
        &self,
        workflow_name: &str,
        execution_id: Uuid,
    ) -> Result<ExecutionContext, ExecutionError> {
        let response = self
            .http
            .get(format!(
                "{}/workflows/{}/status/{}?detailed=true",
                self.base_url, workflow_name, execution_id
            ))
            .send()
            .await
            .map_err(http_err)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ExecutionError::ContextNotFound {
                execution_id: execution_id.to_string(),
            });
        }
        let response = response.error_for_status().map_err(http_err)?;
        response.json().await.map_err(http_err)
    }

    /// Post a context snapshot; the control plane merges events idempotently.
    pub async fn checkpoint(&self, ctx: &ExecutionContext) -> Result<(), ExecutionError> {
        let token = self.session_token()?;
        self.http
            .post(format!(
                "{}/workers/{}/checkpoint/{}",
                self.base_url, self.worker_name, ctx.execution_id
            ))
            .bearer_auth(token)
            .json(ctx)
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?;
        Ok(())
    }

    pub async fn resolve_secrets(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, String>, ExecutionError> {
        let token = self.session_token()?;
        let response = self
            .http
            .post(format!(
                "{}/workers/{}/secrets",
                self.base_url, self.worker_name
            ))
            .bearer_auth(token)
            .json(&json!({ "names": names }))
            .send()
            .await
            .map_err(http_err)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // The control plane reports which name was missing in the detail.
            let detail: serde_json::Value = response.json().await.unwrap_or_default();
            let name = detail["detail"]
                .as_str()
                .and_then(|d| d.split('\'').nth(1))
                .unwrap_or("unknown")
                .to_string();
            return Err(ExecutionError::SecretMissing { name });
        }
        let response = response.error_for_status().map_err(http_err)?;
        let body: serde_json::Value = response.json().await.map_err(http_err)?;
        serde_json::from_value(body["secrets"].clone()).map_err(ExecutionError::from)
    }
}
