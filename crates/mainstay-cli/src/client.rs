//! HTTP client for the control-plane API

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use uuid::Uuid;

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn check(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let detail = body["detail"].as_str().unwrap_or("unknown error");
            bail!("{status}: {detail}");
        }
        Ok(body)
    }

    pub async fn save_workflow(
        &self,
        name: &str,
        source: &[u8],
        requests: Option<Value>,
    ) -> Result<Value> {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

        let response = self
            .http
            .post(format!("{}/workflows", self.base_url))
            .json(&json!({
                "name": name,
                "source": BASE64.encode(source),
                "requests": requests,
            }))
            .send()
            .await
            .context("control plane unreachable")?;
        Self::check(response).await
    }

    pub async fn list_workflows(&self) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}/workflows", self.base_url))
            .send()
            .await
            .context("control plane unreachable")?;
        Self::check(response).await
    }

    pub async fn show_workflow(&self, name: &str, version: Option<i32>) -> Result<Value> {
        let mut url = format!("{}/workflows/{name}", self.base_url);
        if let Some(version) = version {
            url.push_str(&format!("?version={version}"));
        }
        let response = self
            .http
            .get(url)
            .send()
            .await
            .context("control plane unreachable")?;
        Self::check(response).await
    }

    pub async fn run_workflow(
        &self,
        name: &str,
        mode: &str,
        input: Option<Value>,
        execution_id: Option<Uuid>,
        resume_payload: Option<Value>,
        detailed: bool,
    ) -> Result<Value> {
        let response = self
            .http
            .post(format!(
                "{}/workflows/{name}/run/{mode}?detailed={detailed}",
                self.base_url
            ))
            .json(&json!({
                "input": input,
                "execution_id": execution_id,
                "resume_payload": resume_payload,
            }))
            .send()
            .await
            .context("control plane unreachable")?;
        Self::check(response).await
    }

    pub async fn status(&self, name: &str, execution_id: Uuid, detailed: bool) -> Result<Value> {
        let response = self
            .http
            .get(format!(
                "{}/workflows/{name}/status/{execution_id}?detailed={detailed}",
                self.base_url
            ))
            .send()
            .await
            .context("control plane unreachable")?;
        Self::check(response).await
    }

    pub async fn cancel(&self, name: &str, execution_id: Uuid, mode: &str) -> Result<Value> {
        let response = self
            .http
            .post(format!(
                "{}/workflows/{name}/cancel/{execution_id}?mode={mode}",
                self.base_url
            ))
            .send()
            .await
            .context("control plane unreachable")?;
        Self::check(response).await
    }

    pub async fn list_schedules(&self) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}/schedules", self.base_url))
            .send()
            .await
            .context("control plane unreachable")?;
        Self::check(response).await
    }

    pub async fn schedule_action(&self, id: Uuid, action: &str) -> Result<Value> {
        let response = self
            .http
            .post(format!("{}/schedules/{id}/{action}", self.base_url))
            .send()
            .await
            .context("control plane unreachable")?;
        Self::check(response).await
    }

    pub async fn delete_schedule(&self, id: Uuid) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/schedules/{id}", self.base_url))
            .send()
            .await
            .context("control plane unreachable")?;
        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            bail!(
                "{status}: {}",
                body["detail"].as_str().unwrap_or("unknown error")
            );
        }
        Ok(())
    }
}
