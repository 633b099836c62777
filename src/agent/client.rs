//! HTTP client for the agent daemon's conversations with the server.

use crate::error::MeshError;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};
use std::time::Duration;

/// Default timeout for control-plane calls.
const API_TIMEOUT: Duration = Duration::from_secs(15);
/// Ingest pushes carry large payloads and get more headroom.
const PUSH_TIMEOUT: Duration = Duration::from_secs(60);

pub struct AgentApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl AgentApiClient {
    pub fn new(api_url: &str, token: &str) -> Result<Self, MeshError> {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| MeshError::Validation(format!("invalid token: {e}")))?;
        headers.insert(AUTHORIZATION, value);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|e| MeshError::External(e.to_string()))?;

        Ok(AgentApiClient {
            base_url: api_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// One-time registration; no token yet, so a bare client is used.
    pub async fn register(
        api_url: &str,
        name: &str,
        site_name: &str,
        subnets: &[String],
        secret: Option<&str>,
    ) -> Result<(String, String), MeshError> {
        let http = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|e| MeshError::External(e.to_string()))?;

        let mut body = json!({
            "name": name,
            "site_name": site_name,
            "subnets": subnets,
        });
        if let Some(secret) = secret {
            body["secret"] = json!(secret);
        }

        let resp = http
            .post(format!("{}/api/agents/register", api_url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| MeshError::External(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(MeshError::External(format!(
                "registration failed: HTTP {}",
                resp.status()
            )));
        }
        let data: Value = resp
            .json()
            .await
            .map_err(|e| MeshError::External(e.to_string()))?;

        let agent_id = data
            .get("agent_id")
            .and_then(Value::as_str)
            .ok_or_else(|| MeshError::External("register response missing agent_id".to_string()))?
            .to_string();
        let token = data
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| MeshError::External("register response missing token".to_string()))?
            .to_string();
        Ok((agent_id, token))
    }

    async fn post_json(
        &self,
        path: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Value, MeshError> {
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| MeshError::External(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(MeshError::External(format!("{path} failed: HTTP {status}")));
        }
        resp.json()
            .await
            .map_err(|e| MeshError::External(e.to_string()))
    }

    pub async fn push_discovery(&self, payload: &Value) -> Result<(), MeshError> {
        self.post_json("/api/ingest/discovery", payload, PUSH_TIMEOUT)
            .await
            .map(|_| ())
    }

    pub async fn push_shield(&self, payload: &Value) -> Result<(), MeshError> {
        self.post_json("/api/ingest/shield", payload, PUSH_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Heartbeat; returns the server's pending-command count.
    pub async fn heartbeat(&self, status: &str, version: &str) -> Result<u64, MeshError> {
        let data = self
            .post_json(
                "/api/agents/heartbeat",
                &json!({ "status": status, "version": version }),
                API_TIMEOUT,
            )
            .await?;
        Ok(data
            .get("pending_commands")
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    pub async fn fetch_commands(&self) -> Result<Vec<Value>, MeshError> {
        let resp = self
            .http
            .get(format!("{}/api/agents/commands", self.base_url))
            .send()
            .await
            .map_err(|e| MeshError::External(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(MeshError::External(format!(
                "command poll failed: HTTP {}",
                resp.status()
            )));
        }
        let data: Value = resp
            .json()
            .await
            .map_err(|e| MeshError::External(e.to_string()))?;
        Ok(data
            .get("commands")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn update_command(
        &self,
        command_id: &str,
        status: &str,
        result: Option<Value>,
    ) -> Result<(), MeshError> {
        let mut body = json!({ "status": status });
        if let Some(result) = result {
            body["result"] = result;
        }
        let resp = self
            .http
            .patch(format!("{}/api/agents/commands/{command_id}", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| MeshError::External(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(MeshError::External(format!(
                "command update failed: HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Server-advertised agent version for the self-update check.
    pub async fn fetch_version(&self) -> Result<String, MeshError> {
        let resp = self
            .http
            .get(format!("{}/api/agents/version", self.base_url))
            .send()
            .await
            .map_err(|e| MeshError::External(e.to_string()))?;
        let data: Value = resp
            .json()
            .await
            .map_err(|e| MeshError::External(e.to_string()))?;
        Ok(data
            .get("latest_version")
            .and_then(Value::as_str)
            .unwrap_or("0.0.0")
            .to_string())
    }
}
