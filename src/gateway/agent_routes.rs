//! Agent control-plane routes: registration, auth, heartbeat, command
//! queue, and the ingest endpoints.

use crate::control::auth::{generate_token, hash_token, registration_allowed, verify_agent_token};
use crate::error::MeshError;
use crate::gateway::AppState;
use crate::metrics::{INGEST_REQUESTS_TOTAL, RATE_LIMITED_TOTAL};
use crate::store::entities::{
    AgentCommandRecord, AgentRecord, AssetRecord, StoredShieldFinding, StoredShieldScan,
};
use crate::store::{now_iso, ScanIngest};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Heartbeats older than this render the agent as stale in listings.
const STALE_AFTER_SECS: i64 = 300;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/agents/register", post(register_agent))
        .route("/api/agents/rotate-token", post(rotate_token))
        .route("/api/agents/heartbeat", post(heartbeat))
        .route("/api/agents/version", get(agent_version))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/commands", get(poll_commands))
        .route("/api/agents/commands/:command_id", patch(update_command))
        .route("/api/agents/:agent_id/commands", post(create_command))
        .route("/api/ingest/discovery", post(ingest_discovery))
        .route("/api/ingest/shield", post(ingest_shield))
        .route("/api/assets", post(add_asset))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    name: String,
    #[serde(default)]
    site_name: String,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    subnets: Vec<String>,
    #[serde(default)]
    secret: Option<String>,
}

/// Register a new agent and return a one-time plaintext token.
async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<Value>, MeshError> {
    if !registration_allowed(state.registration_secret.as_deref(), body.secret.as_deref()) {
        return Err(MeshError::Forbidden("Invalid registration secret.".to_string()));
    }
    if body.name.trim().is_empty() {
        return Err(MeshError::Validation("agent name must not be empty".to_string()));
    }

    let agent_id = Uuid::new_v4().to_string();
    let token = generate_token();

    state.store.insert_agent(&AgentRecord {
        id: agent_id.clone(),
        name: body.name,
        site_name: body.site_name,
        location: body.location,
        registered_at: now_iso(),
        last_seen: None,
        is_active: true,
        status: "online".to_string(),
        version: None,
        subnets: body.subnets,
        token_digest: hash_token(&token),
    })?;

    Ok(Json(json!({
        "agent_id": agent_id,
        "token": token,
        "message": "Agent registered. Store the token securely; it cannot be retrieved again.",
    })))
}

/// Rotate the caller's bearer token. The old token dies with the swap.
async fn rotate_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, MeshError> {
    let agent = verify_agent_token(&state.store, &headers)?;
    let token = generate_token();
    state.store.rotate_agent_digest(&agent.id, &hash_token(&token))?;
    Ok(Json(json!({
        "agent_id": agent.id,
        "token": token,
        "message": "Token rotated. The previous token is no longer valid.",
    })))
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    #[serde(default = "default_status")]
    status: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    subnets: Option<Vec<String>>,
}

fn default_status() -> String {
    "online".to_string()
}

/// Liveness ping; answers with the pending-command count.
async fn heartbeat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<HeartbeatRequest>,
) -> Result<Json<Value>, MeshError> {
    let agent = verify_agent_token(&state.store, &headers)?;
    let now = now_iso();

    let last_seen = now.clone();
    state.store.update_agent(&agent.id, move |a| {
        a.last_seen = Some(last_seen);
        a.status = body.status;
        if let Some(version) = body.version {
            a.version = Some(version);
        }
        if let Some(subnets) = body.subnets {
            a.subnets = subnets;
        }
    })?;

    let pending = state.store.pending_command_count(&agent.id)?;
    Ok(Json(json!({
        "status": "ok",
        "agent_id": agent.id,
        "last_seen": now,
        "pending_commands": pending,
    })))
}

async fn agent_version(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "latest_version": state.agent_version }))
}

/// List all registered agents with effective status.
async fn list_agents(State(state): State<Arc<AppState>>) -> Result<Json<Value>, MeshError> {
    let now = Utc::now();
    let agents: Vec<Value> = state
        .store
        .list_agents()?
        .into_iter()
        .map(|agent| {
            let mut effective_status = agent.status.clone();
            if let Some(last_seen) = agent
                .last_seen
                .as_deref()
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            {
                if (now - last_seen.with_timezone(&Utc)).num_seconds() > STALE_AFTER_SECS {
                    effective_status = "stale".to_string();
                }
            }
            json!({
                "id": agent.id,
                "name": agent.name,
                "site_name": agent.site_name,
                "location": agent.location,
                "is_active": agent.is_active,
                "registered_at": agent.registered_at,
                "last_seen": agent.last_seen,
                "status": effective_status,
                "version": agent.version,
                "subnets": agent.subnets,
            })
        })
        .collect();

    Ok(Json(json!({ "agents": agents })))
}

#[derive(Debug, Deserialize)]
struct CreateCommandRequest {
    #[serde(default = "default_command_type")]
    command_type: String,
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default = "default_shield")]
    shield: bool,
}

fn default_command_type() -> String {
    "scan_now".to_string()
}

fn default_shield() -> bool {
    true
}

/// Dashboard-side command enqueue. Empty targets fall back to the agent's
/// registered subnets; no targets at all is a client error.
async fn create_command(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<CreateCommandRequest>,
) -> Result<Json<Value>, MeshError> {
    let agent = state
        .store
        .get_agent(&agent_id)?
        .ok_or_else(|| MeshError::NotFound(format!("agent {agent_id}")))?;

    let targets = if body.targets.is_empty() {
        agent.subnets.clone()
    } else {
        body.targets
    };
    if targets.is_empty() {
        return Err(MeshError::Validation(
            "no targets given and the agent has no registered subnets".to_string(),
        ));
    }

    let command = AgentCommandRecord {
        id: Uuid::new_v4().to_string(),
        agent_id: agent.id.clone(),
        command_type: body.command_type,
        params: json!({ "targets": targets, "shield": body.shield }),
        status: "pending".to_string(),
        created_at: now_iso(),
        result: None,
    };
    state.store.insert_command(&command)?;

    Ok(Json(json!({
        "command_id": command.id,
        "agent_id": agent.id,
        "command_type": command.command_type,
        "targets": targets,
        "shield": body.shield,
        "status": "pending",
    })))
}

/// Agent-side poll: every open command, newest first.
async fn poll_commands(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, MeshError> {
    let agent = verify_agent_token(&state.store, &headers)?;
    let commands: Vec<Value> = state
        .store
        .commands_for_agent(&agent.id, &["pending", "ack", "running"])?
        .into_iter()
        .map(|c| {
            json!({
                "id": c.id,
                "command_type": c.command_type,
                "params": c.params,
                "status": c.status,
                "created_at": c.created_at,
            })
        })
        .collect();

    Ok(Json(json!({ "count": commands.len(), "commands": commands })))
}

#[derive(Debug, Deserialize)]
struct CommandStatusUpdate {
    status: String,
    #[serde(default)]
    result: Option<Value>,
}

/// Agent progress report; only the owning agent may update a command.
async fn update_command(
    State(state): State<Arc<AppState>>,
    Path(command_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CommandStatusUpdate>,
) -> Result<Json<Value>, MeshError> {
    let agent = verify_agent_token(&state.store, &headers)?;
    let mut command = state
        .store
        .get_command(&command_id)?
        .ok_or_else(|| MeshError::NotFound(format!("command {command_id}")))?;

    if command.agent_id != agent.id {
        return Err(MeshError::Forbidden(
            "command belongs to a different agent".to_string(),
        ));
    }
    if !matches!(body.status.as_str(), "ack" | "running" | "completed" | "failed") {
        return Err(MeshError::Validation(format!(
            "invalid command status '{}'",
            body.status
        )));
    }

    command.status = body.status;
    if body.result.is_some() {
        command.result = body.result;
    }
    state.store.update_command(&command)?;

    Ok(Json(json!({
        "status": "ok",
        "command_id": command.id,
        "command_status": command.status,
    })))
}

fn enforce_rate_limit(state: &AppState, agent: &AgentRecord) -> Result<(), MeshError> {
    if !state.limiter.check(&agent.token_digest) {
        RATE_LIMITED_TOTAL.inc();
        return Err(MeshError::RateLimited);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct IngestDiscoveryRequest {
    target: String,
    #[serde(default = "default_scan_method")]
    scan_method: String,
    started_at: String,
    #[serde(default)]
    completed_at: Option<String>,
    #[serde(default)]
    is_root: bool,
    #[serde(default)]
    assets: Vec<Value>,
    #[serde(default)]
    #[allow(dead_code)]
    network_fingerprint: Option<Value>,
}

fn default_scan_method() -> String {
    "hybrid".to_string()
}

/// Accept discovery scan results from a remote agent. Transactional: a
/// failed payload leaves no partial scan behind.
async fn ingest_discovery(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IngestDiscoveryRequest>,
) -> Result<Json<Value>, MeshError> {
    let agent = verify_agent_token(&state.store, &headers)?;
    enforce_rate_limit(&state, &agent)?;

    let asset_count = body.assets.len();
    let result = state.store.save_scan(&ScanIngest {
        target: body.target,
        scan_method: body.scan_method,
        started_at: body.started_at,
        completed_at: body.completed_at,
        is_root: body.is_root,
        assets: body.assets,
        agent_id: Some(agent.id.clone()),
        site_name: Some(agent.site_name.clone()),
    });

    let outcome = if result.is_ok() { "ok" } else { "error" };
    INGEST_REQUESTS_TOTAL
        .with_label_values(&["discovery", outcome])
        .inc();
    let scan_id = result?;

    let now = now_iso();
    state.store.update_agent(&agent.id, move |a| {
        a.last_seen = Some(now);
        a.status = "online".to_string();
    })?;

    Ok(Json(json!({
        "status": "ok",
        "scan_id": scan_id,
        "assets_ingested": asset_count,
    })))
}

#[derive(Debug, Deserialize)]
struct IngestShieldRequest {
    target: String,
    started_at: String,
    #[serde(default)]
    completed_at: Option<String>,
    #[serde(default)]
    modules_run: Vec<String>,
    #[serde(default)]
    findings: Vec<Value>,
}

/// Accept shield scan results from a remote agent.
async fn ingest_shield(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<IngestShieldRequest>,
) -> Result<Json<Value>, MeshError> {
    let agent = verify_agent_token(&state.store, &headers)?;
    enforce_rate_limit(&state, &agent)?;

    let scan_id = Uuid::new_v4().to_string();
    let now = now_iso();

    let findings: Vec<StoredShieldFinding> = body
        .findings
        .iter()
        .map(|raw| StoredShieldFinding {
            id: raw
                .get("id")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            scan_id: scan_id.clone(),
            module: raw
                .get("module")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            severity: raw
                .get("severity")
                .and_then(Value::as_str)
                .unwrap_or("info")
                .to_string(),
            title: raw
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            detail: raw
                .get("description")
                .or_else(|| raw.get("detail"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            target_ip: raw
                .get("target_ip")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            target_port: raw
                .get("target_port")
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok()),
            remediation: raw
                .get("remediation")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            raw: raw.clone(),
        })
        .collect();

    let scan = StoredShieldScan {
        id: scan_id.clone(),
        agent_id: Some(agent.id.clone()),
        site_name: Some(agent.site_name.clone()),
        target: body.target,
        started_at: body.started_at,
        completed_at: Some(body.completed_at.unwrap_or_else(|| now.clone())),
        modules_run: body.modules_run.clone(),
        status: "completed".to_string(),
    };
    let result = state.store.save_shield_scan(&scan, &findings);
    let outcome = if result.is_ok() { "ok" } else { "error" };
    INGEST_REQUESTS_TOTAL
        .with_label_values(&["shield", outcome])
        .inc();
    result?;

    state.store.update_agent(&agent.id, move |a| {
        a.last_seen = Some(now);
        a.status = "online".to_string();
    })?;

    Ok(Json(json!({
        "status": "ok",
        "scan_id": scan_id,
        "agent_id": agent.id,
        "modules_received": body.modules_run,
        "findings_count": findings.len(),
    })))
}

#[derive(Debug, Deserialize)]
struct AddAssetRequest {
    ip: String,
    #[serde(default)]
    mac: Option<String>,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default)]
    site_name: Option<String>,
}

fn default_category() -> String {
    "unclassified".to_string()
}

/// Manually add a device. Duplicate (ip, mac) pairs are an integrity
/// violation, not an upsert.
async fn add_asset(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddAssetRequest>,
) -> Result<(StatusCode, Json<Value>), MeshError> {
    if body.ip.trim().is_empty() {
        return Err(MeshError::Validation("ip must not be empty".to_string()));
    }
    let now = now_iso();
    let asset = AssetRecord {
        id: Uuid::new_v4().to_string(),
        ip: body.ip,
        mac: body.mac,
        hostname: body.hostname,
        vendor: body.vendor,
        os_hint: None,
        category: body.category,
        confidence_score: 1.0,
        scan_method: "manual".to_string(),
        first_seen: now.clone(),
        last_seen: now,
        agent_id: None,
        site_name: body.site_name,
        is_ignored: false,
        manual_category: None,
        manual_note: None,
        switch_host: None,
        switch_port: None,
        switch_port_index: None,
    };
    state.store.insert_asset(&asset)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "ok", "asset_id": asset.id })),
    ))
}
