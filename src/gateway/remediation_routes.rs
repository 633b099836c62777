//! Remediation planning and dead-man-switch routes.

use crate::error::MeshError;
use crate::gateway::{limit_from, LimitQuery};
use crate::gateway::AppState;
use crate::remediation::deadman::DeadManConfig;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/remediation/plan/:asset_ip", get(asset_plan))
        .route("/api/remediation/plan", get(network_plan))
        .route("/api/remediation/execute/:action_id", post(execute_action))
        .route("/api/remediation/history", get(history))
        .route("/api/deadman/status", get(deadman_status))
        .route("/api/deadman/status/:agent_id", get(deadman_agent_status))
        .route("/api/deadman/check", post(deadman_check))
        .route("/api/deadman/config", get(get_config).put(put_config))
}

async fn asset_plan(
    State(state): State<Arc<AppState>>,
    Path(asset_ip): Path<String>,
) -> Result<Json<Value>, MeshError> {
    let plan = state.remediation.generate_plan(&asset_ip)?;
    Ok(Json(serde_json::to_value(plan)?))
}

async fn network_plan(State(state): State<Arc<AppState>>) -> Result<Json<Value>, MeshError> {
    let plan = state.remediation.generate_network_plan()?;
    Ok(Json(serde_json::to_value(plan)?))
}

async fn execute_action(
    State(state): State<Arc<AppState>>,
    Path(action_id): Path<String>,
) -> Result<Json<Value>, MeshError> {
    state.remediation.execute_action(&action_id).map(Json)
}

async fn history(
    State(state): State<Arc<AppState>>,
    query: Query<LimitQuery>,
) -> Result<Json<Value>, MeshError> {
    let records = state.store.list_remediation_history(limit_from(&query, 50))?;
    Ok(Json(json!({ "count": records.len(), "history": records })))
}

async fn deadman_status(State(state): State<Arc<AppState>>) -> Result<Json<Value>, MeshError> {
    let statuses = state.deadman.check_agents(&state.store)?;
    Ok(Json(json!({
        "count": statuses.len(),
        "agents": statuses,
        "config": state.deadman.config(),
    })))
}

async fn deadman_agent_status(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, MeshError> {
    let status = state
        .deadman
        .agent_status(&state.store, &agent_id)?
        .ok_or_else(|| MeshError::NotFound(format!("agent {agent_id}")))?;
    Ok(Json(serde_json::to_value(status)?))
}

async fn deadman_check(State(state): State<Arc<AppState>>) -> Result<Json<Value>, MeshError> {
    let statuses = state.deadman.check_agents(&state.store)?;
    let silent = statuses.iter().filter(|s| !s.is_alive).count();
    Ok(Json(json!({
        "checked": statuses.len(),
        "silent": silent,
        "agents": statuses,
    })))
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::to_value(state.deadman.config()).unwrap_or(Value::Null))
}

async fn put_config(
    State(state): State<Arc<AppState>>,
    Json(config): Json<DeadManConfig>,
) -> Result<Json<Value>, MeshError> {
    if config.timeout_minutes == 0 {
        return Err(MeshError::Validation(
            "timeout_minutes must be at least 1".to_string(),
        ));
    }
    state.deadman.update_config(config.clone());
    Ok(Json(serde_json::to_value(config)?))
}
