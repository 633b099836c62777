//! Firewall rule CRUD, status, events, and the sync endpoints.

use crate::error::MeshError;
use crate::gateway::{limit_from, LimitQuery};
use crate::gateway::AppState;
use crate::store::entities::FirewallRuleRecord;
use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/firewall/rules", get(get_rules).post(add_rule))
        .route("/api/firewall/rules/:rule_id", delete(remove_rule))
        .route("/api/firewall/rules/:rule_id/toggle", post(toggle_rule))
        .route("/api/firewall/status", get(status))
        .route("/api/firewall/events", get(events))
        .route("/api/firewall/sync/ports", post(sync_ports))
        .route("/api/firewall/sync/threats", post(sync_threats))
}

#[derive(Debug, Deserialize)]
struct RulesQuery {
    #[serde(default = "default_active_only")]
    active_only: bool,
    #[serde(default)]
    rule_type: Option<String>,
}

fn default_active_only() -> bool {
    true
}

async fn get_rules(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RulesQuery>,
) -> Result<Json<Value>, MeshError> {
    let rules = state
        .firewall
        .get_rules(query.active_only, query.rule_type.as_deref())?;
    Ok(Json(json!({ "count": rules.len(), "rules": rules })))
}

#[derive(Debug, Deserialize)]
struct AddRuleRequest {
    rule_type: String,
    target: String,
    #[serde(default = "default_direction")]
    direction: String,
    #[serde(default = "default_protocol")]
    protocol: String,
    #[serde(default = "default_source")]
    source: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    expires_at: Option<String>,
}

fn default_direction() -> String {
    "both".to_string()
}

fn default_protocol() -> String {
    "any".to_string()
}

fn default_source() -> String {
    "user".to_string()
}

async fn add_rule(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddRuleRequest>,
) -> Result<Json<Value>, MeshError> {
    let rule = state.firewall.add_rule(FirewallRuleRecord {
        id: String::new(),
        rule_type: body.rule_type,
        target: body.target,
        direction: body.direction,
        protocol: body.protocol,
        source: body.source,
        reason: body.reason,
        is_active: true,
        created_at: String::new(),
        expires_at: body.expires_at,
        hit_count: 0,
    })?;
    Ok(Json(json!({ "status": "ok", "rule": rule })))
}

async fn remove_rule(
    State(state): State<Arc<AppState>>,
    Path(rule_id): Path<String>,
) -> Result<Json<Value>, MeshError> {
    state.firewall.remove_rule(&rule_id)?;
    Ok(Json(json!({ "status": "ok", "rule_id": rule_id })))
}

async fn toggle_rule(
    State(state): State<Arc<AppState>>,
    Path(rule_id): Path<String>,
) -> Result<Json<Value>, MeshError> {
    let rule = state.firewall.toggle_rule(&rule_id)?;
    Ok(Json(json!({ "status": "ok", "rule": rule })))
}

async fn status(State(state): State<Arc<AppState>>) -> Result<Json<Value>, MeshError> {
    Ok(Json(state.firewall.status().await?))
}

async fn events(
    State(state): State<Arc<AppState>>,
    query: Query<LimitQuery>,
) -> Result<Json<Value>, MeshError> {
    let events = state.firewall.get_events(limit_from(&query, 50))?;
    Ok(Json(json!({ "count": events.len(), "events": events })))
}

async fn sync_ports(State(state): State<Arc<AppState>>) -> Result<Json<Value>, MeshError> {
    state.firewall.sync_port_rules().map(Json)
}

async fn sync_threats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, MeshError> {
    state.firewall.sync_threat_rules().map(Json)
}
