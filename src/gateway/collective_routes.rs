//! Collective intelligence routes: signal submission and k-anonymous
//! aggregate reads. Raw signal rows are never exposed.

use crate::collective::engine::{SubmitOutcome, ThreatSignal};
use crate::error::MeshError;
use crate::gateway::{limit_from, LimitQuery};
use crate::gateway::AppState;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/collective/signal", post(submit_signal))
        .route("/api/collective/threats", get(get_threats))
        .route("/api/collective/stats", get(get_stats))
        .route("/api/collective/feed", get(get_feed))
}

#[derive(Debug, Deserialize)]
struct SubmitSignalRequest {
    /// Raw /24 CIDR; hashed server-side when given.
    #[serde(default)]
    subnet: Option<String>,
    /// Pre-hashed alternative to `subnet`.
    #[serde(default)]
    subnet_hash: Option<String>,
    signal_type: String,
    severity: f64,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    agent_hash: Option<String>,
}

async fn submit_signal(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitSignalRequest>,
) -> Result<Json<Value>, MeshError> {
    let subnet_hash = match (body.subnet_hash, body.subnet) {
        (Some(hash), _) => hash,
        (None, Some(subnet)) => state.collective.hash_value(&subnet),
        (None, None) => {
            return Err(MeshError::Validation(
                "either subnet or subnet_hash is required".to_string(),
            ))
        }
    };
    let agent_hash = match (body.agent_hash, body.agent_id) {
        (Some(hash), _) => hash,
        (None, Some(agent_id)) => state.collective.hash_value(&agent_id),
        (None, None) => {
            return Err(MeshError::Validation(
                "either agent_id or agent_hash is required".to_string(),
            ))
        }
    };

    let outcome = state.collective.submit_signal(&ThreatSignal {
        subnet_hash,
        signal_type: body.signal_type,
        severity: body.severity,
        port: body.port,
        agent_hash,
        timestamp: None,
    })?;

    Ok(Json(match outcome {
        SubmitOutcome::Suppressed => json!({
            "status": "suppressed",
            "reason": "privacy_randomization",
        }),
        SubmitOutcome::Accepted { noised_severity } => json!({
            "status": "accepted",
            "noised_severity": noised_severity,
        }),
    }))
}

#[derive(Debug, Deserialize)]
struct ThreatsQuery {
    #[serde(default = "default_min_confidence")]
    min_confidence: f64,
}

fn default_min_confidence() -> f64 {
    0.5
}

async fn get_threats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ThreatsQuery>,
) -> Result<Json<Value>, MeshError> {
    let threats = state.collective.get_community_threats(query.min_confidence)?;
    Ok(Json(json!({ "count": threats.len(), "threats": threats })))
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, MeshError> {
    let stats = state.collective.get_stats()?;
    Ok(Json(serde_json::to_value(stats)?))
}

async fn get_feed(
    State(state): State<Arc<AppState>>,
    query: Query<LimitQuery>,
) -> Result<Json<Value>, MeshError> {
    let feed = state.collective.get_feed(limit_from(&query, 20))?;
    Ok(Json(json!({ "count": feed.len(), "feed": feed })))
}
