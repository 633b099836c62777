//! API Gateway
//! ===========
//! REST control plane for agents, shield scans, firewall rules, collective
//! intelligence, and remediation.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

pub mod agent_routes;
pub mod collective_routes;
pub mod firewall_routes;
pub mod inventory_routes;
pub mod remediation_routes;
pub mod shield_routes;

use crate::collective::engine::CollectiveEngine;
use crate::control::ratelimit::IngestRateLimiter;
use crate::error::MeshError;
use crate::firewall::service::FirewallService;
use crate::metrics::encode_metrics;
use crate::remediation::deadman::DeadManSwitch;
use crate::remediation::engine::RemediationEngine;
use crate::shield::orchestrator::ShieldOrchestrator;
use crate::store::EntityStore;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Shared state handed to every handler.
pub struct AppState {
    pub store: Arc<EntityStore>,
    pub orchestrator: Arc<ShieldOrchestrator>,
    pub limiter: Arc<IngestRateLimiter>,
    pub firewall: Arc<FirewallService>,
    pub collective: Arc<CollectiveEngine>,
    pub remediation: Arc<RemediationEngine>,
    pub deadman: Arc<DeadManSwitch>,
    /// When set, registration requires this secret verbatim.
    pub registration_secret: Option<String>,
    /// Version advertised to agents for self-update checks.
    pub agent_version: String,
}

impl AppState {
    /// Wire the full service graph over one store, reading the optional
    /// environment knobs.
    pub fn new(store: Arc<EntityStore>) -> Result<Arc<Self>, MeshError> {
        let registration_secret = std::env::var("AGENT_REGISTRATION_SECRET")
            .ok()
            .filter(|s| !s.is_empty());
        if registration_secret.is_some() {
            info!("agent registration secret is enforced");
        }

        Ok(Arc::new(AppState {
            orchestrator: Arc::new(ShieldOrchestrator::new()),
            limiter: Arc::new(IngestRateLimiter::default()),
            firewall: Arc::new(FirewallService::new(Arc::clone(&store))?),
            collective: Arc::new(CollectiveEngine::from_env(Arc::clone(&store))?),
            remediation: Arc::new(RemediationEngine::new(Arc::clone(&store))),
            deadman: Arc::new(DeadManSwitch::default()),
            registration_secret,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            store,
        }))
    }
}

/// Assemble the full API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .merge(agent_routes::router())
        .merge(shield_routes::router())
        .merge(firewall_routes::router())
        .merge(collective_routes::router())
        .merge(remediation_routes::router())
        .merge(inventory_routes::router())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: Arc<AppState>, addr: &str) -> Result<(), MeshError> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API gateway listening on {addr}");
    axum::serve(listener, app)
        .await
        .map_err(|e| MeshError::External(e.to_string()))
}

/// Shared `?limit=` query for listing endpoints.
#[derive(Debug, serde::Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub(crate) fn limit_from(query: &axum::extract::Query<LimitQuery>, default: usize) -> usize {
    query.limit.unwrap_or(default).clamp(1, 500)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn prometheus_metrics() -> String {
    encode_metrics()
}
