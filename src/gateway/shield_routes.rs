//! Shield scan routes: start, inspect, list, and the synchronous quick
//! scan.

use crate::error::MeshError;
use crate::gateway::{limit_from, LimitQuery};
use crate::gateway::AppState;
use crate::shield::models::{ScanDepth, ScanStatus, Sensitivity, ShieldScan};
use crate::store::entities::{StoredShieldFinding, StoredShieldScan};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/shield/scan", post(start_scan))
        .route("/api/shield/scan/:scan_id", get(get_scan))
        .route("/api/shield/scan/:scan_id/findings", get(get_findings))
        .route("/api/shield", get(list_scans))
        .route("/api/shield/modules", get(list_modules))
        .route("/api/shield/quick", post(quick_scan))
}

#[derive(Debug, Deserialize)]
struct StartScanRequest {
    target: String,
    #[serde(default = "default_depth")]
    depth: ScanDepth,
    #[serde(default)]
    modules: Option<Vec<String>>,
    #[serde(default)]
    sensitivity: Sensitivity,
}

fn default_depth() -> ScanDepth {
    ScanDepth::Quick
}

/// Persist a finished orchestrator scan so remediation can join findings
/// by target IP later.
fn persist_completed(state: &AppState, scan: &ShieldScan) {
    let stored = StoredShieldScan {
        id: scan.id.clone(),
        agent_id: None,
        site_name: None,
        target: scan.target.clone(),
        started_at: scan
            .started_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| scan.created_at.to_rfc3339()),
        completed_at: scan.completed_at.map(|t| t.to_rfc3339()),
        modules_run: scan.modules_enabled.clone(),
        status: scan.status.as_str().to_string(),
    };
    let findings: Vec<StoredShieldFinding> = scan
        .findings
        .iter()
        .map(|f| StoredShieldFinding {
            id: f.id.clone(),
            scan_id: f.scan_id.clone(),
            module: f.module.clone(),
            severity: f.severity.as_str().to_string(),
            title: f.title.clone(),
            detail: f.description.clone(),
            target_ip: f.target_ip.clone(),
            target_port: f.target_port,
            remediation: f.remediation.clone(),
            raw: serde_json::to_value(f).unwrap_or(Value::Null),
        })
        .collect();
    if let Err(err) = state.store.save_shield_scan(&stored, &findings) {
        error!(scan_id = %scan.id, "failed to persist shield scan: {err}");
    }
}

/// Start a shield scan in the background; 202 with the queued scan.
async fn start_scan(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartScanRequest>,
) -> Result<(StatusCode, Json<Value>), MeshError> {
    let scan =
        state
            .orchestrator
            .create_scan(&body.target, body.depth, body.modules, body.sensitivity)?;

    let scan_id = scan.id.clone();
    let task_state = Arc::clone(&state);
    tokio::spawn(async move {
        match task_state.orchestrator.run_scan(&scan_id).await {
            Ok(completed) => persist_completed(&task_state, &completed),
            Err(err) => {
                error!(scan_id = %scan_id, "shield scan failed: {err}");
                task_state.orchestrator.mark_failed(&scan_id);
            }
        }
    });

    Ok((StatusCode::ACCEPTED, Json(scan.to_summary_json())))
}

async fn get_scan(
    State(state): State<Arc<AppState>>,
    Path(scan_id): Path<String>,
) -> Result<Json<Value>, MeshError> {
    let scan = state
        .orchestrator
        .get_scan(&scan_id)
        .ok_or_else(|| MeshError::NotFound(format!("scan {scan_id}")))?;
    Ok(Json(scan.to_json()))
}

async fn get_findings(
    State(state): State<Arc<AppState>>,
    Path(scan_id): Path<String>,
) -> Result<Json<Value>, MeshError> {
    let scan = state
        .orchestrator
        .get_scan(&scan_id)
        .ok_or_else(|| MeshError::NotFound(format!("scan {scan_id}")))?;
    Ok(Json(json!({
        "scan_id": scan.id,
        "count": scan.findings.len(),
        "findings": scan.findings,
    })))
}

async fn list_scans(
    State(state): State<Arc<AppState>>,
    query: Query<LimitQuery>,
) -> Json<Value> {
    let scans: Vec<Value> = state
        .orchestrator
        .list_scans(limit_from(&query, 20))
        .iter()
        .map(|s| s.to_summary_json())
        .collect();
    Json(json!({ "count": scans.len(), "scans": scans }))
}

async fn list_modules(State(state): State<Arc<AppState>>) -> Json<Value> {
    let modules: Vec<Value> = state
        .orchestrator
        .module_status()
        .into_iter()
        .map(|(name, weight, available)| {
            json!({ "name": name, "weight": weight, "available": available })
        })
        .collect();
    Json(json!({ "modules": modules }))
}

#[derive(Debug, Deserialize)]
struct QuickScanRequest {
    target: String,
}

/// Run a quick-depth scan inline and return the completed result.
async fn quick_scan(
    State(state): State<Arc<AppState>>,
    Json(body): Json<QuickScanRequest>,
) -> Result<Json<Value>, MeshError> {
    let scan = state.orchestrator.create_scan(
        &body.target,
        ScanDepth::Quick,
        None,
        Sensitivity::None,
    )?;
    let completed = state.orchestrator.run_scan(&scan.id).await?;
    if completed.status == ScanStatus::Completed {
        persist_completed(&state, &completed);
    }
    Ok(Json(completed.to_json()))
}
