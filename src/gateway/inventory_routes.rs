//! Peripheral inventory routes: subnets, switches, and observed
//! certificates. All upsert-by-key.

use crate::error::MeshError;
use crate::gateway::AppState;
use crate::store::entities::{CertificateRecord, SubnetRecord, SwitchRecord};
use crate::store::now_iso;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/subnets", get(list_subnets).post(add_subnet))
        .route("/api/subnets/:cidr", axum::routing::delete(remove_subnet))
        .route("/api/switches", get(list_switches).post(upsert_switch))
        .route(
            "/api/certificates",
            get(list_certificates).post(upsert_certificate),
        )
}

#[derive(Debug, Deserialize)]
struct AddSubnetRequest {
    cidr: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    site_name: Option<String>,
}

async fn list_subnets(State(state): State<Arc<AppState>>) -> Result<Json<Value>, MeshError> {
    let subnets = state.store.list_subnets()?;
    Ok(Json(json!({ "count": subnets.len(), "subnets": subnets })))
}

async fn add_subnet(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddSubnetRequest>,
) -> Result<Json<Value>, MeshError> {
    if !body.cidr.contains('/') {
        return Err(MeshError::Validation(format!(
            "'{}' is not a CIDR",
            body.cidr
        )));
    }
    let subnet = SubnetRecord {
        cidr: body.cidr,
        description: body.description,
        site_name: body.site_name,
        added_at: now_iso(),
    };
    state.store.upsert_subnet(&subnet)?;
    Ok(Json(json!({ "status": "ok", "subnet": subnet })))
}

async fn remove_subnet(
    State(state): State<Arc<AppState>>,
    Path(cidr): Path<String>,
) -> Result<Json<Value>, MeshError> {
    if !state.store.remove_subnet(&cidr)? {
        return Err(MeshError::NotFound(format!("subnet {cidr}")));
    }
    Ok(Json(json!({ "status": "ok", "cidr": cidr })))
}

#[derive(Debug, Deserialize)]
struct UpsertSwitchRequest {
    host: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

async fn list_switches(State(state): State<Arc<AppState>>) -> Result<Json<Value>, MeshError> {
    let switches = state.store.list_switches()?;
    Ok(Json(json!({ "count": switches.len(), "switches": switches })))
}

async fn upsert_switch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpsertSwitchRequest>,
) -> Result<Json<Value>, MeshError> {
    let switch = SwitchRecord {
        host: body.host,
        name: body.name,
        model: body.model,
        last_seen: now_iso(),
    };
    state.store.upsert_switch(&switch)?;
    Ok(Json(json!({ "status": "ok", "switch": switch })))
}

#[derive(Debug, Deserialize)]
struct UpsertCertificateRequest {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    issuer: Option<String>,
    #[serde(default)]
    not_after: Option<String>,
}

fn default_port() -> u16 {
    443
}

async fn list_certificates(State(state): State<Arc<AppState>>) -> Result<Json<Value>, MeshError> {
    let certificates = state.store.list_certificates()?;
    Ok(Json(
        json!({ "count": certificates.len(), "certificates": certificates }),
    ))
}

async fn upsert_certificate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UpsertCertificateRequest>,
) -> Result<Json<Value>, MeshError> {
    let cert = CertificateRecord {
        host: body.host,
        port: body.port,
        subject: body.subject,
        issuer: body.issuer,
        not_after: body.not_after,
        last_checked: now_iso(),
    };
    state.store.upsert_certificate(&cert)?;
    Ok(Json(json!({ "status": "ok", "certificate": cert })))
}
