//! Control-plane integration tests: registration, auth, heartbeat, the
//! command queue, ingest, firewall routes, and collective aggregates,
//! exercised end to end through the router.

use aegis_mesh::collective::engine::CollectiveEngine;
use aegis_mesh::control::ratelimit::IngestRateLimiter;
use aegis_mesh::firewall::service::FirewallService;
use aegis_mesh::gateway::{router, AppState};
use aegis_mesh::remediation::deadman::DeadManSwitch;
use aegis_mesh::remediation::engine::RemediationEngine;
use aegis_mesh::shield::orchestrator::ShieldOrchestrator;
use aegis_mesh::store::EntityStore;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

struct TestHarness {
    app: Router,
    state: Arc<AppState>,
}

fn harness_with(registration_secret: Option<&str>, limiter: IngestRateLimiter) -> TestHarness {
    let store = Arc::new(EntityStore::temporary().unwrap());
    let state = Arc::new(AppState {
        orchestrator: Arc::new(ShieldOrchestrator::new()),
        limiter: Arc::new(limiter),
        firewall: Arc::new(FirewallService::new(Arc::clone(&store)).unwrap()),
        // High epsilon so submissions are essentially never suppressed.
        collective: Arc::new(
            CollectiveEngine::with_seeded_privacy(Arc::clone(&store), 10.0, 3, 42).unwrap(),
        ),
        remediation: Arc::new(RemediationEngine::new(Arc::clone(&store))),
        deadman: Arc::new(DeadManSwitch::default()),
        registration_secret: registration_secret.map(String::from),
        agent_version: "0.1.0".to_string(),
        store,
    });
    TestHarness {
        app: router(Arc::clone(&state)),
        state,
    }
}

fn harness() -> TestHarness {
    harness_with(None, IngestRateLimiter::default())
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn register_agent(app: &Router, name: &str, subnets: Vec<&str>) -> (String, String) {
    let (status, body) = call(
        app,
        "POST",
        "/api/agents/register",
        None,
        Some(json!({ "name": name, "site_name": "HQ", "subnets": subnets })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    (
        body["agent_id"].as_str().unwrap().to_string(),
        body["token"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn test_register_issues_one_time_token() {
    let h = harness();
    let (agent_id, token) = register_agent(&h.app, "scanner-1", vec![]).await;

    assert_eq!(token.len(), 64);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

    // The stored row holds a digest, never the plaintext.
    let stored = h.state.store.get_agent(&agent_id).unwrap().unwrap();
    assert_ne!(stored.token_digest, token);
    assert_eq!(stored.token_digest.len(), 64);
    assert_eq!(stored.status, "online");
}

#[tokio::test]
async fn test_registration_secret_enforced() {
    let h = harness_with(Some("letmein"), IngestRateLimiter::default());

    let (status, _) = call(
        &h.app,
        "POST",
        "/api/agents/register",
        None,
        Some(json!({ "name": "x", "secret": "wrong" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(
        &h.app,
        "POST",
        "/api/agents/register",
        None,
        Some(json!({ "name": "x", "secret": "letmein" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_heartbeat_requires_valid_bearer() {
    let h = harness();
    let (_, token) = register_agent(&h.app, "scanner-1", vec![]).await;

    let (status, body) = call(
        &h.app,
        "POST",
        "/api/agents/heartbeat",
        Some(&token),
        Some(json!({ "status": "online", "version": "0.1.0" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending_commands"], 0);

    let bogus = "0".repeat(64);
    let (status, _) = call(
        &h.app,
        "POST",
        "/api/agents/heartbeat",
        Some(&bogus),
        Some(json!({ "status": "online" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(
        &h.app,
        "POST",
        "/api/agents/heartbeat",
        None,
        Some(json!({ "status": "online" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_rotate_token_invalidates_old() {
    let h = harness();
    let (_, old_token) = register_agent(&h.app, "scanner-1", vec![]).await;

    let (status, body) = call(&h.app, "POST", "/api/agents/rotate-token", Some(&old_token), Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    let new_token = body["token"].as_str().unwrap().to_string();
    assert_eq!(new_token.len(), 64);
    assert_ne!(new_token, old_token);

    // Old token dies on its first use after rotation.
    let (status, _) = call(
        &h.app,
        "POST",
        "/api/agents/heartbeat",
        Some(&old_token),
        Some(json!({ "status": "online" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(
        &h.app,
        "POST",
        "/api/agents/heartbeat",
        Some(&new_token),
        Some(json!({ "status": "online" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_ingest_discovery_links_agent_and_site() {
    // Scenario: fresh agent registration and ingest.
    let h = harness();
    let (agent_id, token) = register_agent(&h.app, "scanner-1", vec![]).await;

    let (status, body) = call(
        &h.app,
        "POST",
        "/api/ingest/discovery",
        Some(&token),
        Some(json!({
            "target": "10.0.0.0/24",
            "started_at": "2026-02-10T12:00:00Z",
            "assets": [{ "ip": "10.0.0.1", "mac": "aa:bb:cc:dd:ee:01" }],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["assets_ingested"], 1);
    assert!(body["scan_id"].as_str().is_some());

    let assets = h.state.store.list_assets().unwrap();
    assert_eq!(assets.len(), 1);
    assert_eq!(assets[0].agent_id.as_deref(), Some(agent_id.as_str()));
    assert_eq!(assets[0].site_name.as_deref(), Some("HQ"));
}

#[tokio::test]
async fn test_ingest_requires_auth() {
    let h = harness();
    let (status, _) = call(
        &h.app,
        "POST",
        "/api/ingest/discovery",
        None,
        Some(json!({ "target": "10.0.0.0/24", "started_at": "2026-02-10T12:00:00Z", "assets": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_ingest_rate_limited_after_burst() {
    let h = harness_with(None, IngestRateLimiter::new(2, 60));
    let (_, token) = register_agent(&h.app, "scanner-1", vec![]).await;

    let payload = json!({
        "target": "10.0.0.0/24",
        "started_at": "2026-02-10T12:00:00Z",
        "assets": [],
    });
    for _ in 0..2 {
        let (status, _) = call(
            &h.app,
            "POST",
            "/api/ingest/discovery",
            Some(&token),
            Some(payload.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = call(
        &h.app,
        "POST",
        "/api/ingest/discovery",
        Some(&token),
        Some(payload),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_ingest_shield_persists_findings() {
    let h = harness();
    let (_, token) = register_agent(&h.app, "scanner-1", vec![]).await;

    let (status, body) = call(
        &h.app,
        "POST",
        "/api/ingest/shield",
        Some(&token),
        Some(json!({
            "target": "10.0.0.5",
            "started_at": "2026-02-10T12:00:00Z",
            "modules_run": ["tls", "ports"],
            "findings": [
                {
                    "module": "tls",
                    "severity": "high",
                    "title": "Self-Signed Certificate",
                    "description": "self signed",
                    "target_ip": "10.0.0.5",
                    "remediation": "Replace it.",
                }
            ],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["findings_count"], 1);

    let scan_id = body["scan_id"].as_str().unwrap();
    let stored = h.state.store.get_shield_scan(scan_id).unwrap().unwrap();
    assert_eq!(stored.status, "completed");
    assert_eq!(stored.modules_run, vec!["tls", "ports"]);

    let findings = h
        .state
        .store
        .shield_findings_for_ip("10.0.0.5", &["high"], 10)
        .unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].title, "Self-Signed Certificate");
}

#[tokio::test]
async fn test_command_queue_lifecycle() {
    let h = harness();
    let (agent_id, token) = register_agent(&h.app, "scanner-1", vec!["192.168.1.0/24"]).await;

    // Dashboard enqueues with no explicit targets: agent subnets used.
    let (status, body) = call(
        &h.app,
        "POST",
        &format!("/api/agents/{agent_id}/commands"),
        None,
        Some(json!({ "command_type": "scan_now", "shield": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["targets"], json!(["192.168.1.0/24"]));
    let command_id = body["command_id"].as_str().unwrap().to_string();

    // Heartbeat reports the pending command.
    let (_, hb) = call(
        &h.app,
        "POST",
        "/api/agents/heartbeat",
        Some(&token),
        Some(json!({ "status": "online" })),
    )
    .await;
    assert_eq!(hb["pending_commands"], 1);

    // Agent polls and sees it.
    let (status, body) = call(&h.app, "GET", "/api/agents/commands", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["commands"][0]["id"], command_id.as_str());

    // Progress through the lifecycle.
    for next in ["ack", "running", "completed"] {
        let (status, _) = call(
            &h.app,
            "PATCH",
            &format!("/api/agents/commands/{command_id}"),
            Some(&token),
            Some(json!({ "status": next })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    // Completed commands leave the pending-pollers' view.
    let (_, body) = call(&h.app, "GET", "/api/agents/commands", Some(&token), None).await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_command_poll_newest_first() {
    let h = harness();
    let (agent_id, token) = register_agent(&h.app, "scanner-1", vec!["10.0.0.0/24"]).await;

    for _ in 0..2 {
        call(
            &h.app,
            "POST",
            &format!("/api/agents/{agent_id}/commands"),
            None,
            Some(json!({})),
        )
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let (_, body) = call(&h.app, "GET", "/api/agents/commands", Some(&token), None).await;
    let commands = body["commands"].as_array().unwrap();
    assert_eq!(commands.len(), 2);
    let first = commands[0]["created_at"].as_str().unwrap();
    let second = commands[1]["created_at"].as_str().unwrap();
    assert!(first >= second);
}

#[tokio::test]
async fn test_foreign_agent_cannot_patch_command() {
    let h = harness();
    let (agent_id, _) = register_agent(&h.app, "scanner-1", vec!["10.0.0.0/24"]).await;
    let (_, other_token) = register_agent(&h.app, "scanner-2", vec![]).await;

    let (_, body) = call(
        &h.app,
        "POST",
        &format!("/api/agents/{agent_id}/commands"),
        None,
        Some(json!({})),
    )
    .await;
    let command_id = body["command_id"].as_str().unwrap();

    let (status, _) = call(
        &h.app,
        "PATCH",
        &format!("/api/agents/commands/{command_id}"),
        Some(&other_token),
        Some(json!({ "status": "ack" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_create_command_validation() {
    let h = harness();
    // No targets and no registered subnets.
    let (agent_id, _) = register_agent(&h.app, "scanner-1", vec![]).await;
    let (status, _) = call(
        &h.app,
        "POST",
        &format!("/api/agents/{agent_id}/commands"),
        None,
        Some(json!({ "command_type": "scan_now" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Unknown agent.
    let (status, _) = call(
        &h.app,
        "POST",
        "/api/agents/nonexistent-id/commands",
        None,
        Some(json!({ "targets": ["10.0.0.0/24"] })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_agent_listing_marks_stale() {
    let h = harness();
    let (agent_id, _) = register_agent(&h.app, "scanner-1", vec![]).await;

    // Backdate the heartbeat past the staleness window.
    h.state
        .store
        .update_agent(&agent_id, |a| {
            a.last_seen =
                Some((chrono::Utc::now() - chrono::Duration::seconds(600)).to_rfc3339());
        })
        .unwrap();

    let (status, body) = call(&h.app, "GET", "/api/agents", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["agents"][0]["status"], "stale");
}

#[tokio::test]
async fn test_firewall_rule_roundtrip() {
    let h = harness();

    let (status, body) = call(
        &h.app,
        "POST",
        "/api/firewall/rules",
        None,
        Some(json!({ "rule_type": "block_ip", "target": "10.0.0.99", "reason": "test" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let rule_id = body["rule"]["id"].as_str().unwrap().to_string();

    let (_, body) = call(&h.app, "GET", "/api/firewall/rules", None, None).await;
    assert_eq!(body["count"], 1);

    let (status, _) = call(
        &h.app,
        "DELETE",
        &format!("/api/firewall/rules/{rule_id}"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&h.app, "GET", "/api/firewall/rules?active_only=true", None, None).await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_firewall_port_sync_idempotent() {
    let h = harness();
    let (_, first) = call(&h.app, "POST", "/api/firewall/sync/ports", None, None).await;
    assert!(first["rules_created"].as_u64().unwrap() > 0);

    let (_, second) = call(&h.app, "POST", "/api/firewall/sync/ports", None, None).await;
    assert_eq!(second["rules_created"], 0);
}

#[tokio::test]
async fn test_collective_signal_and_k_anonymity() {
    let h = harness();

    for agent in ["a1", "a2"] {
        let (status, body) = call(
            &h.app,
            "POST",
            "/api/collective/signal",
            None,
            Some(json!({
                "subnet": "203.0.113.0/24",
                "signal_type": "port_scan",
                "severity": 0.8,
                "agent_id": agent,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "accepted");
    }

    // Two reporters: below k=3, nothing escapes.
    let (_, body) = call(&h.app, "GET", "/api/collective/threats?min_confidence=0", None, None).await;
    assert_eq!(body["count"], 0);

    let _ = call(
        &h.app,
        "POST",
        "/api/collective/signal",
        None,
        Some(json!({
            "subnet": "203.0.113.0/24",
            "signal_type": "port_scan",
            "severity": 0.8,
            "agent_id": "a3",
        })),
    )
    .await;

    let (_, body) = call(&h.app, "GET", "/api/collective/threats?min_confidence=0", None, None).await;
    assert_eq!(body["count"], 1);
    let report = &body["threats"][0];
    assert!(report["reporter_count"].as_u64().unwrap() >= 3);
    assert_eq!(report["is_verified"], true);
    // Only aggregates escape: no raw severity or agent hash fields.
    assert!(report.get("agent_hash").is_none());
}

#[tokio::test]
async fn test_collective_signal_validation() {
    let h = harness();
    let (status, _) = call(
        &h.app,
        "POST",
        "/api/collective/signal",
        None,
        Some(json!({ "signal_type": "port_scan", "severity": 0.5 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_deadman_status_route() {
    let h = harness();
    let (agent_id, _) = register_agent(&h.app, "scanner-1", vec![]).await;
    h.state
        .store
        .update_agent(&agent_id, |a| {
            a.last_seen = Some((chrono::Utc::now() - chrono::Duration::hours(2)).to_rfc3339());
        })
        .unwrap();

    let (status, body) = call(&h.app, "GET", "/api/deadman/status", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["agents"][0]["is_alive"], false);
    assert_eq!(body["agents"][0]["alert_triggered"], true);
}

#[tokio::test]
async fn test_add_asset_created_and_duplicate_is_500() {
    let h = harness();
    let payload = json!({ "ip": "10.0.0.50", "mac": "aa:aa:aa:aa:aa:50" });

    let (status, _) = call(&h.app, "POST", "/api/assets", None, Some(payload.clone())).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = call(&h.app, "POST", "/api/assets", None, Some(payload)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_remediation_plan_route() {
    let h = harness();
    let (_, token) = register_agent(&h.app, "scanner-1", vec![]).await;

    let _ = call(
        &h.app,
        "POST",
        "/api/ingest/discovery",
        Some(&token),
        Some(json!({
            "target": "10.0.0.0/24",
            "started_at": "2026-02-10T12:00:00Z",
            "assets": [{ "ip": "10.0.0.7", "mac": "aa:bb:cc:dd:ee:07", "open_ports": [23, 3389] }],
        })),
    )
    .await;

    let (status, body) = call(&h.app, "GET", "/api/remediation/plan/10.0.0.7", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_actions"], 2);
    assert_eq!(body["critical_count"], 2);
}

#[tokio::test]
async fn test_subnet_upsert_by_key() {
    let h = harness();

    let (status, _) = call(
        &h.app,
        "POST",
        "/api/subnets",
        None,
        Some(json!({ "cidr": "10.0.0.0/24", "description": "lab" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Upserting the same key does not duplicate.
    let _ = call(
        &h.app,
        "POST",
        "/api/subnets",
        None,
        Some(json!({ "cidr": "10.0.0.0/24", "description": "renamed" })),
    )
    .await;
    let (_, body) = call(&h.app, "GET", "/api/subnets", None, None).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["subnets"][0]["description"], "renamed");

    // Bad CIDR is a client error.
    let (status, _) = call(
        &h.app,
        "POST",
        "/api/subnets",
        None,
        Some(json!({ "cidr": "not-a-cidr" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&h.app, "DELETE", "/api/subnets/10.0.0.0%2F24", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = call(&h.app, "GET", "/api/subnets", None, None).await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_certificate_upsert_by_key() {
    let h = harness();
    for issuer in ["Old CA", "New CA"] {
        let _ = call(
            &h.app,
            "POST",
            "/api/certificates",
            None,
            Some(json!({ "host": "example.com", "port": 443, "issuer": issuer })),
        )
        .await;
    }
    let (_, body) = call(&h.app, "GET", "/api/certificates", None, None).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["certificates"][0]["issuer"], "New CA");
}

#[tokio::test]
async fn test_health_and_metrics_routes() {
    let h = harness();
    let (status, body) = call(&h.app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, _) = call(&h.app, "GET", "/metrics", None, None).await;
    assert_eq!(status, StatusCode::OK);
}
