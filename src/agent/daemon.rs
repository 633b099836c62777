//! Agent Daemon
//! ============
//! Long-lived scan + push loop: detect the local network, drain the
//! offline queue, scan each target subnet, push results, heartbeat, and
//! poll for remote commands between cooperative sleep chunks.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use crate::agent::client::AgentApiClient;
use crate::agent::fingerprint::detect_network_fingerprint;
use crate::agent::queue::OfflineQueue;
use crate::agent::updater::{check_for_update, perform_update};
use crate::error::MeshError;
use crate::shield::models::{ScanDepth, Sensitivity};
use crate::shield::orchestrator::ShieldOrchestrator;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, System};
use tracing::{error, info, warn};

/// Lightweight command poll spacing inside the inter-cycle sleep.
const COMMAND_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Update check cadence in scan cycles (~1 h at the 5-minute default).
const UPDATE_CHECK_EVERY_CYCLES: u64 = 12;

/// Produces the discovery asset list for one target subnet. The concrete
/// network scanners and the asset classifier live behind this seam.
#[async_trait]
pub trait DiscoveryScanner: Send + Sync {
    async fn scan(&self, target: &str) -> Result<Value, MeshError>;
}

/// Placeholder scanner for hosts without the native probe stack; reports
/// an empty asset list so the push pipeline still exercises end to end.
pub struct StubScanner;

#[async_trait]
impl DiscoveryScanner for StubScanner {
    async fn scan(&self, target: &str) -> Result<Value, MeshError> {
        let now = Utc::now().to_rfc3339();
        Ok(json!({
            "target": target,
            "scan_method": "hybrid",
            "started_at": now,
            "completed_at": now,
            "is_root": false,
            "assets": [],
        }))
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub api_url: String,
    pub token: String,
    pub targets: Vec<String>,
    pub interval: Duration,
    pub shield: bool,
    pub data_dir: PathBuf,
}

pub struct AgentDaemon {
    config: DaemonConfig,
    client: AgentApiClient,
    queue: OfflineQueue,
    scanner: Arc<dyn DiscoveryScanner>,
    orchestrator: Arc<ShieldOrchestrator>,
    running: Arc<AtomicBool>,
}

fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes();
    system.process(Pid::from_u32(pid)).is_some()
}

impl AgentDaemon {
    pub fn new(config: DaemonConfig, scanner: Arc<dyn DiscoveryScanner>) -> Result<Self, MeshError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let client = AgentApiClient::new(&config.api_url, &config.token)?;
        let queue = OfflineQueue::new(config.data_dir.join("queue"))?;
        Ok(AgentDaemon {
            client,
            queue,
            scanner,
            orchestrator: Arc::new(ShieldOrchestrator::new()),
            running: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    fn pid_path(&self) -> PathBuf {
        self.config.data_dir.join("agent.pid")
    }

    /// Handle used to stop the loop from another task or a signal handler.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Start the daemon: claim the PID file and enter the scan loop.
    /// Refuses to start when a live daemon owns the PID file.
    pub async fn start(&self) -> Result<(), MeshError> {
        let pid_path = self.pid_path();
        if pid_path.exists() {
            let existing = std::fs::read_to_string(&pid_path)
                .ok()
                .and_then(|text| text.trim().parse::<u32>().ok());
            if let Some(pid) = existing {
                if is_process_alive(pid) {
                    return Err(MeshError::Validation(format!(
                        "agent already running (PID {pid}); stop it first"
                    )));
                }
            }
            // Stale PID from a dead process.
            let _ = std::fs::remove_file(&pid_path);
        }
        std::fs::write(&pid_path, std::process::id().to_string())?;

        self.running.store(true, Ordering::SeqCst);
        info!(
            pid = std::process::id(),
            api = %self.config.api_url,
            targets = ?self.config.targets,
            interval_secs = self.config.interval.as_secs(),
            "agent started"
        );

        self.run_loop().await;
        self.stop();
        Ok(())
    }

    /// Clear the running flag and remove the PID file.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = std::fs::remove_file(self.pid_path());
        info!("agent stopped");
    }

    /// Daemon status derived from the PID file.
    pub fn status(&self) -> Value {
        let pid_path = self.pid_path();
        if !pid_path.exists() {
            return json!({ "running": false, "message": "Not running (no PID file)." });
        }
        let Some(pid) = std::fs::read_to_string(&pid_path)
            .ok()
            .and_then(|text| text.trim().parse::<u32>().ok())
        else {
            return json!({ "running": false, "message": "Invalid PID file." });
        };
        if is_process_alive(pid) {
            json!({ "running": true, "pid": pid, "message": format!("Running (PID {pid}).") })
        } else {
            let _ = std::fs::remove_file(&pid_path);
            json!({ "running": false, "message": "Not running (stale PID cleaned)." })
        }
    }

    async fn run_loop(&self) {
        let mut cycle_count: u64 = 0;
        while self.running.load(Ordering::SeqCst) {
            self.run_single_cycle().await;
            self.send_heartbeat().await;

            cycle_count += 1;
            if cycle_count % UPDATE_CHECK_EVERY_CYCLES == 0 {
                self.run_update_check().await;
            }

            self.interruptible_sleep(self.config.interval).await;
        }
    }

    /// Sleep in poll-interval chunks, checking for remote commands between
    /// chunks. The loop exits at the next chunk boundary after stop().
    async fn interruptible_sleep(&self, total: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total && self.running.load(Ordering::SeqCst) {
            let chunk = COMMAND_POLL_INTERVAL.min(total - elapsed);
            tokio::time::sleep(chunk).await;
            elapsed += chunk;
            if elapsed < total && self.running.load(Ordering::SeqCst) {
                self.poll_and_execute_commands().await;
            }
        }
    }

    /// One cycle: drain the queue, then scan and push every target.
    async fn run_single_cycle(&self) {
        let fingerprint = detect_network_fingerprint();
        if let Some(fp) = &fingerprint {
            info!(
                network = &fp.fingerprint_hash[..12.min(fp.fingerprint_hash.len())],
                gateway = ?fp.gateway_ip,
                "network detected"
            );
        }

        if self.queue.count() > 0 {
            info!("draining {} queued item(s)", self.queue.count());
            let client = &self.client;
            let (sent, failed) = self
                .queue
                .drain(|payload, payload_type| async move {
                    let result = if payload_type == "shield" {
                        client.push_shield(&payload).await
                    } else {
                        client.push_discovery(&payload).await
                    };
                    result.map_err(|e| e.to_string())
                })
                .await;
            info!("drained: {sent} sent, {failed} failed");
        }

        for target in &self.config.targets {
            info!("scanning {target}");
            let mut scan_result = match self.scanner.scan(target).await {
                Ok(result) => result,
                Err(err) => {
                    error!("scan failed for {target}: {err}");
                    continue;
                }
            };

            if let Some(fp) = &fingerprint {
                scan_result["network_fingerprint"] =
                    serde_json::to_value(fp).unwrap_or(Value::Null);
            }

            let asset_count = scan_result
                .get("assets")
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            match self.client.push_discovery(&scan_result).await {
                Ok(()) => info!("pushed {asset_count} asset(s) for {target}"),
                Err(err) => {
                    warn!("push failed for {target}: {err}; queuing for retry");
                    if let Err(enqueue_err) = self.queue.enqueue(&scan_result, "discovery") {
                        error!("failed to queue payload: {enqueue_err}");
                    }
                }
            }

            if self.config.shield {
                match self.run_shield(target).await {
                    Ok(shield_result) => match self.client.push_shield(&shield_result).await {
                        Ok(()) => info!("shield pushed for {target}"),
                        Err(err) => {
                            warn!("shield push failed for {target}: {err}; queuing");
                            if let Err(enqueue_err) = self.queue.enqueue(&shield_result, "shield") {
                                error!("failed to queue shield payload: {enqueue_err}");
                            }
                        }
                    },
                    Err(err) => error!("shield scan failed for {target}: {err}"),
                }
            }
        }
    }

    /// Standard-depth shield scan, shaped for the ingest endpoint.
    async fn run_shield(&self, target: &str) -> Result<Value, MeshError> {
        let scan = self.orchestrator.create_scan(
            target,
            ScanDepth::Standard,
            None,
            Sensitivity::None,
        )?;
        let completed = self.orchestrator.run_scan(&scan.id).await?;

        Ok(json!({
            "target": completed.target,
            "started_at": completed.started_at.map(|t| t.to_rfc3339()),
            "completed_at": completed.completed_at.map(|t| t.to_rfc3339()),
            "modules_run": completed.modules_enabled,
            "findings": completed.findings,
        }))
    }

    /// Periodic self-update check; the new build activates on restart.
    async fn run_update_check(&self) {
        match check_for_update(&self.client, env!("CARGO_PKG_VERSION")).await {
            Ok(Some(latest)) => {
                let install_dir =
                    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
                if perform_update(&install_dir).await {
                    info!("updated to {latest}; restart the agent to activate");
                } else {
                    warn!("auto-update to {latest} failed");
                }
            }
            Ok(None) => {}
            Err(err) => warn!("version check failed: {err}"),
        }
    }

    async fn send_heartbeat(&self) {
        match self
            .client
            .heartbeat("online", env!("CARGO_PKG_VERSION"))
            .await
        {
            Ok(pending) => {
                info!("heartbeat sent");
                if pending > 0 {
                    info!("{pending} pending command(s); fetching");
                    self.poll_and_execute_commands().await;
                }
            }
            Err(err) => warn!("heartbeat failed: {err}"),
        }
    }

    /// Fetch open commands and execute them; errors here are quiet since
    /// this also runs as a background poll.
    async fn poll_and_execute_commands(&self) {
        let commands = match self.client.fetch_commands().await {
            Ok(commands) => commands,
            Err(_) => return,
        };

        for command in commands {
            let Some(command_id) = command.get("id").and_then(Value::as_str) else {
                continue;
            };
            // Only freshly queued commands are picked up; ack/running ones
            // are already being worked by this process.
            if command.get("status").and_then(Value::as_str) != Some("pending") {
                continue;
            }
            let command_type = command
                .get("command_type")
                .and_then(Value::as_str)
                .unwrap_or("");
            let params = command.get("params").cloned().unwrap_or(json!({}));

            info!("executing command {command_id} ({command_type})");
            let _ = self.client.update_command(command_id, "ack", None).await;

            if command_type == "scan_now" {
                self.execute_scan_command(command_id, &params).await;
            } else {
                warn!("unknown command type: {command_type}");
                let _ = self
                    .client
                    .update_command(
                        command_id,
                        "failed",
                        Some(json!({ "error": format!("Unknown command: {command_type}") })),
                    )
                    .await;
            }
        }
    }

    /// scan_now: discovery (and optional shield) per target with
    /// progressive status updates.
    async fn execute_scan_command(&self, command_id: &str, params: &Value) {
        let targets: Vec<String> = params
            .get("targets")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let shield = params.get("shield").and_then(Value::as_bool).unwrap_or(false);

        let _ = self
            .client
            .update_command(command_id, "running", Some(json!({ "step": "Starting scan..." })))
            .await;

        let mut scanned = 0usize;
        let mut errors: Vec<String> = Vec::new();

        for (i, target) in targets.iter().enumerate() {
            let step_prefix = if targets.len() > 1 {
                format!("[{}/{}] ", i + 1, targets.len())
            } else {
                String::new()
            };

            let _ = self
                .client
                .update_command(
                    command_id,
                    "running",
                    Some(json!({ "step": format!("{step_prefix}Discovery scan: {target}") })),
                )
                .await;

            match self.scanner.scan(target).await {
                Ok(scan_result) => {
                    let asset_count = scan_result
                        .get("assets")
                        .and_then(Value::as_array)
                        .map(Vec::len)
                        .unwrap_or(0);
                    match self.client.push_discovery(&scan_result).await {
                        Ok(()) => scanned += asset_count,
                        Err(err) => {
                            errors.push(format!("{target}: {err}"));
                            continue;
                        }
                    }
                }
                Err(err) => {
                    errors.push(format!("{target}: {err}"));
                    continue;
                }
            }

            if shield {
                let _ = self
                    .client
                    .update_command(
                        command_id,
                        "running",
                        Some(json!({ "step": format!("{step_prefix}Shield security scan: {target}") })),
                    )
                    .await;
                match self.run_shield(target).await {
                    Ok(shield_result) => {
                        if let Err(err) = self.client.push_shield(&shield_result).await {
                            errors.push(format!("shield({target}): {err}"));
                        }
                    }
                    Err(err) => errors.push(format!("shield({target}): {err}")),
                }
            }
        }

        let final_status = if errors.is_empty() { "completed" } else { "failed" };
        let _ = self
            .client
            .update_command(
                command_id,
                final_status,
                Some(json!({
                    "assets_scanned": scanned,
                    "targets": targets,
                    "errors": errors,
                })),
            )
            .await;
    }
}

/// Rotate `agent.log` at startup when it exceeds the size cap, keeping
/// three generations.
pub fn rotate_log_if_needed(log_path: &std::path::Path) {
    const MAX_BYTES: u64 = 5 * 1024 * 1024;
    const KEEP: u32 = 3;

    let Ok(metadata) = std::fs::metadata(log_path) else {
        return;
    };
    if metadata.len() < MAX_BYTES {
        return;
    }

    for i in (1..KEEP).rev() {
        let from = log_path.with_extension(format!("log.{i}"));
        let to = log_path.with_extension(format!("log.{}", i + 1));
        let _ = std::fs::rename(from, to);
    }
    let _ = std::fs::rename(log_path, log_path.with_extension("log.1"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> DaemonConfig {
        DaemonConfig {
            api_url: "http://127.0.0.1:1".to_string(),
            token: "0".repeat(64),
            targets: vec!["192.168.1.0/24".to_string()],
            interval: Duration::from_secs(300),
            shield: false,
            data_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_stub_scanner_payload_shape() {
        let payload = StubScanner.scan("10.0.0.0/24").await.unwrap();
        assert_eq!(payload["target"], "10.0.0.0/24");
        assert_eq!(payload["scan_method"], "hybrid");
        assert!(payload["assets"].as_array().unwrap().is_empty());
        assert!(payload["started_at"].is_string());
    }

    #[tokio::test]
    async fn test_refuses_start_when_pid_alive() {
        let dir = tempfile::tempdir().unwrap();
        // Our own PID is certainly alive.
        std::fs::write(dir.path().join("agent.pid"), std::process::id().to_string()).unwrap();

        let daemon = AgentDaemon::new(config(dir.path()), Arc::new(StubScanner)).unwrap();
        let err = daemon.start().await.unwrap_err();
        assert!(matches!(err, MeshError::Validation(_)));
    }

    #[test]
    fn test_status_cleans_stale_pid() {
        let dir = tempfile::tempdir().unwrap();
        // PID u32::MAX is never a live process.
        std::fs::write(dir.path().join("agent.pid"), u32::MAX.to_string()).unwrap();

        let daemon = AgentDaemon::new(config(dir.path()), Arc::new(StubScanner)).unwrap();
        let status = daemon.status();
        assert_eq!(status["running"], false);
        assert!(!dir.path().join("agent.pid").exists());
    }

    #[test]
    fn test_status_without_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = AgentDaemon::new(config(dir.path()), Arc::new(StubScanner)).unwrap();
        assert_eq!(daemon.status()["running"], false);
    }

    #[test]
    fn test_stop_removes_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = AgentDaemon::new(config(dir.path()), Arc::new(StubScanner)).unwrap();
        std::fs::write(dir.path().join("agent.pid"), "12345").unwrap();
        daemon.stop();
        assert!(!dir.path().join("agent.pid").exists());
    }

    #[test]
    fn test_log_rotation_noop_below_cap() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("agent.log");
        std::fs::write(&log, b"small").unwrap();
        rotate_log_if_needed(&log);
        assert!(log.exists());
        assert!(!dir.path().join("agent.log.1").exists());
    }
}
