//! Shield Scan Orchestrator
//! ========================
//! Owns the scan lifecycle: create, dispatch modules concurrently, collect
//! findings, score, and complete. A failing module never fails the scan.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use crate::error::MeshError;
use crate::metrics::{SHIELD_FINDINGS_TOTAL, SHIELD_SCANS_TOTAL, SHIELD_SCAN_DURATION_SECONDS};
use crate::shield::models::{
    FindingSeverity, ModuleScore, ScanDepth, ScanStatus, Sensitivity, ShieldFinding, ShieldScan,
};
use crate::shield::modules::credential_check::CredentialCheckModule;
use crate::shield::modules::cve_matcher::CveMatcherModule;
use crate::shield::modules::dns_security::DnsSecurityModule;
use crate::shield::modules::http_headers::HttpHeadersModule;
use crate::shield::modules::owasp_probes::OwaspProbesModule;
use crate::shield::modules::port_scan::PortScanModule;
use crate::shield::modules::tls_check::TlsCheckModule;
use crate::shield::modules::ScanModule;
use crate::shield::scorer::{calculate_shield_score, compute_module_score};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Default modules enabled per scan depth.
pub fn depth_modules(depth: ScanDepth) -> Vec<String> {
    let names: &[&str] = match depth {
        ScanDepth::Quick => &["tls"],
        ScanDepth::Standard => &["tls", "ports", "headers", "dns"],
        ScanDepth::Deep => &["tls", "ports", "cve", "headers", "dns", "creds", "owasp"],
    };
    names.iter().map(|n| n.to_string()).collect()
}

/// Restrict a module list by target sensitivity.
///
/// `fragile` keeps only passive probes; `cautious` drops active credential,
/// exploit, and CVE probing.
pub fn apply_sensitivity(modules: Vec<String>, sensitivity: Sensitivity) -> Vec<String> {
    match sensitivity {
        Sensitivity::Fragile => {
            const PASSIVE: &[&str] = &["tls", "dns", "headers"];
            modules
                .into_iter()
                .filter(|m| PASSIVE.contains(&m.as_str()))
                .collect()
        }
        Sensitivity::Cautious => {
            const EXCLUDED: &[&str] = &["creds", "owasp", "cve"];
            modules
                .into_iter()
                .filter(|m| !EXCLUDED.contains(&m.as_str()))
                .collect()
        }
        Sensitivity::Safe | Sensitivity::None => modules,
    }
}

/// Detect whether the target is an IP, domain, or CIDR.
pub fn detect_target_type(target: &str) -> &'static str {
    if target.contains('/') {
        return "cidr";
    }
    let parts: Vec<&str> = target.split('.').collect();
    if parts.len() == 4 && parts.iter().all(|p| p.parse::<u8>().is_ok()) {
        return "ip";
    }
    "domain"
}

type ModuleTable = HashMap<String, Arc<dyn ScanModule>>;

/// Orchestrates shield scans across the registered modules.
pub struct ShieldOrchestrator {
    scans: DashMap<String, ShieldScan>,
    modules: ModuleTable,
}

impl ShieldOrchestrator {
    /// Orchestrator with the full production module table.
    pub fn new() -> Self {
        let mut modules: ModuleTable = HashMap::new();
        modules.insert("tls".to_string(), Arc::new(TlsCheckModule::new()));
        modules.insert("ports".to_string(), Arc::new(PortScanModule::new()));
        modules.insert("cve".to_string(), Arc::new(CveMatcherModule::new()));
        modules.insert("headers".to_string(), Arc::new(HttpHeadersModule::new()));
        modules.insert("dns".to_string(), Arc::new(DnsSecurityModule::new()));
        modules.insert("creds".to_string(), Arc::new(CredentialCheckModule::new()));
        modules.insert("owasp".to_string(), Arc::new(OwaspProbesModule::new()));
        Self::with_modules(modules)
    }

    /// Orchestrator over an explicit module table; tests substitute fakes.
    pub fn with_modules(modules: ModuleTable) -> Self {
        ShieldOrchestrator {
            scans: DashMap::new(),
            modules,
        }
    }

    /// Create and queue a new scan. An explicit module list overrides the
    /// depth default; the sensitivity filter applies in both cases.
    pub fn create_scan(
        &self,
        target: &str,
        depth: ScanDepth,
        modules: Option<Vec<String>>,
        sensitivity: Sensitivity,
    ) -> Result<ShieldScan, MeshError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(MeshError::Validation("target must not be empty".to_string()));
        }

        let selected = modules.unwrap_or_else(|| depth_modules(depth));
        let selected = apply_sensitivity(selected, sensitivity);

        let target_type = detect_target_type(target);
        let scan = ShieldScan::new(target, target_type, depth, selected);
        self.scans.insert(scan.id.clone(), scan.clone());
        info!(scan_id = %scan.id, target, depth = depth.as_str(), "shield scan queued");
        Ok(scan)
    }

    pub fn get_scan(&self, scan_id: &str) -> Option<ShieldScan> {
        self.scans.get(scan_id).map(|entry| entry.value().clone())
    }

    /// List recent scans, most recent first.
    pub fn list_scans(&self, limit: usize) -> Vec<ShieldScan> {
        let mut scans: Vec<ShieldScan> = self.scans.iter().map(|e| e.value().clone()).collect();
        scans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        scans.truncate(limit);
        scans
    }

    /// Availability report for every registered module.
    pub fn module_status(&self) -> Vec<(String, u32, bool)> {
        let mut status: Vec<_> = self
            .modules
            .values()
            .map(|m| (m.name().to_string(), m.weight(), m.is_available()))
            .collect();
        status.sort_by(|a, b| a.0.cmp(&b.0));
        status
    }

    /// Execute a queued scan to completion.
    ///
    /// Modules run as sibling tasks and are all awaited before scoring.
    /// A module that errors or panics contributes an empty finding list;
    /// only orchestrator-level failures mark the scan failed.
    pub async fn run_scan(&self, scan_id: &str) -> Result<ShieldScan, MeshError> {
        let mut scan = self
            .get_scan(scan_id)
            .ok_or_else(|| MeshError::NotFound(format!("scan {scan_id}")))?;

        if !matches!(scan.status, ScanStatus::Queued | ScanStatus::Failed) {
            return Err(MeshError::Validation(format!(
                "scan {scan_id} is not in a runnable state: {}",
                scan.status.as_str()
            )));
        }

        scan.status = ScanStatus::Running;
        scan.started_at = Some(chrono::Utc::now());
        self.scans.insert(scan.id.clone(), scan.clone());

        // Fan out one task per enabled module; unavailable modules are skipped.
        let mut handles = Vec::new();
        for module_name in &scan.modules_enabled {
            let Some(module) = self.modules.get(module_name) else {
                warn!(module = %module_name, "module not registered, skipping");
                continue;
            };
            if !module.is_available() {
                warn!(module = %module_name, "module not available, skipping");
                continue;
            }

            let module = Arc::clone(module);
            let name = module_name.clone();
            let target = scan.target.clone();
            handles.push((
                name.clone(),
                tokio::spawn(async move { module.scan(&target, None).await }),
            ));
        }

        let mut all_findings: Vec<ShieldFinding> = Vec::new();
        let mut module_scores: HashMap<String, ModuleScore> = HashMap::new();

        for (name, handle) in handles {
            let findings = match handle.await {
                Ok(Ok(findings)) => findings,
                Ok(Err(err)) => {
                    error!(module = %name, "module failed: {err}");
                    Vec::new()
                }
                Err(join_err) => {
                    error!(module = %name, "module task panicked: {join_err}");
                    Vec::new()
                }
            };

            let mut findings = findings;
            for finding in &mut findings {
                finding.scan_id = scan.id.clone();
                SHIELD_FINDINGS_TOTAL
                    .with_label_values(&[&finding.module, finding.severity.as_str()])
                    .inc();
            }

            module_scores.insert(name.clone(), compute_module_score(&name, &findings));
            all_findings.extend(findings);
        }

        scan.findings = all_findings;
        scan.total_checks = module_scores.values().map(|ms| ms.total_checks).sum();
        scan.passed_checks = module_scores.values().map(|ms| ms.passed_checks).sum();
        scan.failed_checks = scan.total_checks - scan.passed_checks;
        scan.warning_checks = scan
            .findings
            .iter()
            .filter(|f| f.severity == FindingSeverity::Medium)
            .count() as u32;

        let (score, grade) = calculate_shield_score(&module_scores);
        scan.module_scores = module_scores;
        scan.shield_score = Some(score);
        scan.grade = Some(grade);
        scan.status = ScanStatus::Completed;
        scan.completed_at = Some(chrono::Utc::now());

        if let Some(duration) = scan.duration_seconds() {
            SHIELD_SCAN_DURATION_SECONDS.observe(duration);
        }
        SHIELD_SCANS_TOTAL
            .with_label_values(&[scan.scan_depth.as_str(), scan.status.as_str()])
            .inc();
        info!(
            scan_id = %scan.id,
            score,
            grade = grade.as_str(),
            findings = scan.findings.len(),
            "shield scan completed"
        );

        self.scans.insert(scan.id.clone(), scan.clone());
        Ok(scan)
    }

    /// Mark a scan failed; used when the surrounding task hits an
    /// unrecoverable error (store loss, runtime shutdown).
    pub fn mark_failed(&self, scan_id: &str) {
        if let Some(mut entry) = self.scans.get_mut(scan_id) {
            entry.status = ScanStatus::Failed;
            entry.completed_at = Some(chrono::Utc::now());
            SHIELD_SCANS_TOTAL
                .with_label_values(&[entry.scan_depth.as_str(), "failed"])
                .inc();
        }
    }
}

impl Default for ShieldOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}
