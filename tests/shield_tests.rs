//! Shield orchestrator tests with substituted modules: lifecycle, failure
//! isolation, scoring, and aggregation invariants.

use aegis_mesh::shield::models::{
    FindingSeverity, ScanDepth, ScanStatus, Sensitivity, ShieldFinding, ShieldGrade,
};
use aegis_mesh::shield::modules::{ModuleError, ScanModule};
use aegis_mesh::shield::orchestrator::ShieldOrchestrator;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Scripted module standing in for a real probe.
struct MockModule {
    name: &'static str,
    weight: u32,
    available: bool,
    findings: Vec<ShieldFinding>,
    fail: bool,
}

impl MockModule {
    fn clean(name: &'static str, weight: u32) -> Self {
        MockModule {
            name,
            weight,
            available: true,
            findings: Vec::new(),
            fail: false,
        }
    }

    fn with_findings(name: &'static str, weight: u32, severities: &[FindingSeverity]) -> Self {
        let findings = severities
            .iter()
            .map(|s| ShieldFinding::new(name, *s, "mock finding"))
            .collect();
        MockModule {
            name,
            weight,
            available: true,
            findings,
            fail: false,
        }
    }

    fn failing(name: &'static str, weight: u32) -> Self {
        MockModule {
            name,
            weight,
            available: true,
            findings: Vec::new(),
            fail: true,
        }
    }

    fn unavailable(name: &'static str, weight: u32) -> Self {
        MockModule {
            name,
            weight,
            available: false,
            findings: Vec::new(),
            fail: false,
        }
    }
}

#[async_trait]
impl ScanModule for MockModule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn scan(
        &self,
        _target: &str,
        _port: Option<u16>,
    ) -> Result<Vec<ShieldFinding>, ModuleError> {
        if self.fail {
            return Err(ModuleError("probe exploded".to_string()));
        }
        Ok(self.findings.clone())
    }
}

fn orchestrator(modules: Vec<MockModule>) -> ShieldOrchestrator {
    let table: HashMap<String, Arc<dyn ScanModule>> = modules
        .into_iter()
        .map(|m| (m.name.to_string(), Arc::new(m) as Arc<dyn ScanModule>))
        .collect();
    ShieldOrchestrator::with_modules(table)
}

#[tokio::test]
async fn test_quick_scan_on_clean_target_scores_100() {
    let orch = orchestrator(vec![MockModule::clean("tls", 20)]);
    let scan = orch
        .create_scan("example.com", ScanDepth::Quick, None, Sensitivity::None)
        .unwrap();
    assert_eq!(scan.status, ScanStatus::Queued);

    let completed = orch.run_scan(&scan.id).await.unwrap();
    assert_eq!(completed.status, ScanStatus::Completed);
    assert_eq!(completed.shield_score, Some(100.0));
    assert_eq!(completed.grade, Some(ShieldGrade::APlus));
    assert!(completed.findings.is_empty());
    assert_eq!(completed.module_scores["tls"].score, 100.0);
    assert!(completed.started_at.is_some());
    assert!(completed.completed_at.is_some());
}

#[tokio::test]
async fn test_module_failure_is_isolated() {
    let orch = orchestrator(vec![
        MockModule::clean("tls", 20),
        MockModule::failing("ports", 20),
    ]);
    let scan = orch
        .create_scan(
            "example.com",
            ScanDepth::Quick,
            Some(vec!["tls".to_string(), "ports".to_string()]),
            Sensitivity::None,
        )
        .unwrap();

    let completed = orch.run_scan(&scan.id).await.unwrap();
    // The crash never fails the scan; the module reports no findings.
    assert_eq!(completed.status, ScanStatus::Completed);
    assert_eq!(completed.module_scores.len(), 2);
    assert_eq!(completed.module_scores["ports"].findings_count, 0);
    assert_eq!(completed.shield_score, Some(100.0));
}

#[tokio::test]
async fn test_unavailable_module_skipped_and_weights_renormalize() {
    let orch = orchestrator(vec![
        MockModule::with_findings("tls", 20, &[FindingSeverity::Critical]),
        MockModule::unavailable("ports", 20),
    ]);
    let scan = orch
        .create_scan(
            "example.com",
            ScanDepth::Quick,
            Some(vec!["tls".to_string(), "ports".to_string()]),
            Sensitivity::None,
        )
        .unwrap();

    let completed = orch.run_scan(&scan.id).await.unwrap();
    // Only tls participates; its 75 carries the full weight.
    assert_eq!(completed.module_scores.len(), 1);
    assert_eq!(completed.shield_score, Some(75.0));
    assert_eq!(completed.grade, Some(ShieldGrade::B));
}

#[tokio::test]
async fn test_composite_is_weighted_mean_of_present_modules() {
    let orch = orchestrator(vec![
        MockModule::clean("tls", 20),
        MockModule::with_findings("cve", 25, &[FindingSeverity::Critical]),
    ]);
    let scan = orch
        .create_scan(
            "example.com",
            ScanDepth::Quick,
            Some(vec!["tls".to_string(), "cve".to_string()]),
            Sensitivity::None,
        )
        .unwrap();

    let completed = orch.run_scan(&scan.id).await.unwrap();
    // (100 * 20 + 75 * 25) / 45 = 86.11
    assert_eq!(completed.shield_score, Some(86.11));
    assert_eq!(completed.grade, Some(ShieldGrade::BPlus));
}

#[tokio::test]
async fn test_check_counters_sum_across_modules() {
    let orch = orchestrator(vec![
        MockModule::with_findings(
            "tls",
            20,
            &[FindingSeverity::High, FindingSeverity::Medium],
        ),
        MockModule::with_findings("dns", 10, &[FindingSeverity::Low]),
    ]);
    let scan = orch
        .create_scan(
            "example.com",
            ScanDepth::Quick,
            Some(vec!["tls".to_string(), "dns".to_string()]),
            Sensitivity::None,
        )
        .unwrap();

    let completed = orch.run_scan(&scan.id).await.unwrap();
    let sum: u32 = completed
        .module_scores
        .values()
        .map(|ms| ms.total_checks)
        .sum();
    assert_eq!(completed.total_checks, sum);
    assert_eq!(
        completed.failed_checks,
        completed.total_checks - completed.passed_checks
    );
    // One medium finding counts as the warning.
    assert_eq!(completed.warning_checks, 1);
}

#[tokio::test]
async fn test_findings_tagged_with_scan_id() {
    let orch = orchestrator(vec![MockModule::with_findings(
        "tls",
        20,
        &[FindingSeverity::High],
    )]);
    let scan = orch
        .create_scan("example.com", ScanDepth::Quick, None, Sensitivity::None)
        .unwrap();

    let completed = orch.run_scan(&scan.id).await.unwrap();
    assert_eq!(completed.findings.len(), 1);
    assert_eq!(completed.findings[0].scan_id, completed.id);
    assert_eq!(completed.findings[0].module, "tls");
}

#[tokio::test]
async fn test_completed_scan_is_not_runnable() {
    let orch = orchestrator(vec![MockModule::clean("tls", 20)]);
    let scan = orch
        .create_scan("example.com", ScanDepth::Quick, None, Sensitivity::None)
        .unwrap();

    orch.run_scan(&scan.id).await.unwrap();
    let err = orch.run_scan(&scan.id).await.unwrap_err();
    assert!(err.to_string().contains("not in a runnable state"));
}

#[tokio::test]
async fn test_unknown_scan_id() {
    let orch = orchestrator(vec![]);
    assert!(orch.run_scan("sh_missing").await.is_err());
    assert!(orch.get_scan("sh_missing").is_none());
}

#[tokio::test]
async fn test_sensitivity_restricts_executed_modules() {
    let orch = orchestrator(vec![
        MockModule::clean("tls", 20),
        MockModule::clean("ports", 20),
        MockModule::clean("creds", 10),
        MockModule::clean("headers", 10),
        MockModule::clean("dns", 10),
        MockModule::clean("cve", 25),
        MockModule::clean("owasp", 5),
    ]);

    let scan = orch
        .create_scan("example.com", ScanDepth::Deep, None, Sensitivity::Fragile)
        .unwrap();
    assert_eq!(scan.modules_enabled, vec!["tls", "headers", "dns"]);

    let completed = orch.run_scan(&scan.id).await.unwrap();
    assert_eq!(completed.module_scores.len(), 3);
    assert!(!completed.module_scores.contains_key("owasp"));
}

#[tokio::test]
async fn test_concurrent_scans_are_independent() {
    let orch = Arc::new(orchestrator(vec![MockModule::clean("tls", 20)]));

    let mut handles = Vec::new();
    for i in 0..8 {
        let orch = Arc::clone(&orch);
        handles.push(tokio::spawn(async move {
            let scan = orch
                .create_scan(
                    &format!("host-{i}.example.com"),
                    ScanDepth::Quick,
                    None,
                    Sensitivity::None,
                )
                .unwrap();
            orch.run_scan(&scan.id).await.unwrap()
        }));
    }

    let mut ids = std::collections::HashSet::new();
    for handle in handles {
        let scan = handle.await.unwrap();
        assert_eq!(scan.status, ScanStatus::Completed);
        ids.insert(scan.id);
    }
    assert_eq!(ids.len(), 8);
    assert_eq!(orch.list_scans(20).len(), 8);
}

#[tokio::test]
async fn test_list_scans_most_recent_first() {
    let orch = orchestrator(vec![MockModule::clean("tls", 20)]);
    for host in ["a.test", "b.test", "c.test"] {
        orch.create_scan(host, ScanDepth::Quick, None, Sensitivity::None)
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let scans = orch.list_scans(2);
    assert_eq!(scans.len(), 2);
    assert_eq!(scans[0].target, "c.test");
    assert_eq!(scans[1].target, "b.test");
}

#[tokio::test]
async fn test_zero_modules_scores_zero_grade_f() {
    let orch = orchestrator(vec![MockModule::unavailable("tls", 20)]);
    let scan = orch
        .create_scan("example.com", ScanDepth::Quick, None, Sensitivity::None)
        .unwrap();

    let completed = orch.run_scan(&scan.id).await.unwrap();
    assert_eq!(completed.status, ScanStatus::Completed);
    assert_eq!(completed.shield_score, Some(0.0));
    assert_eq!(completed.grade, Some(ShieldGrade::F));
    assert!(completed.module_scores.is_empty());
}
