//! Shield Data Models
//! ==================
//! Scan lifecycle, finding, and scoring types for the shield pipeline.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// Scan depth controls which modules run by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanDepth {
    Quick,
    Standard,
    Deep,
}

impl ScanDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanDepth::Quick => "quick",
            ScanDepth::Standard => "standard",
            ScanDepth::Deep => "deep",
        }
    }
}

/// Target sensitivity restricts the module set after depth selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    /// Passive-only probes (tls, dns, headers).
    Fragile,
    /// Excludes active credential/exploit probing and CVE lookups.
    Cautious,
    Safe,
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Queued => "queued",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl FindingSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingSeverity::Critical => "critical",
            FindingSeverity::High => "high",
            FindingSeverity::Medium => "medium",
            FindingSeverity::Low => "low",
            FindingSeverity::Info => "info",
        }
    }

    /// Score penalty applied per finding of this severity.
    pub fn penalty(&self) -> f64 {
        match self {
            FindingSeverity::Critical => 25.0,
            FindingSeverity::High => 15.0,
            FindingSeverity::Medium => 8.0,
            FindingSeverity::Low => 3.0,
            FindingSeverity::Info => 0.0,
        }
    }
}

/// Letter grade derived from the composite shield score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShieldGrade {
    #[serde(rename = "A+")]
    APlus,
    A,
    #[serde(rename = "B+")]
    BPlus,
    B,
    #[serde(rename = "C+")]
    CPlus,
    C,
    D,
    F,
}

impl ShieldGrade {
    pub fn from_score(score: f64) -> ShieldGrade {
        if score >= 95.0 {
            ShieldGrade::APlus
        } else if score >= 90.0 {
            ShieldGrade::A
        } else if score >= 85.0 {
            ShieldGrade::BPlus
        } else if score >= 75.0 {
            ShieldGrade::B
        } else if score >= 70.0 {
            ShieldGrade::CPlus
        } else if score >= 60.0 {
            ShieldGrade::C
        } else if score >= 40.0 {
            ShieldGrade::D
        } else {
            ShieldGrade::F
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShieldGrade::APlus => "A+",
            ShieldGrade::A => "A",
            ShieldGrade::BPlus => "B+",
            ShieldGrade::B => "B",
            ShieldGrade::CPlus => "C+",
            ShieldGrade::C => "C",
            ShieldGrade::D => "D",
            ShieldGrade::F => "F",
        }
    }
}

/// One observation made by a shield module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShieldFinding {
    pub id: String,
    pub scan_id: String,
    pub module: String,
    pub severity: FindingSeverity,
    pub title: String,
    pub description: String,
    pub remediation: String,
    pub target_ip: String,
    pub target_port: Option<u16>,
    pub evidence: Value,
    /// MITRE ATT&CK technique id, e.g. "T1190".
    pub attack_technique: Option<String>,
    pub attack_tactic: Option<String>,
    pub cve_id: Option<String>,
    pub cvss_score: Option<f64>,
    pub epss_score: Option<f64>,
    pub cisa_kev: bool,
}

impl ShieldFinding {
    pub fn new(module: &str, severity: FindingSeverity, title: &str) -> Self {
        ShieldFinding {
            id: Uuid::new_v4().to_string(),
            scan_id: String::new(),
            module: module.to_string(),
            severity,
            title: title.to_string(),
            description: String::new(),
            remediation: String::new(),
            target_ip: String::new(),
            target_port: None,
            evidence: json!({}),
            attack_technique: None,
            attack_tactic: None,
            cve_id: None,
            cvss_score: None,
            epss_score: None,
            cisa_kev: false,
        }
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    pub fn remediation(mut self, text: impl Into<String>) -> Self {
        self.remediation = text.into();
        self
    }

    pub fn target(mut self, ip: &str, port: Option<u16>) -> Self {
        self.target_ip = ip.to_string();
        self.target_port = port;
        self
    }

    pub fn evidence(mut self, evidence: Value) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn attack(mut self, technique: &str, tactic: &str) -> Self {
        self.attack_technique = Some(technique.to_string());
        self.attack_tactic = Some(tactic.to_string());
        self
    }
}

/// Per-module score summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleScore {
    pub module: String,
    /// 0-100
    pub score: f64,
    pub total_checks: u32,
    pub passed_checks: u32,
    pub findings_count: u32,
}

/// Lifecycle record of a shield security assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShieldScan {
    pub id: String,
    pub target: String,
    /// "ip" | "domain" | "cidr"
    pub target_type: String,
    pub status: ScanStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub shield_score: Option<f64>,
    pub grade: Option<ShieldGrade>,
    pub scan_depth: ScanDepth,
    pub modules_enabled: Vec<String>,
    pub total_checks: u32,
    pub passed_checks: u32,
    pub failed_checks: u32,
    pub warning_checks: u32,
    pub findings: Vec<ShieldFinding>,
    pub module_scores: HashMap<String, ModuleScore>,
}

impl ShieldScan {
    pub fn new(target: &str, target_type: &str, depth: ScanDepth, modules: Vec<String>) -> Self {
        ShieldScan {
            id: new_scan_id(),
            target: target.to_string(),
            target_type: target_type.to_string(),
            status: ScanStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            shield_score: None,
            grade: None,
            scan_depth: depth,
            modules_enabled: modules,
            total_checks: 0,
            passed_checks: 0,
            failed_checks: 0,
            warning_checks: 0,
            findings: Vec::new(),
            module_scores: HashMap::new(),
        }
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }

    /// Full JSON payload returned by the scan APIs.
    pub fn to_json(&self) -> Value {
        let mut severity_counts: HashMap<&str, u32> = HashMap::new();
        for finding in &self.findings {
            *severity_counts.entry(finding.severity.as_str()).or_insert(0) += 1;
        }

        json!({
            "id": self.id,
            "target": self.target,
            "target_type": self.target_type,
            "status": self.status.as_str(),
            "created_at": self.created_at.to_rfc3339(),
            "started_at": self.started_at.map(|t| t.to_rfc3339()),
            "completed_at": self.completed_at.map(|t| t.to_rfc3339()),
            "duration_seconds": self.duration_seconds(),
            "shield_score": self.shield_score,
            "grade": self.grade.map(|g| g.as_str()),
            "scan_depth": self.scan_depth.as_str(),
            "modules_enabled": self.modules_enabled,
            "total_checks": self.total_checks,
            "passed_checks": self.passed_checks,
            "failed_checks": self.failed_checks,
            "warning_checks": self.warning_checks,
            "findings_count": self.findings.len(),
            "findings_summary": severity_counts,
            "findings": self.findings,
            "module_scores": self.module_scores,
        })
    }

    /// Abbreviated payload used for scan listings.
    pub fn to_summary_json(&self) -> Value {
        json!({
            "id": self.id,
            "target": self.target,
            "target_type": self.target_type,
            "status": self.status.as_str(),
            "created_at": self.created_at.to_rfc3339(),
            "scan_depth": self.scan_depth.as_str(),
            "shield_score": self.shield_score,
            "grade": self.grade.map(|g| g.as_str()),
            "findings_count": self.findings.len(),
        })
    }
}

/// Scan ids are short tokens prefixed `sh_`, unlike the UUID ids elsewhere.
pub fn new_scan_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("sh_{}", &raw[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grade_bands() {
        assert_eq!(ShieldGrade::from_score(100.0), ShieldGrade::APlus);
        assert_eq!(ShieldGrade::from_score(95.0), ShieldGrade::APlus);
        assert_eq!(ShieldGrade::from_score(94.99), ShieldGrade::A);
        assert_eq!(ShieldGrade::from_score(90.0), ShieldGrade::A);
        assert_eq!(ShieldGrade::from_score(85.0), ShieldGrade::BPlus);
        assert_eq!(ShieldGrade::from_score(75.0), ShieldGrade::B);
        assert_eq!(ShieldGrade::from_score(70.0), ShieldGrade::CPlus);
        assert_eq!(ShieldGrade::from_score(60.0), ShieldGrade::C);
        assert_eq!(ShieldGrade::from_score(40.0), ShieldGrade::D);
        assert_eq!(ShieldGrade::from_score(39.99), ShieldGrade::F);
        assert_eq!(ShieldGrade::from_score(0.0), ShieldGrade::F);
    }

    #[test]
    fn test_scan_id_format() {
        let id = new_scan_id();
        assert!(id.starts_with("sh_"));
        assert_eq!(id.len(), 11);
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_severity_penalties() {
        assert_eq!(FindingSeverity::Critical.penalty(), 25.0);
        assert_eq!(FindingSeverity::High.penalty(), 15.0);
        assert_eq!(FindingSeverity::Medium.penalty(), 8.0);
        assert_eq!(FindingSeverity::Low.penalty(), 3.0);
        assert_eq!(FindingSeverity::Info.penalty(), 0.0);
    }

    #[test]
    fn test_severity_serde_roundtrip() {
        let sev: FindingSeverity = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(sev, FindingSeverity::Critical);
        assert_eq!(serde_json::to_string(&ShieldGrade::APlus).unwrap(), "\"A+\"");
    }

    #[test]
    fn test_duration() {
        let mut scan = ShieldScan::new("example.com", "domain", ScanDepth::Quick, vec!["tls".into()]);
        assert!(scan.duration_seconds().is_none());
        scan.started_at = Some(Utc::now());
        scan.completed_at = Some(scan.started_at.unwrap() + chrono::Duration::seconds(3));
        assert_eq!(scan.duration_seconds(), Some(3.0));
    }
}
