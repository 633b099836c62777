//! Shield score calculator.

use crate::shield::models::{FindingSeverity, ModuleScore, ShieldFinding, ShieldGrade};
use std::collections::HashMap;

/// Contribution weight of each module to the composite score.
pub const MODULE_WEIGHTS: &[(&str, u32)] = &[
    ("tls", 20),
    ("ports", 20),
    ("cve", 25),
    ("headers", 10),
    ("dns", 10),
    ("creds", 10),
    ("owasp", 5),
];

pub fn module_weight(name: &str) -> u32 {
    MODULE_WEIGHTS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, w)| *w)
        .unwrap_or(0)
}

/// Compute a module's score summary from its findings.
///
/// Scoring heuristic: start at 100, subtract a per-severity penalty for each
/// finding (critical 25, high 15, medium 8, low 3, info 0), floor at 0.
pub fn compute_module_score(module_name: &str, findings: &[ShieldFinding]) -> ModuleScore {
    let mut score = 100.0;
    for finding in findings {
        score -= finding.severity.penalty();
    }
    score = score.max(0.0);

    // total_checks / passed_checks is a simplified estimate: every non-info
    // finding counts as one failed check, plus the connect check itself.
    let non_info = findings
        .iter()
        .filter(|f| f.severity != FindingSeverity::Info)
        .count() as u32;
    let total_checks = non_info.max(1);
    let passed_checks = total_checks.saturating_sub(non_info);

    ModuleScore {
        module: module_name.to_string(),
        score: round2(score),
        total_checks,
        passed_checks,
        findings_count: findings.len() as u32,
    }
}

/// Calculate the weighted shield score from module scores.
///
/// Only modules actually present in `module_scores` participate; their
/// weights are re-normalized to sum to 100%.
pub fn calculate_shield_score(module_scores: &HashMap<String, ModuleScore>) -> (f64, ShieldGrade) {
    if module_scores.is_empty() {
        return (0.0, ShieldGrade::F);
    }

    let total_weight: f64 = module_scores
        .keys()
        .map(|name| module_weight(name) as f64)
        .sum();

    if total_weight == 0.0 {
        // All modules carry zero weight; fall back to a simple average.
        let avg = module_scores.values().map(|ms| ms.score).sum::<f64>()
            / module_scores.len() as f64;
        return (round2(avg), ShieldGrade::from_score(avg));
    }

    let weighted_sum: f64 = module_scores
        .iter()
        .map(|(name, ms)| ms.score * (module_weight(name) as f64 / total_weight))
        .sum();

    let score = round2(weighted_sum);
    (score, ShieldGrade::from_score(score))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
