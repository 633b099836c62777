//! Collective Intelligence Engine
//! ==============================
//! Lifecycle of anonymized threat signals: privacy pipeline on submission,
//! k-anonymous aggregation on read, TTL cleanup. No raw signal row is ever
//! readable through an API.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use crate::collective::privacy::DifferentialPrivacy;
use crate::error::MeshError;
use crate::metrics::COLLECTIVE_SIGNALS_TOTAL;
use crate::store::entities::CollectiveSignalRecord;
use crate::store::{now_iso, EntityStore};
use chrono::{Duration, Utc};
use ring::hmac;
use serde::Serialize;
use statrs::statistics::Statistics;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default signal retention.
pub const DEFAULT_TTL_HOURS: i64 = 72;
pub const DEFAULT_EPSILON: f64 = 1.0;
pub const DEFAULT_K_ANONYMITY: u32 = 3;

const VALID_SIGNAL_TYPES: &[&str] = &["port_scan", "malware_c2", "brute_force", "suspicious"];

/// Build-time fallback key; deployments must set THREAT_HMAC_KEY.
const DEFAULT_HMAC_KEY: &str = "aegis-mesh-dev-hmac-key-do-not-ship";

/// Incoming threat signal, already hashed by the caller.
#[derive(Debug, Clone)]
pub struct ThreatSignal {
    pub subnet_hash: String,
    pub signal_type: String,
    /// True severity in [0, 1]; noise is applied here.
    pub severity: f64,
    pub port: Option<u16>,
    pub agent_hash: String,
    pub timestamp: Option<String>,
}

/// Outcome of the submission pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Randomized response suppressed the signal; nothing was stored.
    Suppressed,
    Accepted { noised_severity: f64 },
}

/// k-anonymous community-level report.
#[derive(Debug, Clone, Serialize)]
pub struct CollectiveSignalReport {
    pub subnet_hash: String,
    pub signal_type: String,
    pub reporter_count: u32,
    pub avg_severity: f64,
    pub first_seen: String,
    pub last_seen: String,
    pub consistency: f64,
    pub confidence: f64,
    pub is_verified: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectiveStats {
    pub total_signals: u64,
    pub active_agents: u64,
    pub verified_threats: u64,
    pub subnets_monitored: u64,
    pub community_protection_score: f64,
    pub last_updated: String,
}

/// Manages collective threat intelligence sharing.
pub struct CollectiveEngine {
    store: Arc<EntityStore>,
    privacy: DifferentialPrivacy,
    hmac_key: hmac::Key,
    ttl_hours: i64,
}

impl CollectiveEngine {
    pub fn new(
        store: Arc<EntityStore>,
        hmac_key: &str,
        epsilon: f64,
        k_anonymity: u32,
        ttl_hours: i64,
    ) -> Result<Self, MeshError> {
        Ok(CollectiveEngine {
            store,
            privacy: DifferentialPrivacy::new(epsilon, k_anonymity)?,
            hmac_key: hmac::Key::new(hmac::HMAC_SHA256, hmac_key.as_bytes()),
            ttl_hours,
        })
    }

    /// Engine configured from environment (THREAT_HMAC_KEY).
    pub fn from_env(store: Arc<EntityStore>) -> Result<Self, MeshError> {
        let key = match std::env::var("THREAT_HMAC_KEY") {
            Ok(key) if !key.is_empty() => key,
            _ => {
                warn!(
                    "THREAT_HMAC_KEY is not set; falling back to the build-time default. \
                     Collective hashes are NOT private across deployments."
                );
                DEFAULT_HMAC_KEY.to_string()
            }
        };
        Self::new(
            store,
            &key,
            DEFAULT_EPSILON,
            DEFAULT_K_ANONYMITY,
            DEFAULT_TTL_HOURS,
        )
    }

    /// Test constructor with a deterministic privacy RNG.
    #[doc(hidden)]
    pub fn with_seeded_privacy(
        store: Arc<EntityStore>,
        epsilon: f64,
        k_anonymity: u32,
        seed: u64,
    ) -> Result<Self, MeshError> {
        Ok(CollectiveEngine {
            store,
            privacy: DifferentialPrivacy::with_seed(epsilon, k_anonymity, seed)?,
            hmac_key: hmac::Key::new(hmac::HMAC_SHA256, DEFAULT_HMAC_KEY.as_bytes()),
            ttl_hours: DEFAULT_TTL_HOURS,
        })
    }

    /// HMAC-SHA256 of an identifying value (agent id, /24 CIDR).
    pub fn hash_value(&self, value: &str) -> String {
        hex::encode(hmac::sign(&self.hmac_key, value.as_bytes()).as_ref())
    }

    /// Run one signal through the privacy pipeline and persist it if it
    /// survives randomized response.
    pub fn submit_signal(&self, signal: &ThreatSignal) -> Result<SubmitOutcome, MeshError> {
        if !VALID_SIGNAL_TYPES.contains(&signal.signal_type.as_str()) {
            return Err(MeshError::Validation(format!(
                "unknown signal_type '{}'",
                signal.signal_type
            )));
        }
        if !(0.0..=1.0).contains(&signal.severity) {
            return Err(MeshError::Validation(
                "severity must be within [0, 1]".to_string(),
            ));
        }
        if signal.subnet_hash.is_empty() || signal.agent_hash.is_empty() {
            return Err(MeshError::Validation(
                "subnet_hash and agent_hash are required".to_string(),
            ));
        }

        // 1. Randomized response: maybe do not report at all.
        if !self.privacy.randomized_response(true) {
            debug!("signal suppressed by randomized response");
            COLLECTIVE_SIGNALS_TOTAL
                .with_label_values(&["suppressed"])
                .inc();
            return Ok(SubmitOutcome::Suppressed);
        }

        // 2. Laplace noise on the severity.
        let noised_severity = self.privacy.add_noise_to_severity(signal.severity);

        // 3. Persist the noised record.
        self.store.insert_collective_signal(&CollectiveSignalRecord {
            id: Uuid::new_v4().to_string(),
            subnet_hash: signal.subnet_hash.clone(),
            signal_type: signal.signal_type.clone(),
            severity: noised_severity,
            port: signal.port,
            agent_hash: signal.agent_hash.clone(),
            reported_at: signal.timestamp.clone().unwrap_or_else(now_iso),
            is_noised: true,
        })?;

        COLLECTIVE_SIGNALS_TOTAL
            .with_label_values(&["accepted"])
            .inc();
        info!(
            signal_type = %signal.signal_type,
            noised_severity,
            "collective signal stored"
        );
        Ok(SubmitOutcome::Accepted { noised_severity })
    }

    fn fresh_signals(&self) -> Result<Vec<CollectiveSignalRecord>, MeshError> {
        let cutoff = (Utc::now() - Duration::hours(self.ttl_hours)).to_rfc3339();
        self.store.collective_signals_since(&cutoff)
    }

    /// Verified community threats above a confidence floor.
    pub fn get_community_threats(
        &self,
        min_confidence: f64,
    ) -> Result<Vec<CollectiveSignalReport>, MeshError> {
        Ok(self
            .aggregate_signals(&self.fresh_signals()?)
            .into_iter()
            .filter(|r| r.is_verified && r.confidence >= min_confidence)
            .collect())
    }

    /// Latest verified reports for the community feed.
    pub fn get_feed(&self, limit: usize) -> Result<Vec<CollectiveSignalReport>, MeshError> {
        let mut verified: Vec<CollectiveSignalReport> = self
            .aggregate_signals(&self.fresh_signals()?)
            .into_iter()
            .filter(|r| r.is_verified)
            .collect();
        verified.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        verified.truncate(limit);
        Ok(verified)
    }

    /// Network stats plus the community protection score.
    pub fn get_stats(&self) -> Result<CollectiveStats, MeshError> {
        let now = Utc::now();
        let signals = self.fresh_signals()?;
        let cutoff_24h = (now - Duration::hours(24)).to_rfc3339();

        let total_signals = signals.len() as u64;
        let active_agents = signals
            .iter()
            .filter(|s| s.reported_at.as_str() >= cutoff_24h.as_str())
            .map(|s| s.agent_hash.as_str())
            .collect::<HashSet<_>>()
            .len() as u64;
        let subnets = signals
            .iter()
            .map(|s| s.subnet_hash.as_str())
            .collect::<HashSet<_>>()
            .len() as u64;
        let verified = self
            .aggregate_signals(&signals)
            .iter()
            .filter(|r| r.is_verified)
            .count() as u64;

        // Heuristic gauge: base 20, capped contributions from agents,
        // verified threats, and monitored subnets.
        let agent_score = (active_agents as f64 * 5.0).min(30.0);
        let threat_score = (verified as f64 * 3.0).min(30.0);
        let subnet_score = (subnets as f64 * 2.0).min(20.0);
        let protection = (20.0 + agent_score + threat_score + subnet_score).min(100.0);

        Ok(CollectiveStats {
            total_signals,
            active_agents,
            verified_threats: verified,
            subnets_monitored: subnets,
            community_protection_score: (protection * 10.0).round() / 10.0,
            last_updated: now.to_rfc3339(),
        })
    }

    /// This agent's contribution summary.
    pub fn contribution_status(&self, agent_hash: &str) -> Result<serde_json::Value, MeshError> {
        let contributed = self.store.count_signals_by_agent(agent_hash)?;
        let received = self
            .aggregate_signals(&self.fresh_signals()?)
            .iter()
            .filter(|r| r.is_verified)
            .count() as u64;
        Ok(serde_json::json!({
            "signals_contributed": contributed,
            "signals_received": received,
            "is_contributing": contributed > 0,
            "opt_in": contributed > 0,
            "privacy_level": "standard",
        }))
    }

    /// Remove expired raw signals. Returns the count removed.
    pub fn cleanup_expired(&self) -> Result<usize, MeshError> {
        let cutoff = (Utc::now() - Duration::hours(self.ttl_hours)).to_rfc3339();
        let removed = self.store.delete_signals_before(&cutoff)?;
        if removed > 0 {
            info!("cleaned up {removed} expired collective signals");
        }
        Ok(removed)
    }

    /// Group raw signals by (subnet_hash, signal_type) and compute the
    /// k-anonymous report for each group.
    fn aggregate_signals(
        &self,
        signals: &[CollectiveSignalRecord],
    ) -> Vec<CollectiveSignalReport> {
        let mut groups: HashMap<(String, String), Vec<&CollectiveSignalRecord>> = HashMap::new();
        for signal in signals {
            groups
                .entry((signal.subnet_hash.clone(), signal.signal_type.clone()))
                .or_default()
                .push(signal);
        }

        let mut reports = Vec::new();
        for ((subnet_hash, signal_type), group) in groups {
            let reporter_count = group
                .iter()
                .map(|s| s.agent_hash.as_str())
                .collect::<HashSet<_>>()
                .len() as u32;

            let severities: Vec<f64> = group.iter().map(|s| s.severity).collect();
            let avg_severity =
                ((severities.iter().sum::<f64>() / severities.len() as f64) * 100.0).round() / 100.0;

            // Consistency = 1 - population sigma; a lone report sits at 0.5.
            let consistency = if severities.len() > 1 {
                let sigma = severities.as_slice().population_std_dev();
                (((1.0 - sigma).max(0.0)) * 100.0).round() / 100.0
            } else {
                0.5
            };

            let confidence = self.privacy.calculate_confidence(reporter_count, consistency);
            let is_verified = self.privacy.meets_k_anonymity(reporter_count);

            let first_seen = group
                .iter()
                .map(|s| s.reported_at.clone())
                .min()
                .unwrap_or_default();
            let last_seen = group
                .iter()
                .map(|s| s.reported_at.clone())
                .max()
                .unwrap_or_default();

            reports.push(CollectiveSignalReport {
                subnet_hash,
                signal_type,
                reporter_count,
                avg_severity,
                first_seen,
                last_seen,
                consistency,
                confidence,
                is_verified,
            });
        }

        reports
    }
}
