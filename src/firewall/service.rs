//! Firewall Service
//! ================
//! Rule persistence, event logging, synchronization from threat intel and
//! high-risk ports, and the adapter hand-off.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use crate::error::MeshError;
use crate::firewall::adapter::{platform_adapter, FirewallAdapter};
use crate::firewall::engine::{FirewallRuleEngine, Verdict};
use crate::store::entities::{FirewallEventRecord, FirewallRuleRecord};
use crate::store::{now_iso, EntityStore};
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Threat indicators at or above this score produce block rules.
const THREAT_SCORE_THRESHOLD: f64 = 0.7;

/// Expiry horizon for threat-sourced rules.
const THREAT_RULE_EXPIRY_DAYS: i64 = 90;

/// High-risk ports seeded by the port sync.
const HIGH_RISK_PORTS: &[(u16, &str)] = &[
    (21, "FTP transmits credentials in plain text"),
    (23, "Telnet is an unencrypted protocol"),
    (445, "SMB is a ransomware vector"),
    (3389, "RDP is a brute-force target"),
    (5900, "VNC is an unencrypted remote desktop"),
    (135, "MSRPC enables lateral movement"),
    (139, "NetBIOS session service is a ransomware vector"),
];

/// Manages firewall rules, events, and synchronization.
pub struct FirewallService {
    store: Arc<EntityStore>,
    engine: RwLock<FirewallRuleEngine>,
    adapter: Box<dyn FirewallAdapter>,
}

impl FirewallService {
    pub fn new(store: Arc<EntityStore>) -> Result<Self, MeshError> {
        let service = FirewallService {
            store,
            engine: RwLock::new(FirewallRuleEngine::new()),
            adapter: platform_adapter(),
        };
        service.reload_engine()?;
        Ok(service)
    }

    /// Rebuild the matching engine from active persisted rules.
    pub fn reload_engine(&self) -> Result<(), MeshError> {
        let rules = self.store.list_firewall_rules(true, None)?;
        self.engine.write().load_rules(rules);
        Ok(())
    }

    /// Evaluate one connection. Blocked verdicts bump the matched rule's
    /// hit count and append a FirewallEvent; no engine lock is held while
    /// writing.
    pub fn evaluate(
        &self,
        dest_ip: &str,
        dest_port: u16,
        protocol: &str,
        domain: Option<&str>,
        direction: &str,
    ) -> (Verdict, Option<FirewallRuleRecord>) {
        let (verdict, matched) = {
            let engine = self.engine.read();
            let (verdict, matched) =
                engine.evaluate(dest_ip, dest_port, protocol, domain, direction);
            (verdict, matched.cloned())
        };

        if verdict == Verdict::Blocked {
            if let Some(rule) = &matched {
                if let Ok(Some(mut stored)) = self.store.get_firewall_rule(&rule.id) {
                    stored.hit_count += 1;
                    let _ = self.store.insert_firewall_rule(&stored);
                }
            }
            let _ = self.store.log_firewall_event(&FirewallEventRecord {
                id: Uuid::new_v4().to_string(),
                timestamp: now_iso(),
                action: "blocked".to_string(),
                rule_id: matched.as_ref().map(|r| r.id.clone()),
                src_ip: None,
                dst_ip: dest_ip.to_string(),
                dst_port: dest_port,
                protocol: protocol.to_string(),
                process_name: None,
                direction: direction.to_string(),
            });
        }

        (verdict, matched)
    }

    pub fn get_rules(
        &self,
        active_only: bool,
        rule_type: Option<&str>,
    ) -> Result<Vec<FirewallRuleRecord>, MeshError> {
        self.store.list_firewall_rules(active_only, rule_type)
    }

    /// Persist a new rule and refresh the engine.
    pub fn add_rule(&self, mut rule: FirewallRuleRecord) -> Result<FirewallRuleRecord, MeshError> {
        if rule.id.is_empty() {
            rule.id = Uuid::new_v4().to_string();
        }
        if rule.created_at.is_empty() {
            rule.created_at = now_iso();
        }
        validate_rule(&rule)?;
        self.store.insert_firewall_rule(&rule)?;
        self.reload_engine()?;
        Ok(rule)
    }

    /// Deactivate a rule (rules are never deleted).
    pub fn remove_rule(&self, rule_id: &str) -> Result<(), MeshError> {
        let mut rule = self
            .store
            .get_firewall_rule(rule_id)?
            .ok_or_else(|| MeshError::NotFound(format!("rule {rule_id}")))?;
        rule.is_active = false;
        self.store.insert_firewall_rule(&rule)?;
        self.reload_engine()
    }

    pub fn toggle_rule(&self, rule_id: &str) -> Result<FirewallRuleRecord, MeshError> {
        let mut rule = self
            .store
            .get_firewall_rule(rule_id)?
            .ok_or_else(|| MeshError::NotFound(format!("rule {rule_id}")))?;
        rule.is_active = !rule.is_active;
        self.store.insert_firewall_rule(&rule)?;
        self.reload_engine()?;
        Ok(rule)
    }

    /// Block rules from every threat indicator scoring at least 0.7;
    /// threat-sourced, 90-day expiry.
    pub fn sync_threat_rules(&self) -> Result<Value, MeshError> {
        let indicators = self
            .store
            .threat_indicators_with_score(THREAT_SCORE_THRESHOLD)?;
        let expires = (Utc::now() + Duration::days(THREAT_RULE_EXPIRY_DAYS)).to_rfc3339();

        let mut created = 0;
        for indicator in &indicators {
            let target = indicator
                .subnet_prefix
                .split('/')
                .next()
                .unwrap_or(&indicator.subnet_prefix)
                .to_string();
            let rule_id = format!("threat-{}", indicator.id);
            if self.store.get_firewall_rule(&rule_id)?.is_some() {
                continue;
            }
            self.store.insert_firewall_rule(&FirewallRuleRecord {
                id: rule_id,
                rule_type: "block_ip".to_string(),
                target,
                direction: "both".to_string(),
                protocol: "any".to_string(),
                source: "threat_intel".to_string(),
                reason: format!("High threat score: {:.2}", indicator.threat_score),
                is_active: true,
                created_at: now_iso(),
                expires_at: Some(expires.clone()),
                hit_count: 0,
            })?;
            created += 1;
        }
        self.reload_engine()?;

        Ok(json!({
            "status": "ok",
            "rules_created": created,
            "indicators_checked": indicators.len(),
        }))
    }

    /// Seed block rules for the high-risk port table. Idempotent: a port
    /// with an existing remediation-sourced rule is skipped.
    pub fn sync_port_rules(&self) -> Result<Value, MeshError> {
        let mut created = 0;
        for (port, reason) in HIGH_RISK_PORTS {
            let target = port.to_string();
            if self
                .store
                .find_firewall_rule("block_port", &target, "remediation")?
                .is_some()
            {
                continue;
            }
            self.store.insert_firewall_rule(&FirewallRuleRecord {
                id: Uuid::new_v4().to_string(),
                rule_type: "block_port".to_string(),
                target,
                direction: "inbound".to_string(),
                protocol: "tcp".to_string(),
                source: "remediation".to_string(),
                reason: format!("High-risk port {port}: {reason}"),
                is_active: true,
                created_at: now_iso(),
                expires_at: None,
                hit_count: 0,
            })?;
            created += 1;
        }
        self.reload_engine()?;

        Ok(json!({ "status": "ok", "rules_created": created }))
    }

    pub fn log_event(&self, event: FirewallEventRecord) -> Result<(), MeshError> {
        self.store.log_firewall_event(&event)
    }

    pub fn get_events(&self, limit: usize) -> Result<Vec<FirewallEventRecord>, MeshError> {
        self.store.list_firewall_events(limit)
    }

    /// Status summary: rule counts, today's event counts, protection level.
    pub async fn status(&self) -> Result<Value, MeshError> {
        let total_rules = self.store.list_firewall_rules(false, None)?.len();
        let active_rules = self.store.list_firewall_rules(true, None)?.len();

        let today_start = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc()
            .to_rfc3339();
        let blocked_today = self
            .store
            .count_firewall_events_since("blocked", &today_start)?;
        let allowed_today = self
            .store
            .count_firewall_events_since("allowed", &today_start)?;

        let protection_level = if active_rules >= 5 { "full" } else { "partial" };

        Ok(json!({
            "is_enabled": true,
            "platform": std::env::consts::OS,
            "adapter": self.adapter.get_status().await,
            "total_rules": total_rules,
            "active_rules": active_rules,
            "blocked_today": blocked_today,
            "allowed_today": allowed_today,
            "protection_level": protection_level,
            "engine": self.engine.read().stats(),
            "last_updated": now_iso(),
        }))
    }

    /// Push the active rule set into the platform adapter.
    pub async fn apply_to_adapter(&self) -> Result<(), MeshError> {
        let rules = self.store.list_firewall_rules(true, None)?;
        self.adapter
            .apply_rules(&rules)
            .await
            .map_err(MeshError::External)
    }
}

fn validate_rule(rule: &FirewallRuleRecord) -> Result<(), MeshError> {
    const RULE_TYPES: &[&str] = &[
        "block_ip",
        "allow_ip",
        "block_port",
        "allow_port",
        "block_domain",
        "allow_domain",
    ];
    if !RULE_TYPES.contains(&rule.rule_type.as_str()) {
        return Err(MeshError::Validation(format!(
            "unknown rule_type '{}'",
            rule.rule_type
        )));
    }
    if rule.target.is_empty() {
        return Err(MeshError::Validation("rule target must not be empty".to_string()));
    }
    if matches!(rule.rule_type.as_str(), "block_port" | "allow_port")
        && rule.target.parse::<u16>().is_err()
    {
        return Err(MeshError::Validation(format!(
            "port rule target '{}' is not a port number",
            rule.target
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::ThreatIndicatorRecord;

    fn service() -> FirewallService {
        FirewallService::new(Arc::new(EntityStore::temporary().unwrap())).unwrap()
    }

    fn block_ip_rule(target: &str) -> FirewallRuleRecord {
        FirewallRuleRecord {
            id: String::new(),
            rule_type: "block_ip".to_string(),
            target: target.to_string(),
            direction: "both".to_string(),
            protocol: "any".to_string(),
            source: "user".to_string(),
            reason: "test".to_string(),
            is_active: true,
            created_at: String::new(),
            expires_at: None,
            hit_count: 0,
        }
    }

    #[test]
    fn test_add_rule_roundtrip() {
        let svc = service();
        let rule = svc.add_rule(block_ip_rule("10.0.0.99")).unwrap();
        assert!(!rule.id.is_empty());

        let rules = svc.get_rules(true, None).unwrap();
        assert_eq!(rules.len(), 1);

        let (verdict, matched) = svc.evaluate("10.0.0.99", 443, "tcp", None, "outbound");
        assert_eq!(verdict, Verdict::Blocked);
        assert_eq!(matched.unwrap().id, rule.id);
    }

    #[test]
    fn test_remove_rule_deactivates() {
        let svc = service();
        let rule = svc.add_rule(block_ip_rule("10.0.0.99")).unwrap();
        svc.remove_rule(&rule.id).unwrap();

        assert!(svc.get_rules(true, None).unwrap().is_empty());
        assert_eq!(svc.get_rules(false, None).unwrap().len(), 1);
        let (verdict, _) = svc.evaluate("10.0.0.99", 443, "tcp", None, "outbound");
        assert_eq!(verdict, Verdict::Allowed);
    }

    #[test]
    fn test_sync_port_rules_idempotent() {
        let svc = service();
        let first = svc.sync_port_rules().unwrap();
        assert_eq!(first["rules_created"], HIGH_RISK_PORTS.len());

        let second = svc.sync_port_rules().unwrap();
        assert_eq!(second["rules_created"], 0);

        let (verdict, _) = svc.evaluate("10.0.0.1", 445, "tcp", None, "inbound");
        assert_eq!(verdict, Verdict::Blocked);
    }

    #[test]
    fn test_sync_threat_rules_threshold() {
        let svc = service();
        for (id, score) in [("t1", 0.9), ("t2", 0.5)] {
            svc.store
                .insert_threat_indicator(&ThreatIndicatorRecord {
                    id: id.to_string(),
                    subnet_prefix: format!("203.0.113.{}/24", if id == "t1" { 1 } else { 2 }),
                    threat_score: score,
                    source: "collective".to_string(),
                    last_seen: now_iso(),
                })
                .unwrap();
        }

        let result = svc.sync_threat_rules().unwrap();
        assert_eq!(result["rules_created"], 1);
        assert_eq!(result["indicators_checked"], 1);

        let rules = svc.get_rules(true, Some("block_ip")).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].source, "threat_intel");
        assert!(rules[0].expires_at.is_some());
    }

    #[test]
    fn test_validate_rejects_bad_rules() {
        let svc = service();
        let mut rule = block_ip_rule("10.0.0.1");
        rule.rule_type = "nonsense".to_string();
        assert!(svc.add_rule(rule).is_err());

        let mut rule = block_ip_rule("not-a-port");
        rule.rule_type = "block_port".to_string();
        assert!(svc.add_rule(rule).is_err());
    }

    #[test]
    fn test_blocked_verdict_logs_event_and_counts_hit() {
        let svc = service();
        let rule = svc.add_rule(block_ip_rule("10.0.0.99")).unwrap();

        svc.evaluate("10.0.0.99", 443, "tcp", None, "outbound");
        svc.evaluate("10.0.0.99", 80, "tcp", None, "outbound");

        let stored = svc.store.get_firewall_rule(&rule.id).unwrap().unwrap();
        assert_eq!(stored.hit_count, 2);

        let events = svc.get_events(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "blocked");
        assert_eq!(events[0].rule_id.as_deref(), Some(rule.id.as_str()));

        // Allowed traffic leaves no event.
        svc.evaluate("10.0.0.1", 443, "tcp", None, "outbound");
        assert_eq!(svc.get_events(10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_status_protection_level() {
        let svc = service();
        let status = svc.status().await.unwrap();
        assert_eq!(status["protection_level"], "partial");

        svc.sync_port_rules().unwrap();
        let status = svc.status().await.unwrap();
        assert_eq!(status["protection_level"], "full");
    }
}
