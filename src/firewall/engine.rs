//! Firewall Rule Engine
//! ====================
//! Platform-independent rule matching. Enforcement happens in a platform
//! adapter; this engine only evaluates connections against loaded rules.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use crate::metrics::FIREWALL_EVALUATIONS_TOTAL;
use crate::store::entities::FirewallRuleRecord;
use std::collections::HashSet;

/// Evaluation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allowed => "allowed",
            Verdict::Blocked => "blocked",
        }
    }
}

/// Rebuildable view of active rules with index sets for O(1) matching.
#[derive(Debug, Default)]
pub struct FirewallRuleEngine {
    rules: Vec<FirewallRuleRecord>,
    ip_blocklist: HashSet<String>,
    ip_allowlist: HashSet<String>,
    port_blocklist: HashSet<u16>,
    domain_blocklist: HashSet<String>,
    domain_allowlist: HashSet<String>,
}

impl FirewallRuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules and rebuild the lookup sets. Inactive rules are invisible.
    pub fn load_rules(&mut self, rules: Vec<FirewallRuleRecord>) {
        self.rules = rules.into_iter().filter(|r| r.is_active).collect();
        self.ip_blocklist.clear();
        self.ip_allowlist.clear();
        self.port_blocklist.clear();
        self.domain_blocklist.clear();
        self.domain_allowlist.clear();

        for rule in &self.rules {
            match rule.rule_type.as_str() {
                "block_ip" => {
                    self.ip_blocklist.insert(rule.target.clone());
                }
                "allow_ip" => {
                    self.ip_allowlist.insert(rule.target.clone());
                }
                "block_port" => {
                    if let Ok(port) = rule.target.parse::<u16>() {
                        self.port_blocklist.insert(port);
                    }
                }
                "block_domain" => {
                    self.domain_blocklist.insert(rule.target.to_lowercase());
                }
                "allow_domain" => {
                    self.domain_allowlist.insert(rule.target.to_lowercase());
                }
                _ => {}
            }
        }
    }

    /// Evaluate a connection against loaded rules.
    ///
    /// Precedence: allow rules beat block rules (whitelist wins), then
    /// IP block, port block, domain block, and a default allow.
    pub fn evaluate(
        &self,
        dest_ip: &str,
        dest_port: u16,
        _protocol: &str,
        domain: Option<&str>,
        _direction: &str,
    ) -> (Verdict, Option<&FirewallRuleRecord>) {
        let result = self.evaluate_inner(dest_ip, dest_port, domain);
        FIREWALL_EVALUATIONS_TOTAL
            .with_label_values(&[result.0.as_str()])
            .inc();
        result
    }

    fn evaluate_inner(
        &self,
        dest_ip: &str,
        dest_port: u16,
        domain: Option<&str>,
    ) -> (Verdict, Option<&FirewallRuleRecord>) {
        // 1. Whitelist always wins.
        if self.ip_allowlist.contains(dest_ip) {
            return (Verdict::Allowed, None);
        }
        if let Some(domain) = domain {
            if self.domain_allowlist.contains(&domain.to_lowercase()) {
                return (Verdict::Allowed, None);
            }
        }

        // 2. IP blocklist.
        if self.ip_blocklist.contains(dest_ip) {
            return (Verdict::Blocked, self.find_rule("block_ip", dest_ip));
        }

        // 3. Port blocklist.
        if self.port_blocklist.contains(&dest_port) {
            return (
                Verdict::Blocked,
                self.find_rule("block_port", &dest_port.to_string()),
            );
        }

        // 4. Domain blocklist.
        if let Some(domain) = domain {
            let lower = domain.to_lowercase();
            if self.domain_blocklist.contains(&lower) {
                return (Verdict::Blocked, self.find_rule("block_domain", &lower));
            }
        }

        // 5. Default allow.
        (Verdict::Allowed, None)
    }

    fn find_rule(&self, rule_type: &str, target: &str) -> Option<&FirewallRuleRecord> {
        self.rules
            .iter()
            .find(|rule| rule.rule_type == rule_type && rule.target == target)
    }

    /// Rule statistics for the status endpoint.
    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "total_rules": self.rules.len(),
            "ip_blocks": self.ip_blocklist.len(),
            "ip_allows": self.ip_allowlist.len(),
            "port_blocks": self.port_blocklist.len(),
            "domain_blocks": self.domain_blocklist.len(),
            "domain_allows": self.domain_allowlist.len(),
        })
    }
}
