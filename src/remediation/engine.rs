//! Remediation Engine
//! ==================
//! Turns open ports and shield findings into actionable remediation plans,
//! and dispatches auto-fixable actions to the owning agent as commands.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use crate::error::MeshError;
use crate::store::entities::{AgentCommandRecord, RemediationRecord, StoredShieldFinding};
use crate::store::{now_iso, EntityStore};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Static remediation knowledge for high-risk ports.
struct PortRemediation {
    port: u16,
    title: &'static str,
    description: &'static str,
    severity: &'static str,
    /// "firewall_rule" | "config_change"
    action_type: &'static str,
    auto_fixable: bool,
    estimated_impact: &'static str,
}

const PORT_REMEDIATIONS: &[PortRemediation] = &[
    PortRemediation {
        port: 21,
        title: "Block FTP",
        description: "FTP transmits credentials in plain text. Switch to SFTP.",
        severity: "high",
        action_type: "firewall_rule",
        auto_fixable: true,
        estimated_impact: "FTP file transfers stop working; use SFTP on port 22.",
    },
    PortRemediation {
        port: 23,
        title: "Block Telnet",
        description: "Telnet is unencrypted. Use SSH instead.",
        severity: "critical",
        action_type: "firewall_rule",
        auto_fixable: true,
        estimated_impact: "Telnet sessions drop; switch access to SSH on port 22.",
    },
    PortRemediation {
        port: 445,
        title: "Restrict SMB to Local Subnet",
        description: "SMB is a major ransomware vector (EternalBlue, WannaCry).",
        severity: "critical",
        action_type: "firewall_rule",
        auto_fixable: true,
        estimated_impact: "External SMB access is blocked; local file sharing is unaffected.",
    },
    PortRemediation {
        port: 3389,
        title: "Block Direct RDP, Use VPN",
        description: "RDP exposed to the internet is a brute force and BlueKeep target.",
        severity: "critical",
        action_type: "firewall_rule",
        auto_fixable: true,
        estimated_impact: "Direct RDP closes; connect through a VPN instead.",
    },
    PortRemediation {
        port: 5900,
        title: "Secure or Disable VNC",
        description: "VNC is often unencrypted. Strengthen the password or disable it.",
        severity: "high",
        action_type: "config_change",
        auto_fixable: false,
        estimated_impact: "VNC remote desktop access may be affected.",
    },
    PortRemediation {
        port: 6379,
        title: "Secure Redis",
        description: "Redis is often unauthenticated. Bind to localhost and set a password.",
        severity: "high",
        action_type: "config_change",
        auto_fixable: true,
        estimated_impact: "External Redis access closes; point applications at localhost.",
    },
    PortRemediation {
        port: 27017,
        title: "Secure MongoDB",
        description: "MongoDB often runs without auth. Enable authentication and bind to localhost.",
        severity: "high",
        action_type: "config_change",
        auto_fixable: true,
        estimated_impact: "External MongoDB access closes; application reconfiguration may be needed.",
    },
    PortRemediation {
        port: 135,
        title: "Block MSRPC",
        description: "Windows RPC can be used for lateral movement.",
        severity: "medium",
        action_type: "firewall_rule",
        auto_fixable: true,
        estimated_impact: "Some Windows remote management functions may be affected.",
    },
    PortRemediation {
        port: 139,
        title: "Block NetBIOS Session",
        description: "SMB over NetBIOS is a ransomware vector.",
        severity: "high",
        action_type: "firewall_rule",
        auto_fixable: true,
        estimated_impact: "Legacy Windows file sharing may be affected; use SMB2/3.",
    },
    PortRemediation {
        port: 1433,
        title: "Restrict MSSQL Access",
        description: "MSSQL exposed to the network is a SQL injection and brute force target.",
        severity: "high",
        action_type: "firewall_rule",
        auto_fixable: true,
        estimated_impact: "External MSSQL access closes; connect via the application server.",
    },
    PortRemediation {
        port: 3306,
        title: "Restrict MySQL Access",
        description: "MySQL exposed to the network is a brute force target.",
        severity: "high",
        action_type: "firewall_rule",
        auto_fixable: true,
        estimated_impact: "External MySQL access closes.",
    },
    PortRemediation {
        port: 5432,
        title: "Restrict PostgreSQL Access",
        description: "PostgreSQL exposed to the network should be restricted.",
        severity: "medium",
        action_type: "firewall_rule",
        auto_fixable: true,
        estimated_impact: "External PostgreSQL access closes.",
    },
    PortRemediation {
        port: 9200,
        title: "Restrict Elasticsearch Access",
        description: "Elasticsearch often has no auth and exposes sensitive data.",
        severity: "high",
        action_type: "firewall_rule",
        auto_fixable: true,
        estimated_impact: "External Elasticsearch access closes.",
    },
];

/// One proposed fix.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationAction {
    pub id: String,
    pub title: String,
    pub description: String,
    pub severity: String,
    /// "firewall_rule" | "config_change" | "manual"
    pub action_type: String,
    pub target_ip: String,
    pub target_port: Option<u16>,
    pub auto_fixable: bool,
    pub estimated_impact: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemediationPlan {
    pub asset_ip: Option<String>,
    pub total_actions: u32,
    pub critical_count: u32,
    pub auto_fixable_count: u32,
    pub actions: Vec<RemediationAction>,
    pub generated_at: String,
}

impl RemediationPlan {
    fn from_actions(asset_ip: Option<String>, actions: Vec<RemediationAction>) -> Self {
        let critical_count = actions.iter().filter(|a| a.severity == "critical").count() as u32;
        let auto_fixable_count = actions.iter().filter(|a| a.auto_fixable).count() as u32;
        RemediationPlan {
            asset_ip,
            total_actions: actions.len() as u32,
            critical_count,
            auto_fixable_count,
            actions,
            generated_at: now_iso(),
        }
    }
}

/// Generates remediation plans for detected issues.
pub struct RemediationEngine {
    store: Arc<EntityStore>,
}

impl RemediationEngine {
    pub fn new(store: Arc<EntityStore>) -> Self {
        RemediationEngine { store }
    }

    /// Plan for one asset: dangerous open ports plus recent shield
    /// findings of severity critical/high/medium.
    pub fn generate_plan(&self, asset_ip: &str) -> Result<RemediationPlan, MeshError> {
        let Some(asset) = self.store.find_asset_by_ip(asset_ip)? else {
            return Ok(RemediationPlan::from_actions(
                Some(asset_ip.to_string()),
                Vec::new(),
            ));
        };

        let mut actions = Vec::new();

        let open_ports = self
            .store
            .latest_scan_asset(&asset.id)?
            .map(|junction| junction.open_ports)
            .unwrap_or_default();
        actions.extend(port_remediations(asset_ip, &open_ports));

        let findings =
            self.store
                .shield_findings_for_ip(asset_ip, &["critical", "high", "medium"], 20)?;
        for finding in &findings {
            actions.push(finding_remediation(asset_ip, finding));
        }

        Ok(RemediationPlan::from_actions(
            Some(asset_ip.to_string()),
            actions,
        ))
    }

    /// Network-wide plan: union over all non-ignored assets, deduplicated
    /// by (target_ip, target_port, action_type).
    pub fn generate_network_plan(&self) -> Result<RemediationPlan, MeshError> {
        let mut all_actions = Vec::new();
        for asset in self.store.list_assets()? {
            if asset.is_ignored {
                continue;
            }
            let open_ports = self
                .store
                .latest_scan_asset(&asset.id)?
                .map(|junction| junction.open_ports)
                .unwrap_or_default();
            all_actions.extend(port_remediations(&asset.ip, &open_ports));
        }

        let mut seen: HashSet<(String, Option<u16>, String)> = HashSet::new();
        let unique: Vec<RemediationAction> = all_actions
            .into_iter()
            .filter(|action| {
                seen.insert((
                    action.target_ip.clone(),
                    action.target_port,
                    action.action_type.clone(),
                ))
            })
            .collect();

        Ok(RemediationPlan::from_actions(None, unique))
    }

    /// Execute an action: dispatch a `remediate` command to the asset's
    /// agent, or fall back to a manual-intervention record.
    pub fn execute_action(&self, action_id: &str) -> Result<serde_json::Value, MeshError> {
        // Format: "port-{ip}-{port}" or "finding-{ip}-{finding_id}".
        let mut parts = action_id.splitn(3, '-');
        let (Some(kind), Some(target_ip), Some(_detail)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(MeshError::Validation(format!(
                "invalid action id '{action_id}'"
            )));
        };
        if !matches!(kind, "port" | "finding") {
            return Err(MeshError::Validation(format!(
                "unknown action kind '{kind}'"
            )));
        }

        let now = now_iso();
        let asset = self.store.find_asset_by_ip(target_ip)?;
        let agent_id = asset.and_then(|a| a.agent_id);

        let mut record = RemediationRecord {
            id: Uuid::new_v4().to_string(),
            asset_ip: target_ip.to_string(),
            action_type: kind.to_string(),
            title: action_id.to_string(),
            severity: "medium".to_string(),
            status: "executing".to_string(),
            created_at: now.clone(),
            executed_at: None,
            result: None,
        };

        if let Some(agent_id) = agent_id {
            let command = AgentCommandRecord {
                id: Uuid::new_v4().to_string(),
                agent_id: agent_id.clone(),
                command_type: "remediate".to_string(),
                params: json!({
                    "action_id": action_id,
                    "action_type": kind,
                    "target_ip": target_ip,
                }),
                status: "pending".to_string(),
                created_at: now,
                result: None,
            };
            self.store.insert_command(&command)?;
            self.store.insert_remediation(&record)?;

            return Ok(json!({
                "status": "ok",
                "message": "Remediation command dispatched to agent.",
                "action_id": action_id,
                "command_id": command.id,
                "agent_id": agent_id,
            }));
        }

        // No owning agent: record for manual follow-up.
        record.status = "pending".to_string();
        record.result = Some("No agent found. Manual intervention required.".to_string());
        self.store.insert_remediation(&record)?;

        Ok(json!({
            "status": "manual",
            "message": "No agent found. Manual intervention required.",
            "action_id": action_id,
        }))
    }

    pub fn history(&self, limit: usize) -> Result<Vec<RemediationRecord>, MeshError> {
        self.store.list_remediation_history(limit)
    }
}

/// Remediation actions for risky open ports.
fn port_remediations(ip: &str, ports: &[u16]) -> Vec<RemediationAction> {
    let mut actions = Vec::new();
    for &port in ports {
        if let Some(info) = PORT_REMEDIATIONS.iter().find(|r| r.port == port) {
            actions.push(RemediationAction {
                id: format!("port-{ip}-{port}"),
                title: info.title.to_string(),
                description: info.description.to_string(),
                severity: info.severity.to_string(),
                action_type: info.action_type.to_string(),
                target_ip: ip.to_string(),
                target_port: Some(port),
                auto_fixable: info.auto_fixable,
                estimated_impact: info.estimated_impact.to_string(),
            });
        }
    }
    actions
}

/// A remediation action derived from a shield finding; always manual.
fn finding_remediation(ip: &str, finding: &StoredShieldFinding) -> RemediationAction {
    let severity = match finding.severity.as_str() {
        sev @ ("critical" | "high" | "medium" | "low") => sev,
        _ => "medium",
    };
    RemediationAction {
        id: format!("finding-{ip}-{}", finding.id),
        title: if finding.title.is_empty() {
            "Security Finding".to_string()
        } else {
            finding.title.clone()
        },
        description: if finding.detail.is_empty() {
            "A security issue was detected.".to_string()
        } else {
            finding.detail.clone()
        },
        severity: severity.to_string(),
        action_type: "manual".to_string(),
        target_ip: ip.to_string(),
        target_port: finding.target_port,
        auto_fixable: false,
        estimated_impact: if finding.remediation.is_empty() {
            "Manual review required.".to_string()
        } else {
            finding.remediation.clone()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::{StoredShieldScan};
    use crate::store::ScanIngest;
    use serde_json::json;

    fn seed_asset_with_ports(store: &EntityStore, ip: &str, ports: &[u16]) {
        store
            .save_scan(&ScanIngest {
                target: format!("{ip}/32"),
                scan_method: "hybrid".to_string(),
                started_at: now_iso(),
                completed_at: None,
                is_root: false,
                assets: vec![json!({
                    "ip": ip,
                    "mac": format!("aa:bb:cc:dd:ee:{:02x}", ports.len()),
                    "open_ports": ports,
                })],
                agent_id: Some("agent-1".to_string()),
                site_name: Some("HQ".to_string()),
            })
            .unwrap();
    }

    #[test]
    fn test_plan_for_dangerous_ports() {
        let store = Arc::new(EntityStore::temporary().unwrap());
        seed_asset_with_ports(&store, "10.0.0.5", &[23, 445, 8080]);

        let engine = RemediationEngine::new(store);
        let plan = engine.generate_plan("10.0.0.5").unwrap();

        assert_eq!(plan.total_actions, 2);
        assert_eq!(plan.critical_count, 2);
        assert!(plan
            .actions
            .iter()
            .any(|a| a.id == "port-10.0.0.5-23" && a.auto_fixable));
        // Port 8080 is not in the dangerous table.
        assert!(!plan.actions.iter().any(|a| a.target_port == Some(8080)));
    }

    #[test]
    fn test_plan_unknown_asset_is_empty() {
        let engine = RemediationEngine::new(Arc::new(EntityStore::temporary().unwrap()));
        let plan = engine.generate_plan("10.9.9.9").unwrap();
        assert_eq!(plan.total_actions, 0);
    }

    #[test]
    fn test_plan_includes_shield_findings() {
        let store = Arc::new(EntityStore::temporary().unwrap());
        seed_asset_with_ports(&store, "10.0.0.5", &[]);
        store
            .save_shield_scan(
                &StoredShieldScan {
                    id: "sh_test".to_string(),
                    agent_id: None,
                    site_name: None,
                    target: "10.0.0.5".to_string(),
                    started_at: now_iso(),
                    completed_at: Some(now_iso()),
                    modules_run: vec!["tls".to_string()],
                    status: "completed".to_string(),
                },
                &[
                    StoredShieldFinding {
                        id: "f1".to_string(),
                        scan_id: "sh_test".to_string(),
                        module: "tls".to_string(),
                        severity: "high".to_string(),
                        title: "Self-Signed Certificate".to_string(),
                        detail: "self signed".to_string(),
                        target_ip: "10.0.0.5".to_string(),
                        target_port: Some(443),
                        remediation: "Replace the certificate.".to_string(),
                        raw: json!({}),
                    },
                    StoredShieldFinding {
                        id: "f2".to_string(),
                        scan_id: "sh_test".to_string(),
                        module: "tls".to_string(),
                        severity: "info".to_string(),
                        title: "Noise".to_string(),
                        detail: String::new(),
                        target_ip: "10.0.0.5".to_string(),
                        target_port: None,
                        remediation: String::new(),
                        raw: json!({}),
                    },
                ],
            )
            .unwrap();

        let engine = RemediationEngine::new(store);
        let plan = engine.generate_plan("10.0.0.5").unwrap();
        // Info findings are excluded.
        assert_eq!(plan.total_actions, 1);
        assert_eq!(plan.actions[0].id, "finding-10.0.0.5-f1");
        assert!(!plan.actions[0].auto_fixable);
    }

    #[test]
    fn test_network_plan_deduplicates() {
        let store = Arc::new(EntityStore::temporary().unwrap());
        // Same ip+port via two scans produces one action.
        seed_asset_with_ports(&store, "10.0.0.5", &[445]);
        seed_asset_with_ports(&store, "10.0.0.6", &[445]);

        let engine = RemediationEngine::new(store);
        let plan = engine.generate_network_plan().unwrap();
        assert_eq!(plan.total_actions, 2);
        let ips: HashSet<_> = plan.actions.iter().map(|a| a.target_ip.clone()).collect();
        assert_eq!(ips.len(), 2);
    }

    #[test]
    fn test_execute_dispatches_command_to_agent() {
        let store = Arc::new(EntityStore::temporary().unwrap());
        seed_asset_with_ports(&store, "10.0.0.5", &[23]);

        let engine = RemediationEngine::new(Arc::clone(&store));
        let result = engine.execute_action("port-10.0.0.5-23").unwrap();
        assert_eq!(result["status"], "ok");

        let commands = store.commands_for_agent("agent-1", &["pending"]).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].command_type, "remediate");
        assert_eq!(commands[0].params["target_ip"], "10.0.0.5");

        let history = engine.history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, "executing");
    }

    #[test]
    fn test_execute_without_agent_is_manual() {
        let store = Arc::new(EntityStore::temporary().unwrap());
        let engine = RemediationEngine::new(Arc::clone(&store));
        let result = engine.execute_action("port-10.9.9.9-23").unwrap();
        assert_eq!(result["status"], "manual");

        let history = engine.history(10).unwrap();
        assert_eq!(history[0].status, "pending");
    }

    #[test]
    fn test_execute_rejects_malformed_ids() {
        let engine = RemediationEngine::new(Arc::new(EntityStore::temporary().unwrap()));
        assert!(engine.execute_action("garbage").is_err());
        assert!(engine.execute_action("weird-10.0.0.1-23").is_err());
    }
}
