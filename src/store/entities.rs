//! Persisted entity records.
//!
//! Every record is serialized to JSON inside its sled tree; identifiers are
//! opaque strings (UUIDs unless noted) and timestamps are RFC 3339 UTC.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of a remote scanner. Deactivated but never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub site_name: String,
    pub location: Option<String>,
    pub registered_at: String,
    pub last_seen: Option<String>,
    pub is_active: bool,
    /// "online" | "offline" | "scanning" | "stale"
    pub status: String,
    pub version: Option<String>,
    /// Subnet CIDRs this agent is authoritative for.
    pub subnets: Vec<String>,
    /// SHA-256 of the bearer token; plaintext is never persisted.
    pub token_digest: String,
}

/// Record of one discovery sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: String,
    pub target: String,
    pub scan_method: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub total_assets: u32,
    pub is_root: bool,
    pub agent_id: Option<String>,
    pub site_name: Option<String>,
}

/// Living record for a discovered device, unique on (ip, mac).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: String,
    pub ip: String,
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub os_hint: Option<String>,
    pub category: String,
    /// [0, 1]
    pub confidence_score: f64,
    pub scan_method: String,
    pub first_seen: String,
    pub last_seen: String,
    pub agent_id: Option<String>,
    pub site_name: Option<String>,
    pub is_ignored: bool,
    pub manual_category: Option<String>,
    pub manual_note: Option<String>,
    pub switch_host: Option<String>,
    pub switch_port: Option<String>,
    pub switch_port_index: Option<u32>,
}

/// Junction capturing the state of an asset at one scan instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanAssetRecord {
    pub scan_id: String,
    pub asset_id: String,
    pub open_ports: Vec<u16>,
    pub confidence_score: f64,
    pub category: String,
    pub raw_evidence: Value,
}

/// Audit log entry for asset mutations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetChangeRecord {
    /// Auto-numbered, monotonically increasing.
    pub id: u64,
    pub asset_id: String,
    pub scan_id: String,
    /// "new_asset" | "field_changed"
    pub change_type: String,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub detected_at: String,
}

/// Remote request queued for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCommandRecord {
    pub id: String,
    pub agent_id: String,
    pub command_type: String,
    pub params: Value,
    /// "pending" | "ack" | "running" | "completed" | "failed"
    pub status: String,
    pub created_at: String,
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRuleRecord {
    pub id: String,
    /// block_ip | allow_ip | block_port | allow_port | block_domain | allow_domain
    pub rule_type: String,
    pub target: String,
    /// "inbound" | "outbound" | "both"
    pub direction: String,
    /// "tcp" | "udp" | "any"
    pub protocol: String,
    /// "user" | "threat_intel" | "remediation"
    pub source: String,
    pub reason: String,
    pub is_active: bool,
    pub created_at: String,
    pub expires_at: Option<String>,
    pub hit_count: u64,
}

/// Append-only firewall observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallEventRecord {
    pub id: String,
    pub timestamp: String,
    /// "blocked" | "allowed"
    pub action: String,
    pub rule_id: Option<String>,
    pub src_ip: Option<String>,
    pub dst_ip: String,
    pub dst_port: u16,
    pub protocol: String,
    pub process_name: Option<String>,
    pub direction: String,
}

/// Anonymized threat report; only k-anonymous aggregates ever leave the
/// collective engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectiveSignalRecord {
    pub id: String,
    /// HMAC-SHA256 of the /24 CIDR.
    pub subnet_hash: String,
    /// "port_scan" | "malware_c2" | "brute_force" | "suspicious"
    pub signal_type: String,
    /// Noised severity in [0, 1].
    pub severity: f64,
    pub port: Option<u16>,
    /// HMAC-SHA256 of the agent id.
    pub agent_hash: String,
    pub reported_at: String,
    pub is_noised: bool,
}

/// High-confidence indicator feeding the firewall threat sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatIndicatorRecord {
    pub id: String,
    /// Subnet prefix, e.g. "203.0.113.0/24".
    pub subnet_prefix: String,
    pub threat_score: f64,
    pub source: String,
    pub last_seen: String,
}

/// History entry for an executed or pending remediation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationRecord {
    pub id: String,
    pub asset_ip: String,
    pub action_type: String,
    pub title: String,
    pub severity: String,
    /// "executing" | "pending" | "completed" | "failed"
    pub status: String,
    pub created_at: String,
    pub executed_at: Option<String>,
    pub result: Option<String>,
}

/// Monitored subnet; upsert-by-key on the CIDR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetRecord {
    pub cidr: String,
    pub description: Option<String>,
    pub site_name: Option<String>,
    pub added_at: String,
}

/// Known network switch; upsert-by-key on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchRecord {
    pub host: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub last_seen: String,
}

/// Observed TLS certificate; upsert-by-key on (host, port).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub host: String,
    pub port: u16,
    pub subject: Option<String>,
    pub issuer: Option<String>,
    pub not_after: Option<String>,
    pub last_checked: String,
}

/// Shield scan as ingested from an agent or persisted after completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredShieldScan {
    pub id: String,
    pub agent_id: Option<String>,
    pub site_name: Option<String>,
    pub target: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub modules_run: Vec<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredShieldFinding {
    pub id: String,
    pub scan_id: String,
    pub module: String,
    pub severity: String,
    pub title: String,
    pub detail: String,
    pub target_ip: String,
    pub target_port: Option<u16>,
    pub remediation: String,
    pub raw: Value,
}
