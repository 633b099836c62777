//! Entity Store
//! ============
//! Schema-agnostic persistence over an embedded sled database: one tree per
//! entity, JSON rows keyed by id, explicit junction trees, and secondary
//! indexes. Referential integrity and (ip, mac) uniqueness are enforced
//! here rather than in a schema.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

pub mod entities;

use crate::error::MeshError;
use chrono::Utc;
use entities::*;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

/// Current UTC timestamp in the canonical RFC 3339 form used everywhere.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Fields of a discovery scan accepted for ingest.
#[derive(Debug, Clone)]
pub struct ScanIngest {
    pub target: String,
    pub scan_method: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub is_root: bool,
    pub assets: Vec<Value>,
    pub agent_id: Option<String>,
    pub site_name: Option<String>,
}

/// The process-wide entity store.
///
/// Multi-tree writes serialize through `write_lock`; compound operations
/// insert their owning row last, so a visible scan implies its junction and
/// change rows are present.
pub struct EntityStore {
    db: sled::Db,
    agents: sled::Tree,
    agents_by_digest: sled::Tree,
    scans: sled::Tree,
    assets: sled::Tree,
    assets_by_key: sled::Tree,
    scan_assets: sled::Tree,
    asset_changes: sled::Tree,
    commands: sled::Tree,
    firewall_rules: sled::Tree,
    firewall_events: sled::Tree,
    collective_signals: sled::Tree,
    threat_indicators: sled::Tree,
    remediation_history: sled::Tree,
    shield_scans: sled::Tree,
    shield_findings: sled::Tree,
    subnets: sled::Tree,
    switches: sled::Tree,
    certificates: sled::Tree,
    write_lock: Mutex<()>,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, MeshError> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MeshError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn tree_values<T: DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>, MeshError> {
    let mut out = Vec::new();
    for entry in tree.iter() {
        let (_, value) = entry?;
        out.push(decode(&value)?);
    }
    Ok(out)
}

/// Composite key for the (ip, mac) uniqueness index.
fn asset_key(ip: &str, mac: Option<&str>) -> String {
    format!("{ip}|{}", mac.unwrap_or("-"))
}

impl EntityStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory store for tests.
    pub fn temporary() -> Result<Self, MeshError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, MeshError> {
        Ok(EntityStore {
            agents: db.open_tree("agents")?,
            agents_by_digest: db.open_tree("agents_by_digest")?,
            scans: db.open_tree("scans")?,
            assets: db.open_tree("assets")?,
            assets_by_key: db.open_tree("assets_by_key")?,
            scan_assets: db.open_tree("scan_assets")?,
            asset_changes: db.open_tree("asset_changes")?,
            commands: db.open_tree("commands")?,
            firewall_rules: db.open_tree("firewall_rules")?,
            firewall_events: db.open_tree("firewall_events")?,
            collective_signals: db.open_tree("collective_signals")?,
            threat_indicators: db.open_tree("threat_indicators")?,
            remediation_history: db.open_tree("remediation_history")?,
            shield_scans: db.open_tree("shield_scans")?,
            shield_findings: db.open_tree("shield_findings")?,
            subnets: db.open_tree("subnets")?,
            switches: db.open_tree("switches")?,
            certificates: db.open_tree("certificates")?,
            db,
            write_lock: Mutex::new(()),
        })
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    pub fn insert_agent(&self, agent: &AgentRecord) -> Result<(), MeshError> {
        let _guard = self.write_lock.lock();
        self.agents_by_digest
            .insert(agent.token_digest.as_bytes(), agent.id.as_bytes())?;
        self.agents.insert(agent.id.as_bytes(), encode(agent)?)?;
        Ok(())
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, MeshError> {
        Ok(self
            .agents
            .get(agent_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()?)
    }

    /// Token verification lookup: digest index, then the active check.
    pub fn find_agent_by_digest(&self, digest: &str) -> Result<Option<AgentRecord>, MeshError> {
        let Some(id_bytes) = self.agents_by_digest.get(digest.as_bytes())? else {
            return Ok(None);
        };
        let id = String::from_utf8_lossy(&id_bytes).to_string();
        Ok(self.get_agent(&id)?.filter(|agent| agent.is_active))
    }

    pub fn list_agents(&self) -> Result<Vec<AgentRecord>, MeshError> {
        let mut agents: Vec<AgentRecord> = tree_values(&self.agents)?;
        agents.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        Ok(agents)
    }

    /// Apply a mutation to an agent row and persist it.
    pub fn update_agent(
        &self,
        agent_id: &str,
        mutate: impl FnOnce(&mut AgentRecord),
    ) -> Result<AgentRecord, MeshError> {
        let _guard = self.write_lock.lock();
        let mut agent = self
            .get_agent(agent_id)?
            .ok_or_else(|| MeshError::NotFound(format!("agent {agent_id}")))?;
        mutate(&mut agent);
        self.agents.insert(agent.id.as_bytes(), encode(&agent)?)?;
        Ok(agent)
    }

    /// Atomically replace an agent's token digest; the old digest stops
    /// resolving as soon as the index entry moves.
    pub fn rotate_agent_digest(
        &self,
        agent_id: &str,
        new_digest: &str,
    ) -> Result<AgentRecord, MeshError> {
        let _guard = self.write_lock.lock();
        let mut agent = self
            .get_agent(agent_id)?
            .ok_or_else(|| MeshError::NotFound(format!("agent {agent_id}")))?;
        self.agents_by_digest.remove(agent.token_digest.as_bytes())?;
        agent.token_digest = new_digest.to_string();
        self.agents_by_digest
            .insert(new_digest.as_bytes(), agent.id.as_bytes())?;
        self.agents.insert(agent.id.as_bytes(), encode(&agent)?)?;
        Ok(agent)
    }

    // ------------------------------------------------------------------
    // Discovery scans and assets
    // ------------------------------------------------------------------

    /// Persist an entire scan result, upserting assets and detecting
    /// changes. Returns the generated scan id.
    ///
    /// The scan row is written last: readers never observe a scan whose
    /// junction rows or change events are missing.
    pub fn save_scan(&self, ingest: &ScanIngest) -> Result<String, MeshError> {
        // Validate up front so a bad payload leaves no partial state.
        for asset in &ingest.assets {
            if asset.get("ip").and_then(Value::as_str).is_none() {
                return Err(MeshError::Validation(
                    "every asset requires an 'ip' field".to_string(),
                ));
            }
        }

        let _guard = self.write_lock.lock();
        let scan_id = Uuid::new_v4().to_string();
        let now = now_iso();

        for asset_data in &ingest.assets {
            let asset_id = self.upsert_asset(
                asset_data,
                &scan_id,
                &now,
                ingest.agent_id.as_deref(),
                ingest.site_name.as_deref(),
            )?;

            let open_ports: Vec<u16> = asset_data
                .get("open_ports")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(|v| v.as_u64().and_then(|n| u16::try_from(n).ok()))
                        .collect()
                })
                .unwrap_or_default();

            let junction = ScanAssetRecord {
                scan_id: scan_id.clone(),
                asset_id: asset_id.clone(),
                open_ports,
                confidence_score: asset_data
                    .get("confidence_score")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                category: asset_data
                    .get("category")
                    .and_then(Value::as_str)
                    .unwrap_or("unclassified")
                    .to_string(),
                raw_evidence: asset_data
                    .get("raw_evidence")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({})),
            };
            let key = format!("{scan_id}|{asset_id}");
            self.scan_assets.insert(key.as_bytes(), encode(&junction)?)?;
        }

        let scan = ScanRecord {
            id: scan_id.clone(),
            target: ingest.target.clone(),
            scan_method: ingest.scan_method.clone(),
            started_at: ingest.started_at.clone(),
            completed_at: ingest.completed_at.clone(),
            total_assets: ingest.assets.len() as u32,
            is_root: ingest.is_root,
            agent_id: ingest.agent_id.clone(),
            site_name: ingest.site_name.clone(),
        };
        self.scans.insert(scan.id.as_bytes(), encode(&scan)?)?;
        Ok(scan_id)
    }

    /// Insert or update an asset, logging one AssetChange per mutated
    /// tracked field. Caller holds the write lock.
    fn upsert_asset(
        &self,
        asset_data: &Value,
        scan_id: &str,
        now: &str,
        agent_id: Option<&str>,
        site_name: Option<&str>,
    ) -> Result<String, MeshError> {
        let ip = asset_data
            .get("ip")
            .and_then(Value::as_str)
            .expect("validated by save_scan");
        let mac = asset_data.get("mac").and_then(Value::as_str);
        let field = |name: &str| asset_data.get(name).and_then(Value::as_str).map(String::from);
        let category = asset_data
            .get("category")
            .and_then(Value::as_str)
            .unwrap_or("unclassified")
            .to_string();
        let confidence = asset_data
            .get("confidence_score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let scan_method = asset_data
            .get("scan_method")
            .and_then(Value::as_str)
            .unwrap_or("passive")
            .to_string();

        let key = asset_key(ip, mac);
        let existing = match self.assets_by_key.get(key.as_bytes())? {
            Some(id_bytes) => {
                let id = String::from_utf8_lossy(&id_bytes).to_string();
                self.assets
                    .get(id.as_bytes())?
                    .map(|bytes| decode::<AssetRecord>(&bytes))
                    .transpose()?
            }
            None => None,
        };

        let Some(mut existing) = existing else {
            let asset = AssetRecord {
                id: Uuid::new_v4().to_string(),
                ip: ip.to_string(),
                mac: mac.map(String::from),
                hostname: field("hostname"),
                vendor: field("vendor"),
                os_hint: field("os_hint"),
                category,
                confidence_score: confidence,
                scan_method,
                first_seen: field("first_seen").unwrap_or_else(|| now.to_string()),
                last_seen: field("last_seen").unwrap_or_else(|| now.to_string()),
                agent_id: agent_id.map(String::from),
                site_name: site_name.map(String::from),
                is_ignored: false,
                manual_category: None,
                manual_note: None,
                switch_host: None,
                switch_port: None,
                switch_port_index: None,
            };
            self.assets_by_key.insert(key.as_bytes(), asset.id.as_bytes())?;
            self.assets.insert(asset.id.as_bytes(), encode(&asset)?)?;
            self.push_change(AssetChangeRecord {
                id: 0,
                asset_id: asset.id.clone(),
                scan_id: scan_id.to_string(),
                change_type: "new_asset".to_string(),
                field_name: None,
                old_value: None,
                new_value: None,
                detected_at: now.to_string(),
            })?;
            return Ok(asset.id);
        };

        // Existing asset: diff the tracked fields before overwriting.
        let incoming: Vec<(&str, Option<String>)> = vec![
            ("hostname", field("hostname")),
            ("vendor", field("vendor")),
            ("os_hint", field("os_hint")),
            ("category", Some(category.clone())),
            ("confidence_score", Some(confidence.to_string())),
            ("scan_method", Some(scan_method.clone())),
        ];
        let current: Vec<(&str, Option<String>)> = vec![
            ("hostname", existing.hostname.clone()),
            ("vendor", existing.vendor.clone()),
            ("os_hint", existing.os_hint.clone()),
            ("category", Some(existing.category.clone())),
            (
                "confidence_score",
                Some(existing.confidence_score.to_string()),
            ),
            ("scan_method", Some(existing.scan_method.clone())),
        ];

        for ((name, new_value), (_, old_value)) in incoming.iter().zip(current.iter()) {
            if new_value != old_value {
                self.push_change(AssetChangeRecord {
                    id: 0,
                    asset_id: existing.id.clone(),
                    scan_id: scan_id.to_string(),
                    change_type: "field_changed".to_string(),
                    field_name: Some(name.to_string()),
                    old_value: old_value.clone(),
                    new_value: new_value.clone(),
                    detected_at: now.to_string(),
                })?;
            }
        }

        existing.hostname = field("hostname");
        existing.vendor = field("vendor");
        existing.os_hint = field("os_hint");
        existing.category = category;
        existing.confidence_score = confidence;
        existing.scan_method = scan_method;
        existing.last_seen = field("last_seen").unwrap_or_else(|| now.to_string());
        if existing.agent_id.is_none() {
            existing.agent_id = agent_id.map(String::from);
        }
        if existing.site_name.is_none() {
            existing.site_name = site_name.map(String::from);
        }
        self.assets
            .insert(existing.id.as_bytes(), encode(&existing)?)?;
        Ok(existing.id)
    }

    fn push_change(&self, mut change: AssetChangeRecord) -> Result<(), MeshError> {
        let seq = self.db.generate_id()?;
        change.id = seq;
        self.asset_changes
            .insert(seq.to_be_bytes(), encode(&change)?)?;
        Ok(())
    }

    /// Direct asset insert used by the add-device path; duplicates on
    /// (ip, mac) are an integrity violation, not an upsert.
    pub fn insert_asset(&self, asset: &AssetRecord) -> Result<(), MeshError> {
        let _guard = self.write_lock.lock();
        let key = asset_key(&asset.ip, asset.mac.as_deref());
        if self.assets_by_key.get(key.as_bytes())?.is_some() {
            return Err(MeshError::Integrity(format!(
                "asset ({}, {:?}) already exists",
                asset.ip, asset.mac
            )));
        }
        self.assets_by_key.insert(key.as_bytes(), asset.id.as_bytes())?;
        self.assets.insert(asset.id.as_bytes(), encode(asset)?)?;
        Ok(())
    }

    pub fn get_scan(&self, scan_id: &str) -> Result<Option<ScanRecord>, MeshError> {
        Ok(self
            .scans
            .get(scan_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()?)
    }

    pub fn list_assets(&self) -> Result<Vec<AssetRecord>, MeshError> {
        tree_values(&self.assets)
    }

    pub fn find_asset_by_ip(&self, ip: &str) -> Result<Option<AssetRecord>, MeshError> {
        for entry in self.assets.iter() {
            let (_, value) = entry?;
            let asset: AssetRecord = decode(&value)?;
            if asset.ip == ip {
                return Ok(Some(asset));
            }
        }
        Ok(None)
    }

    /// Most recent ScanAsset junction for an asset, ordered by the owning
    /// scan's started-at.
    pub fn latest_scan_asset(&self, asset_id: &str) -> Result<Option<ScanAssetRecord>, MeshError> {
        let mut best: Option<(String, ScanAssetRecord)> = None;
        for entry in self.scan_assets.iter() {
            let (_, value) = entry?;
            let junction: ScanAssetRecord = decode(&value)?;
            if junction.asset_id != asset_id {
                continue;
            }
            let started = self
                .get_scan(&junction.scan_id)?
                .map(|s| s.started_at)
                .unwrap_or_default();
            if best.as_ref().map(|(ts, _)| started > *ts).unwrap_or(true) {
                best = Some((started, junction));
            }
        }
        Ok(best.map(|(_, junction)| junction))
    }

    pub fn changes_for_scan(&self, scan_id: &str) -> Result<Vec<AssetChangeRecord>, MeshError> {
        let mut out = Vec::new();
        for entry in self.asset_changes.iter() {
            let (_, value) = entry?;
            let change: AssetChangeRecord = decode(&value)?;
            if change.scan_id == scan_id {
                out.push(change);
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Agent commands
    // ------------------------------------------------------------------

    pub fn insert_command(&self, command: &AgentCommandRecord) -> Result<(), MeshError> {
        self.commands
            .insert(command.id.as_bytes(), encode(command)?)?;
        Ok(())
    }

    pub fn get_command(&self, command_id: &str) -> Result<Option<AgentCommandRecord>, MeshError> {
        Ok(self
            .commands
            .get(command_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()?)
    }

    pub fn update_command(&self, command: &AgentCommandRecord) -> Result<(), MeshError> {
        self.insert_command(command)
    }

    /// Commands for an agent in the given statuses, newest first.
    pub fn commands_for_agent(
        &self,
        agent_id: &str,
        statuses: &[&str],
    ) -> Result<Vec<AgentCommandRecord>, MeshError> {
        let mut out: Vec<AgentCommandRecord> = tree_values::<AgentCommandRecord>(&self.commands)?
            .into_iter()
            .filter(|c| c.agent_id == agent_id && statuses.contains(&c.status.as_str()))
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    pub fn pending_command_count(&self, agent_id: &str) -> Result<usize, MeshError> {
        Ok(self.commands_for_agent(agent_id, &["pending"])?.len())
    }

    // ------------------------------------------------------------------
    // Firewall
    // ------------------------------------------------------------------

    pub fn insert_firewall_rule(&self, rule: &FirewallRuleRecord) -> Result<(), MeshError> {
        self.firewall_rules
            .insert(rule.id.as_bytes(), encode(rule)?)?;
        Ok(())
    }

    pub fn get_firewall_rule(&self, rule_id: &str) -> Result<Option<FirewallRuleRecord>, MeshError> {
        Ok(self
            .firewall_rules
            .get(rule_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()?)
    }

    pub fn list_firewall_rules(
        &self,
        active_only: bool,
        rule_type: Option<&str>,
    ) -> Result<Vec<FirewallRuleRecord>, MeshError> {
        let mut rules: Vec<FirewallRuleRecord> =
            tree_values::<FirewallRuleRecord>(&self.firewall_rules)?
                .into_iter()
                .filter(|r| !active_only || r.is_active)
                .filter(|r| rule_type.map(|t| r.rule_type == t).unwrap_or(true))
                .collect();
        rules.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rules)
    }

    /// Idempotence probe for rule syncs.
    pub fn find_firewall_rule(
        &self,
        rule_type: &str,
        target: &str,
        source: &str,
    ) -> Result<Option<FirewallRuleRecord>, MeshError> {
        for entry in self.firewall_rules.iter() {
            let (_, value) = entry?;
            let rule: FirewallRuleRecord = decode(&value)?;
            if rule.rule_type == rule_type && rule.target == target && rule.source == source {
                return Ok(Some(rule));
            }
        }
        Ok(None)
    }

    pub fn log_firewall_event(&self, event: &FirewallEventRecord) -> Result<(), MeshError> {
        let seq = self.db.generate_id()?;
        self.firewall_events
            .insert(seq.to_be_bytes(), encode(event)?)?;
        Ok(())
    }

    /// Recent firewall events, newest first.
    pub fn list_firewall_events(&self, limit: usize) -> Result<Vec<FirewallEventRecord>, MeshError> {
        let mut out = Vec::new();
        for entry in self.firewall_events.iter().rev() {
            let (_, value) = entry?;
            out.push(decode(&value)?);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    pub fn count_firewall_events_since(
        &self,
        action: &str,
        cutoff_iso: &str,
    ) -> Result<u64, MeshError> {
        let mut count = 0;
        for entry in self.firewall_events.iter() {
            let (_, value) = entry?;
            let event: FirewallEventRecord = decode(&value)?;
            if event.action == action && event.timestamp.as_str() >= cutoff_iso {
                count += 1;
            }
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Collective signals and threat indicators
    // ------------------------------------------------------------------

    pub fn insert_collective_signal(
        &self,
        signal: &CollectiveSignalRecord,
    ) -> Result<(), MeshError> {
        self.collective_signals
            .insert(signal.id.as_bytes(), encode(signal)?)?;
        Ok(())
    }

    pub fn collective_signals_since(
        &self,
        cutoff_iso: &str,
    ) -> Result<Vec<CollectiveSignalRecord>, MeshError> {
        Ok(tree_values::<CollectiveSignalRecord>(&self.collective_signals)?
            .into_iter()
            .filter(|s| s.reported_at.as_str() >= cutoff_iso)
            .collect())
    }

    pub fn count_signals_by_agent(&self, agent_hash: &str) -> Result<u64, MeshError> {
        Ok(tree_values::<CollectiveSignalRecord>(&self.collective_signals)?
            .iter()
            .filter(|s| s.agent_hash == agent_hash)
            .count() as u64)
    }

    /// Remove signals older than the cutoff. Returns the count removed.
    pub fn delete_signals_before(&self, cutoff_iso: &str) -> Result<usize, MeshError> {
        let _guard = self.write_lock.lock();
        let mut removed = 0;
        let stale: Vec<String> = tree_values::<CollectiveSignalRecord>(&self.collective_signals)?
            .into_iter()
            .filter(|s| s.reported_at.as_str() < cutoff_iso)
            .map(|s| s.id)
            .collect();
        for id in stale {
            if self.collective_signals.remove(id.as_bytes())?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn insert_threat_indicator(
        &self,
        indicator: &ThreatIndicatorRecord,
    ) -> Result<(), MeshError> {
        self.threat_indicators
            .insert(indicator.id.as_bytes(), encode(indicator)?)?;
        Ok(())
    }

    pub fn threat_indicators_with_score(
        &self,
        min_score: f64,
    ) -> Result<Vec<ThreatIndicatorRecord>, MeshError> {
        Ok(tree_values::<ThreatIndicatorRecord>(&self.threat_indicators)?
            .into_iter()
            .filter(|t| t.threat_score >= min_score)
            .collect())
    }

    // ------------------------------------------------------------------
    // Remediation history
    // ------------------------------------------------------------------

    pub fn insert_remediation(&self, record: &RemediationRecord) -> Result<(), MeshError> {
        self.remediation_history
            .insert(record.id.as_bytes(), encode(record)?)?;
        Ok(())
    }

    pub fn list_remediation_history(
        &self,
        limit: usize,
    ) -> Result<Vec<RemediationRecord>, MeshError> {
        let mut records: Vec<RemediationRecord> = tree_values(&self.remediation_history)?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }

    // ------------------------------------------------------------------
    // Peripheral inventory (upsert-by-key)
    // ------------------------------------------------------------------

    pub fn upsert_subnet(&self, subnet: &SubnetRecord) -> Result<(), MeshError> {
        self.subnets
            .insert(subnet.cidr.as_bytes(), encode(subnet)?)?;
        Ok(())
    }

    pub fn remove_subnet(&self, cidr: &str) -> Result<bool, MeshError> {
        Ok(self.subnets.remove(cidr.as_bytes())?.is_some())
    }

    pub fn list_subnets(&self) -> Result<Vec<SubnetRecord>, MeshError> {
        let mut subnets: Vec<SubnetRecord> = tree_values(&self.subnets)?;
        subnets.sort_by(|a, b| a.cidr.cmp(&b.cidr));
        Ok(subnets)
    }

    pub fn upsert_switch(&self, switch: &SwitchRecord) -> Result<(), MeshError> {
        self.switches
            .insert(switch.host.as_bytes(), encode(switch)?)?;
        Ok(())
    }

    pub fn list_switches(&self) -> Result<Vec<SwitchRecord>, MeshError> {
        tree_values(&self.switches)
    }

    pub fn upsert_certificate(&self, cert: &CertificateRecord) -> Result<(), MeshError> {
        let key = format!("{}:{}", cert.host, cert.port);
        self.certificates.insert(key.as_bytes(), encode(cert)?)?;
        Ok(())
    }

    pub fn list_certificates(&self) -> Result<Vec<CertificateRecord>, MeshError> {
        tree_values(&self.certificates)
    }

    // ------------------------------------------------------------------
    // Stored shield scans
    // ------------------------------------------------------------------

    /// Persist one shield scan and its findings together.
    pub fn save_shield_scan(
        &self,
        scan: &StoredShieldScan,
        findings: &[StoredShieldFinding],
    ) -> Result<(), MeshError> {
        let _guard = self.write_lock.lock();
        for finding in findings {
            let seq = self.db.generate_id()?;
            self.shield_findings
                .insert(seq.to_be_bytes(), encode(finding)?)?;
        }
        self.shield_scans.insert(scan.id.as_bytes(), encode(scan)?)?;
        Ok(())
    }

    pub fn get_shield_scan(&self, scan_id: &str) -> Result<Option<StoredShieldScan>, MeshError> {
        Ok(self
            .shield_scans
            .get(scan_id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()?)
    }

    /// Findings for a target IP filtered to the given severities, newest
    /// first, bounded by limit.
    pub fn shield_findings_for_ip(
        &self,
        ip: &str,
        severities: &[&str],
        limit: usize,
    ) -> Result<Vec<StoredShieldFinding>, MeshError> {
        let mut out = Vec::new();
        for entry in self.shield_findings.iter().rev() {
            let (_, value) = entry?;
            let finding: StoredShieldFinding = decode(&value)?;
            if finding.target_ip == ip && severities.contains(&finding.severity.as_str()) {
                out.push(finding);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Startup recovery: shield scans left in `running` by a dead process
    /// become `failed`.
    pub fn recover_stale_shield_scans(&self) -> Result<usize, MeshError> {
        let _guard = self.write_lock.lock();
        let mut recovered = 0;
        let stale: Vec<StoredShieldScan> = tree_values::<StoredShieldScan>(&self.shield_scans)?
            .into_iter()
            .filter(|s| s.status == "running")
            .collect();
        for mut scan in stale {
            scan.status = "failed".to_string();
            scan.completed_at.get_or_insert_with(now_iso);
            self.shield_scans.insert(scan.id.as_bytes(), encode(&scan)?)?;
            recovered += 1;
        }
        if recovered > 0 {
            warn!("marked {recovered} interrupted shield scan(s) as failed on recovery");
        }
        Ok(recovered)
    }

    pub fn flush(&self) -> Result<(), MeshError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Resolve the store path from `DATABASE_URL`, stripping URL-style scheme
/// prefixes, with a local default.
pub fn store_path_from_env() -> String {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let path = url
                .trim_start_matches("sqlite:///")
                .trim_start_matches("sqlite://")
                .trim_start_matches("file://")
                .to_string();
            info!("opening entity store at {path}");
            path
        }
        Err(_) => "aegis-data".to_string(),
    }
}
