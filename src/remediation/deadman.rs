//! Dead-Man-Switch
//! ===============
//! Periodic audit of agent heartbeats; a silent agent triggers a
//! rate-limited alert.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use crate::error::MeshError;
use crate::store::entities::AgentRecord;
use crate::store::EntityStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Minimum spacing between alerts for one agent.
const ALERT_WINDOW_SECS: i64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadManConfig {
    pub enabled: bool,
    pub timeout_minutes: u32,
}

impl Default for DeadManConfig {
    fn default() -> Self {
        DeadManConfig {
            enabled: true,
            timeout_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadManStatus {
    pub agent_id: String,
    pub agent_name: String,
    pub last_heartbeat: Option<String>,
    pub minutes_since_heartbeat: Option<f64>,
    pub is_alive: bool,
    pub alert_triggered: bool,
}

/// Monitors agent heartbeats and raises alerts on silence.
pub struct DeadManSwitch {
    config: Mutex<DeadManConfig>,
    /// agent_id -> last alert time
    alerts_sent: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DeadManSwitch {
    pub fn new(config: DeadManConfig) -> Self {
        DeadManSwitch {
            config: Mutex::new(config),
            alerts_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> DeadManConfig {
        self.config.lock().clone()
    }

    pub fn update_config(&self, config: DeadManConfig) {
        *self.config.lock() = config;
    }

    /// Audit every active agent; silent ones get a (rate-limited) alert.
    pub fn check_agents(&self, store: &EntityStore) -> Result<Vec<DeadManStatus>, MeshError> {
        let now = Utc::now();
        let mut statuses = Vec::new();

        for agent in store.list_agents()? {
            if !agent.is_active {
                continue;
            }
            let status = self.evaluate_agent(&agent, now);
            if status.alert_triggered {
                self.trigger_alert(
                    &status.agent_id,
                    status.minutes_since_heartbeat.unwrap_or(0.0),
                    now,
                );
            }
            statuses.push(status);
        }

        Ok(statuses)
    }

    /// Status for one agent; 404 surfaces at the route layer.
    pub fn agent_status(
        &self,
        store: &EntityStore,
        agent_id: &str,
    ) -> Result<Option<DeadManStatus>, MeshError> {
        Ok(store
            .get_agent(agent_id)?
            .map(|agent| self.evaluate_agent(&agent, Utc::now())))
    }

    /// Alert for one silent agent, at most once per agent per window.
    fn trigger_alert(&self, agent_id: &str, minutes_silent: f64, now: DateTime<Utc>) {
        let mut sent = self.alerts_sent.lock();
        if let Some(last) = sent.get(agent_id) {
            if (now - *last).num_seconds() < ALERT_WINDOW_SECS {
                return;
            }
        }
        sent.insert(agent_id.to_string(), now);

        // Email/webhook dispatch is a future extension; logging is the alert.
        warn!(
            agent_id,
            minutes_silent, "DEAD MAN SWITCH: agent has gone silent"
        );
    }

    fn evaluate_agent(&self, agent: &AgentRecord, now: DateTime<Utc>) -> DeadManStatus {
        let config = self.config();

        let Some(last_seen_raw) = agent.last_seen.as_deref() else {
            // Registered but never reported.
            return DeadManStatus {
                agent_id: agent.id.clone(),
                agent_name: agent.name.clone(),
                last_heartbeat: None,
                minutes_since_heartbeat: None,
                is_alive: false,
                alert_triggered: config.enabled,
            };
        };

        let Ok(last_seen) = DateTime::parse_from_rfc3339(last_seen_raw) else {
            return DeadManStatus {
                agent_id: agent.id.clone(),
                agent_name: agent.name.clone(),
                last_heartbeat: Some(last_seen_raw.to_string()),
                minutes_since_heartbeat: None,
                is_alive: false,
                alert_triggered: config.enabled,
            };
        };

        let minutes_since = (now - last_seen.with_timezone(&Utc)).num_seconds() as f64 / 60.0;
        let is_alive = minutes_since <= config.timeout_minutes as f64;

        DeadManStatus {
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            last_heartbeat: Some(last_seen_raw.to_string()),
            minutes_since_heartbeat: Some((minutes_since * 10.0).round() / 10.0),
            is_alive,
            alert_triggered: config.enabled && !is_alive,
        }
    }
}

impl Default for DeadManSwitch {
    fn default() -> Self {
        Self::new(DeadManConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn seed_agent(store: &EntityStore, id: &str, last_seen: Option<DateTime<Utc>>) {
        store
            .insert_agent(&AgentRecord {
                id: id.to_string(),
                name: format!("agent-{id}"),
                site_name: "HQ".to_string(),
                location: None,
                registered_at: Utc::now().to_rfc3339(),
                last_seen: last_seen.map(|t| t.to_rfc3339()),
                is_active: true,
                status: "online".to_string(),
                version: None,
                subnets: vec![],
                token_digest: format!("digest-{id}"),
            })
            .unwrap();
    }

    #[test]
    fn test_silence_audit() {
        let store = Arc::new(EntityStore::temporary().unwrap());
        let now = Utc::now();
        seed_agent(&store, "fresh", Some(now - Duration::minutes(5)));
        seed_agent(&store, "silent", Some(now - Duration::hours(2)));
        seed_agent(&store, "never", None);

        let switch = DeadManSwitch::default();
        let mut statuses = switch.check_agents(&store).unwrap();
        statuses.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        assert_eq!(statuses.len(), 3);

        let fresh = statuses.iter().find(|s| s.agent_id == "fresh").unwrap();
        assert!(fresh.is_alive);
        assert!(!fresh.alert_triggered);

        let silent = statuses.iter().find(|s| s.agent_id == "silent").unwrap();
        assert!(!silent.is_alive);
        assert!(silent.alert_triggered);
        assert!(silent.minutes_since_heartbeat.unwrap() > 100.0);

        let never = statuses.iter().find(|s| s.agent_id == "never").unwrap();
        assert!(never.last_heartbeat.is_none());
        assert!(never.minutes_since_heartbeat.is_none());
        assert!(!never.is_alive);
        assert!(never.alert_triggered);
    }

    #[test]
    fn test_timeout_boundary() {
        let store = Arc::new(EntityStore::temporary().unwrap());
        let now = Utc::now();
        seed_agent(&store, "edge", Some(now - Duration::minutes(29)));
        seed_agent(&store, "over", Some(now - Duration::minutes(31)));

        let switch = DeadManSwitch::default();
        let statuses = switch.check_agents(&store).unwrap();
        assert!(statuses.iter().find(|s| s.agent_id == "edge").unwrap().is_alive);
        assert!(!statuses.iter().find(|s| s.agent_id == "over").unwrap().is_alive);
    }

    #[test]
    fn test_disabled_switch_never_alerts() {
        let store = Arc::new(EntityStore::temporary().unwrap());
        seed_agent(&store, "silent", Some(Utc::now() - Duration::hours(5)));

        let switch = DeadManSwitch::new(DeadManConfig {
            enabled: false,
            timeout_minutes: 30,
        });
        let statuses = switch.check_agents(&store).unwrap();
        assert!(!statuses[0].alert_triggered);
        assert!(!statuses[0].is_alive);
    }

    #[test]
    fn test_alert_rate_limited_per_agent() {
        let switch = DeadManSwitch::default();
        let now = Utc::now();
        switch.trigger_alert("a1", 60.0, now);
        // A second alert inside the window is swallowed.
        switch.trigger_alert("a1", 61.0, now + Duration::seconds(30));
        assert_eq!(switch.alerts_sent.lock().len(), 1);
        let first = *switch.alerts_sent.lock().get("a1").unwrap();
        assert_eq!(first, now);

        // Outside the window the alert fires and the timestamp moves.
        switch.trigger_alert("a1", 70.0, now + Duration::seconds(601));
        let second = *switch.alerts_sent.lock().get("a1").unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_inactive_agents_excluded() {
        let store = Arc::new(EntityStore::temporary().unwrap());
        seed_agent(&store, "gone", None);
        store.update_agent("gone", |a| a.is_active = false).unwrap();

        let switch = DeadManSwitch::default();
        assert!(switch.check_agents(&store).unwrap().is_empty());
    }
}
