//! Platform adapter seam for firewall enforcement.
//!
//! The rule engine is enforcement-free; adapters push the active rule set
//! into an OS mechanism (NEFilter on macOS, WFP on Windows). Adapters are
//! compiled in, never loaded dynamically; unsupported platforms run the
//! no-op adapter so the engine still works.

use crate::store::entities::FirewallRuleRecord;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

#[async_trait]
pub trait FirewallAdapter: Send + Sync {
    /// Install the platform enforcement hook.
    async fn install(&self) -> Result<(), String>;

    /// Replace the enforced rule set.
    async fn apply_rules(&self, rules: &[FirewallRuleRecord]) -> Result<(), String>;

    /// Adapter health/status payload.
    async fn get_status(&self) -> Value;

    /// Remove the platform enforcement hook.
    async fn uninstall(&self) -> Result<(), String>;

    fn platform_name(&self) -> &'static str;
}

/// Adapter for platforms without a kernel shim; matching still runs, and
/// every enforcement call is a logged no-op.
pub struct NoopFirewallAdapter;

#[async_trait]
impl FirewallAdapter for NoopFirewallAdapter {
    async fn install(&self) -> Result<(), String> {
        info!("no-op firewall adapter installed (matching only, no enforcement)");
        Ok(())
    }

    async fn apply_rules(&self, rules: &[FirewallRuleRecord]) -> Result<(), String> {
        info!("no-op firewall adapter received {} rule(s)", rules.len());
        Ok(())
    }

    async fn get_status(&self) -> Value {
        json!({
            "platform": self.platform_name(),
            "engine": "stub",
            "enforcing": false,
        })
    }

    async fn uninstall(&self) -> Result<(), String> {
        Ok(())
    }

    fn platform_name(&self) -> &'static str {
        "noop"
    }
}

/// Pick the adapter for the current platform. Real NEFilter/WFP shims live
/// out of tree; every build currently gets the no-op adapter.
pub fn platform_adapter() -> Box<dyn FirewallAdapter> {
    Box::new(NoopFirewallAdapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_adapter_accepts_everything() {
        let adapter = NoopFirewallAdapter;
        assert!(adapter.install().await.is_ok());
        assert!(adapter.apply_rules(&[]).await.is_ok());
        assert!(adapter.uninstall().await.is_ok());
        let status = adapter.get_status().await;
        assert_eq!(status["enforcing"], false);
    }
}
