//! Shield Scan Modules
//! ===================
//! Pluggable security probes. Each module owns one assessment surface and
//! reports findings through the shared `ScanModule` contract; the
//! orchestrator never inspects module internals.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

pub mod credential_check;
pub mod cve_matcher;
pub mod dns_security;
pub mod http_headers;
pub mod owasp_probes;
pub mod port_scan;
pub mod tls_check;

use crate::shield::models::ShieldFinding;
use async_trait::async_trait;
use std::time::Duration;

/// User agent sent by all HTTP probes.
pub const PROBE_USER_AGENT: &str = "AegisMesh-Shield/1.0 (Security Scanner)";

/// Error raised by a module scan. The orchestrator treats any module error
/// as an isolated failure: it logs and records an empty finding list.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ModuleError(pub String);

impl From<reqwest::Error> for ModuleError {
    fn from(err: reqwest::Error) -> Self {
        ModuleError(err.to_string())
    }
}

impl From<std::io::Error> for ModuleError {
    fn from(err: std::io::Error) -> Self {
        ModuleError(err.to_string())
    }
}

/// Contract implemented by every shield scan module.
#[async_trait]
pub trait ScanModule: Send + Sync {
    /// Stable module name used for registration and finding tags.
    fn name(&self) -> &'static str;

    /// Contribution weight toward the composite score.
    fn weight(&self) -> u32;

    /// Whether the module's external dependencies are present on this host.
    fn is_available(&self) -> bool;

    /// Run the module against a target, optionally scoped to one port.
    async fn scan(
        &self,
        target: &str,
        port: Option<u16>,
    ) -> Result<Vec<ShieldFinding>, ModuleError>;
}

/// Check whether an executable exists on PATH.
pub(crate) fn binary_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(name).is_file())
}

/// HTTP client for probe traffic: certificate verification disabled so
/// misconfigured targets can still be inspected, redirects not followed.
pub(crate) fn probe_client(timeout: Duration) -> Result<reqwest::Client, ModuleError> {
    reqwest::Client::builder()
        .user_agent(PROBE_USER_AGENT)
        .danger_accept_invalid_certs(true)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .build()
        .map_err(ModuleError::from)
}

/// Strict client used where chain validation itself is the check.
pub(crate) fn verifying_client(timeout: Duration) -> Result<reqwest::Client, ModuleError> {
    reqwest::Client::builder()
        .user_agent(PROBE_USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(ModuleError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_on_path_finds_shell() {
        // Something from coreutils is present on every CI host.
        assert!(binary_on_path("ls") || binary_on_path("sh"));
        assert!(!binary_on_path("definitely-not-a-real-binary-xyz"));
    }
}
