//! DNS Security Records Module
//! ===========================
//! Email and certificate hygiene checks (SPF, DKIM, DMARC, CAA, MX) driven
//! by dig/nslookup subprocess queries.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use crate::shield::models::{FindingSeverity, ShieldFinding};
use crate::shield::modules::{binary_on_path, ModuleError, ScanModule};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;
use std::time::Duration;

/// DNS query timeout per record type.
const DNS_TIMEOUT: Duration = Duration::from_secs(15);

/// Common DKIM selector to check.
const DEFAULT_DKIM_SELECTOR: &str = "default";

lazy_static! {
    static ref DMARC_POLICY_RE: Regex = Regex::new(r"(?i)p\s*=\s*(\w+)").unwrap();
    static ref QUOTED_RE: Regex = Regex::new(r#""([^"]*)""#).unwrap();
}

/// Whether the target looks like an IP address (v4 or v6).
pub fn is_ip_address(target: &str) -> bool {
    let parts: Vec<&str> = target.split('.').collect();
    if parts.len() == 4 && parts.iter().all(|p| p.parse::<u8>().is_ok()) {
        return true;
    }
    target.contains(':')
}

/// Strip protocol prefix, port, and path from a target, leaving the domain.
pub fn strip_domain(target: &str) -> String {
    let mut domain = target.trim().to_string();
    for prefix in ["https://", "http://", "//"] {
        if let Some(rest) = domain.strip_prefix(prefix) {
            domain = rest.to_string();
            break;
        }
    }
    // IPv6 in brackets: [::1]:port
    if let Some(rest) = domain.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }
    // Bare IPv6 stays untouched.
    if domain.matches(':').count() > 1 {
        return domain;
    }
    if let Some((host, _)) = domain.split_once(':') {
        domain = host.to_string();
    }
    if let Some((host, _)) = domain.split_once('/') {
        domain = host.to_string();
    }
    domain
}

#[derive(Debug, Default, PartialEq)]
pub struct SpfRecord {
    pub found: bool,
    pub record: Option<String>,
    /// SPF should end with an `all` mechanism.
    pub valid: bool,
    pub policy_strict: bool,
}

/// Parse the SPF record out of a TXT record set.
pub fn parse_spf(txt_records: &[String]) -> SpfRecord {
    for record in txt_records {
        if record.to_lowercase().contains("v=spf1") {
            let mechanisms: Vec<&str> = record.split_whitespace().collect();
            let has_all = mechanisms
                .iter()
                .any(|m| matches!(m.to_lowercase().as_str(), "-all" | "~all" | "+all" | "?all"));
            let strict = mechanisms.iter().any(|m| m.to_lowercase() == "-all");
            return SpfRecord {
                found: true,
                record: Some(record.clone()),
                valid: has_all,
                policy_strict: strict,
            };
        }
    }
    SpfRecord::default()
}

#[derive(Debug, Default, PartialEq)]
pub struct DmarcRecord {
    pub found: bool,
    pub record: Option<String>,
    pub policy: Option<String>,
}

/// Parse the DMARC record out of a TXT record set.
pub fn parse_dmarc(txt_records: &[String]) -> DmarcRecord {
    for record in txt_records {
        if record.to_lowercase().contains("v=dmarc1") {
            let policy = DMARC_POLICY_RE
                .captures(record)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_lowercase())
                .unwrap_or_else(|| "none".to_string());
            return DmarcRecord {
                found: true,
                record: Some(record.clone()),
                policy: Some(policy),
            };
        }
    }
    DmarcRecord::default()
}

/// Severity for a DMARC policy level; `reject` is clean.
pub fn dmarc_policy_severity(policy: &str) -> Option<FindingSeverity> {
    match policy {
        "none" => Some(FindingSeverity::High),
        "quarantine" => Some(FindingSeverity::Low),
        _ => None,
    }
}

/// DNS security records check module.
pub struct DnsSecurityModule;

impl DnsSecurityModule {
    pub fn new() -> Self {
        DnsSecurityModule
    }

    /// Query one record type via dig (preferred) or nslookup.
    async fn query(&self, domain: &str, record_type: &str) -> Result<Vec<String>, ModuleError> {
        if binary_on_path("dig") {
            return self.query_with_dig(domain, record_type).await;
        }
        if binary_on_path("nslookup") {
            return self.query_with_nslookup(domain, record_type).await;
        }
        Err(ModuleError(
            "Neither dig nor nslookup found on system".to_string(),
        ))
    }

    async fn query_with_dig(
        &self,
        domain: &str,
        record_type: &str,
    ) -> Result<Vec<String>, ModuleError> {
        let mut cmd = tokio::process::Command::new("dig");
        cmd.args(["+short", record_type, domain]);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(DNS_TIMEOUT, cmd.output())
            .await
            .map_err(|_| {
                ModuleError(format!(
                    "DNS query timed out after {}s",
                    DNS_TIMEOUT.as_secs()
                ))
            })??;

        if !output.status.success() {
            let stderr_text = String::from_utf8_lossy(&output.stderr);
            return Err(ModuleError(format!(
                "dig exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr_text.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(|line| line.trim().trim_matches('"').to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    async fn query_with_nslookup(
        &self,
        domain: &str,
        record_type: &str,
    ) -> Result<Vec<String>, ModuleError> {
        let mut cmd = tokio::process::Command::new("nslookup");
        cmd.args([&format!("-type={record_type}"), domain]);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(DNS_TIMEOUT, cmd.output())
            .await
            .map_err(|_| {
                ModuleError(format!(
                    "DNS query timed out after {}s",
                    DNS_TIMEOUT.as_secs()
                ))
            })??;

        let text = String::from_utf8_lossy(&output.stdout);
        let mut records = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            let lower = line.to_lowercase();
            if lower.contains("text =") || lower.contains("txt") {
                if let Some(caps) = QUOTED_RE.captures(line) {
                    records.push(caps[1].to_string());
                }
            } else if record_type == "CAA" && (lower.contains("issue") || lower.contains("iodef")) {
                records.push(line.to_string());
            } else if record_type == "MX" && lower.contains("mail exchanger") {
                records.push(line.to_string());
            }
        }
        Ok(records)
    }
}

impl Default for DnsSecurityModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScanModule for DnsSecurityModule {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn weight(&self) -> u32 {
        10
    }

    fn is_available(&self) -> bool {
        binary_on_path("dig") || binary_on_path("nslookup")
    }

    async fn scan(
        &self,
        target: &str,
        _port: Option<u16>,
    ) -> Result<Vec<ShieldFinding>, ModuleError> {
        let mut findings = Vec::new();
        let domain = strip_domain(target);

        // DNS hygiene records only exist for domains.
        if is_ip_address(&domain) {
            findings.push(
                ShieldFinding::new("dns", FindingSeverity::Info, "DNS Checks Skipped")
                    .description(format!(
                        "Target {domain} is an IP address; SPF/DKIM/DMARC records apply to domains only."
                    ))
                    .remediation("Scan the associated domain name to check DNS security records.")
                    .target(&domain, None)
                    .evidence(json!({ "skipped": true, "reason": "ip_target" })),
            );
            return Ok(findings);
        }

        // SPF: TXT on the root.
        let root_txt = self.query(&domain, "TXT").await.unwrap_or_default();
        let spf = parse_spf(&root_txt);
        if !spf.found {
            findings.push(
                ShieldFinding::new("dns", FindingSeverity::High, "SPF Record Missing")
                    .description(format!(
                        "No SPF record found for {domain}. Attackers can spoof email from this domain."
                    ))
                    .remediation("Publish a TXT record such as: v=spf1 include:_spf.example.com -all")
                    .target(&domain, None)
                    .evidence(json!({ "txt_records": root_txt }))
                    .attack("T1566", "Initial Access"),
            );
        } else if !spf.valid {
            findings.push(
                ShieldFinding::new("dns", FindingSeverity::Medium, "SPF Record Without All Mechanism")
                    .description(format!(
                        "The SPF record for {domain} does not terminate with an 'all' mechanism, \
                         leaving the policy open-ended."
                    ))
                    .remediation("End the SPF record with -all (hard fail).")
                    .target(&domain, None)
                    .evidence(json!({ "spf_record": spf.record })),
            );
        } else if !spf.policy_strict {
            findings.push(
                ShieldFinding::new("dns", FindingSeverity::Low, "SPF Soft Fail Policy")
                    .description(format!(
                        "The SPF record for {domain} uses ~all (soft fail) instead of -all."
                    ))
                    .remediation("Tighten the SPF policy to -all once all senders are enumerated.")
                    .target(&domain, None)
                    .evidence(json!({ "spf_record": spf.record })),
            );
        }

        // DKIM: common selector only; other selectors may exist.
        let dkim_domain = format!("{DEFAULT_DKIM_SELECTOR}._domainkey.{domain}");
        let dkim_txt = self.query(&dkim_domain, "TXT").await.unwrap_or_default();
        if !dkim_txt.iter().any(|r| r.contains("v=DKIM1") || r.contains("k=rsa")) {
            findings.push(
                ShieldFinding::new("dns", FindingSeverity::Medium, "DKIM Selector Not Found")
                    .description(format!(
                        "No DKIM record found at {dkim_domain}. \
                         The domain may use a different selector; verify DKIM is configured."
                    ))
                    .remediation("Configure DKIM signing and publish the selector's public key.")
                    .target(&domain, None)
                    .evidence(json!({
                        "selector_checked": DEFAULT_DKIM_SELECTOR,
                        "caveat": "selector may differ",
                    })),
            );
        }

        // DMARC.
        let dmarc_domain = format!("_dmarc.{domain}");
        let dmarc_txt = self.query(&dmarc_domain, "TXT").await.unwrap_or_default();
        let dmarc = parse_dmarc(&dmarc_txt);
        if !dmarc.found {
            findings.push(
                ShieldFinding::new("dns", FindingSeverity::High, "DMARC Record Missing")
                    .description(format!(
                        "No DMARC record found for {domain}. \
                         Receiving servers cannot enforce SPF/DKIM alignment."
                    ))
                    .remediation(
                        "Publish a TXT record at _dmarc with at least: v=DMARC1; p=quarantine",
                    )
                    .target(&domain, None)
                    .evidence(json!({ "dmarc_domain": dmarc_domain }))
                    .attack("T1566", "Initial Access"),
            );
        } else if let Some(policy) = dmarc.policy.as_deref() {
            if let Some(severity) = dmarc_policy_severity(policy) {
                let (title, description, remediation) = if policy == "none" {
                    (
                        "DMARC Policy Set To None",
                        format!(
                            "The DMARC policy for {domain} is p=none, which only monitors \
                             and never rejects spoofed mail."
                        ),
                        "Move the DMARC policy to p=quarantine, then p=reject.",
                    )
                } else {
                    (
                        "DMARC Policy Set To Quarantine",
                        format!(
                            "The DMARC policy for {domain} is p=quarantine; \
                             spoofed mail is flagged but still delivered."
                        ),
                        "Move the DMARC policy to p=reject once alignment is verified.",
                    )
                };
                findings.push(
                    ShieldFinding::new("dns", severity, title)
                        .description(description)
                        .remediation(remediation)
                        .target(&domain, None)
                        .evidence(json!({
                            "policy": policy,
                            "dmarc_record": dmarc.record,
                        })),
                );
            }
        }

        // CAA.
        let caa_records = self.query(&domain, "CAA").await.unwrap_or_default();
        if caa_records.is_empty() {
            findings.push(
                ShieldFinding::new("dns", FindingSeverity::Low, "CAA Record Missing")
                    .description(format!(
                        "No CAA record found for {domain}. \
                         Any certificate authority may issue certificates for this domain."
                    ))
                    .remediation("Publish a CAA record restricting issuance, e.g.: 0 issue \"letsencrypt.org\"")
                    .target(&domain, None)
                    .evidence(json!({ "caa_records": [] })),
            );
        }

        // MX presence is context for the email checks above.
        let mx_records = self.query(&domain, "MX").await.unwrap_or_default();
        if !mx_records.is_empty() {
            findings.push(
                ShieldFinding::new("dns", FindingSeverity::Info, "MX Records Present")
                    .description(format!(
                        "{domain} publishes {} MX record(s); email hygiene findings apply.",
                        mx_records.len()
                    ))
                    .remediation("No action needed.")
                    .target(&domain, None)
                    .evidence(json!({ "mx_records": mx_records })),
            );
        }

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ip_address() {
        assert!(is_ip_address("192.168.1.1"));
        assert!(is_ip_address("fe80::1"));
        assert!(!is_ip_address("example.com"));
        assert!(!is_ip_address("999.1.1.1"));
        assert!(!is_ip_address("300.300.300.300"));
    }

    #[test]
    fn test_strip_domain() {
        assert_eq!(strip_domain("https://example.com/path"), "example.com");
        assert_eq!(strip_domain("example.com:8443"), "example.com");
        assert_eq!(strip_domain("http://example.com:8080/x"), "example.com");
        assert_eq!(strip_domain("[::1]:443"), "::1");
        assert_eq!(strip_domain("fe80::1"), "fe80::1");
        assert_eq!(strip_domain("example.com"), "example.com");
    }

    #[test]
    fn test_parse_spf_strict() {
        let spf = parse_spf(&["v=spf1 include:_spf.google.com -all".to_string()]);
        assert!(spf.found);
        assert!(spf.valid);
        assert!(spf.policy_strict);
    }

    #[test]
    fn test_parse_spf_soft_fail() {
        let spf = parse_spf(&["v=spf1 mx ~all".to_string()]);
        assert!(spf.found);
        assert!(spf.valid);
        assert!(!spf.policy_strict);
    }

    #[test]
    fn test_parse_spf_no_all() {
        let spf = parse_spf(&["v=spf1 include:example.com".to_string()]);
        assert!(spf.found);
        assert!(!spf.valid);
    }

    #[test]
    fn test_parse_spf_absent() {
        let spf = parse_spf(&["some other txt".to_string()]);
        assert!(!spf.found);
    }

    #[test]
    fn test_parse_dmarc() {
        let dmarc = parse_dmarc(&["v=DMARC1; p=reject; rua=mailto:d@example.com".to_string()]);
        assert!(dmarc.found);
        assert_eq!(dmarc.policy.as_deref(), Some("reject"));

        let dmarc = parse_dmarc(&["v=DMARC1;p = Quarantine".to_string()]);
        assert_eq!(dmarc.policy.as_deref(), Some("quarantine"));

        let dmarc = parse_dmarc(&["v=DMARC1".to_string()]);
        assert_eq!(dmarc.policy.as_deref(), Some("none"));
    }

    #[test]
    fn test_dmarc_policy_boundaries() {
        assert_eq!(dmarc_policy_severity("none"), Some(FindingSeverity::High));
        assert_eq!(
            dmarc_policy_severity("quarantine"),
            Some(FindingSeverity::Low)
        );
        assert_eq!(dmarc_policy_severity("reject"), None);
    }
}
