//! HTTP Security Headers Module
//! ============================
//! Checks for required security headers and information-leaking headers.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use crate::shield::models::{FindingSeverity, ShieldFinding};
use crate::shield::modules::{probe_client, ModuleError, ScanModule};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

struct RequiredHeader {
    header: &'static str,
    severity: FindingSeverity,
    title: &'static str,
    description: &'static str,
    remediation: &'static str,
}

/// Required security headers and the severity of their absence.
const REQUIRED_HEADERS: &[RequiredHeader] = &[
    RequiredHeader {
        header: "Strict-Transport-Security",
        severity: FindingSeverity::High,
        title: "HSTS Header Missing",
        description: "The Strict-Transport-Security (HSTS) header is not set. \
             Without HSTS, browsers may allow insecure HTTP connections, \
             exposing users to downgrade attacks and cookie hijacking.",
        remediation: "Add the header: Strict-Transport-Security: max-age=31536000; includeSubDomains; preload",
    },
    RequiredHeader {
        header: "Content-Security-Policy",
        severity: FindingSeverity::Medium,
        title: "Content-Security-Policy Header Missing",
        description: "The Content-Security-Policy (CSP) header is not set. \
             CSP helps prevent cross-site scripting (XSS), clickjacking, \
             and other code injection attacks.",
        remediation: "Add a Content-Security-Policy header. Start with a report-only policy \
             and tighten as needed: Content-Security-Policy: default-src 'self'",
    },
    RequiredHeader {
        header: "X-Frame-Options",
        severity: FindingSeverity::Medium,
        title: "X-Frame-Options Header Missing",
        description: "The X-Frame-Options header is not set. \
             This makes the site vulnerable to clickjacking attacks.",
        remediation: "Add the header: X-Frame-Options: DENY (or SAMEORIGIN if framing is needed).",
    },
    RequiredHeader {
        header: "X-Content-Type-Options",
        severity: FindingSeverity::Low,
        title: "X-Content-Type-Options Header Missing",
        description: "The X-Content-Type-Options header is not set. \
             Browsers may MIME-sniff responses, which can lead to XSS attacks.",
        remediation: "Add the header: X-Content-Type-Options: nosniff",
    },
    RequiredHeader {
        header: "Referrer-Policy",
        severity: FindingSeverity::Low,
        title: "Referrer-Policy Header Missing",
        description: "The Referrer-Policy header is not set. \
             Without it, the full URL may be sent in the Referer header to third-party sites, \
             potentially leaking sensitive information.",
        remediation: "Add the header: Referrer-Policy: strict-origin-when-cross-origin",
    },
    RequiredHeader {
        header: "Permissions-Policy",
        severity: FindingSeverity::Low,
        title: "Permissions-Policy Header Missing",
        description: "The Permissions-Policy header is not set. \
             This header controls which browser features (camera, microphone, geolocation, etc.) \
             the page is allowed to use.",
        remediation: "Add the header: Permissions-Policy: camera=(), microphone=(), geolocation=()",
    },
];

struct LeakHeader {
    header: &'static str,
    title: &'static str,
    description: &'static str,
    remediation: &'static str,
    /// Only flag when the value carries version-like information.
    check_value: bool,
}

/// Headers that leak information when present.
const INFO_LEAK_HEADERS: &[LeakHeader] = &[
    LeakHeader {
        header: "Server",
        title: "Server Header Information Disclosure",
        description: "The Server header reveals server software and version information. \
             Attackers can use this to target known vulnerabilities.",
        remediation: "Remove or obfuscate the Server header to avoid disclosing version information.",
        check_value: true,
    },
    LeakHeader {
        header: "X-Powered-By",
        title: "X-Powered-By Header Information Disclosure",
        description: "The X-Powered-By header reveals the technology stack in use. \
             Attackers can use this to target framework-specific vulnerabilities.",
        remediation: "Remove the X-Powered-By header from server responses.",
        check_value: false,
    },
];

lazy_static! {
    static ref VERSION_HINT_RE: Regex = Regex::new(r"\d+\.\d+").unwrap();
}

/// Whether a header value appears to contain version information
/// (a slash as in `nginx/1.19.0`, or a digit-dot-digit pattern).
pub fn has_version_info(value: &str) -> bool {
    value.contains('/') || VERSION_HINT_RE.is_match(value)
}

/// Check fetched headers (lowercase keys) against both tables.
pub fn analyze_headers(
    target: &str,
    port: u16,
    headers: &HashMap<String, String>,
    url_used: &str,
) -> Vec<ShieldFinding> {
    let mut findings = Vec::new();

    for req in REQUIRED_HEADERS {
        if !headers.contains_key(&req.header.to_lowercase()) {
            findings.push(
                ShieldFinding::new("headers", req.severity, req.title)
                    .description(req.description)
                    .remediation(req.remediation)
                    .target(target, Some(port))
                    .evidence(json!({
                        "missing_header": req.header,
                        "url_checked": url_used,
                    }))
                    .attack("T1190", "Initial Access"),
            );
        }
    }

    for leak in INFO_LEAK_HEADERS {
        if let Some(value) = headers.get(&leak.header.to_lowercase()) {
            if leak.check_value && !has_version_info(value) {
                continue;
            }
            findings.push(
                ShieldFinding::new("headers", FindingSeverity::Medium, leak.title)
                    .description(leak.description)
                    .remediation(leak.remediation)
                    .target(target, Some(port))
                    .evidence(json!({
                        "header": leak.header,
                        "value": value,
                        "url_checked": url_used,
                    }))
                    .attack("T1592", "Reconnaissance"),
            );
        }
    }

    findings
}

/// HTTP security headers check module.
pub struct HttpHeadersModule;

impl HttpHeadersModule {
    pub fn new() -> Self {
        HttpHeadersModule
    }

    /// HEAD the target, trying HTTPS first then HTTP. Returns lowercase
    /// header map and the URL that answered.
    async fn fetch_headers(
        &self,
        target: &str,
    ) -> Result<(HashMap<String, String>, String), ModuleError> {
        let client = probe_client(DEFAULT_TIMEOUT)?;
        let mut last_error = None;

        for url in [format!("https://{target}"), format!("http://{target}")] {
            match client.head(&url).send().await {
                Ok(resp) => {
                    let mut headers = HashMap::new();
                    for (key, value) in resp.headers() {
                        if let Ok(text) = value.to_str() {
                            headers.insert(key.as_str().to_lowercase(), text.to_string());
                        }
                    }
                    return Ok((headers, url));
                }
                Err(err) => last_error = Some(err),
            }
        }

        Err(ModuleError(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("failed to connect to {target}")),
        ))
    }
}

impl Default for HttpHeadersModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScanModule for HttpHeadersModule {
    fn name(&self) -> &'static str {
        "headers"
    }

    fn weight(&self) -> u32 {
        10
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn scan(
        &self,
        target: &str,
        port: Option<u16>,
    ) -> Result<Vec<ShieldFinding>, ModuleError> {
        let actual_port = port.unwrap_or(443);

        let (headers, url_used) = match self.fetch_headers(target).await {
            Ok(result) => result,
            Err(err) => {
                return Ok(vec![ShieldFinding::new(
                    "headers",
                    FindingSeverity::Medium,
                    "HTTP Connection Failed",
                )
                .description(format!(
                    "Could not connect to {target} to check HTTP headers: {err}"
                ))
                .remediation("Verify the target is reachable and serving HTTP/HTTPS.")
                .target(target, Some(actual_port))
                .evidence(json!({ "error": err.to_string() }))]);
            }
        };

        Ok(analyze_headers(target, actual_port, &headers, &url_used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_has_version_info() {
        assert!(has_version_info("nginx/1.19.0"));
        assert!(has_version_info("Apache 2.4"));
        assert!(!has_version_info("cloudflare"));
        assert!(!has_version_info("nginx"));
    }

    #[test]
    fn test_all_headers_missing() {
        let findings = analyze_headers("example.com", 443, &headers(&[]), "https://example.com");
        // Six missing required headers, no leaks.
        assert_eq!(findings.len(), 6);
        assert!(findings
            .iter()
            .any(|f| f.title == "HSTS Header Missing" && f.severity == FindingSeverity::High));
        assert!(findings.iter().all(|f| f.attack_technique.is_some()));
    }

    #[test]
    fn test_all_headers_present() {
        let h = headers(&[
            ("Strict-Transport-Security", "max-age=31536000"),
            ("Content-Security-Policy", "default-src 'self'"),
            ("X-Frame-Options", "DENY"),
            ("X-Content-Type-Options", "nosniff"),
            ("Referrer-Policy", "no-referrer"),
            ("Permissions-Policy", "camera=()"),
        ]);
        let findings = analyze_headers("example.com", 443, &h, "https://example.com");
        assert!(findings.is_empty());
    }

    #[test]
    fn test_server_header_only_flagged_with_version() {
        let all_required = [
            ("Strict-Transport-Security", "x"),
            ("Content-Security-Policy", "x"),
            ("X-Frame-Options", "x"),
            ("X-Content-Type-Options", "x"),
            ("Referrer-Policy", "x"),
            ("Permissions-Policy", "x"),
        ];

        let mut with_bare = all_required.to_vec();
        with_bare.push(("Server", "cloudflare"));
        let findings = analyze_headers("example.com", 443, &headers(&with_bare), "u");
        assert!(findings.is_empty());

        let mut with_version = all_required.to_vec();
        with_version.push(("Server", "nginx/1.19.0"));
        let findings = analyze_headers("example.com", 443, &headers(&with_version), "u");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, FindingSeverity::Medium);
        assert_eq!(findings[0].title, "Server Header Information Disclosure");
    }

    #[test]
    fn test_x_powered_by_flagged_unconditionally() {
        let mut pairs = vec![
            ("Strict-Transport-Security", "x"),
            ("Content-Security-Policy", "x"),
            ("X-Frame-Options", "x"),
            ("X-Content-Type-Options", "x"),
            ("Referrer-Policy", "x"),
            ("Permissions-Policy", "x"),
        ];
        pairs.push(("X-Powered-By", "PHP"));
        let findings = analyze_headers("example.com", 443, &headers(&pairs), "u");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].title, "X-Powered-By Header Information Disclosure");
    }
}
