//! OWASP Basic Probes Module
//! =========================
//! Non-destructive detection probes: error-based SQL injection, reflected
//! XSS, directory traversal, information disclosure, and open redirects.
//! GET requests only; no state changes.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use crate::shield::models::{FindingSeverity, ShieldFinding};
use crate::shield::modules::{probe_client, ModuleError, ScanModule};
use aho_corasick::AhoCorasick;
use async_trait::async_trait;
use lazy_static::lazy_static;
use serde_json::json;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// SQL error patterns indicating potential SQL injection vulnerability.
const SQL_ERROR_PATTERNS: &[&str] = &[
    "you have an error in your sql syntax",
    "unclosed quotation mark",
    "quoted string not properly terminated",
    "syntax error at or near",
    "ORA-",
    "mysql_fetch",
    "pg_query",
    "sqlite3.OperationalError",
];

const SQLI_PAYLOAD: &str = "?id=' OR 1=1--";
const XSS_PAYLOAD: &str = "<script>alert(1)</script>";

const TRAVERSAL_PAYLOADS: &[&str] = &[
    "../../etc/passwd",
    "../../../etc/passwd",
    "..%2f..%2fetc%2fpasswd",
];
const TRAVERSAL_SUCCESS_INDICATOR: &str = "/root:";

/// Information disclosure paths to check.
const DISCLOSURE_PATHS: &[(&str, &str)] = &[
    ("/.env", "Environment File Exposed"),
    ("/phpinfo.php", "PHPInfo Page Exposed"),
    ("/server-status", "Apache Server Status Exposed"),
    ("/debug", "Debug Page Exposed"),
    ("/.git/HEAD", "Git Repository Exposed"),
    ("/wp-config.php.bak", "WordPress Config Backup Exposed"),
    ("/actuator/health", "Spring Actuator Exposed"),
];

const REDIRECT_TEST_URL: &str = "https://evil.example.com";

lazy_static! {
    static ref SQL_ERROR_MATCHER: AhoCorasick = AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(SQL_ERROR_PATTERNS)
        .expect("static pattern set");
}

/// Return the first SQL error pattern present in a response body.
pub fn match_sql_error(body: &str) -> Option<&'static str> {
    SQL_ERROR_MATCHER
        .find(body)
        .map(|m| SQL_ERROR_PATTERNS[m.pattern().as_usize()])
}

/// OWASP detection probes module.
pub struct OwaspProbesModule;

impl OwaspProbesModule {
    pub fn new() -> Self {
        OwaspProbesModule
    }

    /// Resolve a responding base URL, trying HTTPS then HTTP.
    async fn build_base_url(&self, target: &str, port: Option<u16>) -> Option<String> {
        let candidates = match port {
            Some(443) => vec![format!("https://{target}")],
            Some(8443) => vec![format!("https://{target}:8443")],
            Some(80) => vec![format!("http://{target}")],
            Some(p) => vec![
                format!("https://{target}:{p}"),
                format!("http://{target}:{p}"),
            ],
            None => vec![format!("https://{target}"), format!("http://{target}")],
        };

        let client = probe_client(DEFAULT_TIMEOUT).ok()?;
        for url in candidates {
            if client.head(&url).send().await.is_ok() {
                return Some(url);
            }
        }
        None
    }

    /// GET a URL and return (status, body prefix). Status 0 means no answer.
    async fn http_get(&self, url: &str) -> (u16, String) {
        let Ok(client) = probe_client(DEFAULT_TIMEOUT) else {
            return (0, String::new());
        };
        match client.get(url).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                let truncated: String = body.chars().take(65_536).collect();
                (status, truncated)
            }
            Err(_) => (0, String::new()),
        }
    }

    async fn check_sql_injection(
        &self,
        base_url: &str,
        target: &str,
        port: Option<u16>,
    ) -> Vec<ShieldFinding> {
        let test_url = format!("{base_url}/{SQLI_PAYLOAD}");
        let (status, body) = self.http_get(&test_url).await;
        if status == 0 {
            return Vec::new();
        }

        let Some(pattern) = match_sql_error(&body) else {
            return Vec::new();
        };

        vec![ShieldFinding::new(
            "owasp",
            FindingSeverity::Critical,
            "Potential SQL Injection Detected",
        )
        .description(format!(
            "SQL error pattern detected in response from {test_url}. \
             The application may be vulnerable to SQL injection attacks. \
             Matched pattern: '{pattern}'"
        ))
        .remediation(
            "Use parameterized queries or prepared statements. \
             Never concatenate user input into SQL queries. \
             Implement input validation and use an ORM where possible.",
        )
        .target(target, port)
        .evidence(json!({
            "url": test_url,
            "matched_pattern": pattern,
            "status_code": status,
            "response_snippet": body.chars().take(500).collect::<String>(),
        }))
        .attack("T1190", "Initial Access")]
    }

    async fn check_xss(
        &self,
        base_url: &str,
        target: &str,
        port: Option<u16>,
    ) -> Vec<ShieldFinding> {
        let test_url = format!("{base_url}/?q={XSS_PAYLOAD}");
        let (status, body) = self.http_get(&test_url).await;
        if status == 0 || !body.contains(XSS_PAYLOAD) {
            return Vec::new();
        }

        vec![ShieldFinding::new(
            "owasp",
            FindingSeverity::High,
            "Potential Reflected XSS Detected",
        )
        .description(format!(
            "The XSS payload was reflected in the response from {test_url}. \
             The application may be vulnerable to cross-site scripting attacks."
        ))
        .remediation(
            "Implement proper output encoding/escaping for all user-controlled data. \
             Use Content-Security-Policy headers. \
             Consider using a template engine with auto-escaping enabled.",
        )
        .target(target, port)
        .evidence(json!({
            "url": test_url,
            "payload": XSS_PAYLOAD,
            "reflected": true,
            "status_code": status,
        }))
        .attack("T1059.007", "Execution")]
    }

    async fn check_directory_traversal(
        &self,
        base_url: &str,
        target: &str,
        port: Option<u16>,
    ) -> Vec<ShieldFinding> {
        for payload in TRAVERSAL_PAYLOADS {
            let test_url = format!("{base_url}/?file={payload}");
            let (status, body) = self.http_get(&test_url).await;
            if status == 0 {
                continue;
            }
            if body.contains(TRAVERSAL_SUCCESS_INDICATOR) {
                return vec![ShieldFinding::new(
                    "owasp",
                    FindingSeverity::Critical,
                    "Directory Traversal Detected",
                )
                .description(format!(
                    "The response from {test_url} contains passwd file content. \
                     The application allows reading arbitrary files from the server."
                ))
                .remediation(
                    "Never pass user input to filesystem APIs. \
                     Canonicalize and validate paths against an allowlist, \
                     and run the service with minimal filesystem permissions.",
                )
                .target(target, port)
                .evidence(json!({
                    "url": test_url,
                    "payload": payload,
                    "indicator": TRAVERSAL_SUCCESS_INDICATOR,
                    "status_code": status,
                }))
                .attack("T1083", "Discovery")];
            }
        }
        Vec::new()
    }

    async fn check_info_disclosure(
        &self,
        base_url: &str,
        target: &str,
        port: Option<u16>,
    ) -> Vec<ShieldFinding> {
        let mut findings = Vec::new();
        for (path, title) in DISCLOSURE_PATHS {
            let test_url = format!("{base_url}{path}");
            let (status, body) = self.http_get(&test_url).await;
            if status == 200 && !body.is_empty() {
                findings.push(
                    ShieldFinding::new("owasp", FindingSeverity::High, title)
                        .description(format!(
                            "{test_url} returned HTTP 200 with content. \
                             This path exposes sensitive configuration or runtime details."
                        ))
                        .remediation(format!(
                            "Remove or block access to {path}. \
                             Serve application files through an allowlist and deny dotfiles."
                        ))
                        .target(target, port)
                        .evidence(json!({
                            "url": test_url,
                            "path": path,
                            "status_code": status,
                            "body_length": body.len(),
                        }))
                        .attack("T1190", "Initial Access"),
                );
            }
        }
        findings
    }

    async fn check_open_redirect(
        &self,
        base_url: &str,
        target: &str,
        port: Option<u16>,
    ) -> Vec<ShieldFinding> {
        // probe_client never follows redirects, so Location is observable.
        let test_url = format!("{base_url}/?url={REDIRECT_TEST_URL}");
        let Ok(client) = probe_client(DEFAULT_TIMEOUT) else {
            return Vec::new();
        };
        let Ok(resp) = client.get(&test_url).send().await else {
            return Vec::new();
        };

        let status = resp.status().as_u16();
        let location = resp
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = resp.text().await.unwrap_or_default();

        let redirected = location.contains(REDIRECT_TEST_URL);
        let echoed = body.contains(REDIRECT_TEST_URL);
        if !redirected && !echoed {
            return Vec::new();
        }

        vec![ShieldFinding::new(
            "owasp",
            FindingSeverity::Medium,
            "Potential Open Redirect Detected",
        )
        .description(format!(
            "The application at {test_url} {} an attacker-controlled URL.",
            if redirected {
                "redirects to"
            } else {
                "echoes"
            }
        ))
        .remediation(
            "Validate redirect targets against an allowlist of internal paths. \
             Never redirect to a URL taken verbatim from request parameters.",
        )
        .target(target, port)
        .evidence(json!({
            "url": test_url,
            "location": location,
            "echoed_in_body": echoed,
            "status_code": status,
        }))
        .attack("T1566.002", "Initial Access")]
    }
}

impl Default for OwaspProbesModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScanModule for OwaspProbesModule {
    fn name(&self) -> &'static str {
        "owasp"
    }

    fn weight(&self) -> u32 {
        5
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn scan(
        &self,
        target: &str,
        port: Option<u16>,
    ) -> Result<Vec<ShieldFinding>, ModuleError> {
        let Some(base_url) = self.build_base_url(target, port).await else {
            return Ok(vec![ShieldFinding::new(
                "owasp",
                FindingSeverity::Info,
                "No Web Service Reachable",
            )
            .description(format!(
                "Neither HTTPS nor HTTP answered on {target}; OWASP probes were skipped."
            ))
            .remediation("No action needed for non-web targets.")
            .target(target, port)
            .evidence(json!({ "reachable": false }))]);
        };

        let mut findings = Vec::new();
        findings.extend(self.check_sql_injection(&base_url, target, port).await);
        findings.extend(self.check_xss(&base_url, target, port).await);
        findings.extend(self.check_directory_traversal(&base_url, target, port).await);
        findings.extend(self.check_info_disclosure(&base_url, target, port).await);
        findings.extend(self.check_open_redirect(&base_url, target, port).await);
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_error_patterns_match() {
        assert_eq!(
            match_sql_error("You have an error in your SQL syntax near line 3"),
            Some("you have an error in your sql syntax")
        );
        assert_eq!(
            match_sql_error("ERROR: syntax error at or near \"'\""),
            Some("syntax error at or near")
        );
        assert_eq!(match_sql_error("ORA-01756: quoted string"), Some("ORA-"));
        assert_eq!(match_sql_error("<html>hello world</html>"), None);
    }

    #[test]
    fn test_sql_error_case_insensitive() {
        assert!(match_sql_error("UNCLOSED QUOTATION MARK after string").is_some());
        assert!(match_sql_error("MySQL_Fetch_Array() warning").is_some());
    }

    #[test]
    fn test_traversal_indicator() {
        let passwd = "root:x:0:0:root:/root:/bin/bash";
        assert!(passwd.contains(TRAVERSAL_SUCCESS_INDICATOR));
    }

    #[test]
    fn test_disclosure_paths_table() {
        assert_eq!(DISCLOSURE_PATHS.len(), 7);
        assert!(DISCLOSURE_PATHS.iter().any(|(p, _)| *p == "/.env"));
        assert!(DISCLOSURE_PATHS.iter().any(|(p, _)| *p == "/.git/HEAD"));
        assert!(DISCLOSURE_PATHS.iter().any(|(p, _)| *p == "/actuator/health"));
    }
}
