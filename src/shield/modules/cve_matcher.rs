//! CVE Intelligence Module
//! =======================
//! Banner detection -> CPE mapping -> NVD lookup, enriched with EPSS scores
//! and CISA KEV membership. Severity priority blends CVSS, EPSS, and KEV.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use crate::shield::models::{FindingSeverity, ShieldFinding};
use crate::shield::modules::{ModuleError, ScanModule, PROBE_USER_AGENT};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

const BANNER_TIMEOUT: Duration = Duration::from_secs(5);
const API_TIMEOUT: Duration = Duration::from_secs(15);

/// Seconds between NVD requests without an API key.
const NVD_RATE_LIMIT: Duration = Duration::from_millis(6000);
/// Seconds between NVD requests with `NVD_API_KEY` set.
const NVD_RATE_LIMIT_KEYED: Duration = Duration::from_millis(600);

const KEV_CACHE_TTL: Duration = Duration::from_secs(86_400);

const NVD_API_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";
const EPSS_API_URL: &str = "https://api.first.org/data/v1/epss";
const KEV_FEED_URL: &str =
    "https://www.cisa.gov/sites/default/files/feeds/known_exploited_vulnerabilities.json";

const DEFAULT_PROBE_PORTS: &[u16] = &[22, 80, 443, 8080, 8443, 3306, 5432];

/// Maps lowercase service name prefixes to CPE vendor/product pairs.
/// Version is substituted at runtime via `banner_to_cpe`.
const CPE_MAP: &[(&str, (&str, &str))] = &[
    ("nginx", ("f5", "nginx")),
    ("apache", ("apache", "http_server")),
    ("openssh", ("openbsd", "openssh")),
    ("openssl", ("openssl", "openssl")),
    ("lighttpd", ("lighttpd", "lighttpd")),
    ("iis", ("microsoft", "internet_information_services")),
    ("mysql", ("oracle", "mysql")),
    ("mariadb", ("mariadb", "mariadb")),
    ("postgresql", ("postgresql", "postgresql")),
    ("redis", ("redis", "redis")),
    ("tomcat", ("apache", "tomcat")),
    ("postfix", ("postfix", "postfix")),
    ("exim", ("exim", "exim")),
    ("dovecot", ("dovecot", "dovecot")),
    ("proftpd", ("proftpd_project", "proftpd")),
    ("vsftpd", ("beasts", "vsftpd")),
    ("haproxy", ("haproxy", "haproxy")),
    ("envoy", ("envoyproxy", "envoy")),
    ("traefik", ("traefik", "traefik")),
    ("caddy", ("caddyserver", "caddy")),
    ("node.js", ("nodejs", "node.js")),
    ("express", ("expressjs", "express")),
    ("php", ("php", "php")),
    ("python", ("python", "python")),
];

const WEB_SERVICES: &[&str] = &[
    "nginx", "apache", "lighttpd", "iis", "tomcat", "http", "https", "http-proxy", "https-alt",
    "haproxy", "envoy", "traefik", "caddy", "node.js", "express", "php", "python",
];
const REMOTE_SERVICES: &[&str] = &["openssh", "ssh", "rdp", "vnc"];

lazy_static! {
    // Matches versions like /1.24.0, _8.9p1, " 2.4.57".
    static ref VERSION_RE: Regex = Regex::new(r"[/_\s-]?(\d+(?:\.\d+)+(?:p\d+)?)").unwrap();
    static ref P_SUFFIX_RE: Regex = Regex::new(r"p\d+$").unwrap();

    /// Process-wide KEV catalog cache; refresh is single-flight.
    static ref KEV_CACHE: RwLock<Option<(Instant, HashSet<String>)>> = RwLock::new(None);
    static ref KEV_REFRESH_GUARD: Mutex<()> = Mutex::new(());
}

/// Extract a version string from a service banner.
///
/// `"nginx/1.24.0"` -> `"1.24.0"`, `"OpenSSH_8.9p1"` -> `"8.9"`.
pub fn extract_version(banner: &str) -> Option<String> {
    let caps = VERSION_RE.captures(banner)?;
    let version = caps.get(1)?.as_str();
    Some(P_SUFFIX_RE.replace(version, "").into_owned())
}

/// Map a service banner/name to a CPE 2.3 string.
pub fn banner_to_cpe(service_name: &str, version: Option<&str>) -> Option<String> {
    let lower = service_name.to_lowercase();
    let (vendor, product) = CPE_MAP
        .iter()
        .find(|(prefix, _)| lower.contains(prefix))
        .map(|(_, vp)| *vp)?;

    let extracted;
    let ver_str = match version {
        Some(v) => v,
        None => match extract_version(service_name) {
            Some(v) => {
                extracted = v;
                &extracted
            }
            None => "*",
        },
    };
    Some(format!(
        "cpe:2.3:a:{vendor}:{product}:{ver_str}:*:*:*:*:*:*:*"
    ))
}

/// Finding severity from CVSS, EPSS and KEV status.
///
/// - critical: CVSS >= 9.0 AND (EPSS >= 0.5 OR KEV)
/// - high:     CVSS >= 7.0, OR (EPSS >= 0.3 AND CVSS >= 4.0), OR KEV
/// - medium:   CVSS >= 4.0
/// - low:      CVSS < 4.0
/// - info:     no CVSS available
pub fn calculate_priority(cvss: Option<f64>, epss: Option<f64>, kev: bool) -> FindingSeverity {
    let Some(cvss) = cvss else {
        return FindingSeverity::Info;
    };
    let epss = epss.unwrap_or(0.0);

    if cvss >= 9.0 && (epss >= 0.5 || kev) {
        return FindingSeverity::Critical;
    }
    if cvss >= 7.0 || (epss >= 0.3 && cvss >= 4.0) || kev {
        return FindingSeverity::High;
    }
    if cvss >= 4.0 {
        return FindingSeverity::Medium;
    }
    FindingSeverity::Low
}

/// Map a detected service to a MITRE ATT&CK technique and tactic.
pub fn attack_mapping(service: &str) -> (&'static str, &'static str) {
    let lower = service.to_lowercase();
    if WEB_SERVICES.iter().any(|ws| lower.contains(ws)) {
        return ("T1190", "Initial Access");
    }
    if REMOTE_SERVICES.iter().any(|rs| lower.contains(rs)) {
        return ("T1133", "Persistence");
    }
    // Default for database / other services
    ("T1190", "Initial Access")
}

#[derive(Debug, Clone)]
pub struct CveEntry {
    pub cve_id: String,
    pub cvss: Option<f64>,
    pub description: String,
    pub cwe: String,
}

/// Parse an NVD API 2.0 JSON response.
pub fn parse_nvd_response(data: &Value) -> Vec<CveEntry> {
    let mut results = Vec::new();
    let Some(vulns) = data.get("vulnerabilities").and_then(Value::as_array) else {
        return results;
    };

    for wrapper in vulns {
        let cve = wrapper.get("cve").cloned().unwrap_or_default();
        let Some(cve_id) = cve.get("id").and_then(Value::as_str) else {
            continue;
        };
        if cve_id.is_empty() {
            continue;
        }

        // CVSS v3.1 preferred, then v3.0.
        let mut cvss = None;
        if let Some(metrics) = cve.get("metrics") {
            for key in ["cvssMetricV31", "cvssMetricV30"] {
                cvss = metrics
                    .get(key)
                    .and_then(Value::as_array)
                    .and_then(|list| list.first())
                    .and_then(|m| m.get("cvssData"))
                    .and_then(|d| d.get("baseScore"))
                    .and_then(Value::as_f64);
                if cvss.is_some() {
                    break;
                }
            }
        }

        let descriptions = cve
            .get("descriptions")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let description = descriptions
            .iter()
            .find(|d| d.get("lang").and_then(Value::as_str) == Some("en"))
            .or(descriptions.first())
            .and_then(|d| d.get("value"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut cwe = String::new();
        if let Some(weaknesses) = cve.get("weaknesses").and_then(Value::as_array) {
            'outer: for weakness in weaknesses {
                if let Some(descs) = weakness.get("description").and_then(Value::as_array) {
                    for desc in descs {
                        if let Some(val) = desc.get("value").and_then(Value::as_str) {
                            if val.starts_with("CWE-") {
                                cwe = val.to_string();
                                break 'outer;
                            }
                        }
                    }
                }
            }
        }

        results.push(CveEntry {
            cve_id: cve_id.to_string(),
            cvss,
            description,
            cwe,
        });
    }

    results
}

#[derive(Debug, Clone)]
struct DetectedService {
    port: u16,
    banner: String,
    service: String,
    version: Option<String>,
}

fn identify_service(banner: &str, port: u16) -> String {
    let lower = banner.to_lowercase();
    for (prefix, _) in CPE_MAP {
        if lower.contains(prefix) {
            return prefix.to_string();
        }
    }
    match port {
        22 => "ssh",
        80 => "http",
        443 => "https",
        8080 => "http-proxy",
        8443 => "https-alt",
        3306 => "mysql",
        5432 => "postgresql",
        _ => "unknown",
    }
    .to_string()
}

/// CVE intelligence module using the NVD API, EPSS, and CISA KEV.
pub struct CveMatcherModule {
    last_nvd_call: Mutex<Option<Instant>>,
}

impl CveMatcherModule {
    pub fn new() -> Self {
        CveMatcherModule {
            last_nvd_call: Mutex::new(None),
        }
    }

    fn nvd_rate_limit() -> Duration {
        if std::env::var("NVD_API_KEY").is_ok() {
            NVD_RATE_LIMIT_KEYED
        } else {
            NVD_RATE_LIMIT
        }
    }

    /// Enforce the NVD request spacing. The wait happens outside any lock
    /// on shared scan state.
    async fn rate_limit_nvd(&self) {
        let mut last = self.last_nvd_call.lock().await;
        if let Some(prev) = *last {
            let delay = Self::nvd_rate_limit();
            let elapsed = prev.elapsed();
            if elapsed < delay {
                tokio::time::sleep(delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn grab_banner(&self, target: &str, port: u16) -> Option<String> {
        match port {
            80 | 443 | 8080 | 8443 => self.grab_server_header(target, port).await,
            _ => self.grab_raw_banner(target, port).await,
        }
    }

    /// HEAD the HTTP(S) service and read its Server header.
    async fn grab_server_header(&self, target: &str, port: u16) -> Option<String> {
        let scheme = if port == 443 || port == 8443 { "https" } else { "http" };
        let url = match port {
            80 => format!("http://{target}/"),
            443 => format!("https://{target}/"),
            _ => format!("{scheme}://{target}:{port}/"),
        };
        let client = reqwest::Client::builder()
            .user_agent(PROBE_USER_AGENT)
            .danger_accept_invalid_certs(true)
            .timeout(BANNER_TIMEOUT)
            .build()
            .ok()?;
        let resp = client.head(&url).send().await.ok()?;
        resp.headers()
            .get("server")
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    }

    /// Read raw bytes from a TCP socket; many services greet on connect.
    async fn grab_raw_banner(&self, target: &str, port: u16) -> Option<String> {
        let connect = TcpStream::connect((target, port));
        let mut stream = tokio::time::timeout(BANNER_TIMEOUT, connect).await.ok()?.ok()?;
        let mut buf = [0u8; 1024];
        let n = tokio::time::timeout(BANNER_TIMEOUT, stream.read(&mut buf))
            .await
            .ok()?
            .ok()?;
        if n == 0 {
            return None;
        }
        let text = String::from_utf8_lossy(&buf[..n]).trim().to_string();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    async fn detect_services(&self, target: &str, ports: &[u16]) -> Vec<DetectedService> {
        let mut services = Vec::new();
        for &port in ports {
            if let Some(banner) = self.grab_banner(target, port).await {
                let service = identify_service(&banner, port);
                let version = extract_version(&banner);
                services.push(DetectedService {
                    port,
                    banner,
                    service,
                    version,
                });
            }
        }
        services
    }

    async fn fetch_cves_for_cpe(&self, cpe: &str) -> Result<Vec<CveEntry>, ModuleError> {
        let client = reqwest::Client::builder()
            .user_agent(PROBE_USER_AGENT)
            .timeout(API_TIMEOUT)
            .build()?;
        let mut req = client.get(NVD_API_URL).query(&[("cpeName", cpe)]);
        if let Ok(key) = std::env::var("NVD_API_KEY") {
            req = req.header("apiKey", key);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(ModuleError(format!(
                "NVD API HTTP error {} for CPE {cpe}",
                resp.status()
            )));
        }
        let data: Value = resp.json().await?;
        Ok(parse_nvd_response(&data))
    }

    async fn fetch_epss(&self, cve_id: &str) -> Option<f64> {
        let client = reqwest::Client::builder()
            .user_agent(PROBE_USER_AGENT)
            .timeout(API_TIMEOUT)
            .build()
            .ok()?;
        let resp = client
            .get(EPSS_API_URL)
            .query(&[("cve", cve_id)])
            .send()
            .await
            .ok()?;
        let data: Value = resp.json().await.ok()?;
        data.get("data")
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .and_then(|entry| entry.get("epss"))
            .and_then(|v| match v {
                Value::String(s) => s.parse::<f64>().ok(),
                Value::Number(n) => n.as_f64(),
                _ => None,
            })
    }

    /// KEV membership via the cached catalog; cache lives 24 h and only one
    /// refresh is in flight at a time.
    async fn check_kev(&self, cve_id: &str) -> bool {
        {
            let cache = KEV_CACHE.read().await;
            if let Some((fetched_at, ids)) = cache.as_ref() {
                if fetched_at.elapsed() < KEV_CACHE_TTL {
                    return ids.contains(cve_id);
                }
            }
        }

        let _guard = KEV_REFRESH_GUARD.lock().await;
        // Another task may have refreshed while we waited for the guard.
        {
            let cache = KEV_CACHE.read().await;
            if let Some((fetched_at, ids)) = cache.as_ref() {
                if fetched_at.elapsed() < KEV_CACHE_TTL {
                    return ids.contains(cve_id);
                }
            }
        }

        match self.fetch_kev_catalog().await {
            Ok(ids) => {
                let result = ids.contains(cve_id);
                *KEV_CACHE.write().await = Some((Instant::now(), ids));
                result
            }
            Err(err) => {
                warn!("failed to fetch CISA KEV catalog: {err}");
                // Fall back to a stale cache if one exists.
                KEV_CACHE
                    .read()
                    .await
                    .as_ref()
                    .map(|(_, ids)| ids.contains(cve_id))
                    .unwrap_or(false)
            }
        }
    }

    async fn fetch_kev_catalog(&self) -> Result<HashSet<String>, ModuleError> {
        let client = reqwest::Client::builder()
            .user_agent(PROBE_USER_AGENT)
            .timeout(API_TIMEOUT)
            .build()?;
        let data: Value = client.get(KEV_FEED_URL).send().await?.json().await?;
        let mut ids = HashSet::new();
        if let Some(vulns) = data.get("vulnerabilities").and_then(Value::as_array) {
            for vuln in vulns {
                if let Some(id) = vuln.get("cveID").and_then(Value::as_str) {
                    if !id.is_empty() {
                        ids.insert(id.to_string());
                    }
                }
            }
        }
        Ok(ids)
    }
}

impl Default for CveMatcherModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScanModule for CveMatcherModule {
    fn name(&self) -> &'static str {
        "cve"
    }

    fn weight(&self) -> u32 {
        25
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn scan(
        &self,
        target: &str,
        port: Option<u16>,
    ) -> Result<Vec<ShieldFinding>, ModuleError> {
        let mut findings = Vec::new();

        let probe_ports: Vec<u16> = match port {
            Some(p) => vec![p],
            None => DEFAULT_PROBE_PORTS.to_vec(),
        };
        let services = self.detect_services(target, &probe_ports).await;

        if services.is_empty() {
            findings.push(
                ShieldFinding::new("cve", FindingSeverity::Info, "No Services Detected")
                    .description(format!("No service banners were detected on {target}."))
                    .remediation(
                        "No action needed. The target may not expose detectable service banners.",
                    )
                    .target(target, None)
                    .evidence(json!({ "probed_ports": probe_ports })),
            );
            return Ok(findings);
        }

        let mut api_failed = false;
        for svc in &services {
            let Some(cpe) = banner_to_cpe(&svc.banner, svc.version.as_deref()) else {
                continue;
            };

            self.rate_limit_nvd().await;

            let cves = match self.fetch_cves_for_cpe(&cpe).await {
                Ok(cves) => cves,
                Err(err) => {
                    warn!("NVD lookup failed for CPE {cpe}: {err}");
                    api_failed = true;
                    continue;
                }
            };

            for cve_info in &cves {
                let epss = self.fetch_epss(&cve_info.cve_id).await;
                let kev = self.check_kev(&cve_info.cve_id).await;
                let severity = calculate_priority(cve_info.cvss, epss, kev);
                let (technique, tactic) = attack_mapping(&svc.service);

                let mut remediation = format!("Update {} to the latest version.", svc.service);
                if kev {
                    remediation.push_str(
                        " This CVE is in CISA's Known Exploited Vulnerabilities catalog; patch immediately.",
                    );
                }
                if cve_info.cvss.map(|c| c >= 9.0).unwrap_or(false) {
                    remediation.push_str(" This is a critical-severity vulnerability.");
                }

                let description = if cve_info.description.is_empty() {
                    format!("CVE {} affects {cpe}", cve_info.cve_id)
                } else {
                    cve_info.description.clone()
                };

                let mut finding = ShieldFinding::new(
                    "cve",
                    severity,
                    &format!("{}: {} vulnerability", cve_info.cve_id, svc.service),
                )
                .description(description)
                .remediation(remediation)
                .target(target, Some(svc.port))
                .evidence(json!({
                    "cpe": cpe,
                    "banner": svc.banner,
                    "cwe": cve_info.cwe,
                    "service": svc.service,
                    "version": svc.version,
                }))
                .attack(technique, tactic);
                finding.cve_id = Some(cve_info.cve_id.clone());
                finding.cvss_score = cve_info.cvss;
                finding.epss_score = epss;
                finding.cisa_kev = kev;
                findings.push(finding);
            }
        }

        if api_failed && findings.is_empty() {
            debug!("CVE intelligence degraded for {target}: NVD unavailable");
            findings.push(
                ShieldFinding::new("cve", FindingSeverity::Info, "CVE Lookup Unavailable")
                    .description(format!(
                        "The NVD API could not be reached while scanning {target}; \
                         CVE intelligence is incomplete."
                    ))
                    .remediation("Retry the scan later or configure NVD_API_KEY.")
                    .target(target, None)
                    .evidence(json!({ "error": "nvd_unavailable" })),
            );
        }

        Ok(findings)
    }
}
