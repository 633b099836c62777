//! Default Credential Check Module
//! ===============================
//! Probes common services for missing or default authentication: Redis and
//! MongoDB no-auth access, exposed web admin panels, and banner detection
//! for services whose defaults must be verified manually.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use crate::shield::models::{FindingSeverity, ShieldFinding};
use crate::shield::modules::{probe_client, ModuleError, ScanModule};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Max probe attempts per service category per scan.
const MAX_ATTEMPTS_PER_SERVICE: u32 = 3;

/// Admin panel paths that should never answer unauthenticated.
const ADMIN_PANEL_PATHS: &[(&str, &str)] = &[
    ("/admin", "Admin Panel"),
    ("/wp-admin", "WordPress Admin"),
    ("/phpmyadmin", "phpMyAdmin"),
];

/// Known service ports probed by this module.
pub fn port_service(port: u16) -> Option<&'static str> {
    match port {
        6379 => Some("redis"),
        27017 => Some("mongodb"),
        80 | 443 | 8080 | 8443 => Some("web_admin"),
        22 => Some("ssh"),
        21 => Some("ftp"),
        3306 => Some("mysql"),
        5432 => Some("postgresql"),
        _ => None,
    }
}

const PROBE_PORTS: &[u16] = &[21, 22, 80, 443, 3306, 5432, 6379, 8080, 8443, 27017];

/// Default credentials worth checking per service, included as evidence.
fn default_credentials(service: &str) -> Vec<&'static str> {
    match service {
        "ssh" => vec!["root:root", "admin:admin", "pi:raspberry"],
        "ftp" => vec!["anonymous:", "ftp:ftp", "admin:admin"],
        "mysql" => vec!["root:", "root:root", "root:password"],
        "postgresql" => vec!["postgres:postgres", "postgres:password"],
        _ => vec![],
    }
}

/// Default credential checker for common services.
pub struct CredentialCheckModule;

impl CredentialCheckModule {
    pub fn new() -> Self {
        CredentialCheckModule
    }

    async fn check_port_open(&self, host: &str, port: u16) -> bool {
        matches!(
            tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }

    /// Redis no-auth check: an unauthenticated PING answers +PONG.
    async fn check_redis_no_auth(&self, host: &str, port: u16) -> bool {
        let result = tokio::time::timeout(CONNECT_TIMEOUT, async {
            let mut stream = TcpStream::connect((host, port)).await?;
            stream.write_all(b"PING\r\n").await?;
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await?;
            Ok::<_, std::io::Error>(String::from_utf8_lossy(&buf[..n]).to_string())
        })
        .await;

        match result {
            Ok(Ok(reply)) => reply.contains("+PONG"),
            _ => false,
        }
    }

    /// MongoDB no-auth check: best-effort legacy wire probe; an open
    /// deployment answers the query with data.
    async fn check_mongodb_no_auth(&self, host: &str, port: u16) -> bool {
        // Minimal OP_QUERY frame against admin.$cmd (legacy protocol); any
        // byte stream back implies the listener spoke without auth.
        let probe: &[u8] = &[
            0x3a, 0x00, 0x00, 0x00, // messageLength
            0x01, 0x00, 0x00, 0x00, // requestID
            0x00, 0x00, 0x00, 0x00, // responseTo
            0xd4, 0x07, 0x00, 0x00, // opCode OP_QUERY
            0x00, 0x00, 0x00, 0x00, // flags
            b'a', b'd', b'm', b'i', b'n', b'.', b'$', b'c', b'm', b'd', 0x00,
            0x00, 0x00, 0x00, 0x00, // numberToSkip
            0x01, 0x00, 0x00, 0x00, // numberToReturn
            0x13, 0x00, 0x00, 0x00, // query document length
            0x10, b'i', b's', b'M', b'a', b's', b't', b'e', b'r', 0x00,
            0x01, 0x00, 0x00, 0x00, 0x00,
        ];

        let result = tokio::time::timeout(CONNECT_TIMEOUT, async {
            let mut stream = TcpStream::connect((host, port)).await?;
            stream.write_all(probe).await?;
            let mut buf = [0u8; 128];
            let n = stream.read(&mut buf).await?;
            Ok::<_, std::io::Error>(n)
        })
        .await;

        matches!(result, Ok(Ok(n)) if n > 0)
    }

    /// GET an admin panel path; 200 with a body means it is exposed.
    async fn check_admin_panel(
        &self,
        host: &str,
        port: u16,
        path: &str,
        label: &str,
    ) -> Option<ShieldFinding> {
        let client = probe_client(HTTP_TIMEOUT).ok()?;
        let scheme = if port == 443 || port == 8443 { "https" } else { "http" };
        let url = match port {
            80 => format!("http://{host}{path}"),
            443 => format!("https://{host}{path}"),
            _ => format!("{scheme}://{host}:{port}{path}"),
        };

        let resp = client.get(&url).send().await.ok()?;
        if resp.status() != reqwest::StatusCode::OK {
            return None;
        }
        let body = resp.text().await.ok()?;
        if body.is_empty() {
            return None;
        }

        Some(
            ShieldFinding::new(
                "creds",
                FindingSeverity::High,
                &format!("{label} Accessible Without Authentication"),
            )
            .description(format!(
                "{label} at {url} returned HTTP 200 with content. \
                 Administrative interfaces must not be reachable without authentication."
            ))
            .remediation(format!(
                "Require authentication for {path}, or restrict access to trusted networks."
            ))
            .target(host, Some(port))
            .evidence(json!({
                "url": url,
                "path": path,
                "status_code": 200,
                "body_length": body.len(),
            }))
            .attack("T1078", "Initial Access"),
        )
    }

    /// Read the greeting banner from a raw socket.
    async fn get_service_banner(&self, host: &str, port: u16) -> String {
        let result = tokio::time::timeout(CONNECT_TIMEOUT, async {
            let mut stream = TcpStream::connect((host, port)).await?;
            let mut buf = [0u8; 512];
            let n = stream.read(&mut buf).await?;
            Ok::<_, std::io::Error>(String::from_utf8_lossy(&buf[..n]).trim().to_string())
        })
        .await;

        match result {
            Ok(Ok(banner)) => banner,
            _ => String::new(),
        }
    }
}

impl Default for CredentialCheckModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScanModule for CredentialCheckModule {
    fn name(&self) -> &'static str {
        "creds"
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
        let mut findings = Vec::new();

        let ports_to_check: Vec<u16> = match port {
            Some(p) => vec![p],
            None => PROBE_PORTS.to_vec(),
        };

        let mut attempts_per_service: HashMap<&str, u32> = HashMap::new();

        for check_port in ports_to_check {
            let Some(service) = port_service(check_port) else {
                continue;
            };

            let attempts = attempts_per_service.entry(service).or_insert(0);
            if *attempts >= MAX_ATTEMPTS_PER_SERVICE {
                debug!("skipping {service} probe on {target}:{check_port}: attempt budget spent");
                continue;
            }
            *attempts += 1;

            if !self.check_port_open(target, check_port).await {
                continue;
            }

            match service {
                "redis" => {
                    if self.check_redis_no_auth(target, check_port).await {
                        findings.push(
                            ShieldFinding::new(
                                "creds",
                                FindingSeverity::Critical,
                                "Redis Accessible Without Authentication",
                            )
                            .description(format!(
                                "Redis on {target}:{check_port} responds to PING without authentication. \
                                 An attacker can read/write all data and potentially execute commands."
                            ))
                            .remediation(
                                "Enable Redis authentication with a strong password: \
                                 set 'requirepass' in redis.conf. \
                                 Bind Redis to localhost or restrict with firewall rules.",
                            )
                            .target(target, Some(check_port))
                            .evidence(json!({
                                "service": "redis",
                                "auth_required": false,
                                "test": "PING returned PONG without credentials",
                            }))
                            .attack("T1078", "Initial Access"),
                        );
                    }
                }
                "mongodb" => {
                    if self.check_mongodb_no_auth(target, check_port).await {
                        findings.push(
                            ShieldFinding::new(
                                "creds",
                                FindingSeverity::Critical,
                                "MongoDB Accessible Without Authentication",
                            )
                            .description(format!(
                                "MongoDB on {target}:{check_port} appears to accept connections \
                                 without authentication. An attacker can access all databases."
                            ))
                            .remediation(
                                "Enable MongoDB authentication: set 'security.authorization: enabled' \
                                 in mongod.conf. Create admin users with strong passwords. \
                                 Bind to localhost or restrict with firewall rules.",
                            )
                            .target(target, Some(check_port))
                            .evidence(json!({
                                "service": "mongodb",
                                "auth_required": false,
                                "test": "Connection accepted and data received without credentials",
                            }))
                            .attack("T1078", "Initial Access"),
                        );
                    }
                }
                "web_admin" => {
                    for (path, label) in ADMIN_PANEL_PATHS {
                        if let Some(finding) =
                            self.check_admin_panel(target, check_port, path, label).await
                        {
                            findings.push(finding);
                        }
                    }
                }
                _ => {
                    let banner = self.get_service_banner(target, check_port).await;
                    let service_label = service.to_uppercase();
                    if !banner.is_empty() {
                        let snippet: String = banner.chars().take(200).collect();
                        findings.push(
                            ShieldFinding::new(
                                "creds",
                                FindingSeverity::Medium,
                                &format!(
                                    "{service_label} Service Detected - Default Credential Check Recommended"
                                ),
                            )
                            .description(format!(
                                "{service_label} service detected on {target}:{check_port}. \
                                 Banner: {snippet}. Default credentials should be tested manually."
                            ))
                            .remediation(format!(
                                "Verify that {service_label} does not use default credentials. \
                                 Change default passwords and disable default accounts. \
                                 Restrict access using firewall rules or SSH key-based authentication."
                            ))
                            .target(target, Some(check_port))
                            .evidence(json!({
                                "service": service,
                                "banner": snippet,
                                "default_creds_to_check": default_credentials(service),
                            }))
                            .attack("T1110.001", "Credential Access"),
                        );
                    } else {
                        findings.push(
                            ShieldFinding::new(
                                "creds",
                                FindingSeverity::Low,
                                &format!(
                                    "Service Port {check_port} Open - Manual Credential Check Recommended"
                                ),
                            )
                            .description(format!(
                                "Port {check_port} ({service_label}) is open on {target} \
                                 but no service banner was received. \
                                 Default credentials should be verified."
                            ))
                            .remediation(format!(
                                "Verify the service on port {check_port} does not accept default credentials. \
                                 Disable unused services and restrict access with firewall rules."
                            ))
                            .target(target, Some(check_port))
                            .evidence(json!({
                                "service": service,
                                "banner": "",
                                "port_open": true,
                            }))
                            .attack("T1078", "Initial Access"),
                        );
                    }
                }
            }
        }

        Ok(findings)
    }
}
