//! Port Scanning Module
//! ====================
//! Wraps an nmap TCP connect scan (top 1000 ports, service detection) and
//! flags dangerous or excessive open ports.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use crate::shield::models::{FindingSeverity, ShieldFinding};
use crate::shield::modules::{binary_on_path, ModuleError, ScanModule};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

/// Nmap process timeout
const NMAP_TIMEOUT: Duration = Duration::from_secs(120);

/// Open port count threshold for the excessive-ports finding
const OPEN_PORT_THRESHOLD: usize = 10;

/// Common/expected ports that are informational only
const COMMON_PORTS: &[u16] = &[22, 80, 443];

/// Ports that indicate potentially dangerous services
fn dangerous_service(port: u16) -> Option<&'static str> {
    match port {
        21 => Some("FTP"),
        23 => Some("Telnet"),
        445 => Some("SMB"),
        3389 => Some("RDP"),
        27017 => Some("MongoDB"),
        6379 => Some("Redis"),
        5432 => Some("PostgreSQL"),
        3306 => Some("MySQL"),
        11211 => Some("Memcached"),
        9200 => Some("Elasticsearch"),
        _ => None,
    }
}

/// One open port parsed from nmap output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPort {
    pub port: u16,
    pub protocol: String,
    pub service: String,
    pub version: String,
}

/// Parse nmap XML output, keeping open ports only.
pub fn parse_nmap_xml(xml_text: &str) -> Vec<OpenPort> {
    let mut reader = Reader::from_str(xml_text);

    let mut ports = Vec::new();
    let mut current: Option<OpenPort> = None;
    let mut current_open = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = e.name().as_ref().to_vec();
                let attr = |key: &[u8]| -> Option<String> {
                    e.attributes().flatten().find_map(|a| {
                        if a.key.as_ref() == key {
                            Some(String::from_utf8_lossy(&a.value).into_owned())
                        } else {
                            None
                        }
                    })
                };
                match name.as_slice() {
                    b"port" => {
                        current = Some(OpenPort {
                            port: attr(b"portid")
                                .and_then(|v| v.parse().ok())
                                .unwrap_or(0),
                            protocol: attr(b"protocol").unwrap_or_else(|| "tcp".to_string()),
                            service: String::new(),
                            version: String::new(),
                        });
                        current_open = false;
                    }
                    b"state" => {
                        if current.is_some() {
                            current_open = attr(b"state").as_deref() == Some("open");
                        }
                    }
                    b"service" => {
                        if let Some(port) = current.as_mut() {
                            port.service = attr(b"name").unwrap_or_default();
                            let product = attr(b"product").unwrap_or_default();
                            let version = attr(b"version").unwrap_or_default();
                            port.version = match (product.is_empty(), version.is_empty()) {
                                (false, false) => format!("{product} {version}"),
                                (false, true) => product,
                                _ => String::new(),
                            };
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"port" => {
                if let Some(port) = current.take() {
                    if current_open && port.port != 0 {
                        ports.push(port);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => {
                warn!("failed to parse nmap XML output: {err}");
                break;
            }
            _ => {}
        }
    }

    ports
}

/// Turn the parsed port list into findings.
pub fn analyze_ports(target: &str, open_ports: &[OpenPort]) -> Vec<ShieldFinding> {
    let mut findings = Vec::new();

    if open_ports.is_empty() {
        findings.push(
            ShieldFinding::new("ports", FindingSeverity::Info, "No Open Ports Detected")
                .description(format!(
                    "No open ports found in top 1000 ports scan of {target}."
                ))
                .remediation(
                    "No action needed. The target may be behind a firewall or all ports are filtered.",
                )
                .target(target, None)
                .evidence(json!({ "open_port_count": 0 })),
        );
        return findings;
    }

    for info in open_ports {
        let detail = {
            let mut parts = Vec::new();
            if !info.service.is_empty() {
                parts.push(format!(" Service: {}", info.service));
            }
            if !info.version.is_empty() {
                parts.push(format!(" version: {}", info.version));
            }
            parts.concat()
        };

        if let Some(svc_label) = dangerous_service(info.port) {
            findings.push(
                ShieldFinding::new(
                    "ports",
                    FindingSeverity::High,
                    &format!(
                        "Dangerous Port Open: {}/{} ({svc_label})",
                        info.port, info.protocol
                    ),
                )
                .description(format!(
                    "Port {} ({svc_label}) is open on {target}. \
                     This service should not be publicly exposed.{detail}",
                    info.port
                ))
                .remediation(format!(
                    "Close port {} or restrict access using firewall rules. \
                     If {svc_label} is required, ensure it is not exposed to the public internet.",
                    info.port
                ))
                .target(target, Some(info.port))
                .evidence(json!({
                    "port": info.port,
                    "protocol": info.protocol,
                    "service": info.service,
                    "version": info.version,
                    "dangerous_service": svc_label,
                }))
                .attack("T1190", "Initial Access"),
            );
        } else if COMMON_PORTS.contains(&info.port) {
            findings.push(
                ShieldFinding::new(
                    "ports",
                    FindingSeverity::Info,
                    &format!("Common Port Open: {}/{}", info.port, info.protocol),
                )
                .description(format!(
                    "Port {} is open on {target}. This is a commonly expected port.{detail}",
                    info.port
                ))
                .remediation(
                    "No action needed for standard services. Ensure the service is kept up to date.",
                )
                .target(target, Some(info.port))
                .evidence(json!({
                    "port": info.port,
                    "protocol": info.protocol,
                    "service": info.service,
                    "version": info.version,
                })),
            );
        } else {
            findings.push(
                ShieldFinding::new(
                    "ports",
                    FindingSeverity::Low,
                    &format!("Open Port: {}/{}", info.port, info.protocol),
                )
                .description(format!("Port {} is open on {target}.{detail}", info.port))
                .remediation(format!(
                    "Verify port {} is intentionally open. Close unnecessary services.",
                    info.port
                ))
                .target(target, Some(info.port))
                .evidence(json!({
                    "port": info.port,
                    "protocol": info.protocol,
                    "service": info.service,
                    "version": info.version,
                })),
            );
        }
    }

    if open_ports.len() > OPEN_PORT_THRESHOLD {
        findings.push(
            ShieldFinding::new("ports", FindingSeverity::Medium, "Excessive Open Ports")
                .description(format!(
                    "{} open ports detected on {target}, which exceeds the threshold of {}. \
                     A large attack surface increases security risk.",
                    open_ports.len(),
                    OPEN_PORT_THRESHOLD
                ))
                .remediation(
                    "Review all open ports and close unnecessary services. \
                     Apply the principle of least privilege to exposed services.",
                )
                .target(target, None)
                .evidence(json!({
                    "open_port_count": open_ports.len(),
                    "threshold": OPEN_PORT_THRESHOLD,
                    "ports": open_ports.iter().map(|p| p.port).collect::<Vec<_>>(),
                }))
                .attack("T1046", "Discovery"),
        );
    }

    findings
}

/// Port scanning module using an nmap subprocess.
pub struct PortScanModule;

impl PortScanModule {
    pub fn new() -> Self {
        PortScanModule
    }
}

impl Default for PortScanModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScanModule for PortScanModule {
    fn name(&self) -> &'static str {
        "ports"
    }

    fn weight(&self) -> u32 {
        20
    }

    fn is_available(&self) -> bool {
        binary_on_path("nmap")
    }

    async fn scan(
        &self,
        target: &str,
        _port: Option<u16>,
    ) -> Result<Vec<ShieldFinding>, ModuleError> {
        if !binary_on_path("nmap") {
            return Ok(vec![ShieldFinding::new(
                "ports",
                FindingSeverity::Info,
                "Nmap Not Installed",
            )
            .description(
                "The nmap binary was not found on the system. \
                 Port scanning requires nmap to be installed.",
            )
            .remediation(
                "Install nmap: apt-get install nmap (Debian/Ubuntu) or brew install nmap (macOS).",
            )
            .target(target, None)
            .evidence(json!({ "error": "nmap_not_found" }))]);
        }

        // TCP connect scan needs no root; argument-list form, no shell.
        let mut cmd = tokio::process::Command::new("nmap");
        cmd.args([
            "-sT",
            "--top-ports",
            "1000",
            "-sV",
            "--open",
            "-oX",
            "-",
            target,
        ]);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let output = match tokio::time::timeout(NMAP_TIMEOUT, cmd.output()).await {
            Err(_) => {
                return Ok(vec![ShieldFinding::new(
                    "ports",
                    FindingSeverity::Medium,
                    "Port Scan Timeout",
                )
                .description(format!(
                    "Nmap scan of {target} timed out after {} seconds.",
                    NMAP_TIMEOUT.as_secs()
                ))
                .remediation("The target may be heavily filtered. Try scanning fewer ports.")
                .target(target, None)
                .evidence(json!({
                    "error": "timeout",
                    "timeout_seconds": NMAP_TIMEOUT.as_secs(),
                }))]);
            }
            Ok(Err(err)) => {
                return Ok(vec![ShieldFinding::new(
                    "ports",
                    FindingSeverity::Info,
                    "Port Scan Error",
                )
                .description(format!("Failed to execute nmap: {err}"))
                .remediation("Verify nmap is correctly installed and accessible.")
                .target(target, None)
                .evidence(json!({ "error": err.to_string() }))]);
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr_text = String::from_utf8_lossy(&output.stderr);
            let code = output.status.code().unwrap_or(-1);
            return Ok(vec![ShieldFinding::new(
                "ports",
                FindingSeverity::Info,
                "Port Scan Failed",
            )
            .description(format!(
                "Nmap exited with code {code} for target {target}."
            ))
            .remediation("Check the target address and nmap permissions.")
            .target(target, None)
            .evidence(json!({
                "return_code": code,
                "stderr": stderr_text.chars().take(500).collect::<String>(),
            }))]);
        }

        let xml_output = String::from_utf8_lossy(&output.stdout);
        let open_ports = parse_nmap_xml(&xml_output);
        Ok(analyze_ports(target, &open_ports))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_XML: &str = r#"<?xml version="1.0"?>
<nmaprun>
  <host>
    <ports>
      <port protocol="tcp" portid="22">
        <state state="open" reason="syn-ack"/>
        <service name="ssh" product="OpenSSH" version="8.9p1"/>
      </port>
      <port protocol="tcp" portid="80">
        <state state="open" reason="syn-ack"/>
        <service name="http" product="nginx" version="1.24.0"/>
      </port>
      <port protocol="tcp" portid="6379">
        <state state="open" reason="syn-ack"/>
        <service name="redis"/>
      </port>
      <port protocol="tcp" portid="8443">
        <state state="closed" reason="conn-refused"/>
      </port>
    </ports>
  </host>
</nmaprun>"#;

    #[test]
    fn test_parse_nmap_xml_open_only() {
        let ports = parse_nmap_xml(SAMPLE_XML);
        assert_eq!(ports.len(), 3);
        assert_eq!(ports[0].port, 22);
        assert_eq!(ports[0].service, "ssh");
        assert_eq!(ports[0].version, "OpenSSH 8.9p1");
        assert_eq!(ports[2].port, 6379);
        assert_eq!(ports[2].version, "");
    }

    #[test]
    fn test_parse_nmap_xml_garbage() {
        assert!(parse_nmap_xml("not xml at all").is_empty());
        assert!(parse_nmap_xml("").is_empty());
    }

    fn open_port(port: u16) -> OpenPort {
        OpenPort {
            port,
            protocol: "tcp".to_string(),
            service: String::new(),
            version: String::new(),
        }
    }

    #[test]
    fn test_dangerous_port_flagged_high() {
        let findings = analyze_ports("10.0.0.5", &[open_port(3389)]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, FindingSeverity::High);
        assert!(findings[0].title.contains("RDP"));
        assert_eq!(findings[0].attack_technique.as_deref(), Some("T1190"));
    }

    #[test]
    fn test_common_port_info() {
        let findings = analyze_ports("10.0.0.5", &[open_port(443)]);
        assert_eq!(findings[0].severity, FindingSeverity::Info);
    }

    #[test]
    fn test_unknown_port_low() {
        let findings = analyze_ports("10.0.0.5", &[open_port(8081)]);
        assert_eq!(findings[0].severity, FindingSeverity::Low);
    }

    #[test]
    fn test_no_open_ports_info() {
        let findings = analyze_ports("10.0.0.5", &[]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, FindingSeverity::Info);
        assert_eq!(findings[0].title, "No Open Ports Detected");
    }

    #[test]
    fn test_excessive_ports_boundary() {
        // 10 open ports: no excessive finding.
        let ten: Vec<_> = (8000..8010).map(open_port).collect();
        let findings = analyze_ports("10.0.0.5", &ten);
        assert!(!findings.iter().any(|f| f.title == "Excessive Open Ports"));

        // 11 open ports: the medium finding appears.
        let eleven: Vec<_> = (8000..8011).map(open_port).collect();
        let findings = analyze_ports("10.0.0.5", &eleven);
        let excessive: Vec<_> = findings
            .iter()
            .filter(|f| f.title == "Excessive Open Ports")
            .collect();
        assert_eq!(excessive.len(), 1);
        assert_eq!(excessive[0].severity, FindingSeverity::Medium);
    }
}
