//! TLS Validation Module
//! =====================
//! Certificate and TLS configuration checks: expiry, chain trust, protocol
//! version, key size, cipher strength, SAN/CN match, and HSTS.
//!
//! Copyright © 2025 Stephen Bilodeau. All rights reserved.
//! Licensed under GPL-3.0 with proprietary agent clauses.

use crate::shield::models::{FindingSeverity, ShieldFinding};
use crate::shield::modules::{verifying_client, ModuleError, ScanModule, PROBE_USER_AGENT};
use async_trait::async_trait;
use chrono::Utc;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

/// Weak cipher suites that should be flagged
const WEAK_CIPHERS: &[&str] = &[
    "RC4", "DES", "3DES", "NULL", "EXPORT", "ANON", "RC2", "IDEA", "SEED", "MD5",
];

/// Days before expiry to warn
const EXPIRY_WARNING_DAYS: i64 = 30;

/// Connect + handshake timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Protocol versions considered deprecated and insecure.
const DEPRECATED_PROTOCOLS: &[&str] = &["SSLv2", "SSLv3", "TLSv1", "TLSv1.1"];

/// Certificate verifier that accepts everything. The inspection pass must
/// complete against broken certificates; trust is judged in a second pass.
#[derive(Debug)]
struct AcceptAnyCert(rustls::crypto::CryptoProvider);

impl AcceptAnyCert {
    fn new() -> Self {
        AcceptAnyCert(rustls::crypto::ring::default_provider())
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Raw material captured from the inspection handshake.
struct TlsProbe {
    cert_der: Option<Vec<u8>>,
    protocol: Option<String>,
    cipher: Option<String>,
}

fn is_weak_cipher(cipher_name: &str) -> bool {
    let upper = cipher_name.to_uppercase();
    WEAK_CIPHERS.iter().any(|weak| upper.contains(weak))
}

/// Expiry severity from days remaining: expired is critical, within the
/// warning window is medium, otherwise nothing.
fn expiry_severity(days_remaining: i64) -> Option<FindingSeverity> {
    if days_remaining < 0 {
        Some(FindingSeverity::Critical)
    } else if days_remaining <= EXPIRY_WARNING_DAYS {
        Some(FindingSeverity::Medium)
    } else {
        None
    }
}

/// Hostname match against a certificate pattern, supporting single-label
/// wildcards: `*.example.com` matches `foo.example.com` but not
/// `foo.bar.example.com`.
fn hostname_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let hostname = hostname.to_lowercase();

    if pattern == hostname {
        return true;
    }

    if let Some(suffix) = pattern.strip_prefix("*.") {
        if let Some(prefix) = hostname.strip_suffix(&format!(".{suffix}")) {
            return !prefix.is_empty() && !prefix.contains('.');
        }
    }

    false
}

/// Whether the target appears in the certificate's SAN entries or CN.
fn cert_matches_target(cert: &X509Certificate<'_>, target: &str) -> bool {
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => {
                    if hostname_matches(dns, target) {
                        return true;
                    }
                }
                GeneralName::IPAddress(bytes) => {
                    if bytes.len() == 4 {
                        let ip = format!("{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3]);
                        if ip == target {
                            return true;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    // Fall back to CN
    if let Some(cn) = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
    {
        if hostname_matches(cn, target) {
            return true;
        }
    }

    false
}

/// Collect the SAN list for evidence payloads.
fn san_entries(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut entries = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => entries.push(format!("DNS:{dns}")),
                GeneralName::IPAddress(bytes) if bytes.len() == 4 => entries.push(format!(
                    "IP:{}.{}.{}.{}",
                    bytes[0], bytes[1], bytes[2], bytes[3]
                )),
                other => entries.push(format!("{other:?}")),
            }
        }
    }
    entries
}

fn key_bits(cert: &X509Certificate<'_>) -> Option<usize> {
    match cert.public_key().parsed() {
        Ok(PublicKey::RSA(rsa)) => Some(rsa.key_size()),
        Ok(PublicKey::EC(point)) => Some(point.key_size()),
        _ => None,
    }
}

fn protocol_name(version: rustls::ProtocolVersion) -> &'static str {
    match version {
        rustls::ProtocolVersion::SSLv2 => "SSLv2",
        rustls::ProtocolVersion::SSLv3 => "SSLv3",
        rustls::ProtocolVersion::TLSv1_0 => "TLSv1",
        rustls::ProtocolVersion::TLSv1_1 => "TLSv1.1",
        rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2",
        rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3",
        _ => "unknown",
    }
}

/// TLS/SSL certificate and configuration validation module.
pub struct TlsCheckModule;

impl TlsCheckModule {
    pub fn new() -> Self {
        TlsCheckModule
    }

    /// Handshake with verification disabled and capture cert, cipher, protocol.
    async fn inspect(&self, target: &str, port: u16) -> Result<TlsProbe, ModuleError> {
        // Pin the ring provider so the build does not depend on a process
        // default being installed.
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ModuleError(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let server_name = ServerName::try_from(target.to_string())
            .map_err(|e| ModuleError(format!("invalid server name: {e}")))?;

        let tcp = TcpStream::connect((target, port)).await?;
        let stream = connector.connect(server_name, tcp).await?;
        let (_, conn) = stream.get_ref();

        let cert_der = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec());
        let protocol = conn.protocol_version().map(|v| protocol_name(v).to_string());
        let cipher = conn
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite()));

        Ok(TlsProbe {
            cert_der,
            protocol,
            cipher,
        })
    }

    /// Second pass with full verification to judge chain trust.
    async fn verify_chain(&self, target: &str, port: u16) -> Result<(), String> {
        let client = verifying_client(DEFAULT_TIMEOUT).map_err(|e| e.to_string())?;
        let url = if port == 443 {
            format!("https://{target}/")
        } else {
            format!("https://{target}:{port}/")
        };
        match client.head(&url).send().await {
            Ok(_) => Ok(()),
            // Handshake/connect failures are chain problems; an HTTP-level
            // error after a completed handshake is not.
            Err(err) if err.is_connect() => Err(err.to_string()),
            Err(_) => Ok(()),
        }
    }

    /// HSTS check over the non-verifying client; best-effort.
    async fn check_hsts(&self, target: &str, port: u16) -> Option<ShieldFinding> {
        let client = reqwest::Client::builder()
            .user_agent(PROBE_USER_AGENT)
            .danger_accept_invalid_certs(true)
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .ok()?;
        let url = if port == 443 {
            format!("https://{target}/")
        } else {
            format!("https://{target}:{port}/")
        };
        let resp = client.head(&url).send().await.ok()?;
        if resp.headers().contains_key("strict-transport-security") {
            return None;
        }
        Some(
            ShieldFinding::new("tls", FindingSeverity::Low, "HSTS Header Missing")
                .description(format!(
                    "The server at {target} does not send the Strict-Transport-Security header."
                ))
                .remediation(
                    "Add the header: Strict-Transport-Security: max-age=31536000; includeSubDomains",
                )
                .target(target, Some(port))
                .evidence(json!({ "hsts_present": false })),
        )
    }
}

impl Default for TlsCheckModule {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScanModule for TlsCheckModule {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn weight(&self) -> u32 {
        20
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
        let actual_port = port.unwrap_or(443);

        // DNS resolution first so the failure mode is distinguishable.
        if tokio::net::lookup_host((target, actual_port)).await.is_err() {
            findings.push(
                ShieldFinding::new("tls", FindingSeverity::High, "DNS Resolution Failure")
                    .description(format!("Could not resolve hostname: {target}"))
                    .remediation("Verify the domain name is correct and DNS is reachable.")
                    .target(target, Some(actual_port))
                    .evidence(json!({ "error": "dns_resolution_failed" })),
            );
            return Ok(findings);
        }

        // Step 1: inspection handshake (verification disabled).
        let probe = match tokio::time::timeout(DEFAULT_TIMEOUT, self.inspect(target, actual_port))
            .await
        {
            Err(_) => {
                findings.push(
                    ShieldFinding::new("tls", FindingSeverity::Medium, "TLS Connection Timeout")
                        .description(format!(
                            "Connection to {target}:{actual_port} timed out after {}s.",
                            DEFAULT_TIMEOUT.as_secs()
                        ))
                        .remediation("Verify the target is reachable and the port is open.")
                        .target(target, Some(actual_port))
                        .evidence(json!({ "error": "timeout" })),
                );
                return Ok(findings);
            }
            Ok(Err(err)) => {
                let text = err.to_string();
                let finding = if text.contains("refused") {
                    ShieldFinding::new("tls", FindingSeverity::Medium, "TLS Connection Refused")
                        .description(format!(
                            "Connection to {target}:{actual_port} was refused."
                        ))
                        .remediation("Verify TLS service is running on the target port.")
                        .target(target, Some(actual_port))
                        .evidence(json!({ "error": "connection_refused" }))
                } else {
                    ShieldFinding::new("tls", FindingSeverity::High, "SSL/TLS Error")
                        .description(format!(
                            "TLS error connecting to {target}:{actual_port}: {text}"
                        ))
                        .remediation("Check the TLS configuration of the target service.")
                        .target(target, Some(actual_port))
                        .evidence(json!({ "error": text }))
                };
                findings.push(finding);
                return Ok(findings);
            }
            Ok(Ok(probe)) => probe,
        };

        let Some(cert_der) = probe.cert_der.as_deref() else {
            findings.push(
                ShieldFinding::new("tls", FindingSeverity::High, "No Certificate Presented")
                    .description(format!(
                        "The server at {target}:{actual_port} did not present a certificate."
                    ))
                    .remediation("Configure a valid TLS certificate on the server.")
                    .target(target, Some(actual_port)),
            );
            return Ok(findings);
        };

        let parsed = X509Certificate::from_der(cert_der);
        let cert = match &parsed {
            Ok((_, cert)) => Some(cert),
            Err(err) => {
                debug!("certificate parse failed for {target}: {err}");
                None
            }
        };

        // Step 2: chain verification pass.
        if let Err(chain_error) = self.verify_chain(target, actual_port).await {
            let is_self_signed = cert
                .map(|c| c.subject().to_string() == c.issuer().to_string())
                .unwrap_or(false);

            if is_self_signed {
                findings.push(
                    ShieldFinding::new("tls", FindingSeverity::High, "Self-Signed Certificate")
                        .description(format!(
                            "The certificate for {target} is self-signed. \
                             Clients will not trust this certificate by default."
                        ))
                        .remediation(
                            "Replace with a certificate signed by a trusted Certificate Authority.",
                        )
                        .target(target, Some(actual_port))
                        .evidence(json!({ "self_signed": true, "chain_error": chain_error }))
                        .attack("T1557", "Credential Access"),
                );
            } else {
                findings.push(
                    ShieldFinding::new(
                        "tls",
                        FindingSeverity::High,
                        "Certificate Chain Verification Failed",
                    )
                    .description(format!(
                        "Certificate chain verification failed for {target}: {chain_error}"
                    ))
                    .remediation(
                        "Ensure the server sends the full certificate chain including intermediate CAs.",
                    )
                    .target(target, Some(actual_port))
                    .evidence(json!({ "chain_error": chain_error })),
                );
            }
        }

        if let Some(cert) = cert {
            // Step 3: expiry.
            let not_after = cert.validity().not_after.timestamp();
            let days_remaining = (not_after - Utc::now().timestamp()) / 86_400;
            match expiry_severity(days_remaining) {
                Some(FindingSeverity::Critical) => findings.push(
                    ShieldFinding::new("tls", FindingSeverity::Critical, "Certificate Expired")
                        .description(format!(
                            "The certificate for {target} expired {} days ago.",
                            days_remaining.abs()
                        ))
                        .remediation("Renew the TLS certificate immediately.")
                        .target(target, Some(actual_port))
                        .evidence(json!({
                            "not_after_unix": not_after,
                            "days_remaining": days_remaining,
                        })),
                ),
                Some(FindingSeverity::Medium) => findings.push(
                    ShieldFinding::new(
                        "tls",
                        FindingSeverity::Medium,
                        "Certificate Expiring Soon",
                    )
                    .description(format!(
                        "The certificate for {target} expires in {days_remaining} days."
                    ))
                    .remediation("Renew the TLS certificate before it expires.")
                    .target(target, Some(actual_port))
                    .evidence(json!({
                        "not_after_unix": not_after,
                        "days_remaining": days_remaining,
                    })),
                ),
                _ => {}
            }

            // Step 5: key size.
            if let Some(bits) = key_bits(cert) {
                if bits < 2048 {
                    findings.push(
                        ShieldFinding::new(
                            "tls",
                            FindingSeverity::High,
                            "Weak Certificate Key Size",
                        )
                        .description(format!(
                            "The certificate uses a {bits}-bit key, below the recommended 2048-bit minimum."
                        ))
                        .remediation(
                            "Generate a new certificate with at least a 2048-bit RSA key or 256-bit ECDSA key.",
                        )
                        .target(target, Some(actual_port))
                        .evidence(json!({ "key_bits": bits })),
                    );
                }
            }

            // Step 7: SAN/CN match.
            if !cert_matches_target(cert, target) {
                findings.push(
                    ShieldFinding::new("tls", FindingSeverity::Medium, "Certificate Name Mismatch")
                        .description(format!(
                            "The certificate does not match the target hostname '{target}'."
                        ))
                        .remediation(
                            "Obtain a certificate that includes the correct hostname in the SAN field.",
                        )
                        .target(target, Some(actual_port))
                        .evidence(json!({
                            "target": target,
                            "san": san_entries(cert),
                        })),
                );
            }
        }

        // Step 4: protocol version.
        if let Some(protocol) = &probe.protocol {
            if DEPRECATED_PROTOCOLS.contains(&protocol.as_str()) {
                findings.push(
                    ShieldFinding::new(
                        "tls",
                        FindingSeverity::Critical,
                        "Deprecated TLS Protocol Version",
                    )
                    .description(format!(
                        "The server negotiated {protocol}, which is deprecated and insecure."
                    ))
                    .remediation(
                        "Disable TLS 1.0, TLS 1.1, and all SSL versions. Use TLS 1.2 or TLS 1.3.",
                    )
                    .target(target, Some(actual_port))
                    .evidence(json!({ "protocol_version": protocol }))
                    .attack("T1040", "Credential Access"),
                );
            }
        }

        // Step 6: cipher suite.
        if let Some(cipher) = &probe.cipher {
            if is_weak_cipher(cipher) {
                findings.push(
                    ShieldFinding::new("tls", FindingSeverity::High, "Weak Cipher Suite")
                        .description(format!(
                            "The negotiated cipher suite '{cipher}' uses weak cryptographic algorithms."
                        ))
                        .remediation(
                            "Disable weak cipher suites (RC4, DES, 3DES, NULL, EXPORT, anonymous).",
                        )
                        .target(target, Some(actual_port))
                        .evidence(json!({
                            "cipher_name": cipher,
                            "protocol": probe.protocol,
                        }))
                        .attack("T1557", "Credential Access"),
                );
            }
        }

        // Step 8: HSTS header.
        if let Some(finding) = self.check_hsts(target, actual_port).await {
            findings.push(finding);
        }

        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weak_cipher_detection() {
        assert!(is_weak_cipher("TLS_RSA_WITH_RC4_128_SHA"));
        assert!(is_weak_cipher("DES-CBC3-SHA"));
        assert!(is_weak_cipher("TLS_RSA_WITH_NULL_MD5"));
        assert!(!is_weak_cipher("TLS13_AES_256_GCM_SHA384"));
        assert!(!is_weak_cipher("ECDHE-RSA-AES128-GCM-SHA256"));
    }

    #[test]
    fn test_expiry_boundaries() {
        assert_eq!(expiry_severity(-1), Some(FindingSeverity::Critical));
        assert_eq!(expiry_severity(0), Some(FindingSeverity::Medium));
        assert_eq!(expiry_severity(30), Some(FindingSeverity::Medium));
        assert_eq!(expiry_severity(31), None);
        assert_eq!(expiry_severity(365), None);
    }

    #[test]
    fn test_hostname_exact_match() {
        assert!(hostname_matches("example.com", "example.com"));
        assert!(hostname_matches("EXAMPLE.com", "example.COM"));
        assert!(!hostname_matches("example.com", "other.com"));
    }

    #[test]
    fn test_hostname_wildcard_match() {
        assert!(hostname_matches("*.example.com", "foo.example.com"));
        assert!(!hostname_matches("*.example.com", "foo.bar.example.com"));
        assert!(!hostname_matches("*.example.com", "example.com"));
        assert!(!hostname_matches("*.example.com", ".example.com"));
    }

    #[test]
    fn test_deprecated_protocol_table() {
        for proto in ["SSLv2", "SSLv3", "TLSv1", "TLSv1.1"] {
            assert!(DEPRECATED_PROTOCOLS.contains(&proto));
        }
        assert!(!DEPRECATED_PROTOCOLS.contains(&"TLSv1.2"));
        assert!(!DEPRECATED_PROTOCOLS.contains(&"TLSv1.3"));
    }
}
