//! Local network fingerprint: identifies which network the agent is on so
//! pushed scans can be grouped server-side.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct NetworkFingerprint {
    pub fingerprint_hash: String,
    pub gateway_ip: Option<String>,
    pub interface: Option<String>,
}

/// Detect the current network; None when no default route is readable.
pub fn detect_network_fingerprint() -> Option<NetworkFingerprint> {
    let route_table = std::fs::read_to_string("/proc/net/route").ok()?;
    let (interface, gateway_ip) = parse_default_route(&route_table)?;

    let digest = blake3::hash(format!("{interface}|{gateway_ip}").as_bytes());
    Some(NetworkFingerprint {
        fingerprint_hash: digest.to_hex().to_string(),
        gateway_ip: Some(gateway_ip),
        interface: Some(interface),
    })
}

/// Parse /proc/net/route for the default route (destination 00000000).
/// Gateway octets are little-endian hex.
fn parse_default_route(table: &str) -> Option<(String, String)> {
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[1] != "00000000" {
            continue;
        }
        let raw = u32::from_str_radix(fields[2], 16).ok()?;
        let octets = raw.to_le_bytes();
        // Filter "0.0.0.0" entries that are not real gateways.
        if raw == 0 {
            continue;
        }
        let gateway = format!(
            "{}.{}.{}.{}",
            octets[0], octets[1], octets[2], octets[3]
        );
        return Some((fields[0].to_string(), gateway));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTE_TABLE: &str = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\n\
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\n\
eth0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\n";

    #[test]
    fn test_parse_default_route() {
        let (iface, gateway) = parse_default_route(ROUTE_TABLE).unwrap();
        assert_eq!(iface, "eth0");
        // 0101A8C0 little-endian = 192.168.1.1
        assert_eq!(gateway, "192.168.1.1");
    }

    #[test]
    fn test_parse_no_default_route() {
        let table = "Iface\tDestination\tGateway\neth0\t0001A8C0\t00000000\n";
        assert!(parse_default_route(table).is_none());
    }

    #[test]
    fn test_fingerprint_hash_is_stable() {
        let a = blake3::hash(b"eth0|192.168.1.1").to_hex().to_string();
        let b = blake3::hash(b"eth0|192.168.1.1").to_hex().to_string();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
