//! Deterministic peer identity: anonymization, public-address filtering, and
//! the `<peerId>@<ip>:<port> (@ <location>)` grammar parser.
//!
//! Hash lengths (8 hex for the anonymous id, 6 hex for the self-id hash) are
//! pinned to match the reference telemetry dashboard this system replaces.

use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;
use std::sync::OnceLock;

fn peer_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\w+)@(\d+\.\d+\.\d+\.\d+):(\d+)\s*\(@\s*([\d.]+)\)").expect("valid regex")
    })
}

/// Hard-coded gateway allowlist. `spec.md` §6 treats this as a known
/// constant; a deployment may extend it via configuration.
pub const DEFAULT_GATEWAY_IPS: &[&str] = &["5.9.111.215"];

pub fn anonymize_ip(ip: Ipv4Addr) -> String {
    let digest = Sha256::digest(ip.to_string().as_bytes());
    format!("peer-{}", hex::encode(&digest[..4]))
}

pub fn self_id_hash(ip: Ipv4Addr) -> String {
    let digest = Sha256::digest(ip.to_string().as_bytes());
    hex::encode(&digest[..3])
}

/// A fresh 16-hex-character priority token, replayed by reconnecting clients.
pub fn generate_priority_token() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn is_valid_priority_token(token: &str) -> bool {
    token.len() == 16 && token.chars().all(|c| c.is_ascii_hexdigit())
}

/// True for addresses that are routable on the public internet: neither
/// private, loopback, link-local, documentation/test-net, nor unspecified.
pub fn is_public_ip(ip: Ipv4Addr) -> bool {
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_documentation()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast())
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerStringParts {
    pub peer_id: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub location: f64,
}

/// Parses the `<peerId>@<ip>:<port> (@ <location>)` grammar. Returns `None`
/// if the string doesn't contain a match anywhere (the grammar is searched
/// for, not anchored, matching upstream telemetry producers that sometimes
/// wrap the token in surrounding text).
pub fn parse_peer_string(input: &str) -> Option<PeerStringParts> {
    let caps = peer_pattern().captures(input)?;
    let ip: Ipv4Addr = caps.get(2)?.as_str().parse().ok()?;
    let port: u16 = caps.get(3)?.as_str().parse().ok()?;
    let location: f64 = caps.get(4)?.as_str().parse().ok()?;
    Some(PeerStringParts {
        peer_id: caps.get(1)?.as_str().to_owned(),
        ip,
        port,
        location,
    })
}

pub fn format_peer_string(peer_id: &str, ip: Ipv4Addr, port: u16, location: f64) -> String {
    format!("{peer_id}@{ip}:{port} (@ {location})")
}

pub fn is_gateway_ip(ip: Ipv4Addr, gateway_ips: &[Ipv4Addr]) -> bool {
    gateway_ips.contains(&ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_peer_string_extracts_all_fields() {
        let parsed = parse_peer_string("X@1.2.3.4:5000 (@ 0.25)").unwrap();
        assert_eq!(parsed.peer_id, "X");
        assert_eq!(parsed.ip, Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(parsed.port, 5000);
        assert!((parsed.location - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_peer_string_rejects_garbage() {
        assert!(parse_peer_string("not a peer string").is_none());
        assert!(parse_peer_string("").is_none());
    }

    #[test]
    fn round_trip_law_holds_for_constructed_strings() {
        let cases = [
            ("abc123", Ipv4Addr::new(203, 0, 113, 7), 4000u16, 0.5f64),
            ("Z9", Ipv4Addr::new(8, 8, 8, 8), 1, 0.0),
            ("peerXYZ", Ipv4Addr::new(255, 255, 255, 254), 65535, 0.999999),
        ];
        for (id, ip, port, loc) in cases {
            let s = format_peer_string(id, ip, port, loc);
            let parsed = parse_peer_string(&s).unwrap();
            assert_eq!(parsed.peer_id, id);
            assert_eq!(parsed.ip, ip);
            assert!((parsed.location - loc).abs() < 1e-9);
        }
    }

    #[test]
    fn anonymization_is_pure() {
        let ip = Ipv4Addr::new(9, 9, 9, 9);
        assert_eq!(anonymize_ip(ip), anonymize_ip(ip));
        assert_eq!(self_id_hash(ip), self_id_hash(ip));
    }

    #[test]
    fn is_public_ip_rejects_private_loopback_and_test_ranges() {
        assert!(!is_public_ip(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!is_public_ip(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(!is_public_ip(Ipv4Addr::new(172, 16, 0, 1)));
        assert!(!is_public_ip(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(!is_public_ip(Ipv4Addr::new(169, 254, 1, 1)));
        assert!(!is_public_ip(Ipv4Addr::new(192, 0, 2, 1)));
        assert!(is_public_ip(Ipv4Addr::new(1, 2, 3, 4)));
        assert!(is_public_ip(Ipv4Addr::new(5, 9, 111, 215)));
    }

    #[test]
    fn priority_token_is_sixteen_hex_chars() {
        let token = generate_priority_token();
        assert!(is_valid_priority_token(&token));
    }
}
