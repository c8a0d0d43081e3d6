//! IP/CIDR validation and normalization shared by the node drivers and
//! the panel blocklist pipeline.

use ipnetwork::IpNetwork;
use regex::Regex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::OnceLock;

fn ipv4_cidr_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d{1,3}\.){3}\d{1,3}(/\d{1,2})?$").unwrap())
}

/// Validate an IPv4 address or CIDR block. Regex shape check first,
/// then per-octet and prefix range checks.
pub fn validate_ip_cidr(ip: &str) -> bool {
    let ip = ip.trim();
    if ip.is_empty() || !ipv4_cidr_pattern().is_match(ip) {
        return false;
    }

    let addr_part = ip.split('/').next().unwrap_or("");
    for octet in addr_part.split('.') {
        match octet.parse::<u32>() {
            Ok(v) if v <= 255 => {}
            _ => return false,
        }
    }

    if let Some(prefix) = ip.split('/').nth(1) {
        match prefix.parse::<u32>() {
            Ok(p) if p <= 32 => {}
            _ => return false,
        }
    }

    true
}

/// Normalize an address: trim whitespace and drop a redundant `/32`.
pub fn normalize_ip(ip: &str) -> String {
    let ip = ip.trim();
    match ip.strip_suffix("/32") {
        Some(bare) => bare.to_string(),
        None => ip.to_string(),
    }
}

/// Normalize using full address parsing where possible. Falls back to the
/// lightweight normalization for inputs that are not parseable.
pub fn canonicalize_ip(ip: &str) -> String {
    let ip = ip.trim();
    if ip.contains('/') {
        if let Ok(net) = ip.parse::<IpNetwork>() {
            if let IpNetwork::V4(v4) = net {
                if v4.prefix() == 32 {
                    return v4.ip().to_string();
                }
            }
            return net.to_string();
        }
    } else if let Ok(addr) = ip.parse::<IpAddr>() {
        return addr.to_string();
    }
    normalize_ip(ip)
}

/// Deduplicate a list of addresses after normalization, dropping invalid
/// entries and preserving first-seen order.
///
/// Idempotent: `deduplicate_ips(deduplicate_ips(xs)) == deduplicate_ips(xs)`.
pub fn deduplicate_ips<I, S>(ips: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for ip in ips {
        let normalized = canonicalize_ip(ip.as_ref());
        if normalized.is_empty() || !is_valid_ip_or_network(&normalized) {
            continue;
        }
        if seen.insert(normalized.clone()) {
            result.push(normalized);
        }
    }
    result
}

fn is_valid_ip_or_network(s: &str) -> bool {
    if s.contains('/') {
        s.parse::<IpNetwork>().is_ok()
    } else {
        s.parse::<IpAddr>().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_addresses() {
        assert!(validate_ip_cidr("1.2.3.4"));
        assert!(validate_ip_cidr("10.0.0.0/8"));
        assert!(validate_ip_cidr(" 192.168.1.1 "));
    }

    #[test]
    fn invalid_addresses() {
        assert!(!validate_ip_cidr(""));
        assert!(!validate_ip_cidr("junk"));
        assert!(!validate_ip_cidr("256.1.1.1"));
        assert!(!validate_ip_cidr("1.2.3.4/33"));
        assert!(!validate_ip_cidr("1.2.3"));
        assert!(!validate_ip_cidr("::1"));
    }

    #[test]
    fn normalization_drops_slash32() {
        assert_eq!(normalize_ip("1.2.3.4/32"), "1.2.3.4");
        assert_eq!(normalize_ip("10.0.0.0/8"), "10.0.0.0/8");
        assert_eq!(normalize_ip("  5.5.5.5 "), "5.5.5.5");
    }

    #[test]
    fn dedup_is_idempotent() {
        let input = vec!["1.1.1.1", "1.1.1.1/32", "2.2.2.2", "junk", "2.2.2.2"];
        let once = deduplicate_ips(input.clone());
        let twice = deduplicate_ips(once.clone());
        assert_eq!(once, vec!["1.1.1.1", "2.2.2.2"]);
        assert_eq!(once, twice);
    }

    #[test]
    fn dedup_keeps_networks() {
        let out = deduplicate_ips(vec!["10.0.0.0/8", "10.0.0.0/8", "1.2.3.4"]);
        assert_eq!(out, vec!["10.0.0.0/8", "1.2.3.4"]);
    }
}
