//! Destination-to-host extraction.
//!
//! The rule is applied identically on ingest and on every query path:
//! a destination loses its trailing `:N` only when N is all digits, so
//! `example.com:443` becomes `example.com` but a bare IPv6-ish or
//! malformed tail is left untouched.

/// Strip a trailing `:port` from a destination string.
pub fn extract_host(destination: &str) -> &str {
    match destination.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => destination,
    }
}

#[cfg(test)]
mod tests {
    use super::extract_host;

    #[test]
    fn strips_numeric_port() {
        assert_eq!(extract_host("example.com:443"), "example.com");
        assert_eq!(extract_host("5.34.60.150:25402"), "5.34.60.150");
    }

    #[test]
    fn leaves_portless_input() {
        assert_eq!(extract_host("example.com"), "example.com");
        assert_eq!(extract_host("a.com:"), "a.com:");
        assert_eq!(extract_host("a.com:http"), "a.com:http");
    }
}
