//! Infrastructure IP resolution.
//!
//! Infrastructure addresses are never counted as client IPs: the set is
//! the union of configured server base-URL hosts, manually declared
//! addresses, and their resolved A/AAAA records (DNS cached for an
//! hour).

use crate::error::Result;
use crate::store::{self, settings};
use chrono::{Duration, NaiveDateTime};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::{Mutex, OnceLock};

const DNS_CACHE_TTL: i64 = 3600;

fn dns_cache() -> &'static Mutex<HashMap<String, (HashSet<String>, NaiveDateTime)>> {
    static CACHE: OnceLock<Mutex<HashMap<String, (HashSet<String>, NaiveDateTime)>>> =
        OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Extract the hostname from a base URL.
pub fn host_from_url(url: &str) -> Option<String> {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let authority = without_scheme.split('/').next()?;
    let host = authority.rsplit('@').next()?;
    // Strip a port unless the host is a bracketed IPv6 literal.
    let host = if host.starts_with('[') {
        host.trim_start_matches('[').split(']').next()?
    } else {
        host.split(':').next()?
    };
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

pub fn is_ip(address: &str) -> bool {
    address.parse::<IpAddr>().is_ok()
}

fn resolve_blocking(domain: &str) -> HashSet<String> {
    if is_ip(domain) {
        return [domain.to_string()].into_iter().collect();
    }
    match format!("{}:443", domain).to_socket_addrs() {
        Ok(addrs) => addrs.map(|a| a.ip().to_string()).collect(),
        Err(_) => HashSet::new(),
    }
}

/// Resolve an address through the in-memory DNS cache.
pub async fn resolve_address(address: &str) -> HashSet<String> {
    let now = store::now_naive();
    {
        let cache = dns_cache().lock().expect("dns cache poisoned");
        if let Some((ips, cached_at)) = cache.get(address) {
            if now - *cached_at < Duration::seconds(DNS_CACHE_TTL) {
                return ips.clone();
            }
        }
    }

    let owned = address.to_string();
    let ips = tokio::task::spawn_blocking(move || resolve_blocking(&owned))
        .await
        .unwrap_or_default();

    if !ips.is_empty() {
        dns_cache()
            .lock()
            .expect("dns cache poisoned")
            .insert(address.to_string(), (ips.clone(), now));
    }
    ips
}

/// The full infrastructure set, with per-address resolutions persisted
/// back onto their rows.
pub async fn infrastructure_ips(pool: &SqlitePool) -> Result<Vec<String>> {
    let mut ips: HashSet<String> = HashSet::new();

    for server in store::servers::list(pool).await? {
        if let Some(host) = host_from_url(&server.url) {
            ips.insert(host);
        }
    }

    let now = store::now_naive();
    for (id, address, stored_resolved) in settings::infrastructure_addresses(pool).await? {
        ips.insert(address.clone());
        let resolved = resolve_address(&address).await;
        ips.extend(resolved.iter().cloned());

        let mut sorted: Vec<&String> = resolved.iter().collect();
        sorted.sort();
        let resolved_json = if resolved.is_empty() {
            None
        } else {
            serde_json::to_string(&sorted).ok()
        };
        if resolved_json.as_deref() != stored_resolved.as_deref() {
            let _ = settings::save_resolved_ips(pool, id, resolved_json.as_deref(), now).await;
        }
    }

    let mut result: Vec<String> = ips.into_iter().collect();
    result.sort();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_host_from_urls() {
        assert_eq!(
            host_from_url("https://edge-1.example.com:8081/"),
            Some("edge-1.example.com".into())
        );
        assert_eq!(host_from_url("http://10.0.0.5"), Some("10.0.0.5".into()));
        assert_eq!(
            host_from_url("https://user@panel.example.com/path"),
            Some("panel.example.com".into())
        );
        assert_eq!(host_from_url("https://"), None);
    }

    #[test]
    fn ip_literals_resolve_to_themselves() {
        assert_eq!(
            resolve_blocking("1.2.3.4"),
            ["1.2.3.4".to_string()].into_iter().collect()
        );
    }
}
