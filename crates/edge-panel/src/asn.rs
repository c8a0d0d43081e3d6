//! ASN resolution and clustering for the anomaly analyzer.
//!
//! Addresses resolve through the RIPEstat network-info endpoint with a
//! seven-day cache in the store. Clustering groups a user's IPs by ASN
//! and keeps only groups whose summed visits reach the activity
//! threshold, so a handful of idle IPs cannot trip the device limit.

use crate::error::Result;
use crate::store::{self, anomalies};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const RIPE_URL: &str = "https://stat.ripe.net/data/network-info/data.json";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsnInfo {
    pub asn: Option<String>,
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AsnGroup {
    pub asn: Option<String>,
    pub prefix: Option<String>,
    pub ips: Vec<String>,
    pub count: usize,
    pub visits: i64,
}

/// Resolve a batch of IPs, hitting RIPE only for cache misses.
pub async fn lookup_ips(pool: &SqlitePool, ips: &[String]) -> Result<HashMap<String, AsnInfo>> {
    let now = store::now_naive();
    let mut resolved = HashMap::new();
    let mut misses = Vec::new();

    for ip in ips {
        match anomalies::asn_cache_get(pool, ip, now).await? {
            Some((asn, prefix)) => {
                resolved.insert(ip.clone(), AsnInfo { asn, prefix });
            }
            None => misses.push(ip.clone()),
        }
    }

    if misses.is_empty() {
        return Ok(resolved);
    }

    let client = reqwest::Client::builder().timeout(LOOKUP_TIMEOUT).build()?;
    for ip in misses {
        let info = query_ripe(&client, &ip).await.unwrap_or_default();
        anomalies::asn_cache_put(pool, &ip, info.asn.as_deref(), info.prefix.as_deref(), now)
            .await?;
        resolved.insert(ip, info);
    }

    Ok(resolved)
}

async fn query_ripe(client: &reqwest::Client, ip: &str) -> Option<AsnInfo> {
    let response = client
        .get(RIPE_URL)
        .query(&[("resource", ip)])
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    let body: Value = response.json().await.ok()?;
    let data = body.get("data")?;
    let asn = data
        .get("asns")
        .and_then(Value::as_array)
        .and_then(|asns| asns.first())
        .map(|v| match v {
            Value::String(s) => format!("AS{}", s.trim_start_matches("AS")),
            other => format!("AS{}", other),
        });
    let prefix = data
        .get("prefix")
        .and_then(Value::as_str)
        .map(str::to_string);
    debug!("resolved {} -> {:?}", ip, asn);
    Some(AsnInfo { asn, prefix })
}

/// Cluster IPs by ASN, summing visits, and keep only groups whose total
/// reaches `min_visits`. Unresolved IPs fall into a `None` group.
pub fn group_by_asn(
    asn_map: &HashMap<String, AsnInfo>,
    ip_visits: &HashMap<String, i64>,
    min_visits: i64,
) -> Vec<AsnGroup> {
    let mut grouped: HashMap<Option<String>, AsnGroup> = HashMap::new();

    for (ip, visits) in ip_visits {
        let info = asn_map.get(ip).cloned().unwrap_or_default();
        let group = grouped.entry(info.asn.clone()).or_insert_with(|| AsnGroup {
            asn: info.asn.clone(),
            prefix: info.prefix.clone(),
            ips: Vec::new(),
            count: 0,
            visits: 0,
        });
        group.ips.push(ip.clone());
        group.count += 1;
        group.visits += visits;
    }

    let mut groups: Vec<AsnGroup> = grouped
        .into_values()
        .filter(|group| group.visits >= min_visits)
        .collect();
    for group in &mut groups {
        group.ips.sort();
    }
    groups.sort_by(|a, b| b.visits.cmp(&a.visits));
    groups
}

/// Effective IP group count: how many active ASN clusters the user has.
pub fn effective_ip_count(groups: &[AsnGroup]) -> usize {
    groups.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(asn: &str) -> AsnInfo {
        AsnInfo {
            asn: Some(asn.to_string()),
            prefix: Some(format!("{}.0/24", asn)),
        }
    }

    #[test]
    fn groups_filter_by_visit_threshold() {
        // The seed scenario: 8 IPs across 3 ASNs with 1200/1500/300
        // visits; only two groups reach the 1000-visit threshold.
        let mut asn_map = HashMap::new();
        let mut visits = HashMap::new();
        for (i, (asn, per_ip)) in [("AS1", 400), ("AS1", 400), ("AS1", 400),
                                   ("AS2", 500), ("AS2", 500), ("AS2", 500),
                                   ("AS3", 150), ("AS3", 150)]
        .iter()
        .enumerate()
        {
            let ip = format!("10.0.0.{}", i);
            asn_map.insert(ip.clone(), info(asn));
            visits.insert(ip, *per_ip as i64);
        }

        let groups = group_by_asn(&asn_map, &visits, 1000);
        assert_eq!(effective_ip_count(&groups), 2);
        assert_eq!(groups[0].asn.as_deref(), Some("AS2"));
        assert_eq!(groups[0].visits, 1500);
        assert_eq!(groups[1].visits, 1200);
    }

    #[test]
    fn unresolved_ips_cluster_together() {
        let asn_map = HashMap::new();
        let visits: HashMap<String, i64> =
            [("1.1.1.1".to_string(), 600), ("2.2.2.2".to_string(), 600)]
                .into_iter()
                .collect();
        let groups = group_by_asn(&asn_map, &visits, 1000);
        assert_eq!(groups.len(), 1);
        assert!(groups[0].asn.is_none());
        assert_eq!(groups[0].count, 2);
        assert_eq!(groups[0].visits, 1200);
    }
}
