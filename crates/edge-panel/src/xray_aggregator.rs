//! Xray stats aggregator: pulls per-node visit aggregates, merges them
//! into the fact table under a process-wide write lock, and rebuilds
//! the summary projections after each successful cycle.

use crate::error::Result;
use crate::infra;
use crate::node_client::NodeClient;
use crate::remnawave::UpstreamClient;
use crate::store::anomalies::UserCacheRow;
use crate::store::settings::RemnawaveSettings;
use crate::store::{self, anomalies, settings, xray};
use chrono::{NaiveDateTime, Timelike};
use edge_types::{extract_host, XrayStatEntry};
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const SETTINGS_CHECK_TICKS: i64 = 15;
const USER_CACHE_INTERVAL: Duration = Duration::from_secs(1800);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(86_400);
const DEADLOCK_RETRIES: u32 = 3;

/// Build the merge delta from one node's report: filtered, re-keyed by
/// host and summed. Also returns (total visits, unique users, unique
/// hosts) for the hourly row.
pub fn build_updates(
    stats: &[XrayStatEntry],
    ignored_users: &HashSet<i64>,
    excluded_hosts: &HashSet<String>,
) -> (HashMap<(i64, String, String), i64>, i64, i64, i64) {
    let mut updates: HashMap<(i64, String, String), i64> = HashMap::new();
    let mut total = 0i64;
    let mut users = HashSet::new();
    let mut hosts = HashSet::new();

    for entry in stats {
        if entry.email == 0 || entry.source_ip.is_empty() || entry.count == 0 {
            continue;
        }
        // Destinations are matched without a port on both sides.
        let host = extract_host(&entry.host).to_string();
        if host.is_empty() {
            continue;
        }
        if ignored_users.contains(&entry.email) {
            continue;
        }
        if excluded_hosts.contains(&host) {
            continue;
        }

        *updates
            .entry((entry.email, entry.source_ip.clone(), host.clone()))
            .or_insert(0) += entry.count;
        total += entry.count;
        users.insert(entry.email);
        hosts.insert(host);
    }

    (updates, total, users.len() as i64, hosts.len() as i64)
}

pub fn floor_to_hour(now: NaiveDateTime) -> NaiveDateTime {
    now.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

pub struct XrayAggregator {
    pool: SqlitePool,
    client: NodeClient,
    // Serializes cross-node writes to the fact table. Parallel upserts
    // on the same composite key deadlock the store without this.
    write_lock: Mutex<()>,
    running: Arc<AtomicBool>,
    collecting: AtomicBool,
    user_cache_updating: AtomicBool,
    collection_interval: AtomicI64,
    time_since_collect: AtomicI64,
    last_collect: Mutex<Option<NaiveDateTime>>,
    last_user_cache_update: Mutex<Option<NaiveDateTime>>,
    batch_cache: Mutex<Option<serde_json::Value>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl XrayAggregator {
    pub fn new(pool: SqlitePool) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            pool,
            client: NodeClient::new()?,
            write_lock: Mutex::new(()),
            running: Arc::new(AtomicBool::new(false)),
            collecting: AtomicBool::new(false),
            user_cache_updating: AtomicBool::new(false),
            collection_interval: AtomicI64::new(300),
            time_since_collect: AtomicI64::new(0),
            last_collect: Mutex::new(None),
            last_user_cache_update: Mutex::new(None),
            batch_cache: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    async fn settings(&self) -> RemnawaveSettings {
        settings::remnawave_settings(&self.pool)
            .await
            .unwrap_or_default()
    }

    /// Merge one node's stats. Holds the process-wide write lock for
    /// the whole batch; deadlocks retry with back-off.
    pub async fn save_stats(&self, stats: &[XrayStatEntry]) -> Result<()> {
        let settings = self.settings().await;
        let ignored = settings.ignored_users();
        let excluded = settings::excluded_destinations(&self.pool).await?;

        let (updates, total, unique_users, unique_hosts) =
            build_updates(stats, &ignored, &excluded);
        if updates.is_empty() {
            return Ok(());
        }

        let now = store::now_naive();
        let hour = floor_to_hour(now);

        let _guard = self.write_lock.lock().await;
        for attempt in 1..=DEADLOCK_RETRIES {
            let merged = async {
                xray::upsert_stats(&self.pool, &updates, now).await?;
                xray::upsert_hourly(&self.pool, hour, total, unique_users, unique_hosts).await
            }
            .await;

            match merged {
                Ok(()) => {
                    debug!("saved {} unique entries via batch upsert", updates.len());
                    return Ok(());
                }
                Err(e) => {
                    let contended = e.to_string().to_lowercase().contains("deadlock")
                        || e.to_string().to_lowercase().contains("locked");
                    if contended && attempt < DEADLOCK_RETRIES {
                        warn!("contention in save_stats (attempt {}), retrying...", attempt);
                        tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn collect_from_node(
        &self,
        node_id: i64,
        server: &crate::store::servers::Server,
    ) {
        let now = store::now_naive();
        match self.client.collect_xray_stats(server).await {
            Ok(report) => {
                if !report.stats.is_empty() {
                    if let Err(e) = self.save_stats(&report.stats).await {
                        error!("failed to save stats from {}: {}", server.name, e);
                        let _ = settings::update_node_status(
                            &self.pool,
                            node_id,
                            Some(&e.to_string()),
                            now,
                        )
                        .await;
                        return;
                    }
                }
                let _ = settings::update_node_status(&self.pool, node_id, None, now).await;
                debug!(
                    "collected {} stat entries from {}",
                    report.stats.len(),
                    server.name
                );
            }
            Err(e) => {
                let message = e.to_string();
                debug!("failed to collect from {}: {}", server.name, message);
                let _ =
                    settings::update_node_status(&self.pool, node_id, Some(&message), now).await;
            }
        }
    }

    pub async fn collect_from_all_nodes(&self) -> Result<usize> {
        let nodes = settings::enabled_nodes(&self.pool).await?;
        if nodes.is_empty() {
            return Ok(0);
        }

        self.collecting.store(true, Ordering::SeqCst);
        let futures: Vec<_> = nodes
            .iter()
            .map(|(node, server)| self.collect_from_node(node.id, server))
            .collect();
        futures::future::join_all(futures).await;
        *self.last_collect.lock().await = Some(store::now_naive());
        self.collecting.store(false, Ordering::SeqCst);
        Ok(nodes.len())
    }

    pub async fn rebuild_summaries(&self) -> Result<()> {
        let infra_ips = infra::infrastructure_ips(&self.pool).await?;
        xray::rebuild_summaries(&self.pool, &infra_ips).await?;
        self.warm_batch_cache().await;
        Ok(())
    }

    /// Pre-compute the default dashboard batch (all time, top 100 users
    /// and destinations) so the batch endpoint answers without touching
    /// the projections.
    pub async fn warm_batch_cache(&self) {
        let batch = async {
            let global = xray::global_summary(&self.pool).await?;
            let users = xray::top_users(&self.pool, 100).await?;
            let destinations = xray::top_destinations(&self.pool, 100).await?;
            Ok::<_, crate::error::PanelError>(serde_json::json!({
                "global": global,
                "top_users": users,
                "top_destinations": destinations,
            }))
        }
        .await;

        match batch {
            Ok(value) => *self.batch_cache.lock().await = Some(value),
            Err(e) => warn!("failed to warm batch cache: {}", e),
        }
    }

    pub async fn cached_batch(&self) -> Option<serde_json::Value> {
        self.batch_cache.lock().await.clone()
    }

    /// Manual trigger: one full cycle now.
    pub async fn collect_now(&self) -> serde_json::Value {
        let settings = self.settings().await;
        if !settings.enabled {
            return serde_json::json!({
                "success": false, "error": "Collection is disabled",
                "collected_at": null, "nodes_count": 0
            });
        }
        if self.collecting.load(Ordering::SeqCst) {
            return serde_json::json!({
                "success": false, "error": "Collection already in progress",
                "collected_at": null, "nodes_count": 0
            });
        }

        let nodes_count = self.collect_from_all_nodes().await.unwrap_or(0);
        if let Err(e) = self.rebuild_summaries().await {
            warn!("post-collection summary rebuild failed: {}", e);
        }
        self.time_since_collect.store(0, Ordering::Relaxed);
        let collected_at = self
            .last_collect
            .lock()
            .await
            .map(|t| format!("{}Z", t.format("%Y-%m-%dT%H:%M:%S")));
        serde_json::json!({
            "success": true,
            "collected_at": collected_at,
            "nodes_count": nodes_count
        })
    }

    pub async fn status(&self) -> serde_json::Value {
        let interval = self.collection_interval.load(Ordering::Relaxed);
        let elapsed = self.time_since_collect.load(Ordering::Relaxed);
        let next = if self.running.load(Ordering::Relaxed) {
            Some((interval - elapsed).max(0))
        } else {
            None
        };
        let last = self
            .last_collect
            .lock()
            .await
            .map(|t| format!("{}Z", t.format("%Y-%m-%dT%H:%M:%S")));
        serde_json::json!({
            "running": self.running.load(Ordering::Relaxed),
            "collecting": self.collecting.load(Ordering::Relaxed),
            "collection_interval": interval,
            "last_collect_time": last,
            "next_collect_in": next
        })
    }

    // ── user cache ──

    fn parse_upstream_datetime(value: Option<&Value>) -> Option<NaiveDateTime> {
        let raw = value?.as_str()?;
        let normalized = raw.trim_end_matches('Z');
        chrono::DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.naive_utc())
            .or_else(|_| {
                NaiveDateTime::parse_from_str(normalized, "%Y-%m-%dT%H:%M:%S%.f")
            })
            .ok()
    }

    fn user_to_row(user: &Value) -> Option<UserCacheRow> {
        let email = user.get("id").and_then(Value::as_i64)?;
        let traffic = user.get("userTraffic").cloned().unwrap_or(Value::Null);
        let string_of = |v: &Value, key: &str| -> Option<String> {
            v.get(key).and_then(Value::as_str).map(str::to_string)
        };

        Some(UserCacheRow {
            email,
            uuid: string_of(user, "uuid"),
            short_uuid: string_of(user, "shortUuid"),
            username: string_of(user, "username"),
            telegram_id: user
                .get("telegramId")
                .map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .flatten(),
            status: string_of(user, "status"),
            expire_at: Self::parse_upstream_datetime(user.get("expireAt")),
            subscription_url: string_of(user, "subscriptionUrl"),
            sub_last_user_agent: string_of(user, "subLastUserAgent"),
            sub_last_opened_at: Self::parse_upstream_datetime(user.get("subLastOpenedAt")),
            traffic_limit_bytes: user.get("trafficLimitBytes").and_then(Value::as_i64),
            traffic_limit_strategy: string_of(user, "trafficLimitStrategy"),
            last_traffic_reset_at: Self::parse_upstream_datetime(user.get("lastTrafficResetAt")),
            used_traffic_bytes: traffic.get("usedTrafficBytes").and_then(Value::as_i64),
            lifetime_used_traffic_bytes: traffic
                .get("lifetimeUsedTrafficBytes")
                .and_then(Value::as_i64),
            online_at: Self::parse_upstream_datetime(traffic.get("onlineAt")),
            first_connected_at: Self::parse_upstream_datetime(traffic.get("firstConnectedAt")),
            hwid_device_limit: user.get("hwidDeviceLimit").and_then(Value::as_i64),
            user_email: string_of(user, "email"),
            description: string_of(user, "description"),
            tag: string_of(user, "tag"),
            created_at: Self::parse_upstream_datetime(user.get("createdAt")),
        })
    }

    /// Mirror the upstream user list: batch upsert, then delete anyone
    /// the fresh response no longer contains. On persistent failure the
    /// old cache is left untouched.
    pub async fn update_user_cache(&self) -> serde_json::Value {
        let settings = self.settings().await;
        let (Some(api_url), Some(api_token)) = (&settings.api_url, &settings.api_token) else {
            return serde_json::json!({"success": false, "error": "API not configured", "count": 0});
        };
        if self.user_cache_updating.swap(true, Ordering::SeqCst) {
            return serde_json::json!({"success": false, "error": "Update already in progress", "count": 0});
        }

        let mut last_error = String::new();
        for attempt in 1..=2u32 {
            let client = match UpstreamClient::new(
                api_url,
                api_token,
                settings.cookie_secret.as_deref(),
            ) {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    last_error = e.to_string();
                    break;
                }
            };

            match client.all_users_paginated(200, 5).await {
                Ok(users) => {
                    let now = store::now_naive();
                    let rows: Vec<UserCacheRow> =
                        users.iter().filter_map(Self::user_to_row).collect();
                    let emails: Vec<i64> = rows.iter().map(|r| r.email).collect();

                    let saved = async {
                        if !rows.is_empty() {
                            anomalies::upsert_user_cache(&self.pool, &rows, now).await?;
                        }
                        if !emails.is_empty() {
                            anomalies::delete_users_not_in(&self.pool, &emails).await?;
                        }
                        Ok::<_, crate::error::PanelError>(())
                    }
                    .await;

                    match saved {
                        Ok(()) => {
                            *self.last_user_cache_update.lock().await = Some(now);
                            info!("user cache synced: {} users (stale removed)", rows.len());
                            self.user_cache_updating.store(false, Ordering::SeqCst);
                            return serde_json::json!({
                                "success": true, "count": rows.len(), "error": null
                            });
                        }
                        Err(e) => last_error = e.to_string(),
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!("user cache sync attempt {}/2 failed: {}", attempt, last_error);
                }
            }

            if attempt < 2 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }

        self.user_cache_updating.store(false, Ordering::SeqCst);
        warn!("user cache sync failed after 2 attempts, keeping old cache");
        serde_json::json!({"success": false, "error": last_error, "count": 0})
    }

    pub async fn user_cache_status(&self) -> serde_json::Value {
        let last = self
            .last_user_cache_update
            .lock()
            .await
            .map(|t| format!("{}Z", t.format("%Y-%m-%dT%H:%M:%S")));
        serde_json::json!({
            "last_update": last,
            "updating": self.user_cache_updating.load(Ordering::Relaxed),
            "update_interval": USER_CACHE_INTERVAL.as_secs()
        })
    }

    // ── cleanup ──

    pub async fn cleanup_old_data(&self) -> Result<()> {
        let settings = self.settings().await;
        let now = store::now_naive();
        let deleted = xray::cleanup(
            &self.pool,
            now,
            settings.visit_stats_retention_days.max(1),
            settings.hourly_stats_retention_days.max(1),
        )
        .await?;

        if deleted > 0 {
            info!("xray stats cleanup: {} rows removed", deleted);
            if let Err(e) = xray::vacuum(&self.pool).await {
                debug!("VACUUM failed (non-critical): {}", e);
            }
        } else {
            info!("xray stats cleanup completed (nothing to delete)");
        }
        Ok(())
    }

    // ── loops ──

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = self.tasks.lock().await;

        let collector = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut settings_tick = SETTINGS_CHECK_TICKS;
            let mut enabled = false;

            while collector.running.load(Ordering::SeqCst) {
                if settings_tick >= SETTINGS_CHECK_TICKS {
                    settings_tick = 0;
                    let settings = collector.settings().await;
                    enabled = settings.enabled;
                    let interval = settings.collection_interval.clamp(60, 900);
                    let old = collector.collection_interval.swap(interval, Ordering::Relaxed);
                    if old != interval {
                        info!("collection interval changed: {}s -> {}s", old, interval);
                    }
                }

                let interval = collector.collection_interval.load(Ordering::Relaxed);
                if enabled && collector.time_since_collect.load(Ordering::Relaxed) >= interval {
                    if let Err(e) = collector.collect_from_all_nodes().await {
                        error!("collection error: {}", e);
                    }
                    if let Err(e) = collector.rebuild_summaries().await {
                        warn!("post-collection tasks failed: {}", e);
                    }
                    collector.time_since_collect.store(0, Ordering::Relaxed);
                }

                tokio::time::sleep(Duration::from_secs(1)).await;
                collector.time_since_collect.fetch_add(1, Ordering::Relaxed);
                settings_tick += 1;
            }
        }));

        let cache = self.clone();
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            while cache.running.load(Ordering::SeqCst) {
                let settings = cache.settings().await;
                if settings.enabled {
                    cache.update_user_cache().await;
                }
                tokio::time::sleep(USER_CACHE_INTERVAL).await;
            }
        }));

        let cleaner = self.clone();
        tasks.push(tokio::spawn(async move {
            while cleaner.running.load(Ordering::SeqCst) {
                tokio::time::sleep(CLEANUP_INTERVAL).await;
                if let Err(e) = cleaner.cleanup_old_data().await {
                    error!("cleanup error: {}", e);
                }
            }
        }));

        info!("xray stats aggregator started (single-table mode)");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("xray stats aggregator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(email: i64, ip: &str, host: &str, count: i64) -> XrayStatEntry {
        XrayStatEntry {
            email,
            source_ip: ip.into(),
            host: host.into(),
            count,
        }
    }

    #[test]
    fn updates_filter_ignored_and_excluded() {
        let stats = vec![
            entry(42, "9.9.9.9", "a.com", 2),
            entry(42, "9.9.9.9", "a.com:443", 1), // port stripped, merges
            entry(7, "1.1.1.1", "b.com", 5),      // ignored user
            entry(42, "9.9.9.9", "ads.com", 9),   // excluded destination
            entry(0, "9.9.9.9", "c.com", 1),      // invalid email
        ];
        let ignored: HashSet<i64> = [7].into_iter().collect();
        let excluded: HashSet<String> = ["ads.com".to_string()].into_iter().collect();

        let (updates, total, users, hosts) = build_updates(&stats, &ignored, &excluded);
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[&(42, "9.9.9.9".to_string(), "a.com".to_string())],
            3
        );
        assert_eq!(total, 3);
        assert_eq!(users, 1);
        assert_eq!(hosts, 1);
    }

    #[test]
    fn hour_flooring() {
        let t = NaiveDateTime::parse_from_str("2026-03-01 13:45:59", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(
            floor_to_hour(t),
            NaiveDateTime::parse_from_str("2026-03-01 13:00:00", "%Y-%m-%d %H:%M:%S").unwrap()
        );
    }

    #[test]
    fn upstream_datetime_parsing() {
        let v = serde_json::json!("2026-01-02T03:04:05.123Z");
        let parsed = XrayAggregator::parse_upstream_datetime(Some(&v)).unwrap();
        assert_eq!(parsed.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-01-02 03:04:05");
        assert!(XrayAggregator::parse_upstream_datetime(Some(&serde_json::json!(null))).is_none());
    }
}
