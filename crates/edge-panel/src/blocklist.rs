//! Blocklist synchronizer.
//!
//! The effective set for every (server, direction) pair is the dedup of
//! global rules, server-specific rules and enabled sources. External lists
//! refresh on a long loop; a changed content hash triggers a fleet
//! sync. Each per-server sync runs against a snapshot of the rules and
//! its own deadline, so one dead node cannot poison the rest.

use crate::error::Result;
use crate::node_client::NodeClient;
use crate::store::blocklist::BlocklistSource;
use crate::store::{self, blocklist, settings};
use edge_types::{deduplicate_ips, validate_ip_cidr, Direction};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub const DEFAULT_UPDATE_INTERVAL: i64 = 86_400;
const MIN_UPDATE_INTERVAL: i64 = 3_600;
const MAX_UPDATE_INTERVAL: i64 = 7 * 86_400;
const FETCH_CACHE_TTL: Duration = Duration::from_secs(300);
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const PER_SERVER_DEADLINE: Duration = Duration::from_secs(30);

pub const DEFAULT_SOURCES: &[(&str, &str)] = &[
    (
        "AntiScanner",
        "https://raw.githubusercontent.com/shadow-netlab/traffic-guard-lists/refs/heads/main/public/antiscanner.list",
    ),
    (
        "Government Networks",
        "https://raw.githubusercontent.com/shadow-netlab/traffic-guard-lists/refs/heads/main/public/government_networks.list",
    ),
];

/// Parse a fetched list: strip `#` comments, validate, normalize.
pub fn parse_list_content(content: &str) -> Vec<String> {
    let mut ips = Vec::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if validate_ip_cidr(line) {
            ips.push(edge_types::normalize_ip(line));
        }
    }
    ips
}

/// Content hash of the sorted unique set: a source is "changed" iff its
/// hash differs from the stored one.
pub fn calculate_hash(ips: &[String]) -> String {
    let mut sorted: Vec<&String> = {
        let unique: std::collections::HashSet<&String> = ips.iter().collect();
        unique.into_iter().collect()
    };
    sorted.sort();
    let content = sorted
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub struct BlocklistSync {
    pool: SqlitePool,
    client: NodeClient,
    http: reqwest::Client,
    fetch_cache: Mutex<HashMap<String, (Instant, Vec<String>)>>,
    sync_in_progress: AtomicBool,
    last_sync: Mutex<Option<Value>>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BlocklistSync {
    pub fn new(pool: SqlitePool) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            pool,
            client: NodeClient::new()?,
            http: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()?,
            fetch_cache: Mutex::new(HashMap::new()),
            sync_in_progress: AtomicBool::new(false),
            last_sync: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }))
    }

    pub async fn clear_cache(&self) {
        self.fetch_cache.lock().await.clear();
    }

    /// Fetch one external list, honoring the five-minute cache.
    pub async fn fetch_list(&self, url: &str, use_cache: bool) -> Result<Vec<String>> {
        if use_cache {
            let cache = self.fetch_cache.lock().await;
            if let Some((at, ips)) = cache.get(url) {
                if at.elapsed() < FETCH_CACHE_TTL {
                    return Ok(ips.clone());
                }
            }
        }

        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(crate::error::PanelError::Upstream(format!(
                "HTTP {}",
                response.status().as_u16()
            )));
        }
        let content = response.text().await?;
        let ips = parse_list_content(&content);
        self.fetch_cache
            .lock()
            .await
            .insert(url.to_string(), (Instant::now(), ips.clone()));
        Ok(ips)
    }

    /// The authoritative set for one (server, direction) pair.
    pub async fn effective_ips(
        &self,
        server_id: i64,
        direction: Direction,
    ) -> Result<Vec<String>> {
        let mut all = blocklist::global_rules(&self.pool, direction).await?;
        all.extend(blocklist::server_rules(&self.pool, server_id, direction).await?);

        for source in blocklist::enabled_sources(&self.pool, direction).await? {
            match self.fetch_list(&source.url, true).await {
                Ok(ips) => all.extend(ips),
                Err(e) => warn!("failed to fetch {}: {}", source.name, e),
            }
        }

        Ok(deduplicate_ips(all))
    }

    async fn sync_one_server(&self, server: &store::servers::Server) -> Value {
        let mut result = json!({
            "server_id": server.id,
            "server_name": server.name,
            "success": true,
            "in": {},
            "out": {},
        });

        for direction in [Direction::In, Direction::Out] {
            let key = direction.as_str();
            match self.effective_ips(server.id, direction).await {
                Ok(ips) => {
                    let ip_count = ips.len();
                    match self.client.sync_ipset(server, ips, direction).await {
                        Ok(outcome) => {
                            result[key] = json!({
                                "success": outcome.success,
                                "message": outcome.message,
                                "ip_count": ip_count,
                                "added": outcome.added,
                                "removed": outcome.removed,
                            });
                            if !outcome.success {
                                result["success"] = json!(false);
                            }
                        }
                        Err(e) => {
                            error!("failed to sync {} to {}: {}", key, server.name, e);
                            result[key] = json!({
                                "success": false,
                                "message": e.to_string(),
                                "ip_count": ip_count,
                            });
                            result["success"] = json!(false);
                        }
                    }
                }
                Err(e) => {
                    result[key] = json!({
                        "success": false,
                        "message": e.to_string(),
                        "ip_count": 0,
                    });
                    result["success"] = json!(false);
                }
            }
        }

        result
    }

    async fn sync_one_server_safe(&self, server: &store::servers::Server) -> Value {
        match tokio::time::timeout(PER_SERVER_DEADLINE, self.sync_one_server(server)).await {
            Ok(result) => result,
            Err(_) => json!({
                "server_id": server.id,
                "server_name": server.name,
                "success": false,
                "in": {"success": false, "message": "Timeout", "ip_count": 0},
                "out": {"success": false, "message": "Timeout", "ip_count": 0},
            }),
        }
    }

    async fn store_sync_result(&self, servers: Value) {
        *self.last_sync.lock().await = Some(json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "servers": servers,
            "in_progress": false,
        }));
        self.sync_in_progress.store(false, Ordering::SeqCst);
    }

    pub async fn sync_status(&self) -> Value {
        if self.sync_in_progress.load(Ordering::SeqCst) {
            return json!({"in_progress": true, "timestamp": null, "servers": {}});
        }
        self.last_sync
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| json!({"in_progress": false, "timestamp": null, "servers": {}}))
    }

    /// Push the effective sets to every active node, both directions,
    /// in parallel.
    pub async fn sync_all_nodes(&self) -> Value {
        self.sync_in_progress.store(true, Ordering::SeqCst);
        let mut results = serde_json::Map::new();

        match store::servers::list_active(&self.pool).await {
            Ok(server_list) => {
                let futures: Vec<_> = server_list
                    .iter()
                    .map(|server| self.sync_one_server_safe(server))
                    .collect();
                for result in futures::future::join_all(futures).await {
                    if let Some(id) = result.get("server_id").and_then(Value::as_i64) {
                        results.insert(id.to_string(), result);
                    }
                }
            }
            Err(e) => error!("sync_all_nodes failed: {}", e),
        }

        let value = Value::Object(results);
        self.store_sync_result(value.clone()).await;
        value
    }

    pub async fn sync_single_node(&self, server_id: i64) -> Result<Value> {
        self.sync_in_progress.store(true, Ordering::SeqCst);
        let server = match store::servers::get(&self.pool, server_id).await {
            Ok(server) => server,
            Err(e) => {
                self.sync_in_progress.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let result = self.sync_one_server_safe(&server).await;

        let mut servers = self
            .last_sync
            .lock()
            .await
            .as_ref()
            .and_then(|v| v.get("servers").cloned())
            .unwrap_or_else(|| json!({}));
        servers[server_id.to_string()] = result.clone();
        self.store_sync_result(servers).await;
        Ok(result)
    }

    /// Refresh a source: fetch fresh content, compare hashes, record
    /// the outcome. Returns (message, ip_count, changed).
    pub async fn refresh_source(&self, source: &BlocklistSource) -> (bool, String, i64, bool) {
        match self.fetch_list(&source.url, false).await {
            Ok(ips) => {
                let new_hash = calculate_hash(&ips);
                let changed = source.last_hash.as_deref() != Some(new_hash.as_str());
                let count = ips.len() as i64;
                if let Err(e) = blocklist::record_refresh(
                    &self.pool,
                    source.id,
                    &new_hash,
                    count,
                    store::now_naive(),
                )
                .await
                {
                    return (false, e.to_string(), 0, false);
                }
                let message = if changed {
                    format!("Updated: {} IPs (changed)", count)
                } else {
                    format!("Checked: {} IPs (no changes)", count)
                };
                (true, message, count, changed)
            }
            Err(e) => {
                let message = e.to_string();
                let _ = blocklist::record_refresh_error(&self.pool, source.id, &message).await;
                (false, message, 0, false)
            }
        }
    }

    /// Refresh every enabled source. Returns per-source results and
    /// whether any hash changed.
    pub async fn refresh_all_sources(&self) -> (Value, bool) {
        let mut results = serde_json::Map::new();
        let mut any_changed = false;

        let sources = match blocklist::list_sources(&self.pool).await {
            Ok(sources) => sources,
            Err(e) => {
                error!("failed to load sources: {}", e);
                return (Value::Object(results), false);
            }
        };

        for source in sources.iter().filter(|s| s.enabled) {
            let (success, message, ip_count, changed) = self.refresh_source(source).await;
            if changed {
                any_changed = true;
                info!("source '{}' changed: {} IPs", source.name, ip_count);
            } else if !success {
                warn!("source '{}' failed: {}", source.name, message);
            }
            results.insert(
                source.id.to_string(),
                json!({
                    "name": source.name,
                    "success": success,
                    "message": message,
                    "ip_count": ip_count,
                    "changed": changed,
                }),
            );
        }

        (Value::Object(results), any_changed)
    }

    pub async fn init_default_sources(&self) -> Result<()> {
        let existing = blocklist::list_sources(&self.pool).await?;
        for (name, url) in DEFAULT_SOURCES {
            if existing.iter().any(|s| s.url == *url) {
                continue;
            }
            blocklist::create_source(
                &self.pool,
                &blocklist::SourceCreate {
                    name: name.to_string(),
                    url: url.to_string(),
                    direction: Direction::In,
                },
            )
            .await?;
            info!("added default source: {}", name);
        }
        Ok(())
    }

    /// Kick a background fleet sync (rule CRUD, source toggles and
    /// manual triggers all land here).
    pub fn schedule_sync(self: &Arc<Self>) {
        let sync = self.clone();
        tokio::spawn(async move {
            sync.sync_all_nodes().await;
        });
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.init_default_sources().await {
            warn!("could not seed default sources: {}", e);
        }

        let sync = self.clone();
        *self.task.lock().await = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;

            while sync.running.load(Ordering::SeqCst) {
                let enabled = settings::get_setting(&sync.pool, "blocklist_auto_update_enabled")
                    .await
                    .ok()
                    .flatten()
                    .map(|v| v != "false")
                    .unwrap_or(true);

                if !enabled {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    continue;
                }

                let interval = settings::get_int_setting(
                    &sync.pool,
                    "blocklist_auto_update_interval",
                    DEFAULT_UPDATE_INTERVAL,
                    MIN_UPDATE_INTERVAL,
                    MAX_UPDATE_INTERVAL,
                )
                .await
                .unwrap_or(DEFAULT_UPDATE_INTERVAL);

                info!("starting auto-update of blocklist sources");
                let (_, any_changed) = sync.refresh_all_sources().await;

                if any_changed {
                    info!("syncing updated blocklists to nodes");
                    sync.clear_cache().await;
                    sync.sync_all_nodes().await;
                } else {
                    info!("no changes in blocklist sources, skipping sync");
                }

                tokio::time::sleep(Duration::from_secs(interval as u64)).await;
            }
        }));
        info!("blocklist sync started");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        info!("blocklist sync stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lists_with_comments() {
        let content = "\
# scanner list
1.1.1.1
2.2.2.0/24   # inline comment
junk-line
3.3.3.3/32

";
        let ips = parse_list_content(content);
        assert_eq!(ips, vec!["1.1.1.1", "2.2.2.0/24", "3.3.3.3"]);
    }

    #[test]
    fn hash_is_order_insensitive_and_dedups() {
        let a = calculate_hash(&["1.1.1.1".into(), "2.2.2.2".into()]);
        let b = calculate_hash(&["2.2.2.2".into(), "1.1.1.1".into(), "2.2.2.2".into()]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = calculate_hash(&["1.1.1.1".into()]);
        assert_ne!(a, c);
    }
}
