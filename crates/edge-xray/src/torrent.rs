//! Torrent detection and temp-banning.
//!
//! Two detectors feed the same ipset sink: torrent-tagged log lines ban
//! the source immediately, and a behavior tracker bans sources that hit
//! too many distinct raw-IPv4 destinations within one minute (BitTorrent
//! peer discovery looks exactly like that; browsing does not). Bans are
//! temp ipset entries plus a conntrack flush to kill live sessions.

use chrono::{DateTime, Utc};
use edge_exec::HostRunner;
use edge_network::IpsetDriver;
use edge_types::Direction;
use ipnetwork::IpNetwork;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const DEFAULT_PERSISTENT_FILE: &str = "/var/lib/monitoring/torrent_blocker.json";

const DEFAULT_BEHAVIOR_THRESHOLD: usize = 50;
const MIN_BEHAVIOR_THRESHOLD: usize = 5;
const MAX_BEHAVIOR_THRESHOLD: usize = 1000;
const DEDUP_WINDOW_SEC: i64 = 60;
const TRACKER_CLEANUP_INTERVAL: u64 = 500;

const DEFAULT_WHITELIST: &[&str] = &[
    "127.0.0.1",
    "::1",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
];

fn torrent_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"from (?:tcp:)?(\d+\.\d+\.\d+\.\d+):\d+\s+accepted\s+.+?\[.+?->\s*torrent\]")
            .unwrap()
    })
}

fn any_connection_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"from (?:tcp:)?(\d+\.\d+\.\d+\.\d+):\d+\s+accepted\s+(?:tcp|udp):([^:\s]+):\d+")
            .unwrap()
    })
}

fn raw_ip_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+\.\d+$").unwrap())
}

/// Tracks unique destination IPs per source IP per minute bucket.
#[derive(Default)]
pub struct ConnectionTracker {
    connections: HashMap<String, HashMap<i64, HashSet<String>>>,
}

impl ConnectionTracker {
    /// Record a connection and report whether the source crossed the
    /// threshold within the current minute.
    pub fn add_and_check(&mut self, source_ip: &str, dest_ip: &str, threshold: usize) -> bool {
        let minute = Utc::now().timestamp() / 60;
        self.add_and_check_at(source_ip, dest_ip, threshold, minute)
    }

    fn add_and_check_at(
        &mut self,
        source_ip: &str,
        dest_ip: &str,
        threshold: usize,
        minute: i64,
    ) -> bool {
        let buckets = self.connections.entry(source_ip.to_string()).or_default();
        let bucket = buckets.entry(minute).or_default();
        bucket.insert(dest_ip.to_string());
        bucket.len() >= threshold
    }

    /// Drop buckets older than two minutes, and sources left empty.
    pub fn cleanup(&mut self) {
        let cutoff = Utc::now().timestamp() / 60 - 2;
        self.cleanup_at(cutoff)
    }

    fn cleanup_at(&mut self, cutoff: i64) {
        for buckets in self.connections.values_mut() {
            buckets.retain(|minute, _| *minute >= cutoff);
        }
        self.connections.retain(|_, buckets| !buckets.is_empty());
    }

    pub fn remove_ip(&mut self, ip: &str) {
        self.connections.remove(ip);
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_threshold")]
    behavior_threshold: usize,
    #[serde(default)]
    whitelist: Option<Vec<String>>,
}

fn default_threshold() -> usize {
    DEFAULT_BEHAVIOR_THRESHOLD
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockerStatus {
    pub enabled: bool,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub total_blocked: u64,
    pub tag_blocks: u64,
    pub behavior_blocks: u64,
    pub active_blocks: usize,
    pub active_ips: Vec<String>,
    pub last_block_time: Option<DateTime<Utc>>,
    pub behavior_threshold: usize,
    pub whitelist: Vec<String>,
    pub whitelist_parsed: usize,
}

struct MutableState {
    tracker: ConnectionTracker,
    block_cache: HashMap<String, i64>,
    whitelist: Vec<String>,
    whitelist_networks: Vec<IpNetwork>,
    behavior_threshold: usize,
    line_counter: u64,
    started_at: Option<DateTime<Utc>>,
    last_block_time: Option<DateTime<Utc>>,
}

pub struct TorrentBlocker {
    ipset: Arc<IpsetDriver>,
    runner: Arc<dyn HostRunner>,
    container: String,
    log_path: String,
    persistent_file: PathBuf,
    enabled: AtomicBool,
    running: AtomicBool,
    total_blocked: AtomicU64,
    tag_blocks: AtomicU64,
    behavior_blocks: AtomicU64,
    state: Mutex<MutableState>,
    process: Mutex<Option<Child>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TorrentBlocker {
    pub fn new(ipset: Arc<IpsetDriver>, runner: Arc<dyn HostRunner>) -> Self {
        Self::with_paths(
            ipset,
            runner,
            crate::ingest::CONTAINER_NAME,
            crate::ingest::LOG_PATH,
            DEFAULT_PERSISTENT_FILE,
        )
    }

    pub fn with_paths(
        ipset: Arc<IpsetDriver>,
        runner: Arc<dyn HostRunner>,
        container: &str,
        log_path: &str,
        persistent_file: impl Into<PathBuf>,
    ) -> Self {
        let persistent_file = persistent_file.into();

        let mut enabled = false;
        let mut threshold = DEFAULT_BEHAVIOR_THRESHOLD;
        let mut whitelist: Vec<String> =
            DEFAULT_WHITELIST.iter().map(|s| s.to_string()).collect();

        if let Ok(content) = std::fs::read_to_string(&persistent_file) {
            match serde_json::from_str::<PersistedState>(&content) {
                Ok(state) => {
                    enabled = state.enabled;
                    threshold = state.behavior_threshold;
                    if let Some(saved) = state.whitelist {
                        whitelist = saved;
                    }
                }
                Err(e) => warn!("failed to load torrent blocker config: {}", e),
            }
        }

        let whitelist_networks = parse_whitelist(&whitelist);

        Self {
            ipset,
            runner,
            container: container.to_string(),
            log_path: log_path.to_string(),
            persistent_file,
            enabled: AtomicBool::new(enabled),
            running: AtomicBool::new(false),
            total_blocked: AtomicU64::new(0),
            tag_blocks: AtomicU64::new(0),
            behavior_blocks: AtomicU64::new(0),
            state: Mutex::new(MutableState {
                tracker: ConnectionTracker::default(),
                block_cache: HashMap::new(),
                whitelist,
                whitelist_networks,
                behavior_threshold: threshold,
                line_counter: 0,
                started_at: None,
                last_block_time: None,
            }),
            process: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    async fn save_config(&self) {
        let state = self.state.lock().await;
        let persisted = PersistedState {
            enabled: self.enabled.load(Ordering::Relaxed),
            behavior_threshold: state.behavior_threshold,
            whitelist: Some(state.whitelist.clone()),
        };
        drop(state);

        if let Some(parent) = self.persistent_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&persisted) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.persistent_file, json) {
                    error!("failed to save torrent blocker config: {}", e);
                }
            }
            Err(e) => error!("failed to serialize torrent blocker config: {}", e),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub async fn behavior_threshold(&self) -> usize {
        self.state.lock().await.behavior_threshold
    }

    pub async fn set_behavior_threshold(&self, value: usize) {
        {
            let mut state = self.state.lock().await;
            state.behavior_threshold =
                value.clamp(MIN_BEHAVIOR_THRESHOLD, MAX_BEHAVIOR_THRESHOLD);
        }
        self.save_config().await;
    }

    pub async fn whitelist(&self) -> Vec<String> {
        self.state.lock().await.whitelist.clone()
    }

    /// Replace the whitelist and lift any temp bans it now covers.
    pub async fn set_whitelist(&self, ips: Vec<String>) {
        let count = ips.len();
        {
            let mut state = self.state.lock().await;
            state.whitelist_networks = parse_whitelist(&ips);
            state.whitelist = ips;
        }
        self.save_config().await;
        self.unban_whitelisted().await;
        info!("torrent blocker whitelist updated: {} entries", count);
    }

    async fn unban_whitelisted(&self) {
        let networks = self.state.lock().await.whitelist_networks.clone();
        if networks.is_empty() {
            return;
        }

        let active = self.ipset.list(false, Direction::In).await;
        let mut removed = 0usize;
        for entry in active {
            let bare = entry.split('/').next().unwrap_or(&entry);
            let Ok(addr) = bare.parse::<IpAddr>() else {
                continue;
            };
            if networks.iter().any(|net| net.contains(addr)) {
                if self.ipset.remove(&entry, false, Direction::In).await.is_ok() {
                    removed += 1;
                    info!("unbanned whitelisted IP from temp blocklist: {}", entry);
                }
            }
        }
        if removed > 0 {
            info!("removed {} whitelisted IPs from temp blocklist", removed);
        }
    }

    async fn is_whitelisted(&self, ip: &str) -> bool {
        let Ok(addr) = ip.parse::<IpAddr>() else {
            return false;
        };
        let state = self.state.lock().await;
        let matched = state.whitelist_networks.iter().any(|net| net.contains(addr));
        if matched {
            debug!("whitelist match: {} - skipping block", ip);
        }
        matched
    }

    /// Dedup window: do not re-block the same IP within 60 seconds.
    async fn should_block(&self, ip: &str) -> bool {
        let now = Utc::now().timestamp();
        let mut state = self.state.lock().await;
        if let Some(last) = state.block_cache.get(ip) {
            if now - last < DEDUP_WINDOW_SEC {
                return false;
            }
        }
        state.block_cache.insert(ip.to_string(), now);
        true
    }

    async fn kill_connections(&self, ip: &str) {
        // Conntrack flush so established flows die with the ban.
        self.runner
            .run("conntrack", &["-D", "-s", ip], Duration::from_secs(5))
            .await;
    }

    async fn block_ip(&self, ip: &str, reason: &str) {
        match self.ipset.add(ip, false, Direction::In).await {
            Ok(_) => {
                self.total_blocked.fetch_add(1, Ordering::Relaxed);
                match reason {
                    "torrent_tag" => {
                        self.tag_blocks.fetch_add(1, Ordering::Relaxed);
                    }
                    "behavior" => {
                        self.behavior_blocks.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                self.state.lock().await.last_block_time = Some(Utc::now());
                self.kill_connections(ip).await;
                info!("torrent blocker: blocked {} (reason: {})", ip, reason);
            }
            Err(e) => warn!("torrent blocker: failed to block {}: {}", ip, e),
        }
    }

    /// Process one raw access-log line through both detectors.
    pub async fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        // 1) Tag-based detection: Xray routed the flow to the torrent
        //    outbound.
        let tag_hit = torrent_line_pattern().captures(line);
        if let Some(caps) = &tag_hit {
            let source_ip = &caps[1];
            if self.is_whitelisted(source_ip).await {
                info!("whitelist prevented tag-block for {}", source_ip);
            } else if self.should_block(source_ip).await {
                self.block_ip(source_ip, "torrent_tag").await;
                self.state.lock().await.tracker.remove_ip(source_ip);
            }
        }

        // 2) Behavior-based detection: many unique raw-IP destinations
        //    per minute.
        if tag_hit.is_none() {
            if let Some(caps) = any_connection_pattern().captures(line) {
                let source_ip = caps[1].to_string();
                let dest_host = caps[2].to_string();

                if raw_ip_pattern().is_match(&dest_host) {
                    let exceeded = {
                        let mut state = self.state.lock().await;
                        let threshold = state.behavior_threshold;
                        state.tracker.add_and_check(&source_ip, &dest_host, threshold)
                    };
                    if exceeded {
                        if self.is_whitelisted(&source_ip).await {
                            info!("whitelist prevented behavior-block for {}", source_ip);
                            self.state.lock().await.tracker.remove_ip(&source_ip);
                        } else if self.should_block(&source_ip).await {
                            self.block_ip(&source_ip, "behavior").await;
                            self.state.lock().await.tracker.remove_ip(&source_ip);
                        }
                    }
                }
            }
        }

        let mut state = self.state.lock().await;
        state.line_counter += 1;
        if state.line_counter >= TRACKER_CLEANUP_INTERVAL {
            state.line_counter = 0;
            state.tracker.cleanup();
            let now = Utc::now().timestamp();
            state
                .block_cache
                .retain(|_, ts| now - *ts <= DEDUP_WINDOW_SEC * 2);
        }
    }

    async fn container_running(&self) -> bool {
        let output = Command::new("docker")
            .args(["inspect", "-f", "{{.State.Running}}", &self.container])
            .output();
        match tokio::time::timeout(Duration::from_secs(5), output).await {
            Ok(Ok(output)) => {
                output.status.success()
                    && String::from_utf8_lossy(&output.stdout).trim() == "true"
            }
            _ => false,
        }
    }

    async fn read_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            if !self.container_running().await {
                debug!("torrent blocker: {} container not running, waiting...", self.container);
                tokio::time::sleep(Duration::from_secs(30)).await;
                continue;
            }

            info!("torrent blocker: starting log monitoring");

            let child = Command::new("docker")
                .args(["exec", &self.container, "tail", "-f", "-n", "0", &self.log_path])
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn();

            let mut child = match child {
                Ok(child) => child,
                Err(e) => {
                    error!("torrent blocker error: {}", e);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    continue;
                }
            };

            let stdout = child.stdout.take();
            *self.process.lock().await = Some(child);

            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while self.running.load(Ordering::SeqCst) {
                    match tokio::time::timeout(Duration::from_secs(60), lines.next_line()).await {
                        Ok(Ok(Some(line))) => self.handle_line(&line).await,
                        Ok(Ok(None)) => break,
                        Ok(Err(_)) => break,
                        Err(_) => {
                            self.state.lock().await.tracker.cleanup();
                            let mut process = self.process.lock().await;
                            if let Some(child) = process.as_mut() {
                                if let Ok(Some(_)) = child.try_wait() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }

            if let Some(mut child) = self.process.lock().await.take() {
                let _ = child.kill().await;
            }

            if self.running.load(Ordering::SeqCst) {
                info!("torrent blocker: log reader ended, restarting...");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.enabled.store(true, Ordering::Relaxed);
        self.state.lock().await.started_at = Some(Utc::now());
        self.save_config().await;

        let reader = self.clone();
        *self.task.lock().await = Some(tokio::spawn(reader.read_loop()));
        info!("torrent blocker started");
    }

    /// Stop monitoring without changing the enabled flag, so the blocker
    /// auto-starts again on the next boot.
    pub async fn graceful_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut child) = self.process.lock().await.take() {
            let _ = child.kill().await;
        }
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        info!("torrent blocker gracefully stopped (state preserved)");
    }

    /// Operator-initiated disable: persists enabled=false and stops.
    pub async fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        self.save_config().await;
        self.graceful_stop().await;
        info!("torrent blocker disabled");
    }

    pub async fn auto_start_if_enabled(self: &Arc<Self>) {
        if self.is_enabled() && !self.running.load(Ordering::SeqCst) {
            self.start().await;
        }
    }

    pub async fn status(&self) -> BlockerStatus {
        let active_ips = self.ipset.list(false, Direction::In).await;
        let state = self.state.lock().await;
        BlockerStatus {
            enabled: self.enabled.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            started_at: state.started_at,
            total_blocked: self.total_blocked.load(Ordering::Relaxed),
            tag_blocks: self.tag_blocks.load(Ordering::Relaxed),
            behavior_blocks: self.behavior_blocks.load(Ordering::Relaxed),
            active_blocks: active_ips.len(),
            active_ips,
            last_block_time: state.last_block_time,
            behavior_threshold: state.behavior_threshold,
            whitelist: state.whitelist.clone(),
            whitelist_parsed: state.whitelist_networks.len(),
        }
    }
}

fn parse_whitelist(entries: &[String]) -> Vec<IpNetwork> {
    let mut networks = Vec::new();
    let mut invalid = Vec::new();
    for entry in entries {
        match entry.trim().parse::<IpNetwork>() {
            Ok(net) => networks.push(net),
            Err(_) => match entry.trim().parse::<IpAddr>() {
                Ok(addr) => networks.push(IpNetwork::from(addr)),
                Err(_) => invalid.push(entry.clone()),
            },
        }
    }
    if invalid.is_empty() {
        info!("whitelist rebuilt: {} network entries", networks.len());
    } else {
        warn!(
            "whitelist: {} valid, {} invalid entries: {:?}",
            networks.len(),
            invalid.len(),
            invalid
        );
    }
    networks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_threshold_within_minute() {
        let mut tracker = ConnectionTracker::default();
        for i in 0..49 {
            let dest = format!("1.2.3.{}", i);
            assert!(!tracker.add_and_check_at("5.5.5.5", &dest, 50, 1000));
        }
        assert!(tracker.add_and_check_at("5.5.5.5", "9.9.9.9", 50, 1000));
    }

    #[test]
    fn tracker_buckets_reset_per_minute() {
        let mut tracker = ConnectionTracker::default();
        for i in 0..49 {
            let dest = format!("1.2.3.{}", i);
            tracker.add_and_check_at("5.5.5.5", &dest, 50, 1000);
        }
        // New minute: the count starts over.
        assert!(!tracker.add_and_check_at("5.5.5.5", "9.9.9.9", 50, 1001));
    }

    #[test]
    fn tracker_cleanup_drops_stale_buckets() {
        let mut tracker = ConnectionTracker::default();
        tracker.add_and_check_at("5.5.5.5", "1.1.1.1", 50, 1000);
        tracker.add_and_check_at("6.6.6.6", "1.1.1.1", 50, 1003);
        tracker.cleanup_at(1002);
        assert!(!tracker.connections.contains_key("5.5.5.5"));
        assert!(tracker.connections.contains_key("6.6.6.6"));
    }

    #[test]
    fn duplicate_destinations_count_once() {
        let mut tracker = ConnectionTracker::default();
        for _ in 0..100 {
            assert!(!tracker.add_and_check_at("5.5.5.5", "1.1.1.1", 50, 1000));
        }
    }

    #[test]
    fn torrent_tag_pattern_matches() {
        let line = "2024/06/01 12:00:00.1 from tcp:5.5.5.5:42000 accepted tcp:1.2.3.4:6881 [inbound -> torrent]";
        let caps = torrent_line_pattern().captures(line).unwrap();
        assert_eq!(&caps[1], "5.5.5.5");
    }

    #[test]
    fn connection_pattern_extracts_destination() {
        let line = "2024/06/01 12:00:00.1 from 5.5.5.5:42000 accepted tcp:panel.example.com:443 [inbound -> direct] email: 7";
        let caps = any_connection_pattern().captures(line).unwrap();
        assert_eq!(&caps[1], "5.5.5.5");
        assert_eq!(&caps[2], "panel.example.com");
        assert!(!raw_ip_pattern().is_match("panel.example.com"));
        assert!(raw_ip_pattern().is_match("1.2.3.4"));
    }

    #[test]
    fn whitelist_parses_defaults() {
        let entries: Vec<String> = DEFAULT_WHITELIST.iter().map(|s| s.to_string()).collect();
        let networks = parse_whitelist(&entries);
        assert_eq!(networks.len(), 5);
        assert!(networks
            .iter()
            .any(|net| net.contains("192.168.1.10".parse().unwrap())));
    }
}
