//! Xray access-log ingestion into bounded in-memory aggregates.
//!
//! A reader task tails the access log of the `remnanode` container and
//! feeds a bounded line buffer. A batch task drains the buffer every
//! five seconds and parses it off the async runtime, folding entries
//! into a single `(email, source_ip, host) -> count` map. A watchdog
//! clears the map when it outgrows its memory budget or has not been
//! collected for ten minutes, so a dead panel cannot OOM the node.

use crate::error::Result;
use chrono::{DateTime, Utc};
use edge_types::{extract_host, XrayCollectReport, XrayStatEntry};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const CONTAINER_NAME: &str = "remnanode";
pub const LOG_PATH: &str = "/var/log/supervisor/xray.out.log";

const MAX_MEMORY_MB: f64 = 256.0;
const MAX_ENTRIES: usize = 1_000_000;
const BATCH_INTERVAL: Duration = Duration::from_secs(5);
const MAX_BUFFER_LINES: usize = 200_000;
const MAX_BUFFER_MB: f64 = 100.0;
const AUTO_FLUSH_SECONDS: i64 = 600;
const MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Approximate per-entry cost of the aggregate map, used for the
/// memory budget.
const ENTRY_COST_BYTES: usize = 120;
const BUFFER_LINE_COST_BYTES: usize = 250;

fn log_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}\.\d+)\s+from (?:tcp:)?(\d+\.\d+\.\d+\.\d+):(\d+)\s+accepted\s+(tcp|udp):(.+?)\s+\[(.+?)\]\s+email:\s*(\d+)",
        )
        .unwrap()
    })
}

/// Parse one batch of raw log lines into (destination, email, source_ip)
/// tuples. Blocked and torrent-tagged lines are skipped.
fn parse_batch(lines: &[String]) -> Vec<(String, i64, String)> {
    let pattern = log_pattern();
    let mut results = Vec::new();

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.contains("-> BLOCK") || line.contains(">> BLOCK") || line.contains("-> torrent") {
            continue;
        }
        let Some(caps) = pattern.captures(line) else {
            continue;
        };
        let source_ip = caps[2].to_string();
        let destination = caps[5].to_string();
        let Ok(email) = caps[7].parse::<i64>() else {
            continue;
        };
        results.push((destination, email, source_ip));
    }

    results
}

#[derive(Default)]
struct Aggregate {
    stats: HashMap<(i64, String, String), i64>,
    total_entries: u64,
    dropped_entries: u64,
    auto_flushes: u64,
    started_at: Option<DateTime<Utc>>,
}

impl Aggregate {
    fn memory_usage_mb(&self) -> f64 {
        (self.stats.len() * ENTRY_COST_BYTES) as f64 / (1024.0 * 1024.0)
    }

    fn is_over_limits(&self) -> bool {
        self.memory_usage_mb() > MAX_MEMORY_MB || self.stats.len() > MAX_ENTRIES
    }

    fn is_near_limits(&self) -> bool {
        self.memory_usage_mb() > MAX_MEMORY_MB * 0.9
            || self.stats.len() as f64 > MAX_ENTRIES as f64 * 0.9
    }

    fn add_entry(&mut self, destination: &str, email: i64, source_ip: String) {
        let host = extract_host(destination).to_string();
        *self.stats.entry((email, source_ip, host)).or_insert(0) += 1;
        self.total_entries += 1;
    }

    fn clear(&mut self) {
        self.stats.clear();
        self.total_entries = 0;
        self.dropped_entries = 0;
        self.started_at = Some(Utc::now());
    }

    fn to_entries(&self) -> Vec<XrayStatEntry> {
        self.stats
            .iter()
            .map(|((email, source_ip, host), count)| XrayStatEntry {
                email: *email,
                source_ip: source_ip.clone(),
                host: host.clone(),
                count: *count,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngesterStatus {
    pub available: bool,
    pub running: bool,
    pub container: String,
    pub entries_collected: u64,
    pub unique_combinations: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub batch_interval_sec: u64,
    pub buffer_lines: usize,
    pub buffer_memory_mb: f64,
    pub buffer_dropped_lines: u64,
    pub total_lines_read: u64,
    pub total_lines_parsed: u64,
    pub last_batch_duration_ms: f64,
    pub stats_memory_mb: f64,
    pub memory_limit_mb: f64,
    pub dropped_entries: u64,
    pub auto_flushes: u64,
}

pub struct XrayLogIngester {
    container: String,
    log_path: String,
    aggregate: Mutex<Aggregate>,
    line_buffer: Mutex<Vec<String>>,
    last_collection: Mutex<DateTime<Utc>>,
    last_batch_duration_ms: Mutex<f64>,
    total_lines_read: AtomicU64,
    total_lines_parsed: AtomicU64,
    buffer_dropped_lines: AtomicU64,
    running: AtomicBool,
    available: AtomicBool,
    last_error: Mutex<Option<String>>,
    process: Mutex<Option<Child>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl XrayLogIngester {
    pub fn new() -> Self {
        Self::for_container(CONTAINER_NAME, LOG_PATH)
    }

    pub fn for_container(container: &str, log_path: &str) -> Self {
        let mut aggregate = Aggregate::default();
        aggregate.started_at = Some(Utc::now());
        Self {
            container: container.to_string(),
            log_path: log_path.to_string(),
            aggregate: Mutex::new(aggregate),
            line_buffer: Mutex::new(Vec::new()),
            last_collection: Mutex::new(Utc::now()),
            last_batch_duration_ms: Mutex::new(0.0),
            total_lines_read: AtomicU64::new(0),
            total_lines_parsed: AtomicU64::new(0),
            buffer_dropped_lines: AtomicU64::new(0),
            running: AtomicBool::new(false),
            available: AtomicBool::new(false),
            last_error: Mutex::new(None),
            process: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
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

    fn buffer_memory_mb(len: usize) -> f64 {
        (len * BUFFER_LINE_COST_BYTES) as f64 / (1024.0 * 1024.0)
    }

    /// Accept one raw log line into the buffer, enforcing its bounds.
    pub(crate) async fn push_line(&self, line: String) {
        self.total_lines_read.fetch_add(1, Ordering::Relaxed);

        let mut buffer = self.line_buffer.lock().await;
        if buffer.len() >= MAX_BUFFER_LINES
            || Self::buffer_memory_mb(buffer.len()) >= MAX_BUFFER_MB
        {
            let dropped = self.buffer_dropped_lines.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 10_000 == 1 {
                warn!("buffer overflow, dropped: {}", dropped);
            }
            return;
        }
        buffer.push(line);
    }

    /// Drain the buffer and fold parsed entries into the aggregate.
    /// Parsing is CPU-bound and runs on the blocking pool.
    pub(crate) async fn process_batch(&self) {
        let lines = {
            let mut buffer = self.line_buffer.lock().await;
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        let started = std::time::Instant::now();

        {
            let mut aggregate = self.aggregate.lock().await;
            if aggregate.is_near_limits() {
                warn!(
                    "stats near limits, skipping batch of {} lines ({:.1}MB)",
                    lines.len(),
                    aggregate.memory_usage_mb()
                );
                aggregate.dropped_entries += lines.len() as u64;
                return;
            }
        }

        let line_count = lines.len();
        let parsed = match tokio::task::spawn_blocking(move || parse_batch(&lines)).await {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("batch parsing error: {}", e);
                return;
            }
        };

        let parsed_count = parsed.len() as u64;
        {
            let mut aggregate = self.aggregate.lock().await;
            for (destination, email, source_ip) in parsed {
                aggregate.add_entry(&destination, email, source_ip);
            }
        }
        self.total_lines_parsed.fetch_add(parsed_count, Ordering::Relaxed);

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        *self.last_batch_duration_ms.lock().await = duration_ms;

        if line_count > 1000 {
            debug!(
                "batch processed: {} lines -> {} entries in {:.0}ms",
                line_count, parsed_count, duration_ms
            );
        }
    }

    async fn memory_check(&self) {
        let mut aggregate = self.aggregate.lock().await;
        if aggregate.is_over_limits() {
            warn!(
                "stats memory limit exceeded! entries={}, memory={:.1}MB, auto-flushing",
                aggregate.stats.len(),
                aggregate.memory_usage_mb()
            );
            aggregate.auto_flushes += 1;
            aggregate.clear();
            return;
        }

        let since_collection = Utc::now() - *self.last_collection.lock().await;
        if since_collection.num_seconds() > AUTO_FLUSH_SECONDS && aggregate.total_entries > 0 {
            warn!(
                "no collection for {}s, auto-flushing {} entries",
                since_collection.num_seconds(),
                aggregate.total_entries
            );
            aggregate.auto_flushes += 1;
            aggregate.clear();
            *self.last_collection.lock().await = Utc::now();
        }
    }

    async fn read_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            if !self.container_running().await {
                self.available.store(false, Ordering::Relaxed);
                *self.last_error.lock().await =
                    Some(format!("{} container not running", self.container));
                tokio::time::sleep(Duration::from_secs(30)).await;
                continue;
            }

            self.available.store(true, Ordering::Relaxed);
            *self.last_error.lock().await = None;
            info!("starting Xray log collection from {} (batch mode)", self.container);

            let child = Command::new("docker")
                .args(["exec", &self.container, "tail", "-f", "-n", "0", &self.log_path])
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn();

            let mut child = match child {
                Ok(child) => child,
                Err(e) => {
                    *self.last_error.lock().await = Some(e.to_string());
                    error!("failed to start log tail: {}", e);
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
                        Ok(Ok(Some(line))) => self.push_line(line).await,
                        Ok(Ok(None)) => break,
                        Ok(Err(e)) => {
                            debug!("log stream read ended: {}", e);
                            break;
                        }
                        Err(_) => {
                            // Idle timeout: bail out if the tail died.
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
                info!("Xray log reader process ended, will restart...");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut aggregate = self.aggregate.lock().await;
            aggregate.started_at = Some(Utc::now());
        }
        *self.last_collection.lock().await = Utc::now();

        let mut tasks = self.tasks.lock().await;

        let reader = self.clone();
        tasks.push(tokio::spawn(reader.read_loop()));

        let batcher = self.clone();
        tasks.push(tokio::spawn(async move {
            while batcher.running.load(Ordering::SeqCst) {
                tokio::time::sleep(BATCH_INTERVAL).await;
                batcher.process_batch().await;
            }
        }));

        let watchdog = self.clone();
        tasks.push(tokio::spawn(async move {
            while watchdog.running.load(Ordering::SeqCst) {
                tokio::time::sleep(MEMORY_CHECK_INTERVAL).await;
                watchdog.memory_check().await;
            }
        }));

        info!(
            "Xray log ingester started (batch interval {}s, buffer {} lines / {}MB, stats {}MB)",
            BATCH_INTERVAL.as_secs(),
            MAX_BUFFER_LINES,
            MAX_BUFFER_MB,
            MAX_MEMORY_MB
        );
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(mut child) = self.process.lock().await.take() {
            let _ = child.kill().await;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("Xray log ingester stopped");
    }

    pub async fn status(&self) -> IngesterStatus {
        let aggregate = self.aggregate.lock().await;
        let buffer_lines = self.line_buffer.lock().await.len();
        let stats_memory_mb = aggregate.memory_usage_mb();

        IngesterStatus {
            available: self.available.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            container: self.container.clone(),
            entries_collected: aggregate.total_entries,
            unique_combinations: aggregate.stats.len(),
            started_at: aggregate.started_at,
            last_error: self.last_error.lock().await.clone(),
            batch_interval_sec: BATCH_INTERVAL.as_secs(),
            buffer_lines,
            buffer_memory_mb: Self::buffer_memory_mb(buffer_lines),
            buffer_dropped_lines: self.buffer_dropped_lines.load(Ordering::Relaxed),
            total_lines_read: self.total_lines_read.load(Ordering::Relaxed),
            total_lines_parsed: self.total_lines_parsed.load(Ordering::Relaxed),
            last_batch_duration_ms: *self.last_batch_duration_ms.lock().await,
            stats_memory_mb,
            memory_limit_mb: MAX_MEMORY_MB,
            dropped_entries: aggregate.dropped_entries,
            auto_flushes: aggregate.auto_flushes,
        }
    }

    /// Drain any pending batch, return the aggregate snapshot, and
    /// atomically reset state. Called by the panel.
    pub async fn collect_and_clear(&self) -> Result<XrayCollectReport> {
        self.process_batch().await;

        let collected_at = Utc::now();
        *self.last_collection.lock().await = collected_at;

        let mut aggregate = self.aggregate.lock().await;
        let stats = aggregate.to_entries();
        let report = XrayCollectReport {
            collected_at,
            period_start: aggregate.started_at.unwrap_or(collected_at),
            entries_count: aggregate.total_entries,
            stats,
            total_lines_read: self.total_lines_read.swap(0, Ordering::Relaxed),
            total_lines_parsed: self.total_lines_parsed.swap(0, Ordering::Relaxed),
            buffer_dropped_lines: self.buffer_dropped_lines.swap(0, Ordering::Relaxed),
            dropped_entries: aggregate.dropped_entries,
            auto_flushes: aggregate.auto_flushes,
            memory_usage_mb_before_clear: aggregate.memory_usage_mb(),
        };
        aggregate.clear();

        info!(
            "collected {} entries, {} unique (user, ip, host) combos",
            report.entries_count,
            report.stats.len()
        );
        Ok(report)
    }
}

impl Default for XrayLogIngester {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE_A: &str = "2024/06/01 12:00:00.123456 from 9.9.9.9:51000 accepted tcp:a.com:443 [inbound -> direct] email: 42";
    const LINE_B: &str = "2024/06/01 12:00:01.123456 from tcp:9.9.9.9:51001 accepted tcp:b.com:443 [inbound -> direct] email: 42";
    const LINE_BLOCKED: &str = "2024/06/01 12:00:02.1 from 9.9.9.9:51002 accepted tcp:ads.com:443 [inbound -> BLOCK] email: 42";
    const LINE_TORRENT: &str = "2024/06/01 12:00:03.1 from 9.9.9.9:51003 accepted tcp:1.2.3.4:6881 [inbound -> torrent] email: 42";

    #[test]
    fn parses_accepted_lines() {
        let parsed = parse_batch(&[LINE_A.to_string(), LINE_B.to_string()]);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], ("a.com:443".to_string(), 42, "9.9.9.9".to_string()));
        assert_eq!(parsed[1].0, "b.com:443");
    }

    #[test]
    fn skips_block_and_torrent_lines() {
        let parsed = parse_batch(&[
            LINE_BLOCKED.to_string(),
            LINE_TORRENT.to_string(),
            "garbage".to_string(),
        ]);
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn aggregates_by_email_ip_host() {
        let ingester = XrayLogIngester::for_container("test", "/dev/null");
        ingester.push_line(LINE_A.to_string()).await;
        ingester.push_line(LINE_A.to_string()).await;
        ingester.push_line(LINE_B.to_string()).await;
        ingester.process_batch().await;

        let report = ingester.collect_and_clear().await.unwrap();
        assert_eq!(report.entries_count, 3);

        let mut stats = report.stats;
        stats.sort_by(|a, b| a.host.cmp(&b.host));
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].host, "a.com");
        assert_eq!(stats[0].count, 2);
        assert_eq!(stats[1].host, "b.com");
        assert_eq!(stats[1].count, 1);
        assert_eq!(stats[0].email, 42);
        assert_eq!(stats[0].source_ip, "9.9.9.9");
    }

    #[tokio::test]
    async fn collect_resets_state() {
        let ingester = XrayLogIngester::for_container("test", "/dev/null");
        ingester.push_line(LINE_A.to_string()).await;
        let first = ingester.collect_and_clear().await.unwrap();
        assert_eq!(first.entries_count, 1);

        let second = ingester.collect_and_clear().await.unwrap();
        assert_eq!(second.entries_count, 0);
        assert!(second.stats.is_empty());
    }

    #[tokio::test]
    async fn status_reflects_buffer_and_counters() {
        let ingester = XrayLogIngester::for_container("test", "/dev/null");
        ingester.push_line(LINE_A.to_string()).await;
        let status = ingester.status().await;
        assert_eq!(status.buffer_lines, 1);
        assert_eq!(status.total_lines_read, 1);
        assert_eq!(status.unique_combinations, 0);
    }
}
