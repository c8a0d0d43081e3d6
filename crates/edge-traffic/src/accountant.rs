//! Per-port and per-interface traffic accounting.
//!
//! Interface counters come from `/proc/net/dev`; port counters from two
//! dedicated iptables chains holding one rule per (port, protocol,
//! direction). Deltas against the previous reading are persisted every
//! tick, with hourly/daily/monthly accumulation in SQLite. Counter
//! baselines survive restarts through a state file so traffic is not
//! double-counted.

use crate::error::Result;
use crate::store::{self, InterfaceTotals, PeriodTraffic, PortTotals, TotalTraffic};
use chrono::{DateTime, Utc};
use edge_exec::HostRunner;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const CHAIN_IN: &str = "TRAFFIC_ACCOUNTING_IN";
pub const CHAIN_OUT: &str = "TRAFFIC_ACCOUNTING_OUT";

const IPTABLES_TIMEOUT: Duration = Duration::from_secs(10);
const SUMMARY_CACHE_TTL: Duration = Duration::from_secs(120);
const STATE_SAVE_EVERY: u64 = 300;
const RULES_CHECK_EVERY: u64 = 600;
const CLEANUP_EVERY: u64 = 86_400;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Counters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedState {
    timestamp: Option<String>,
    #[serde(default)]
    interface_bytes: HashMap<String, Counters>,
    #[serde(default)]
    port_bytes: HashMap<String, Counters>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedConfig {
    #[serde(default)]
    tracked_ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortChange {
    pub success: bool,
    pub message: String,
}

struct SummaryCache<T> {
    entries: Mutex<HashMap<i64, (Instant, T)>>,
}

impl<T: Clone> SummaryCache<T> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn get(&self, days: i64) -> Option<T> {
        let entries = self.entries.lock().await;
        entries
            .get(&days)
            .filter(|(at, _)| at.elapsed() < SUMMARY_CACHE_TTL)
            .map(|(_, value)| value.clone())
    }

    async fn put(&self, days: i64, value: T) {
        self.entries.lock().await.insert(days, (Instant::now(), value));
    }
}

/// Compute a counter delta handling restarts and reboots: the first
/// observation establishes a baseline (delta 0), and a shrinking counter
/// means the host rebooted so the current value is the delta.
pub fn calculate_delta(current: u64, previous: u64) -> u64 {
    if previous == 0 {
        return 0;
    }
    if current < previous {
        debug!("counter reset detected: current={}, previous={}", current, previous);
        return current;
    }
    current - previous
}

pub struct TrafficAccountant {
    pool: SqlitePool,
    runner: Arc<dyn HostRunner>,
    config_path: PathBuf,
    state_path: PathBuf,
    proc_net_dev: PathBuf,
    collect_interval: u64,
    retention_days: i64,
    tracked_ports: Mutex<Vec<u16>>,
    prev_interfaces: Mutex<HashMap<String, Counters>>,
    prev_ports: Mutex<HashMap<u16, Counters>>,
    iptables_available: AtomicBool,
    running: Arc<AtomicBool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    total_cache: SummaryCache<TotalTraffic>,
    port_cache: SummaryCache<Vec<PortTotals>>,
    iface_cache: SummaryCache<Vec<InterfaceTotals>>,
}

pub struct TrafficConfig {
    pub db_path: PathBuf,
    pub collect_interval: u64,
    pub retention_days: i64,
    pub proc_net_dev: PathBuf,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/monitoring/traffic.db"),
            collect_interval: 60,
            retention_days: 30,
            proc_net_dev: PathBuf::from("/proc/net/dev"),
        }
    }
}

impl TrafficAccountant {
    /// Open the database, replay persisted config and counter state,
    /// and ensure the iptables accounting chains exist.
    pub async fn init(runner: Arc<dyn HostRunner>, config: TrafficConfig) -> Result<Arc<Self>> {
        let pool = store::open(&config.db_path).await?;
        let parent = config
            .db_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let accountant = Arc::new(Self {
            pool,
            runner,
            config_path: parent.join("traffic_config.json"),
            state_path: parent.join("traffic_state.json"),
            proc_net_dev: config.proc_net_dev,
            collect_interval: config.collect_interval.max(1),
            retention_days: config.retention_days,
            tracked_ports: Mutex::new(Vec::new()),
            prev_interfaces: Mutex::new(HashMap::new()),
            prev_ports: Mutex::new(HashMap::new()),
            iptables_available: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            total_cache: SummaryCache::new(),
            port_cache: SummaryCache::new(),
            iface_cache: SummaryCache::new(),
        });

        accountant.load_config().await;
        accountant.load_state().await;
        accountant.check_iptables_available().await;
        accountant.setup_iptables().await;

        info!(
            "traffic accountant initialized, iptables: {}",
            accountant.iptables_available.load(Ordering::Relaxed)
        );
        Ok(accountant)
    }

    // ── config / state files ──

    async fn load_config(&self) {
        let Ok(content) = std::fs::read_to_string(&self.config_path) else {
            return;
        };
        match serde_json::from_str::<SavedConfig>(&content) {
            Ok(config) => {
                info!("loaded tracked ports: {:?}", config.tracked_ports);
                *self.tracked_ports.lock().await = config.tracked_ports;
            }
            Err(e) => warn!("failed to load traffic config: {}", e),
        }
    }

    async fn save_config(&self) {
        let config = SavedConfig {
            tracked_ports: self.tracked_ports.lock().await.clone(),
        };
        if let Some(parent) = self.config_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&config) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.config_path, json) {
                    error!("failed to save traffic config: {}", e);
                }
            }
            Err(e) => error!("failed to serialize traffic config: {}", e),
        }
    }

    async fn load_state(&self) {
        let Ok(content) = std::fs::read_to_string(&self.state_path) else {
            return;
        };
        match serde_json::from_str::<SavedState>(&content) {
            Ok(state) => {
                *self.prev_interfaces.lock().await = state.interface_bytes;
                let ports = state
                    .port_bytes
                    .into_iter()
                    .filter_map(|(k, v)| k.parse::<u16>().ok().map(|p| (p, v)))
                    .collect();
                *self.prev_ports.lock().await = ports;
                info!("loaded counter state from {}", self.state_path.display());
            }
            Err(e) => warn!("failed to load state (first run or corrupted): {}", e),
        }
    }

    /// Persist the live counters so a restart keeps its baselines.
    pub async fn save_state(&self) {
        let interfaces = self.read_interface_bytes();
        let ports = self.read_port_bytes().await;

        let state = SavedState {
            timestamp: Some(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            interface_bytes: interfaces,
            port_bytes: ports.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        };
        if let Some(parent) = self.state_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&state) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.state_path, json) {
                    error!("failed to save state: {}", e);
                } else {
                    debug!("state saved");
                }
            }
            Err(e) => error!("failed to serialize state: {}", e),
        }
    }

    // ── iptables chain management ──

    async fn run_iptables(&self, args: &[&str]) -> bool {
        self.runner.run("iptables", args, IPTABLES_TIMEOUT).await.success
    }

    async fn check_iptables_available(&self) {
        let available = self.run_iptables(&["-L", "-n"]).await;
        if !available {
            warn!("iptables not available or no permissions - port tracking disabled");
        }
        self.iptables_available.store(available, Ordering::Relaxed);
    }

    async fn chain_exists(&self, chain: &str) -> bool {
        self.run_iptables(&["-L", chain, "-n"]).await
    }

    async fn rule_exists(&self, chain: &str, port: u16, flag: &str, protocol: &str) -> bool {
        let port = port.to_string();
        self.run_iptables(&["-C", chain, "-p", protocol, flag, &port]).await
    }

    async fn add_port_rules(&self, port: u16) -> bool {
        if !self.iptables_available.load(Ordering::Relaxed) {
            return false;
        }
        let port_str = port.to_string();
        for (chain, flag, protocol) in [
            (CHAIN_IN, "--dport", "tcp"),
            (CHAIN_OUT, "--sport", "tcp"),
            (CHAIN_IN, "--dport", "udp"),
            (CHAIN_OUT, "--sport", "udp"),
        ] {
            if !self.rule_exists(chain, port, flag, protocol).await {
                self.run_iptables(&["-A", chain, "-p", protocol, flag, &port_str])
                    .await;
            }
        }
        true
    }

    async fn remove_port_rules(&self, port: u16) {
        if !self.iptables_available.load(Ordering::Relaxed) {
            return;
        }
        let port_str = port.to_string();
        for (chain, flag, protocol) in [
            (CHAIN_IN, "--dport", "tcp"),
            (CHAIN_OUT, "--sport", "tcp"),
            (CHAIN_IN, "--dport", "udp"),
            (CHAIN_OUT, "--sport", "udp"),
        ] {
            self.run_iptables(&["-D", chain, "-p", protocol, flag, &port_str])
                .await;
        }
    }

    async fn setup_iptables(&self) {
        if !self.iptables_available.load(Ordering::Relaxed) {
            info!("skipping iptables setup - not available");
            return;
        }

        self.run_iptables(&["-N", CHAIN_IN]).await;
        self.run_iptables(&["-N", CHAIN_OUT]).await;

        if !self.run_iptables(&["-C", "INPUT", "-j", CHAIN_IN]).await {
            self.run_iptables(&["-I", "INPUT", "-j", CHAIN_IN]).await;
        }
        if !self.run_iptables(&["-C", "OUTPUT", "-j", CHAIN_OUT]).await {
            self.run_iptables(&["-I", "OUTPUT", "-j", CHAIN_OUT]).await;
        }

        let ports = self.tracked_ports.lock().await.clone();
        for port in &ports {
            self.add_port_rules(*port).await;
        }
        if !ports.is_empty() {
            info!("iptables rules configured for ports: {:?}", ports);
        }
    }

    /// Re-create chains and rules that an external flush removed.
    async fn ensure_iptables_rules(&self) {
        if !self.iptables_available.load(Ordering::Relaxed) {
            return;
        }
        let ports = self.tracked_ports.lock().await.clone();
        if ports.is_empty() {
            return;
        }

        if !self.chain_exists(CHAIN_IN).await {
            self.run_iptables(&["-N", CHAIN_IN]).await;
            self.run_iptables(&["-I", "INPUT", "-j", CHAIN_IN]).await;
            info!("recreated chain {}", CHAIN_IN);
        }
        if !self.chain_exists(CHAIN_OUT).await {
            self.run_iptables(&["-N", CHAIN_OUT]).await;
            self.run_iptables(&["-I", "OUTPUT", "-j", CHAIN_OUT]).await;
            info!("recreated chain {}", CHAIN_OUT);
        }

        for port in ports {
            self.add_port_rules(port).await;
        }
    }

    // ── tracked ports ──

    pub async fn tracked_ports(&self) -> Vec<u16> {
        self.tracked_ports.lock().await.clone()
    }

    pub async fn add_tracked_port(&self, port: u16) -> PortChange {
        {
            let ports = self.tracked_ports.lock().await;
            if ports.contains(&port) {
                return PortChange {
                    success: false,
                    message: format!("Port {} already tracked", port),
                };
            }
        }
        if !self.iptables_available.load(Ordering::Relaxed) {
            return PortChange {
                success: false,
                message: "iptables not available - port tracking disabled".into(),
            };
        }
        if !self.add_port_rules(port).await {
            return PortChange {
                success: false,
                message: format!("Failed to add iptables rules for port {}", port),
            };
        }

        {
            let mut ports = self.tracked_ports.lock().await;
            ports.push(port);
            ports.sort_unstable();
        }
        self.save_config().await;
        info!("added port {} to tracking", port);
        PortChange {
            success: true,
            message: format!("Port {} added to tracking", port),
        }
    }

    pub async fn remove_tracked_port(&self, port: u16) -> PortChange {
        {
            let ports = self.tracked_ports.lock().await;
            if !ports.contains(&port) {
                return PortChange {
                    success: false,
                    message: format!("Port {} not tracked", port),
                };
            }
        }
        self.remove_port_rules(port).await;
        {
            let mut ports = self.tracked_ports.lock().await;
            ports.retain(|p| *p != port);
        }
        self.save_config().await;
        info!("removed port {} from tracking", port);
        PortChange {
            success: true,
            message: format!("Port {} removed from tracking", port),
        }
    }

    // ── counter reading ──

    fn read_interface_bytes(&self) -> HashMap<String, Counters> {
        let mut result = HashMap::new();
        let Ok(content) = std::fs::read_to_string(&self.proc_net_dev) else {
            error!("error reading {}", self.proc_net_dev.display());
            return result;
        };

        for line in content.lines().skip(2) {
            let Some((name, values)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            if name == "lo" {
                continue;
            }
            let fields: Vec<&str> = values.split_whitespace().collect();
            if fields.len() >= 16 {
                let rx_bytes = fields[0].parse().unwrap_or(0);
                let tx_bytes = fields[8].parse().unwrap_or(0);
                result.insert(name.to_string(), Counters { rx_bytes, tx_bytes });
            }
        }
        result
    }

    async fn read_port_bytes(&self) -> HashMap<u16, Counters> {
        let ports = self.tracked_ports.lock().await.clone();
        let mut result: HashMap<u16, Counters> =
            ports.iter().map(|p| (*p, Counters::default())).collect();
        if !self.iptables_available.load(Ordering::Relaxed) || ports.is_empty() {
            return result;
        }

        let incoming = self
            .runner
            .run("iptables", &["-L", CHAIN_IN, "-v", "-n", "-x"], IPTABLES_TIMEOUT)
            .await;
        if incoming.success {
            accumulate_counter_lines(&incoming.stdout, &ports, "dpt:", &mut result, true);
        }

        let outgoing = self
            .runner
            .run("iptables", &["-L", CHAIN_OUT, "-v", "-n", "-x"], IPTABLES_TIMEOUT)
            .await;
        if outgoing.success {
            accumulate_counter_lines(&outgoing.stdout, &ports, "spt:", &mut result, false);
        }

        result
    }

    // ── collection ──

    /// Read the counters, compute deltas against the previous reading,
    /// and store them.
    pub async fn collect_snapshot(&self) -> Result<()> {
        let now = Utc::now();

        let current_interfaces = self.read_interface_bytes();
        {
            let mut prev = self.prev_interfaces.lock().await;
            for (iface, counters) in &current_interfaces {
                let previous = prev.get(iface).copied().unwrap_or_default();
                let rx_delta = calculate_delta(counters.rx_bytes, previous.rx_bytes);
                let tx_delta = calculate_delta(counters.tx_bytes, previous.tx_bytes);
                if rx_delta > 0 || tx_delta > 0 {
                    store::record_interface_delta(
                        &self.pool,
                        now,
                        iface,
                        rx_delta as i64,
                        tx_delta as i64,
                    )
                    .await?;
                }
            }
            *prev = current_interfaces;
        }

        let current_ports = self.read_port_bytes().await;
        {
            let mut prev = self.prev_ports.lock().await;
            for (port, counters) in &current_ports {
                let previous = prev.get(port).copied().unwrap_or_default();
                let rx_delta = calculate_delta(counters.rx_bytes, previous.rx_bytes);
                let tx_delta = calculate_delta(counters.tx_bytes, previous.tx_bytes);
                if rx_delta > 0 || tx_delta > 0 {
                    store::record_port_delta(&self.pool, now, *port, rx_delta as i64, tx_delta as i64)
                        .await?;
                }
            }
            *prev = current_ports;
        }

        Ok(())
    }

    pub async fn cleanup_old_data(&self) -> Result<()> {
        store::cleanup_raw(&self.pool, self.retention_days).await?;
        info!("cleaned up traffic data older than {} days", self.retention_days);
        Ok(())
    }

    /// Start the background collection loop.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let accountant = self.clone();
        let handle = tokio::spawn(async move {
            let interval = accountant.collect_interval;
            let mut state_counter = 0u64;
            let mut rules_counter = 0u64;
            let mut cleanup_counter = 0u64;

            while accountant.running.load(Ordering::SeqCst) {
                if let Err(e) = accountant.collect_snapshot().await {
                    error!("error in traffic collection: {}", e);
                }
                state_counter += 1;
                rules_counter += 1;
                cleanup_counter += 1;

                if state_counter >= STATE_SAVE_EVERY / interval {
                    accountant.save_state().await;
                    state_counter = 0;
                }
                if rules_counter >= RULES_CHECK_EVERY / interval {
                    accountant.ensure_iptables_rules().await;
                    rules_counter = 0;
                }
                if cleanup_counter >= CLEANUP_EVERY / interval {
                    if let Err(e) = accountant.cleanup_old_data().await {
                        error!("traffic cleanup failed: {}", e);
                    }
                    cleanup_counter = 0;
                }

                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
        });

        *self.task.lock().await = Some(handle);
        info!("traffic accountant started");
    }

    /// Stop the loop, saving counter state first.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.save_state().await;
        info!("traffic state saved before shutdown");
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        info!("traffic accountant stopped");
    }

    // ── queries ──

    pub async fn hourly(
        &self,
        hours: i64,
        interface: Option<&str>,
        port: Option<u16>,
    ) -> Result<Vec<PeriodTraffic>> {
        store::hourly(&self.pool, hours, interface, port).await
    }

    pub async fn daily(
        &self,
        days: i64,
        interface: Option<&str>,
        port: Option<u16>,
    ) -> Result<Vec<PeriodTraffic>> {
        store::daily(&self.pool, days, interface, port).await
    }

    pub async fn monthly(
        &self,
        months: i64,
        interface: Option<&str>,
        port: Option<u16>,
    ) -> Result<Vec<PeriodTraffic>> {
        store::monthly(&self.pool, months, interface, port).await
    }

    pub async fn port_summary(&self, days: i64) -> Result<Vec<PortTotals>> {
        if let Some(cached) = self.port_cache.get(days).await {
            return Ok(cached);
        }
        let result = store::port_summary(&self.pool, days).await?;
        self.port_cache.put(days, result.clone()).await;
        Ok(result)
    }

    pub async fn interface_summary(&self, days: i64) -> Result<Vec<InterfaceTotals>> {
        if let Some(cached) = self.iface_cache.get(days).await {
            return Ok(cached);
        }
        let result = store::interface_summary(&self.pool, days).await?;
        self.iface_cache.put(days, result.clone()).await;
        Ok(result)
    }

    pub async fn total_traffic(&self, days: i64) -> Result<TotalTraffic> {
        if let Some(cached) = self.total_cache.get(days).await {
            return Ok(cached);
        }
        let result = store::total_traffic(&self.pool, days).await?;
        self.total_cache.put(days, result.clone()).await;
        Ok(result)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn accumulate_counter_lines(
    stdout: &str,
    ports: &[u16],
    marker: &str,
    result: &mut HashMap<u16, Counters>,
    incoming: bool,
) {
    for line in stdout.lines() {
        for port in ports {
            let needle = format!("{}{}", marker, port);
            if !line.split_whitespace().any(|tok| tok == needle) {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() >= 2 {
                if let Ok(bytes) = fields[1].parse::<u64>() {
                    let entry = result.entry(*port).or_default();
                    if incoming {
                        entry.rx_bytes += bytes;
                    } else {
                        entry.tx_bytes += bytes;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_baseline_is_zero() {
        assert_eq!(calculate_delta(1_000_000, 0), 0);
    }

    #[test]
    fn delta_normal_growth() {
        assert_eq!(calculate_delta(1_050_000, 1_000_000), 50_000);
    }

    #[test]
    fn delta_reboot_counts_from_zero() {
        assert_eq!(calculate_delta(100, 1_050_000), 100);
    }

    #[test]
    fn counter_lines_sum_tcp_and_udp() {
        let stdout = "\
Chain TRAFFIC_ACCOUNTING_IN (1 references)
    pkts      bytes target     prot opt in     out     source               destination
      10     5000            tcp  --  *      *       0.0.0.0/0            0.0.0.0/0            tcp dpt:443
       2     1200            udp  --  *      *       0.0.0.0/0            0.0.0.0/0            udp dpt:443
";
        let ports = vec![443u16];
        let mut result: HashMap<u16, Counters> =
            ports.iter().map(|p| (*p, Counters::default())).collect();
        accumulate_counter_lines(stdout, &ports, "dpt:", &mut result, true);
        assert_eq!(result[&443].rx_bytes, 6200);
        assert_eq!(result[&443].tx_bytes, 0);
    }

    #[test]
    fn counter_lines_ignore_other_ports() {
        let stdout = "      10     5000    tcp dpt:4430\n";
        let ports = vec![443u16];
        let mut result: HashMap<u16, Counters> =
            ports.iter().map(|p| (*p, Counters::default())).collect();
        accumulate_counter_lines(stdout, &ports, "dpt:", &mut result, true);
        assert_eq!(result[&443].rx_bytes, 0);
    }
}
