//! Fleet collector: polls every active node, derives speeds from
//! cumulative counters, and maintains snapshots, roll-ups, cached
//! HAProxy/traffic blobs and the Xray probe flag.

use crate::error::Result;
use crate::node_client::{NodeClient, HAPROXY_TIMEOUT};
use crate::store::metrics::SnapshotRow;
use crate::store::servers::Server;
use crate::store::{self, metrics, servers, settings};
use chrono::{Duration as ChronoDuration, NaiveDateTime, Timelike};
use edge_types::metrics::MetricsDocument;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

pub const DEFAULT_METRICS_INTERVAL: i64 = 10;
pub const DEFAULT_HAPROXY_INTERVAL: i64 = 300;
const XRAY_CHECK_INTERVAL: Duration = Duration::from_secs(120);
const SETTINGS_RELOAD_INTERVAL: Duration = Duration::from_secs(30);
const DEADLOCK_RETRIES: u32 = 3;

/// Per-server previous counters for speed derivation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpeedState {
    pub prev_net_rx: i64,
    pub prev_net_tx: i64,
    pub prev_disk_read: i64,
    pub prev_disk_write: i64,
    pub prev_time: f64,
    pub initialized: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Speeds {
    pub net_rx: f64,
    pub net_tx: f64,
    pub disk_read: f64,
    pub disk_write: f64,
}

/// Rate rule: `(current - prev) / dt` against the previous reading,
/// with at least half a second between measurements. A shrinking
/// counter means the host rebooted, so the current value itself is the
/// delta and subsequent readings resume from the new baseline.
pub fn derive_speeds(state: &mut SpeedState, doc: &MetricsDocument, now_secs: f64) -> Speeds {
    let net_rx = doc.network.total.rx_bytes as i64;
    let net_tx = doc.network.total.tx_bytes as i64;
    let disk_read: i64 = doc.disk.io.values().map(|d| d.read_bytes as i64).sum();
    let disk_write: i64 = doc.disk.io.values().map(|d| d.write_bytes as i64).sum();

    fn rate(current: i64, previous: i64, dt: f64) -> f64 {
        let diff = current - previous;
        if diff >= 0 {
            diff as f64 / dt
        } else {
            current as f64 / dt
        }
    }

    let mut speeds = Speeds::default();
    if state.initialized && state.prev_time > 0.0 {
        let dt = now_secs - state.prev_time;
        if dt > 0.5 {
            speeds.net_rx = rate(net_rx, state.prev_net_rx, dt);
            speeds.net_tx = rate(net_tx, state.prev_net_tx, dt);
            speeds.disk_read = rate(disk_read, state.prev_disk_read, dt);
            speeds.disk_write = rate(disk_write, state.prev_disk_write, dt);
        }
    }

    state.prev_net_rx = net_rx;
    state.prev_net_tx = net_tx;
    state.prev_disk_read = disk_read;
    state.prev_disk_write = disk_write;
    state.prev_time = now_secs;
    state.initialized = true;

    speeds
}

/// Flatten the metrics document plus derived speeds into a snapshot row.
pub fn build_snapshot(
    server_id: i64,
    doc: &MetricsDocument,
    speeds: Speeds,
    timestamp: NaiveDateTime,
) -> SnapshotRow {
    let tcp = &doc.system.connections_detailed.tcp;
    let disk_percent = doc
        .disk
        .partitions
        .first()
        .map(|p| p.percent)
        .unwrap_or(0.0);
    let connections_count =
        (doc.system.connections.established + doc.system.connections.listen) as i64;

    let tcp_field = |v: u64| -> Option<i64> { Some(v as i64) };

    SnapshotRow {
        server_id,
        timestamp,
        cpu_usage: doc.cpu.usage_percent,
        load_avg_1: doc.cpu.load_avg_1,
        load_avg_5: doc.cpu.load_avg_5,
        load_avg_15: doc.cpu.load_avg_15,
        memory_total: doc.memory.ram.total as i64,
        memory_used: doc.memory.ram.used as i64,
        memory_available: doc.memory.ram.available as i64,
        memory_percent: doc.memory.ram.percent,
        swap_used: doc.memory.swap.used as i64,
        swap_percent: doc.memory.swap.percent,
        net_rx_bytes_per_sec: speeds.net_rx,
        net_tx_bytes_per_sec: speeds.net_tx,
        net_rx_bytes: doc.network.total.rx_bytes as i64,
        net_tx_bytes: doc.network.total.tx_bytes as i64,
        disk_percent,
        disk_read_bytes_per_sec: speeds.disk_read,
        disk_write_bytes_per_sec: speeds.disk_write,
        process_count: doc.processes.total as i64,
        connections_count,
        tcp_established: tcp_field(tcp.established),
        tcp_listen: tcp_field(tcp.listen),
        tcp_time_wait: tcp_field(tcp.time_wait),
        tcp_close_wait: tcp_field(tcp.close_wait),
        tcp_syn_sent: tcp_field(tcp.syn_sent),
        tcp_syn_recv: tcp_field(tcp.syn_recv),
        tcp_fin_wait: tcp_field(tcp.fin_wait),
        per_cpu_percent: if doc.cpu.per_cpu_percent.is_empty() {
            None
        } else {
            serde_json::to_string(&doc.cpu.per_cpu_percent).ok()
        },
    }
}

pub struct FleetCollector {
    pool: SqlitePool,
    client: NodeClient,
    states: Mutex<HashMap<i64, SpeedState>>,
    collect_interval: AtomicU64,
    haproxy_interval: AtomicU64,
    traffic_period_days: AtomicU64,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    last_hourly: Mutex<NaiveDateTime>,
    last_daily: Mutex<NaiveDateTime>,
}

impl FleetCollector {
    pub fn new(pool: SqlitePool) -> Result<Arc<Self>> {
        let now = store::now_naive();
        Ok(Arc::new(Self {
            pool,
            client: NodeClient::new()?,
            states: Mutex::new(HashMap::new()),
            collect_interval: AtomicU64::new(DEFAULT_METRICS_INTERVAL as u64),
            haproxy_interval: AtomicU64::new(DEFAULT_HAPROXY_INTERVAL as u64),
            traffic_period_days: AtomicU64::new(30),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            last_hourly: Mutex::new(now - ChronoDuration::hours(2)),
            last_daily: Mutex::new(now - ChronoDuration::days(2)),
        }))
    }

    async fn load_settings(&self) {
        if let Ok(interval) = settings::get_int_setting(
            &self.pool,
            "metrics_collect_interval",
            DEFAULT_METRICS_INTERVAL,
            5,
            300,
        )
        .await
        {
            let old = self.collect_interval.swap(interval as u64, Ordering::Relaxed);
            if old != interval as u64 {
                info!("metrics interval changed: {}s -> {}s", old, interval);
            }
        }
        if let Ok(interval) = settings::get_int_setting(
            &self.pool,
            "haproxy_collect_interval",
            DEFAULT_HAPROXY_INTERVAL,
            30,
            600,
        )
        .await
        {
            let old = self.haproxy_interval.swap(interval as u64, Ordering::Relaxed);
            if old != interval as u64 {
                info!("haproxy interval changed: {}s -> {}s", old, interval);
            }
        }
        if let Ok(period) =
            settings::get_int_setting(&self.pool, "traffic_period", 30, 1, 365).await
        {
            self.traffic_period_days.store(period as u64, Ordering::Relaxed);
        }
    }

    /// Poll one server and persist the outcome. Retries deadlocks with
    /// linear back-off.
    pub async fn collect_server(&self, server: &Server) -> Result<()> {
        let outcome = self.client.fetch_metrics(server).await;

        for attempt in 1..=DEADLOCK_RETRIES {
            let result = match &outcome {
                Ok((doc, body)) => {
                    let now = store::now_naive();
                    let now_secs = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
                    let speeds = {
                        let mut states = self.states.lock().await;
                        let state = states.entry(server.id).or_default();
                        derive_speeds(state, doc, now_secs)
                    };
                    let row = build_snapshot(server.id, doc, speeds, now);
                    match metrics::insert_snapshot(&self.pool, &row).await {
                        Ok(()) => servers::mark_online(&self.pool, server.id, body, now).await,
                        Err(e) => Err(e),
                    }
                }
                Err(poll_error) => {
                    servers::mark_error(&self.pool, server.id, &poll_error.message, poll_error.code)
                        .await
                }
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let is_deadlock = e.to_string().to_lowercase().contains("deadlock")
                        || e.to_string().to_lowercase().contains("locked");
                    if is_deadlock && attempt < DEADLOCK_RETRIES {
                        debug!("database contention collecting {} (attempt {})", server.name, attempt);
                        tokio::time::sleep(Duration::from_millis(300 * attempt as u64)).await;
                        continue;
                    }
                    debug!("failed to collect from {}: {}", server.name, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub async fn collect_all(&self) {
        let Ok(server_list) = servers::list_active(&self.pool).await else {
            return;
        };

        let futures: Vec<_> = server_list
            .iter()
            .map(|server| self.collect_server(server))
            .collect();
        for result in futures::future::join_all(futures).await {
            let _ = result;
        }

        if let Err(e) = metrics::cleanup(&self.pool, store::now_naive()).await {
            error!("metrics retention cleanup failed: {}", e);
        }
    }

    /// Close out any complete hour/day since the last aggregation.
    pub async fn run_aggregation(&self) -> Result<()> {
        let now = store::now_naive();

        let run_hourly = {
            let last = self.last_hourly.lock().await;
            now - *last >= ChronoDuration::hours(1)
        };
        if run_hourly {
            let hour_end = now
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(now);
            let hour_start = hour_end - ChronoDuration::hours(1);
            for server in servers::list(&self.pool).await? {
                metrics::aggregate_hour(&self.pool, server.id, hour_start).await?;
            }
            *self.last_hourly.lock().await = hour_end;
            info!("hourly aggregation completed for {}", hour_start);
        }

        let run_daily = {
            let last = self.last_daily.lock().await;
            now - *last >= ChronoDuration::days(1)
        };
        if run_daily {
            let day_end = now
                .with_hour(0)
                .and_then(|t| t.with_minute(0))
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(now);
            let day_start = day_end - ChronoDuration::days(1);
            for server in servers::list(&self.pool).await? {
                metrics::aggregate_day(&self.pool, server.id, day_start).await?;
            }
            *self.last_daily.lock().await = day_end;
            info!("daily aggregation completed for {}", day_start);
        }

        Ok(())
    }

    /// Cache the HAProxy/traffic view of one server as JSON blobs.
    pub async fn cache_server_data(&self, server: &Server) {
        let mut haproxy = serde_json::Map::new();
        for (key, path) in [
            ("status", "/api/haproxy/status"),
            ("rules", "/api/haproxy/rules"),
            ("certs", "/api/haproxy/certs/all"),
            ("firewall", "/api/haproxy/firewall/rules"),
        ] {
            if let Some(value) = self.client.fetch_json(server, path, HAPROXY_TIMEOUT).await {
                haproxy.insert(key.to_string(), value);
            }
        }

        let period = self.traffic_period_days.load(Ordering::Relaxed);
        let mut traffic = serde_json::Map::new();
        if let Some(value) = self
            .client
            .fetch_json(
                server,
                &format!("/api/traffic/summary?days={}", period),
                HAPROXY_TIMEOUT,
            )
            .await
        {
            traffic.insert("summary".to_string(), value);
        }
        if let Some(value) = self
            .client
            .fetch_json(server, "/api/traffic/ports/tracked", HAPROXY_TIMEOUT)
            .await
        {
            traffic.insert("tracked_ports".to_string(), value);
        }

        let cached_at = chrono::Utc::now().to_rfc3339();
        if !haproxy.is_empty() {
            haproxy.insert("cached_at".to_string(), json!(cached_at));
            if let Ok(blob) = serde_json::to_string(&haproxy) {
                let _ = servers::cache_haproxy_data(&self.pool, server.id, &blob).await;
            }
        }
        if !traffic.is_empty() {
            traffic.insert("cached_at".to_string(), json!(cached_at));
            if let Ok(blob) = serde_json::to_string(&traffic) {
                let _ = servers::cache_traffic_data(&self.pool, server.id, &blob).await;
            }
        }
    }

    async fn check_xray_nodes(&self) {
        let Ok(server_list) = servers::list_active(&self.pool).await else {
            return;
        };

        let probes: Vec<_> = server_list
            .iter()
            .map(|server| async move { (server.id, server.has_xray_node, self.client.probe_xray(server).await) })
            .collect();

        for (id, previous, available) in futures::future::join_all(probes).await {
            if available != previous {
                if servers::set_has_xray_node(&self.pool, id, available).await.is_ok() {
                    info!("server {}: has_xray_node = {}", id, available);
                }
            }
        }
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.load_settings().await;

        let mut tasks = self.tasks.lock().await;

        let main = self.clone();
        tasks.push(tokio::spawn(async move {
            while main.running.load(Ordering::SeqCst) {
                main.collect_all().await;
                let interval = main.collect_interval.load(Ordering::Relaxed);
                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
        }));

        let aggregator = self.clone();
        tasks.push(tokio::spawn(async move {
            while aggregator.running.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(60)).await;
                if let Err(e) = aggregator.run_aggregation().await {
                    error!("aggregation error: {}", e);
                }
            }
        }));

        let cache = self.clone();
        tasks.push(tokio::spawn(async move {
            while cache.running.load(Ordering::SeqCst) {
                let interval = cache.haproxy_interval.load(Ordering::Relaxed);
                tokio::time::sleep(Duration::from_secs(interval)).await;
                if let Ok(server_list) = servers::list_active(&cache.pool).await {
                    let futures: Vec<_> = server_list
                        .iter()
                        .map(|server| cache.cache_server_data(server))
                        .collect();
                    futures::future::join_all(futures).await;
                }
            }
        }));

        let prober = self.clone();
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            while prober.running.load(Ordering::SeqCst) {
                prober.check_xray_nodes().await;
                tokio::time::sleep(XRAY_CHECK_INTERVAL).await;
            }
        }));

        let reloader = self.clone();
        tasks.push(tokio::spawn(async move {
            while reloader.running.load(Ordering::SeqCst) {
                tokio::time::sleep(SETTINGS_RELOAD_INTERVAL).await;
                reloader.load_settings().await;
            }
        }));

        info!(
            "fleet collector started (interval: {}s, haproxy: {}s)",
            self.collect_interval.load(Ordering::Relaxed),
            self.haproxy_interval.load(Ordering::Relaxed)
        );
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("fleet collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with_counters(rx: u64, tx: u64) -> MetricsDocument {
        let mut doc = MetricsDocument::default();
        doc.network.total.rx_bytes = rx;
        doc.network.total.tx_bytes = tx;
        doc
    }

    #[test]
    fn speed_derivation_across_reboot() {
        let mut state = SpeedState::default();

        // t=0: baseline only.
        let speeds = derive_speeds(&mut state, &doc_with_counters(1_000_000, 0), 0.0);
        assert_eq!(speeds.net_rx, 0.0);

        // t=10: 50 KB over 10 s.
        let speeds = derive_speeds(&mut state, &doc_with_counters(1_050_000, 0), 10.0);
        assert_eq!(speeds.net_rx, 5000.0);

        // t=20: reboot, counter fell to 100; the new value is the delta.
        let speeds = derive_speeds(&mut state, &doc_with_counters(100, 0), 20.0);
        assert_eq!(speeds.net_rx, 10.0);

        // t=30: resumed normal accounting from the new baseline.
        let speeds = derive_speeds(&mut state, &doc_with_counters(1_100, 0), 30.0);
        assert_eq!(speeds.net_rx, 100.0);
    }

    #[test]
    fn short_gaps_produce_no_speed() {
        let mut state = SpeedState::default();
        derive_speeds(&mut state, &doc_with_counters(1_000, 0), 0.0);
        let speeds = derive_speeds(&mut state, &doc_with_counters(2_000, 0), 0.3);
        assert_eq!(speeds.net_rx, 0.0);
    }

    #[test]
    fn snapshot_row_flattens_tcp_states() {
        let mut doc = doc_with_counters(42, 17);
        doc.cpu.usage_percent = 55.5;
        doc.system.connections_detailed.tcp.established = 7;
        doc.system.connections_detailed.tcp.fin_wait = 3;
        doc.system.connections.established = 7;
        doc.system.connections.listen = 2;

        let row = build_snapshot(
            1,
            &doc,
            Speeds {
                net_rx: 123.0,
                ..Default::default()
            },
            store::now_naive(),
        );
        assert_eq!(row.cpu_usage, 55.5);
        assert_eq!(row.net_rx_bytes, 42);
        assert_eq!(row.net_rx_bytes_per_sec, 123.0);
        assert_eq!(row.tcp_established, Some(7));
        assert_eq!(row.tcp_fin_wait, Some(3));
        assert_eq!(row.connections_count, 9);
    }
}
