//! Adaptive-threshold alerting over the collector's cached metrics.
//!
//! Per server, exponential moving averages (window 30) track CPU, RAM,
//! network throughput and the TCP state counts. Absolute thresholds
//! catch hard ceilings; relative spike/drop checks catch deviations
//! from each server's own baseline. An alert needs its condition
//! sustained for the configured time and its cooldown expired; a
//! resolved condition clears the sustain tracker but never the
//! cooldown.

use crate::error::Result;
use crate::store::alerts::AlertSettings;
use crate::store::servers::Server;
use crate::store::{self, alerts, servers};
use crate::telegram;
use chrono::Duration as ChronoDuration;
use edge_types::metrics::MetricsDocument;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};

pub const EMA_WINDOW: f64 = 30.0;
pub const EMA_ALPHA: f64 = 2.0 / (EMA_WINDOW + 1.0);
pub const MIN_EMA_SAMPLES: u64 = 5;

/// Per-server adaptive state.
#[derive(Debug, Default)]
pub struct ServerAlertState {
    pub fail_count: i64,
    pub was_offline: bool,
    pub samples: u64,

    pub ema_cpu: f64,
    pub ema_ram: f64,
    pub ema_net_rx: f64,
    pub ema_net_tx: f64,
    pub ema_tcp_established: f64,
    pub ema_tcp_listen: f64,
    pub ema_tcp_timewait: f64,
    pub ema_tcp_closewait: f64,
    pub ema_tcp_synsent: f64,
    pub ema_tcp_synrecv: f64,
    pub ema_tcp_finwait: f64,

    pub prev_net_rx: f64,
    pub prev_net_tx: f64,
    pub prev_time: f64,
    pub net_initialized: bool,

    alert_start: HashMap<String, f64>,
    last_alert: HashMap<String, f64>,
}

impl ServerAlertState {
    fn update_ema(ema: &mut f64, samples: u64, value: f64) {
        if samples < 2 {
            *ema = value;
        } else {
            *ema = *ema * (1.0 - EMA_ALPHA) + value * EMA_ALPHA;
        }
    }

    pub fn is_warmed(&self) -> bool {
        self.samples >= MIN_EMA_SAMPLES
    }

    fn track_condition(&mut self, alert_type: &str, now: f64) {
        self.alert_start.entry(alert_type.to_string()).or_insert(now);
    }

    fn clear_condition(&mut self, alert_type: &str) {
        self.alert_start.remove(alert_type);
    }

    fn sustained_met(&self, alert_type: &str, now: f64, sustained: i64) -> bool {
        match self.alert_start.get(alert_type) {
            Some(started) => now - started >= sustained as f64,
            None => false,
        }
    }

    fn cooldown_ok(&self, alert_type: &str, now: f64, cooldown: i64) -> bool {
        match self.last_alert.get(alert_type) {
            Some(last) => now - last >= cooldown as f64,
            None => true,
        }
    }

    fn mark_sent(&mut self, alert_type: &str, now: f64) {
        self.last_alert.insert(alert_type.to_string(), now);
    }

    pub fn active_conditions(&self) -> Vec<String> {
        self.alert_start.keys().cloned().collect()
    }

    /// Speed from consecutive cumulative counter readings.
    fn calc_net_speed(&mut self, raw_rx: f64, raw_tx: f64, now: f64) -> (f64, f64) {
        let mut rx_speed = 0.0;
        let mut tx_speed = 0.0;

        if self.net_initialized && self.prev_time > 0.0 {
            let dt = now - self.prev_time;
            if dt > 0.5 {
                let rx_diff = raw_rx - self.prev_net_rx;
                let tx_diff = raw_tx - self.prev_net_tx;
                if rx_diff >= 0.0 {
                    rx_speed = rx_diff / dt;
                }
                if tx_diff >= 0.0 {
                    tx_speed = tx_diff / dt;
                }
            }
        }

        self.prev_net_rx = raw_rx;
        self.prev_net_tx = raw_tx;
        self.prev_time = now;
        self.net_initialized = true;
        (rx_speed, tx_speed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvent {
    pub alert_type: String,
    pub severity: &'static str,
    pub message: String,
    pub details: Value,
}

fn lang(settings: &AlertSettings) -> &str {
    if settings.language.eq_ignore_ascii_case("ru") {
        "ru"
    } else {
        "en"
    }
}

fn msg_offline(name: &str, settings: &AlertSettings, fail_count: i64) -> String {
    if lang(settings) == "ru" {
        format!("Сервер {} недоступен (нет ответа {} проверок подряд)", name, fail_count)
    } else {
        format!(
            "Server {} is offline (no response for {} consecutive checks)",
            name, fail_count
        )
    }
}

fn msg_recovery(name: &str, settings: &AlertSettings) -> String {
    if lang(settings) == "ru" {
        format!("Сервер {} снова онлайн", name)
    } else {
        format!("Server {} is back online", name)
    }
}

fn msg_critical(
    name: &str,
    settings: &AlertSettings,
    label: &str,
    current: f64,
    threshold: f64,
    unit: &str,
) -> String {
    if lang(settings) == "ru" {
        format!(
            "{} критический на {}: {:.1}{} (порог {:.0}{})",
            label, name, current, unit, threshold, unit
        )
    } else {
        format!(
            "{} critical on {}: {:.1}{} (threshold {:.0}{})",
            label, name, current, unit, threshold, unit
        )
    }
}

fn msg_spike(
    name: &str,
    settings: &AlertSettings,
    label: &str,
    current: &str,
    baseline: &str,
    pct: f64,
) -> String {
    if lang(settings) == "ru" {
        format!("Скачок {} на {}: {} (базовое {}, +{:.0}%)", label, name, current, baseline, pct)
    } else {
        format!(
            "{} spike on {}: {} (baseline {}, +{:.0}%)",
            label, name, current, baseline, pct
        )
    }
}

fn msg_drop(
    name: &str,
    settings: &AlertSettings,
    label: &str,
    current: &str,
    baseline: &str,
    pct: f64,
) -> String {
    if lang(settings) == "ru" {
        format!("Падение {} на {}: {} (базовое {}, -{:.0}%)", label, name, current, baseline, pct)
    } else {
        format!(
            "{} drop on {}: {} (baseline {}, -{:.0}%)",
            label, name, current, baseline, pct
        )
    }
}

pub fn format_bytes_speed(value: f64) -> String {
    if value >= 1e9 {
        format!("{:.1} GB/s", value / 1e9)
    } else if value >= 1e6 {
        format!("{:.1} MB/s", value / 1e6)
    } else if value >= 1e3 {
        format!("{:.1} KB/s", value / 1e3)
    } else {
        format!("{:.0} B/s", value)
    }
}

struct ResourceCheck<'a> {
    current: f64,
    ema: f64,
    critical_threshold: f64,
    spike_percent: f64,
    sustained: i64,
    critical_type: &'a str,
    spike_type: &'a str,
    label: &'a str,
    unit: &'a str,
    min_value: f64,
}

/// Absolute critical + relative spike check for CPU / RAM.
fn check_resource(
    state: &mut ServerAlertState,
    name: &str,
    settings: &AlertSettings,
    now: f64,
    cooldown: i64,
    check: ResourceCheck<'_>,
    events: &mut Vec<AlertEvent>,
) {
    if check.current >= check.critical_threshold {
        state.track_condition(check.critical_type, now);
        if state.sustained_met(check.critical_type, now, check.sustained)
            && state.cooldown_ok(check.critical_type, now, cooldown)
        {
            state.mark_sent(check.critical_type, now);
            events.push(AlertEvent {
                alert_type: check.critical_type.to_string(),
                severity: "critical",
                message: msg_critical(
                    name,
                    settings,
                    check.label,
                    check.current,
                    check.critical_threshold,
                    check.unit,
                ),
                details: json!({
                    "current": (check.current * 10.0).round() / 10.0,
                    "threshold": check.critical_threshold,
                    "ema": (check.ema * 10.0).round() / 10.0,
                }),
            });
        }
    } else {
        state.clear_condition(check.critical_type);
    }

    if check.current < check.min_value {
        state.clear_condition(check.spike_type);
        return;
    }

    let deviation_pct = if check.ema > 0.0 {
        (check.current - check.ema) / check.ema * 100.0
    } else if check.current == 0.0 {
        0.0
    } else {
        100.0
    };

    if deviation_pct > check.spike_percent {
        state.track_condition(check.spike_type, now);
        if state.sustained_met(check.spike_type, now, check.sustained)
            && state.cooldown_ok(check.spike_type, now, cooldown)
        {
            state.mark_sent(check.spike_type, now);
            events.push(AlertEvent {
                alert_type: check.spike_type.to_string(),
                severity: "warning",
                message: msg_spike(
                    name,
                    settings,
                    check.label,
                    &format!("{:.1}{}", check.current, check.unit),
                    &format!("{:.1}{}", check.ema, check.unit),
                    deviation_pct,
                ),
                details: json!({
                    "current": (check.current * 10.0).round() / 10.0,
                    "ema": (check.ema * 10.0).round() / 10.0,
                    "deviation_pct": (deviation_pct * 10.0).round() / 10.0,
                }),
            });
        }
    } else {
        state.clear_condition(check.spike_type);
    }
}

struct DeviationCheck<'a> {
    current: f64,
    ema: f64,
    spike_pct: f64,
    drop_pct: Option<f64>,
    sustained: i64,
    spike_type: &'a str,
    drop_type: Option<&'a str>,
    label: &'a str,
    min_value: f64,
    format_bytes: bool,
}

/// Relative spike (and optionally drop) against the EMA baseline.
fn check_deviation(
    state: &mut ServerAlertState,
    name: &str,
    settings: &AlertSettings,
    now: f64,
    cooldown: i64,
    check: DeviationCheck<'_>,
    events: &mut Vec<AlertEvent>,
) {
    if check.ema < check.min_value && check.current < check.min_value {
        state.clear_condition(check.spike_type);
        if let Some(drop_type) = check.drop_type {
            state.clear_condition(drop_type);
        }
        return;
    }

    let fmt = |value: f64| -> String {
        if check.format_bytes {
            format_bytes_speed(value)
        } else {
            format!("{:.0}", value)
        }
    };

    let increase_pct = if check.ema > 0.0 {
        (check.current - check.ema) / check.ema * 100.0
    } else if check.current == 0.0 {
        0.0
    } else {
        100.0
    };

    if increase_pct > check.spike_pct {
        state.track_condition(check.spike_type, now);
        if state.sustained_met(check.spike_type, now, check.sustained)
            && state.cooldown_ok(check.spike_type, now, cooldown)
        {
            state.mark_sent(check.spike_type, now);
            events.push(AlertEvent {
                alert_type: check.spike_type.to_string(),
                severity: "warning",
                message: msg_spike(
                    name,
                    settings,
                    check.label,
                    &fmt(check.current),
                    &fmt(check.ema),
                    increase_pct,
                ),
                details: json!({
                    "current": check.current,
                    "ema": check.ema,
                    "deviation_pct": (increase_pct * 10.0).round() / 10.0,
                }),
            });
        }
    } else {
        state.clear_condition(check.spike_type);
    }

    let (Some(drop_pct), Some(drop_type)) = (check.drop_pct, check.drop_type) else {
        return;
    };

    if check.ema > 0.0 {
        let decrease_pct = (check.ema - check.current) / check.ema * 100.0;
        if decrease_pct > drop_pct {
            state.track_condition(drop_type, now);
            if state.sustained_met(drop_type, now, check.sustained)
                && state.cooldown_ok(drop_type, now, cooldown)
            {
                state.mark_sent(drop_type, now);
                events.push(AlertEvent {
                    alert_type: drop_type.to_string(),
                    severity: "warning",
                    message: msg_drop(
                        name,
                        settings,
                        check.label,
                        &fmt(check.current),
                        &fmt(check.ema),
                        decrease_pct,
                    ),
                    details: json!({
                        "current": check.current,
                        "ema": check.ema,
                        "deviation_pct": (decrease_pct * 10.0).round() / 10.0,
                    }),
                });
            }
        } else {
            state.clear_condition(drop_type);
        }
    } else {
        state.clear_condition(drop_type);
    }
}

fn extract_tcp(doc: &MetricsDocument) -> [f64; 7] {
    let tcp = &doc.system.connections_detailed.tcp;
    [
        tcp.established as f64,
        tcp.listen as f64,
        tcp.time_wait as f64,
        tcp.close_wait as f64,
        tcp.syn_sent as f64,
        tcp.syn_recv as f64,
        tcp.fin_wait as f64,
    ]
}

/// Offline/recovery transition check.
pub fn check_offline(
    state: &mut ServerAlertState,
    name: &str,
    settings: &AlertSettings,
    is_online: bool,
    now: f64,
    events: &mut Vec<AlertEvent>,
) {
    let cooldown = settings.alert_cooldown.max(1);
    let threshold = settings.offline_fail_threshold.max(1);

    if !is_online {
        state.fail_count += 1;
        if state.fail_count >= threshold && !state.was_offline {
            state.was_offline = true;
            if state.cooldown_ok("offline", now, cooldown) {
                state.mark_sent("offline", now);
                events.push(AlertEvent {
                    alert_type: "offline".into(),
                    severity: "critical",
                    message: msg_offline(name, settings, state.fail_count),
                    details: json!({"fail_count": state.fail_count, "threshold": threshold}),
                });
            }
        }
    } else {
        if state.was_offline && settings.offline_recovery_notify {
            if state.cooldown_ok("recovery", now, cooldown) {
                state.mark_sent("recovery", now);
                events.push(AlertEvent {
                    alert_type: "recovery".into(),
                    severity: "info",
                    message: msg_recovery(name, settings),
                    details: json!({"was_offline_checks": state.fail_count}),
                });
            }
        }
        state.fail_count = 0;
        state.was_offline = false;
        state.clear_condition("offline");
    }
}

/// Full per-server evaluation. Pure over (state, metrics, settings,
/// now); no I/O, so the sustained/cooldown machinery is testable with
/// simulated clocks.
pub fn check_server(
    state: &mut ServerAlertState,
    name: &str,
    settings: &AlertSettings,
    is_online: bool,
    metrics: Option<&MetricsDocument>,
    now: f64,
) -> Vec<AlertEvent> {
    let mut events = Vec::new();

    if settings.offline_enabled {
        check_offline(state, name, settings, is_online, now, &mut events);
    }

    let Some(doc) = metrics else {
        return events;
    };
    if !is_online {
        return events;
    }

    let cpu = doc.cpu.usage_percent;
    let ram = doc.memory.ram.percent;
    let (rx_speed, tx_speed) = state.calc_net_speed(
        doc.network.total.rx_bytes as f64,
        doc.network.total.tx_bytes as f64,
        now,
    );
    let tcp = extract_tcp(doc);

    let samples = state.samples;
    ServerAlertState::update_ema(&mut state.ema_cpu, samples, cpu);
    ServerAlertState::update_ema(&mut state.ema_ram, samples, ram);
    ServerAlertState::update_ema(&mut state.ema_net_rx, samples, rx_speed);
    ServerAlertState::update_ema(&mut state.ema_net_tx, samples, tx_speed);
    ServerAlertState::update_ema(&mut state.ema_tcp_established, samples, tcp[0]);
    ServerAlertState::update_ema(&mut state.ema_tcp_listen, samples, tcp[1]);
    ServerAlertState::update_ema(&mut state.ema_tcp_timewait, samples, tcp[2]);
    ServerAlertState::update_ema(&mut state.ema_tcp_closewait, samples, tcp[3]);
    ServerAlertState::update_ema(&mut state.ema_tcp_synsent, samples, tcp[4]);
    ServerAlertState::update_ema(&mut state.ema_tcp_synrecv, samples, tcp[5]);
    ServerAlertState::update_ema(&mut state.ema_tcp_finwait, samples, tcp[6]);
    state.samples += 1;

    if !state.is_warmed() {
        return events;
    }

    let cooldown = settings.alert_cooldown.max(1);

    if settings.cpu_enabled {
        check_resource(
            state,
            name,
            settings,
            now,
            cooldown,
            ResourceCheck {
                current: cpu,
                ema: state.ema_cpu,
                critical_threshold: settings.cpu_critical_threshold,
                spike_percent: settings.cpu_spike_percent,
                sustained: settings.cpu_sustained_seconds,
                critical_type: "cpu_critical",
                spike_type: "cpu_spike",
                label: "CPU",
                unit: "%",
                min_value: settings.cpu_min_value,
            },
            &mut events,
        );
    }

    if settings.ram_enabled {
        check_resource(
            state,
            name,
            settings,
            now,
            cooldown,
            ResourceCheck {
                current: ram,
                ema: state.ema_ram,
                critical_threshold: settings.ram_critical_threshold,
                spike_percent: settings.ram_spike_percent,
                sustained: settings.ram_sustained_seconds,
                critical_type: "ram_critical",
                spike_type: "ram_spike",
                label: "RAM",
                unit: "%",
                min_value: settings.ram_min_value,
            },
            &mut events,
        );
    }

    if settings.network_enabled {
        check_deviation(
            state,
            name,
            settings,
            now,
            cooldown,
            DeviationCheck {
                current: rx_speed + tx_speed,
                ema: state.ema_net_rx + state.ema_net_tx,
                spike_pct: settings.network_spike_percent,
                drop_pct: Some(settings.network_drop_percent),
                sustained: settings.network_sustained_seconds,
                spike_type: "network_spike",
                drop_type: Some("network_drop"),
                label: "Network",
                min_value: settings.network_min_bytes,
                format_bytes: true,
            },
            &mut events,
        );
    }

    let tcp_min = settings.tcp_min_connections;
    let spike_only: [(bool, f64, f64, f64, i64, &str, &str); 6] = [
        (
            settings.tcp_listen_enabled,
            tcp[1],
            state.ema_tcp_listen,
            settings.tcp_listen_spike_percent,
            settings.tcp_listen_sustained_seconds,
            "tcp_listen_spike",
            "TCP Listen",
        ),
        (
            settings.tcp_timewait_enabled,
            tcp[2],
            state.ema_tcp_timewait,
            settings.tcp_timewait_spike_percent,
            settings.tcp_timewait_sustained_seconds,
            "tcp_timewait_spike",
            "TCP Time Wait",
        ),
        (
            settings.tcp_closewait_enabled,
            tcp[3],
            state.ema_tcp_closewait,
            settings.tcp_closewait_spike_percent,
            settings.tcp_closewait_sustained_seconds,
            "tcp_closewait_spike",
            "TCP Close Wait",
        ),
        (
            settings.tcp_synsent_enabled,
            tcp[4],
            state.ema_tcp_synsent,
            settings.tcp_synsent_spike_percent,
            settings.tcp_synsent_sustained_seconds,
            "tcp_synsent_spike",
            "TCP SYN Sent",
        ),
        (
            settings.tcp_synrecv_enabled,
            tcp[5],
            state.ema_tcp_synrecv,
            settings.tcp_synrecv_spike_percent,
            settings.tcp_synrecv_sustained_seconds,
            "tcp_synrecv_spike",
            "TCP SYN Recv",
        ),
        (
            settings.tcp_finwait_enabled,
            tcp[6],
            state.ema_tcp_finwait,
            settings.tcp_finwait_spike_percent,
            settings.tcp_finwait_sustained_seconds,
            "tcp_finwait_spike",
            "TCP FIN Wait",
        ),
    ];

    if settings.tcp_established_enabled {
        check_deviation(
            state,
            name,
            settings,
            now,
            cooldown,
            DeviationCheck {
                current: tcp[0],
                ema: state.ema_tcp_established,
                spike_pct: settings.tcp_established_spike_percent,
                drop_pct: Some(settings.tcp_established_drop_percent),
                sustained: settings.tcp_established_sustained_seconds,
                spike_type: "tcp_established_spike",
                drop_type: Some("tcp_established_drop"),
                label: "TCP Established",
                min_value: tcp_min,
                format_bytes: false,
            },
            &mut events,
        );
    }

    for (enabled, current, ema, spike_pct, sustained, spike_type, label) in spike_only {
        if !enabled {
            continue;
        }
        check_deviation(
            state,
            name,
            settings,
            now,
            cooldown,
            DeviationCheck {
                current,
                ema,
                spike_pct,
                drop_pct: None,
                sustained,
                spike_type,
                drop_type: None,
                label,
                min_value: tcp_min,
                format_bytes: false,
            },
            &mut events,
        );
    }

    events
}

/// Online = the collector has seen the server within
/// `check_interval × offline_fail_threshold + 30 s`.
pub fn server_is_online(server: &Server, settings: &AlertSettings) -> bool {
    let Some(last_seen) = server.last_seen else {
        return false;
    };
    let interval = settings.check_interval.max(1);
    let threshold = settings.offline_fail_threshold.max(1);
    let max_gap = ChronoDuration::seconds(interval * threshold + 30);
    store::now_naive() - last_seen < max_gap
}

pub struct Alerter {
    pool: SqlitePool,
    states: Mutex<HashMap<i64, ServerAlertState>>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Alerter {
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self {
            pool,
            states: Mutex::new(HashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }

    async fn send_and_save(&self, server: &Server, settings: &AlertSettings, event: &AlertEvent) {
        let mut notified = false;
        if let (Some(token), Some(chat_id)) =
            (&settings.telegram_bot_token, &settings.telegram_chat_id)
        {
            let emoji = match event.severity {
                "critical" => "\u{1f534}",
                "warning" => "\u{1f7e1}",
                _ => "\u{1f7e2}",
            };
            let header = if lang(settings) == "ru" {
                "Уведомление сервера"
            } else {
                "Server Alert"
            };
            let text = format!("{} <b>{}</b>\n\n{}", emoji, header, event.message);
            notified = telegram::send_message(token, chat_id, &text).await;
        }

        // Persisted regardless of delivery.
        if let Err(e) = alerts::record_alert(
            &self.pool,
            server.id,
            &server.name,
            &event.alert_type,
            event.severity,
            &event.message,
            &event.details.to_string(),
            notified,
        )
        .await
        {
            error!("failed to save alert history: {}", e);
        }
    }

    pub async fn check_all(&self, settings: &AlertSettings) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let excluded = settings.excluded_servers();
        let server_list = servers::list_active(&self.pool).await?;

        let mut states = self.states.lock().await;
        for server in &server_list {
            if excluded.contains(&server.id) {
                continue;
            }
            let state = states.entry(server.id).or_default();

            let is_online = server_is_online(server, settings);
            let metrics: Option<MetricsDocument> = server
                .last_metrics
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok());

            let events = check_server(
                state,
                &server.name,
                settings,
                is_online,
                metrics.as_ref(),
                now,
            );
            for event in &events {
                self.send_and_save(server, settings, event).await;
            }
        }

        // Forget servers that are gone or excluded now.
        let monitored: std::collections::HashSet<i64> = server_list
            .iter()
            .map(|s| s.id)
            .filter(|id| !excluded.contains(id))
            .collect();
        states.retain(|id, _| monitored.contains(id));

        Ok(())
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let alerter = self.clone();
        *self.task.lock().await = Some(tokio::spawn(async move {
            let mut elapsed = 0i64;
            let mut first_run = true;

            while alerter.running.load(Ordering::SeqCst) {
                let settings = alerts::alert_settings(&alerter.pool)
                    .await
                    .unwrap_or_default();
                let interval = settings.check_interval.max(10);

                if settings.enabled && (first_run || elapsed >= interval) {
                    if let Err(e) = alerter.check_all(&settings).await {
                        error!("alerter loop error: {}", e);
                    }
                    elapsed = 0;
                    first_run = false;
                }

                tokio::time::sleep(Duration::from_secs(1)).await;
                elapsed += 1;
            }
        }));
        info!("server alerter started");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        info!("server alerter stopped");
    }

    pub async fn status(&self) -> Value {
        let states = self.states.lock().await;
        let active: HashMap<String, Vec<String>> = states
            .iter()
            .filter(|(_, state)| !state.active_conditions().is_empty())
            .map(|(id, state)| (id.to_string(), state.active_conditions()))
            .collect();
        json!({
            "running": self.running.load(Ordering::Relaxed),
            "monitored_servers": states.len(),
            "active_conditions": active,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with_cpu(cpu: f64) -> MetricsDocument {
        let mut doc = MetricsDocument::default();
        doc.cpu.usage_percent = cpu;
        doc
    }

    fn test_settings() -> AlertSettings {
        AlertSettings {
            enabled: true,
            cpu_critical_threshold: 90.0,
            cpu_sustained_seconds: 300,
            alert_cooldown: 1800,
            // Keep the spike detector quiet in these tests.
            cpu_spike_percent: 100_000.0,
            ram_enabled: false,
            network_enabled: false,
            offline_enabled: false,
            ..Default::default()
        }
    }

    /// Seed scenario: five warm-up samples at 20%, then sustained 95%.
    /// The first alert fires when sustained time reaches 300 s; no
    /// repeat within the 1800 s cooldown; a dip clears the sustain
    /// tracker but not the cooldown.
    #[test]
    fn sustained_and_cooldown() {
        let settings = test_settings();
        let mut state = ServerAlertState::default();
        let mut now = 0.0;
        let tick = 60.0;

        // Warm-up: no alerts possible.
        for _ in 0..5 {
            let events = check_server(&mut state, "s1", &settings, true, Some(&doc_with_cpu(20.0)), now);
            assert!(events.is_empty());
            now += tick;
        }

        // High CPU: condition starts at the first high sample, alert
        // fires once 300 s of sustained time have accumulated.
        let mut fired_at = None;
        for i in 0..15 {
            let events = check_server(&mut state, "s1", &settings, true, Some(&doc_with_cpu(95.0)), now);
            if !events.is_empty() {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].alert_type, "cpu_critical");
                assert_eq!(events[0].severity, "critical");
                fired_at = Some((i, now));
                break;
            }
            now += tick;
        }
        let (iteration, _) = fired_at.expect("critical alert should fire");
        assert_eq!(iteration, 5); // 300 s after the condition started

        // Cooldown: CPU stays hot, nothing more fires within 1800 s.
        for _ in 0..20 {
            now += tick;
            let events = check_server(&mut state, "s1", &settings, true, Some(&doc_with_cpu(95.0)), now);
            assert!(events.is_empty(), "no alert within cooldown");
        }

        // Dip below threshold: sustain tracker clears...
        now += tick;
        let events = check_server(&mut state, "s1", &settings, true, Some(&doc_with_cpu(20.0)), now);
        assert!(events.is_empty());
        assert!(!state.active_conditions().contains(&"cpu_critical".to_string()));

        // ...but the cooldown persists: going hot again immediately
        // does not alert even after another 300 s of sustain, because
        // the 1800 s since the first alert have not passed.
        for _ in 0..6 {
            now += tick;
            let events = check_server(&mut state, "s1", &settings, true, Some(&doc_with_cpu(95.0)), now);
            assert!(events.is_empty());
        }
    }

    #[test]
    fn offline_then_recovery() {
        let mut settings = test_settings();
        settings.offline_enabled = true;
        settings.offline_fail_threshold = 3;
        let mut state = ServerAlertState::default();
        let mut now = 0.0;

        for i in 0..3 {
            let events = check_server(&mut state, "s1", &settings, false, None, now);
            if i < 2 {
                assert!(events.is_empty());
            } else {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].alert_type, "offline");
                assert_eq!(events[0].severity, "critical");
            }
            now += 60.0;
        }

        // Back online: recovery info alert, counters reset.
        let events = check_server(&mut state, "s1", &settings, true, None, now);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].alert_type, "recovery");
        assert_eq!(events[0].severity, "info");
        assert_eq!(state.fail_count, 0);
    }

    #[test]
    fn network_drop_detection() {
        let mut settings = test_settings();
        settings.network_enabled = true;
        settings.network_drop_percent = 80.0;
        settings.network_sustained_seconds = 0;
        settings.cpu_enabled = false;

        let mut state = ServerAlertState::default();
        let mut now = 0.0;
        let mut counter: u64 = 0;

        // Baseline: ~1 MB/s for enough samples to warm the EMA.
        for _ in 0..10 {
            counter += 60_000_000;
            let mut doc = MetricsDocument::default();
            doc.network.total.rx_bytes = counter;
            check_server(&mut state, "s1", &settings, true, Some(&doc), now);
            now += 60.0;
        }

        // Throughput collapses to ~1 KB/s.
        let mut events = Vec::new();
        for _ in 0..3 {
            counter += 60_000;
            let mut doc = MetricsDocument::default();
            doc.network.total.rx_bytes = counter;
            events = check_server(&mut state, "s1", &settings, true, Some(&doc), now);
            if !events.is_empty() {
                break;
            }
            now += 60.0;
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].alert_type, "network_drop");
    }

    #[test]
    fn byte_speed_formatting() {
        assert_eq!(format_bytes_speed(500.0), "500 B/s");
        assert_eq!(format_bytes_speed(1_500.0), "1.5 KB/s");
        assert_eq!(format_bytes_speed(2_500_000.0), "2.5 MB/s");
        assert_eq!(format_bytes_speed(3_100_000_000.0), "3.1 GB/s");
    }
}
