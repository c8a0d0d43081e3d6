//! Traffic anomaly analyzer.
//!
//! Periodically scans the cached user state for three signal classes:
//! traffic consumed since the last snapshot beyond a configurable
//! limit, too many active ASN-clustered client IPs for the user's
//! device limit, and HWID devices with user agents that no known
//! client produces.

use crate::asn::{self, AsnGroup};
use crate::error::Result;
use crate::infra;
use crate::remnawave::UpstreamClient;
use crate::store::anomalies::{AnalyzerSettings, CachedUser};
use crate::store::{self, anomalies, settings, xray};
use crate::telegram;
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use regex::Regex;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const MIN_ASN_VISIT_COUNT: i64 = xray::MIN_ASN_VISIT_COUNT;

const VALID_PLATFORMS: &[&str] = &["android", "ios", "windows", "macos", "linux", "mac"];

// Known client user-agent prefixes. No trailing anchor: real agents
// carry OS/framework suffixes ("Shadowrocket/1882 CFNetwork/...").
const VALID_APP_PATTERNS: &[&str] = &[
    // V2Ray family
    r"^V2rayNG",
    r"^v2raytun",
    r"^v2rayA",
    r"^V2RayU",
    r"^V2Box",
    r"^Qv2ray",
    r"^Happ",
    // Shadowrocket / Quantumult / Surge / Loon / Stash
    r"^Shadowrocket",
    r"^Quantumult",
    r"^Surge",
    r"^Loon",
    r"^Stash",
    r"^Pharos",
    r"^Spectre",
    r"^FoXray",
    // Clash / Mihomo family
    r"^Clash",
    r"^FlClash",
    r"^Flowvy",
    r"^mihomo",
    r"^koala[\-_]?clash",
    r"^murge",
    r"^prizrak[\-_]?box",
    // sing-box family
    r"^sing[\-]?box",
    r"^sf[aimt]([/ \d]|$)",
    r"^karing",
    r"^rabbithole",
    // NekoBox / Nekoray / SagerNet / Matsuri
    r"^NekoBox",
    r"^nekoray",
    r"^SagerNet",
    r"^Matsuri",
    // Other clients
    r"^Streisand",
    r"^OneClick",
    r"^hiddify",
    r"^WingsX",
];

const SUSPICIOUS_PATTERNS: &[&str] = &[
    "GAYNETWORK",
    "FREE",
    "CRACK",
    "HACK",
    "PIRATE",
    "STOLEN",
    "SHARED",
];

fn valid_app_regexes() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        VALID_APP_PATTERNS
            .iter()
            .map(|p| {
                Regex::new(&format!("(?i){}", p)).expect("valid app pattern")
            })
            .collect()
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserAgentVerdict {
    pub valid: bool,
    pub issues: Vec<String>,
}

/// Validate a HWID user-agent string against the known-client table and
/// the deny-substring list.
pub fn validate_user_agent(user_agent: &str) -> UserAgentVerdict {
    let ua = user_agent.trim();
    if ua.is_empty() {
        return UserAgentVerdict {
            valid: false,
            issues: vec!["empty_user_agent".into()],
        };
    }

    let mut issues = Vec::new();
    let upper = ua.to_uppercase();
    for pattern in SUSPICIOUS_PATTERNS {
        if upper.contains(pattern) {
            issues.push(format!("suspicious_pattern:{}", pattern));
        }
    }

    let matches_known_app = valid_app_regexes().iter().any(|re| re.is_match(ua));
    if !matches_known_app {
        let lower = ua.to_lowercase();
        let has_platform = VALID_PLATFORMS.iter().any(|p| lower.contains(p));
        if !has_platform {
            issues.push("unknown_app_format".into());
        }
    }

    if ua.len() < 5 {
        issues.push("too_short".into());
    }

    UserAgentVerdict {
        valid: issues.is_empty(),
        issues,
    }
}

#[derive(Debug, Clone)]
pub struct Anomaly {
    pub anomaly_type: &'static str,
    pub severity: &'static str,
    pub details: Value,
}

/// Traffic delta rule: `consumed = current - previous`, except that a
/// shrinking counter (billing reset) means `consumed = current`.
/// Critical when consumption exceeds twice the limit.
pub fn evaluate_traffic(
    previous: Option<i64>,
    current: i64,
    limit_gb: f64,
    period_minutes: i64,
) -> Option<Anomaly> {
    // First observation just creates the baseline.
    let previous = previous?;

    let consumed = if current < previous {
        current
    } else {
        current - previous
    };

    let limit_bytes = (limit_gb * (1u64 << 30) as f64) as i64;
    if consumed <= limit_bytes {
        return None;
    }

    let consumed_gb = consumed as f64 / (1u64 << 30) as f64;
    let severity = if consumed >= limit_bytes * 2 {
        "critical"
    } else {
        "warning"
    };

    Some(Anomaly {
        anomaly_type: "traffic",
        severity,
        details: json!({
            "consumed_gb": (consumed_gb * 100.0).round() / 100.0,
            "period_minutes": period_minutes,
            "limit_gb": limit_gb,
            "exceeded_by_gb": ((consumed_gb - limit_gb) * 100.0).round() / 100.0,
        }),
    })
}

/// ASN-clustering rule: more active IP groups than
/// `device_limit * multiplier` is an anomaly. Details are capped at
/// five groups of ten IPs each for notification compactness.
pub fn evaluate_ip_groups(
    groups: &[AsnGroup],
    device_limit: i64,
    ip_limit_multiplier: f64,
) -> Option<Anomaly> {
    let effective = asn::effective_ip_count(groups);
    let ip_limit = (device_limit as f64 * ip_limit_multiplier) as usize;
    if effective <= ip_limit {
        return None;
    }

    let unique_ips: usize = groups.iter().map(|g| g.count).sum();
    let severity = if effective as f64 > ip_limit as f64 * 1.5 {
        "critical"
    } else {
        "warning"
    };

    let compact: Vec<Value> = groups
        .iter()
        .take(5)
        .map(|group| {
            json!({
                "asn": group.asn,
                "prefix": group.prefix,
                "ips": group.ips.iter().take(10).collect::<Vec<_>>(),
                "count": group.count,
                "visits": group.visits,
            })
        })
        .collect();

    Some(Anomaly {
        anomaly_type: "ip_count",
        severity,
        details: json!({
            "unique_ips": unique_ips,
            "unique_asns": groups.iter().filter(|g| g.asn.is_some()).count(),
            "effective_count": effective,
            "device_limit": device_limit,
            "ip_limit": ip_limit,
            "exceeded_by": effective - ip_limit,
            "min_visit_threshold": MIN_ASN_VISIT_COUNT,
            "asn_groups": compact,
        }),
    })
}

/// HWID rule: any device whose user agent fails validation is
/// suspicious; more than one failing device is critical.
pub fn evaluate_hwid(devices: &[Value]) -> Option<Anomaly> {
    if devices.is_empty() {
        return None;
    }

    let mut suspicious = Vec::new();
    for device in devices {
        let user_agent = device
            .get("userAgent")
            .and_then(Value::as_str)
            .unwrap_or("");
        let verdict = validate_user_agent(user_agent);
        if !verdict.valid {
            let hwid = device.get("hwid").and_then(Value::as_str).unwrap_or("");
            suspicious.push(json!({
                "hwid": format!("{}...", hwid.chars().take(20).collect::<String>()),
                "user_agent": if user_agent.is_empty() {
                    "(empty)".to_string()
                } else {
                    user_agent.chars().take(100).collect()
                },
                "issues": verdict.issues,
            }));
        }
    }

    if suspicious.is_empty() {
        return None;
    }

    let severity = if suspicious.len() > 1 { "critical" } else { "warning" };
    Some(Anomaly {
        anomaly_type: "hwid",
        severity,
        details: json!({
            "total_devices": devices.len(),
            "suspicious_count": suspicious.len(),
            "suspicious_devices": suspicious.into_iter().take(5).collect::<Vec<_>>(),
        }),
    })
}

fn parse_device_datetime(value: Option<&Value>) -> Option<NaiveDateTime> {
    let raw = value?.as_str()?;
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.naive_utc())
        .ok()
}

/// Keep only devices touched within the window, indexed by user UUID.
pub fn index_recent_devices(
    devices: Vec<Value>,
    cutoff: NaiveDateTime,
) -> HashMap<String, Vec<Value>> {
    let mut by_user: HashMap<String, Vec<Value>> = HashMap::new();
    for device in devices {
        let latest = parse_device_datetime(device.get("updatedAt"))
            .or_else(|| parse_device_datetime(device.get("createdAt")));
        if let Some(latest) = latest {
            if latest < cutoff {
                continue;
            }
        }
        if let Some(uuid) = device.get("userUuid").and_then(Value::as_str) {
            by_user.entry(uuid.to_string()).or_default().push(device);
        }
    }
    by_user
}

pub struct AnomalyAnalyzer {
    pool: SqlitePool,
    running: Arc<AtomicBool>,
    analyzing: AtomicBool,
    check_interval: AtomicI64,
    time_since_check: AtomicI64,
    last_check: Mutex<Option<NaiveDateTime>>,
    hwid_cache: Mutex<HashMap<String, Vec<Value>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AnomalyAnalyzer {
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self {
            pool,
            running: Arc::new(AtomicBool::new(false)),
            analyzing: AtomicBool::new(false),
            check_interval: AtomicI64::new(1800),
            time_since_check: AtomicI64::new(0),
            last_check: Mutex::new(None),
            hwid_cache: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        })
    }

    async fn refresh_hwid_cache(&self, remnawave: &settings::RemnawaveSettings) {
        let (Some(api_url), Some(api_token)) = (&remnawave.api_url, &remnawave.api_token) else {
            return;
        };
        let client = match UpstreamClient::new(api_url, api_token, remnawave.cookie_secret.as_deref())
        {
            Ok(client) => client,
            Err(e) => {
                warn!("failed to build upstream client: {}", e);
                return;
            }
        };

        match client.all_hwid_devices_paginated(100).await {
            Ok(devices) => {
                let total = devices.len();
                let cutoff = store::now_naive() - ChronoDuration::hours(24);
                let indexed = index_recent_devices(devices, cutoff);
                let kept: usize = indexed.values().map(Vec::len).sum();
                debug!(
                    "HWID cache refreshed: {}/{} devices (24h) for {} users",
                    kept,
                    total,
                    indexed.len()
                );
                *self.hwid_cache.lock().await = indexed;
            }
            Err(e) => warn!("failed to refresh HWID cache: {}", e),
        }
    }

    async fn analyze_user(
        &self,
        user: &CachedUser,
        analyzer: &AnalyzerSettings,
        cutoff: NaiveDateTime,
        infra_ips: &[String],
    ) -> Result<Vec<Anomaly>> {
        let mut anomalies_found = Vec::new();
        let now = store::now_naive();

        // 1. Traffic delta against the stored baseline. The snapshot is
        //    always updated, even when no anomaly results.
        let current = user.used_traffic_bytes.unwrap_or(0);
        let previous = anomalies::swap_traffic_snapshot(&self.pool, user.email, current, now).await?;
        if let Some(anomaly) = evaluate_traffic(
            previous,
            current,
            analyzer.traffic_limit_gb,
            analyzer.check_interval_minutes,
        ) {
            anomalies_found.push(anomaly);
        }

        // 2. ASN clustering over the last 24 h of non-infrastructure IPs.
        let ip_visits = xray::user_ip_visits(&self.pool, user.email, cutoff, infra_ips).await?;
        if !ip_visits.is_empty() {
            let ips: Vec<String> = ip_visits.keys().cloned().collect();
            let asn_map = asn::lookup_ips(&self.pool, &ips).await?;
            let groups = asn::group_by_asn(&asn_map, &ip_visits, MIN_ASN_VISIT_COUNT);
            let device_limit = user.hwid_device_limit.unwrap_or(2).max(1);
            if let Some(anomaly) =
                evaluate_ip_groups(&groups, device_limit, analyzer.ip_limit_multiplier)
            {
                anomalies_found.push(anomaly);
            }
        }

        // 3. HWID user agents from the pre-fetched cache.
        if analyzer.check_hwid_anomalies {
            if let Some(uuid) = &user.uuid {
                let devices = self.hwid_cache.lock().await.get(uuid).cloned();
                if let Some(devices) = devices {
                    if let Some(anomaly) = evaluate_hwid(&devices) {
                        anomalies_found.push(anomaly);
                    }
                }
            }
        }

        for anomaly in &anomalies_found {
            self.save_and_notify(user, anomaly, analyzer).await?;
        }

        Ok(anomalies_found)
    }

    async fn save_and_notify(
        &self,
        user: &CachedUser,
        anomaly: &Anomaly,
        analyzer: &AnalyzerSettings,
    ) -> Result<()> {
        let now = store::now_naive();
        if anomalies::has_recent_unresolved(&self.pool, user.email, anomaly.anomaly_type, now)
            .await?
        {
            return Ok(());
        }

        let id = anomalies::record_anomaly(
            &self.pool,
            user.email,
            user.username.as_deref(),
            anomaly.anomaly_type,
            anomaly.severity,
            &anomaly.details.to_string(),
            now,
        )
        .await?;

        if let (Some(token), Some(chat_id)) =
            (&analyzer.telegram_bot_token, &analyzer.telegram_chat_id)
        {
            let message = build_notification(user, anomaly);
            if telegram::send_message(token, chat_id, &message).await {
                anomalies::mark_notified(&self.pool, id).await?;
            }
        }

        Ok(())
    }

    pub async fn run_analysis(&self) -> Value {
        let analyzer = match anomalies::analyzer_settings(&self.pool).await {
            Ok(settings) => settings,
            Err(e) => {
                return json!({"success": false, "error": e.to_string(),
                              "analyzed_users": 0, "anomalies_found": 0})
            }
        };
        if !analyzer.enabled {
            return json!({"success": false, "error": "Analyzer is disabled",
                          "analyzed_users": 0, "anomalies_found": 0});
        }
        if self.analyzing.swap(true, Ordering::SeqCst) {
            return json!({"success": false, "error": "Analysis already in progress",
                          "analyzed_users": 0, "anomalies_found": 0});
        }

        let outcome = self.run_analysis_inner(&analyzer).await;
        self.analyzing.store(false, Ordering::SeqCst);

        match outcome {
            Ok((analyzed, found)) => {
                let now = store::now_naive();
                *self.last_check.lock().await = Some(now);
                let _ = anomalies::record_analyzer_run(&self.pool, now, None).await;
                info!("analysis complete: {} users, {} anomalies", analyzed, found);
                json!({"success": true, "analyzed_users": analyzed, "anomalies_found": found})
            }
            Err(e) => {
                let message = e.to_string();
                error!("analysis failed: {}", message);
                let _ =
                    anomalies::record_analyzer_run(&self.pool, store::now_naive(), Some(&message))
                        .await;
                json!({"success": false, "error": message, "analyzed_users": 0, "anomalies_found": 0})
            }
        }
    }

    async fn run_analysis_inner(&self, analyzer: &AnalyzerSettings) -> Result<(usize, usize)> {
        let remnawave = settings::remnawave_settings(&self.pool).await?;
        let ignored = remnawave.ignored_users();

        let users: Vec<CachedUser> = anomalies::cached_users(&self.pool)
            .await?
            .into_iter()
            .filter(|user| !ignored.contains(&user.email))
            .collect();

        if users.is_empty() {
            info!("no users in cache to analyze (after filtering)");
            return Ok((0, 0));
        }

        if analyzer.check_hwid_anomalies {
            self.refresh_hwid_cache(&remnawave).await;
        }

        let cutoff = store::now_naive() - ChronoDuration::hours(24);
        let infra_ips = infra::infrastructure_ips(&self.pool).await?;

        let mut analyzed = 0usize;
        let mut found = 0usize;
        for user in &users {
            match self.analyze_user(user, analyzer, cutoff, &infra_ips).await {
                Ok(anomalies_found) => {
                    analyzed += 1;
                    found += anomalies_found.len();
                }
                Err(e) => debug!("error analyzing user {}: {}", user.email, e),
            }
        }

        Ok((analyzed, found))
    }

    pub async fn status(&self) -> Value {
        let interval = self.check_interval.load(Ordering::Relaxed);
        let elapsed = self.time_since_check.load(Ordering::Relaxed);
        let next = if self.running.load(Ordering::Relaxed) {
            Some((interval - elapsed).max(0))
        } else {
            None
        };
        let last = self
            .last_check
            .lock()
            .await
            .map(|t| format!("{}Z", t.format("%Y-%m-%dT%H:%M:%S")));
        json!({
            "running": self.running.load(Ordering::Relaxed),
            "analyzing": self.analyzing.load(Ordering::Relaxed),
            "check_interval": interval,
            "last_check_time": last,
            "next_check_in": next,
        })
    }

    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let analyzer = self.clone();
        *self.task.lock().await = Some(tokio::spawn(async move {
            let mut first_run = true;

            while analyzer.running.load(Ordering::SeqCst) {
                let settings = anomalies::analyzer_settings(&analyzer.pool)
                    .await
                    .unwrap_or_default();
                let interval = (settings.check_interval_minutes.clamp(15, 120)) * 60;
                analyzer.check_interval.store(interval, Ordering::Relaxed);

                let elapsed = analyzer.time_since_check.load(Ordering::Relaxed);
                if settings.enabled && (first_run || elapsed >= interval) {
                    info!("running analysis (first_run={})", first_run);
                    analyzer.run_analysis().await;
                    analyzer.time_since_check.store(0, Ordering::Relaxed);
                    first_run = false;
                }

                tokio::time::sleep(Duration::from_secs(1)).await;
                analyzer.time_since_check.fetch_add(1, Ordering::Relaxed);
            }
        }));
        info!("traffic analyzer started");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        info!("traffic analyzer stopped");
    }
}

fn build_notification(user: &CachedUser, anomaly: &Anomaly) -> String {
    let emoji = if anomaly.severity == "critical" {
        "\u{1f534}"
    } else {
        "\u{1f7e1}"
    };
    let title = match anomaly.anomaly_type {
        "traffic" => "Traffic limit exceeded",
        "ip_count" => "Too many client IPs",
        "hwid" => "Suspicious devices",
        other => other,
    };

    let who = user
        .username
        .clone()
        .unwrap_or_else(|| user.email.to_string());
    let mut message = format!("{} <b>{}</b>\n\n\u{1f464} <b>User:</b> {}\n", emoji, title, who);
    if let Some(telegram_id) = &user.telegram_id {
        message.push_str(&format!("\u{1f4f1} Telegram ID: <code>{}</code>\n", telegram_id));
    }

    let details = &anomaly.details;
    match anomaly.anomaly_type {
        "traffic" => {
            message.push_str(&format!(
                "\n\u{1f4ca} <b>Consumed over {} min:</b> {} GB\n\u{1f4ca} <b>Limit:</b> {} GB\n\u{26a0} <b>Over by:</b> +{} GB",
                details["period_minutes"], details["consumed_gb"], details["limit_gb"], details["exceeded_by_gb"],
            ));
        }
        "ip_count" => {
            message.push_str(&format!(
                "\n\u{1f310} <b>Unique IPs:</b> {}\n\u{1f3e2} <b>ASN groups:</b> {} (limit: {})\n\u{1f4f1} <b>Device limit:</b> {}\n\u{26a0} <b>Over by:</b> +{}\n",
                details["unique_ips"], details["effective_count"], details["ip_limit"],
                details["device_limit"], details["exceeded_by"],
            ));
            if let Some(groups) = details["asn_groups"].as_array() {
                for group in groups.iter().take(5) {
                    let asn = group["asn"].as_str().unwrap_or("???");
                    message.push_str(&format!(
                        "\n\u{2022} ASN {}: {} IP, {} visits",
                        asn, group["count"], group["visits"],
                    ));
                }
            }
        }
        "hwid" => {
            message.push_str(&format!(
                "\n\u{1f4f1} <b>Devices in 24h:</b> {}\n\u{26a0} <b>Suspicious:</b> {}\n",
                details["total_devices"], details["suspicious_count"],
            ));
            if let Some(devices) = details["suspicious_devices"].as_array() {
                for device in devices.iter().take(3) {
                    message.push_str(&format!(
                        "\n\u{2022} <code>{}</code>",
                        device["user_agent"].as_str().unwrap_or("(empty)"),
                    ));
                }
            }
        }
        _ => {}
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: i64 = 1 << 30;

    #[test]
    fn traffic_first_observation_is_baseline_only() {
        assert!(evaluate_traffic(None, 500 * GIB, 100.0, 30).is_none());
    }

    #[test]
    fn traffic_delta_and_severity() {
        // The seed scenario: snapshot 10 GiB, current 210 GiB, limit
        // 100 GiB: consumed 200 GiB, critical, exceeded by 100.
        let anomaly = evaluate_traffic(Some(10 * GIB), 210 * GIB, 100.0, 30).unwrap();
        assert_eq!(anomaly.anomaly_type, "traffic");
        assert_eq!(anomaly.severity, "critical");
        assert_eq!(anomaly.details["consumed_gb"], 200.0);
        assert_eq!(anomaly.details["limit_gb"], 100.0);
        assert_eq!(anomaly.details["exceeded_by_gb"], 100.0);

        // Just over the limit: warning.
        let anomaly = evaluate_traffic(Some(0), 150 * GIB, 100.0, 30).unwrap();
        assert_eq!(anomaly.severity, "warning");

        // Under the limit: nothing.
        assert!(evaluate_traffic(Some(0), 50 * GIB, 100.0, 30).is_none());
    }

    #[test]
    fn traffic_counter_reset_uses_current() {
        // Counter fell (new billing period): consumed = current.
        assert!(evaluate_traffic(Some(500 * GIB), 50 * GIB, 100.0, 30).is_none());
        let anomaly = evaluate_traffic(Some(500 * GIB), 150 * GIB, 100.0, 30).unwrap();
        assert_eq!(anomaly.details["consumed_gb"], 150.0);
    }

    #[test]
    fn ip_groups_under_limit_is_fine() {
        // Seed scenario: 2 active groups, device_limit 2, multiplier 2
        // means limit 4: no anomaly.
        let groups = vec![
            AsnGroup {
                asn: Some("AS1".into()),
                prefix: None,
                ips: vec!["1.1.1.1".into()],
                count: 1,
                visits: 1200,
            },
            AsnGroup {
                asn: Some("AS2".into()),
                prefix: None,
                ips: vec!["2.2.2.2".into()],
                count: 1,
                visits: 1500,
            },
        ];
        assert!(evaluate_ip_groups(&groups, 2, 2.0).is_none());
    }

    #[test]
    fn ip_groups_over_limit_is_anomalous() {
        let groups: Vec<AsnGroup> = (0..5)
            .map(|i| AsnGroup {
                asn: Some(format!("AS{}", i)),
                prefix: None,
                ips: (0..12).map(|j| format!("10.{}.0.{}", i, j)).collect(),
                count: 12,
                visits: 2000,
            })
            .collect();
        let anomaly = evaluate_ip_groups(&groups, 2, 2.0).unwrap();
        assert_eq!(anomaly.anomaly_type, "ip_count");
        assert_eq!(anomaly.details["effective_count"], 5);
        assert_eq!(anomaly.details["ip_limit"], 4);
        assert_eq!(anomaly.details["exceeded_by"], 1);

        // Capped at 5 groups x 10 IPs.
        let compact = anomaly.details["asn_groups"].as_array().unwrap();
        assert_eq!(compact.len(), 5);
        assert_eq!(compact[0]["ips"].as_array().unwrap().len(), 10);
    }

    #[test]
    fn user_agent_validation() {
        assert!(validate_user_agent("Shadowrocket/1882 CFNetwork/1568.200.51 Darwin/24.1.0").valid);
        assert!(validate_user_agent("V2rayNG/1.8.5").valid);
        assert!(validate_user_agent("clash-verge/1.3.8").valid);
        assert!(validate_user_agent("Happ/3.9.1/Windows").valid);

        let empty = validate_user_agent("  ");
        assert!(!empty.valid);
        assert_eq!(empty.issues, vec!["empty_user_agent"]);

        let cracked = validate_user_agent("SuperFREEvpn/1.0 Android");
        assert!(!cracked.valid);
        assert!(cracked.issues.iter().any(|i| i.contains("FREE")));

        let unknown = validate_user_agent("definitely-not-a-client/9.9");
        assert!(!unknown.valid);
        assert!(unknown.issues.contains(&"unknown_app_format".to_string()));

        // Unknown app but a platform marker keeps it out of the
        // unknown_app_format bucket.
        assert!(validate_user_agent("CustomClient for Android 14").valid);
    }

    #[test]
    fn hwid_severity_scales_with_device_count() {
        let ok_device = json!({"hwid": "aaa", "userAgent": "V2rayNG/1.8.5", "userUuid": "u1"});
        let bad_device = json!({"hwid": "bbb", "userAgent": "x", "userUuid": "u1"});

        assert!(evaluate_hwid(&[ok_device.clone()]).is_none());

        let single = evaluate_hwid(&[ok_device.clone(), bad_device.clone()]).unwrap();
        assert_eq!(single.severity, "warning");

        let double = evaluate_hwid(&[bad_device.clone(), bad_device]).unwrap();
        assert_eq!(double.severity, "critical");
    }

    #[test]
    fn device_indexing_filters_by_window() {
        let cutoff =
            NaiveDateTime::parse_from_str("2026-01-02 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let devices = vec![
            json!({"userUuid": "u1", "updatedAt": "2026-01-02T12:00:00Z"}),
            json!({"userUuid": "u1", "updatedAt": "2026-01-01T00:00:00Z"}),
            json!({"userUuid": "u2", "createdAt": "2026-01-02T06:00:00Z"}),
            json!({"updatedAt": "2026-01-02T12:00:00Z"}), // no user uuid
        ];
        let indexed = index_recent_devices(devices, cutoff);
        assert_eq!(indexed.len(), 2);
        assert_eq!(indexed["u1"].len(), 1);
        assert_eq!(indexed["u2"].len(), 1);
    }
}
