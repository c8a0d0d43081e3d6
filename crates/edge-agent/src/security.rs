//! Connection-dropping security layer.
//!
//! Requests that fail API-key validation are answered with status 444
//! and an empty body, so a scanner learns nothing about the service.
//! Repeated failures from one source IP earn a timed ban; banned IPs
//! get the same empty 444 before any handler runs.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Default, Clone)]
struct IpRecord {
    failed_attempts: u32,
    last_attempt: i64,
    banned_until: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BannedIp {
    pub ip: String,
    pub banned_until: i64,
    pub remaining_seconds: i64,
    pub failed_attempts: u32,
}

pub struct SecurityManager {
    max_failed_attempts: u32,
    ban_duration: i64,
    cleanup_interval: i64,
    records: DashMap<String, IpRecord>,
    last_cleanup: AtomicI64,
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

impl SecurityManager {
    pub fn new(max_failed_attempts: u32, ban_duration: u64) -> Self {
        Self {
            max_failed_attempts,
            ban_duration: ban_duration as i64,
            cleanup_interval: 300,
            records: DashMap::new(),
            last_cleanup: AtomicI64::new(now_ts()),
        }
    }

    /// Extract the real client IP, trusting the reverse-proxy headers
    /// the deployment puts in front of the agent.
    pub fn client_ip(headers: &HeaderMap) -> String {
        if let Some(forwarded) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
        if let Some(real_ip) = headers.get("X-Real-IP").and_then(|v| v.to_str().ok()) {
            return real_ip.to_string();
        }
        "unknown".to_string()
    }

    fn cleanup_expired(&self) {
        let now = now_ts();
        let last = self.last_cleanup.load(Ordering::Relaxed);
        if now - last < self.cleanup_interval {
            return;
        }
        self.last_cleanup.store(now, Ordering::Relaxed);
        self.records.retain(|_, record| {
            record.banned_until >= now || now - record.last_attempt <= self.ban_duration
        });
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        self.records
            .get(ip)
            .map(|record| record.banned_until > now_ts())
            .unwrap_or(false)
    }

    pub fn record_failure(&self, ip: &str) {
        let mut record = self.records.entry(ip.to_string()).or_default();
        record.failed_attempts += 1;
        record.last_attempt = now_ts();
        if record.failed_attempts >= self.max_failed_attempts {
            record.banned_until = now_ts() + self.ban_duration;
            warn!(
                "IP {} banned after {} failed attempts",
                ip, record.failed_attempts
            );
        }
    }

    pub fn record_success(&self, ip: &str) {
        if let Some(mut record) = self.records.get_mut(ip) {
            record.failed_attempts = 0;
        }
    }

    pub fn touch(&self, ip: &str) {
        self.cleanup_expired();
        let mut record = self.records.entry(ip.to_string()).or_default();
        record.last_attempt = now_ts();
    }

    pub fn banned_ips(&self) -> Vec<BannedIp> {
        let now = now_ts();
        self.records
            .iter()
            .filter(|entry| entry.value().banned_until > now)
            .map(|entry| BannedIp {
                ip: entry.key().clone(),
                banned_until: entry.value().banned_until,
                remaining_seconds: entry.value().banned_until - now,
                failed_attempts: entry.value().failed_attempts,
            })
            .collect()
    }

    pub fn unban(&self, ip: &str) -> bool {
        match self.records.get_mut(ip) {
            Some(mut record) => {
                record.banned_until = 0;
                record.failed_attempts = 0;
                info!("IP {} unbanned", ip);
                true
            }
            None => false,
        }
    }
}

/// Bare connection drop: non-standard status 444, zero-length body.
pub fn drop_connection() -> Response {
    Response::builder()
        .status(StatusCode::from_u16(444).expect("444 is a valid status code"))
        .body(Body::empty())
        .expect("static response")
}

#[derive(Clone)]
pub struct SecurityLayerState {
    pub manager: Arc<SecurityManager>,
    pub api_key: String,
}

/// API-key gate applied to the whole `/api` surface.
pub async fn security_middleware(
    State(state): State<SecurityLayerState>,
    request: Request,
    next: Next,
) -> Response {
    let ip = SecurityManager::client_ip(request.headers());
    let presented = request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok());

    let valid = presented == Some(state.api_key.as_str());

    if !valid {
        if state.manager.is_banned(&ip) {
            warn!("dropping connection from banned IP: {}", ip);
            return drop_connection();
        }
        state.manager.touch(&ip);
        state.manager.record_failure(&ip);
        warn!("auth failure from {}: {}", ip, request.uri().path());
        return drop_connection();
    }

    state.manager.record_success(&ip);
    let response = next.run(request).await;

    // A downstream handler may still reject the caller.
    if matches!(
        response.status(),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
    ) {
        state.manager.record_failure(&ip);
        return drop_connection();
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bans_after_max_failures() {
        let manager = SecurityManager::new(3, 3600);
        assert!(!manager.is_banned("1.2.3.4"));
        manager.record_failure("1.2.3.4");
        manager.record_failure("1.2.3.4");
        assert!(!manager.is_banned("1.2.3.4"));
        manager.record_failure("1.2.3.4");
        assert!(manager.is_banned("1.2.3.4"));

        let banned = manager.banned_ips();
        assert_eq!(banned.len(), 1);
        assert_eq!(banned[0].ip, "1.2.3.4");
        assert!(banned[0].remaining_seconds > 3590);
    }

    #[test]
    fn success_resets_counter() {
        let manager = SecurityManager::new(3, 3600);
        manager.record_failure("1.2.3.4");
        manager.record_failure("1.2.3.4");
        manager.record_success("1.2.3.4");
        manager.record_failure("1.2.3.4");
        assert!(!manager.is_banned("1.2.3.4"));
    }

    #[test]
    fn unban_clears_state() {
        let manager = SecurityManager::new(1, 3600);
        manager.record_failure("5.6.7.8");
        assert!(manager.is_banned("5.6.7.8"));
        assert!(manager.unban("5.6.7.8"));
        assert!(!manager.is_banned("5.6.7.8"));
        assert!(!manager.unban("9.9.9.9"));
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", "9.9.9.9, 10.0.0.1".parse().unwrap());
        headers.insert("X-Real-IP", "8.8.8.8".parse().unwrap());
        assert_eq!(SecurityManager::client_ip(&headers), "9.9.9.9");

        let mut headers = HeaderMap::new();
        headers.insert("X-Real-IP", "8.8.8.8".parse().unwrap());
        assert_eq!(SecurityManager::client_ip(&headers), "8.8.8.8");

        assert_eq!(SecurityManager::client_ip(&HeaderMap::new()), "unknown");
    }

    #[test]
    fn dropped_response_is_empty_444() {
        let response = drop_connection();
        assert_eq!(response.status().as_u16(), 444);
    }
}
