//! HTTP client for node agents.
//!
//! Nodes commonly run behind self-signed TLS, so certificate
//! verification is disabled for these connections. Every call carries
//! an explicit deadline; failures are classified into the error codes
//! stored on the server row.

use crate::error::{PanelError, Result};
use crate::store::servers::Server;
use edge_types::metrics::MetricsDocument;
use edge_types::{Direction, IpsetSyncRequest, XrayCollectReport};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

pub const METRICS_TIMEOUT: Duration = Duration::from_secs(5);
pub const HAPROXY_TIMEOUT: Duration = Duration::from_secs(10);
pub const XRAY_PROBE_TIMEOUT: Duration = Duration::from_secs(12);
pub const COLLECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(20);

/// Classified poll failure, persisted on the server row.
#[derive(Debug, Clone, PartialEq)]
pub struct PollError {
    pub message: String,
    pub code: i64,
}

pub const ERR_TIMEOUT: &str = "Connection timeout";
pub const ERR_CONNECTION_REFUSED: &str = "Connection refused";
pub const ERR_SSL: &str = "SSL certificate error";
pub const ERR_AUTH: &str = "Authentication failed";
pub const ERR_SERVER: &str = "Server error";
pub const ERR_UNKNOWN: &str = "Unknown error";

pub fn classify_reqwest_error(e: &reqwest::Error) -> PollError {
    if e.is_timeout() {
        return PollError {
            message: ERR_TIMEOUT.into(),
            code: 504,
        };
    }
    let text = e.to_string().to_lowercase();
    if text.contains("refused") {
        return PollError {
            message: ERR_CONNECTION_REFUSED.into(),
            code: 502,
        };
    }
    if text.contains("ssl") || text.contains("certificate") || text.contains("tls") {
        return PollError {
            message: ERR_SSL.into(),
            code: 495,
        };
    }
    if e.is_connect() {
        return PollError {
            message: format!("{}: {}", ERR_CONNECTION_REFUSED, truncate(&text, 100)),
            code: 502,
        };
    }
    PollError {
        message: format!("{}: {}", ERR_UNKNOWN, truncate(&text, 100)),
        code: 500,
    }
}

pub fn classify_status(status: reqwest::StatusCode) -> PollError {
    let code = status.as_u16() as i64;
    if code == 401 || code == 403 {
        PollError {
            message: ERR_AUTH.into(),
            code,
        }
    } else {
        PollError {
            message: format!("{}: HTTP {}", ERR_SERVER, code),
            code,
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Clone)]
pub struct NodeClient {
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
pub struct NodeSyncResponse {
    pub success: bool,
    #[serde(default)]
    pub added: usize,
    #[serde(default)]
    pub removed: usize,
    #[serde(default)]
    pub invalid: Vec<String>,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub message: String,
}

impl NodeClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client })
    }

    fn get(&self, server: &Server, path: &str, timeout: Duration) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", server.url, path))
            .header("X-API-Key", &server.api_key)
            .timeout(timeout)
    }

    fn post(&self, server: &Server, path: &str, timeout: Duration) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", server.url, path))
            .header("X-API-Key", &server.api_key)
            .timeout(timeout)
    }

    /// Poll the composite metrics document.
    pub async fn fetch_metrics(
        &self,
        server: &Server,
    ) -> std::result::Result<(MetricsDocument, String), PollError> {
        let response = self
            .get(server, "/api/metrics", METRICS_TIMEOUT)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        if !response.status().is_success() {
            return Err(classify_status(response.status()));
        }

        let body = response.text().await.map_err(|e| classify_reqwest_error(&e))?;
        let document: MetricsDocument = serde_json::from_str(&body).map_err(|e| PollError {
            message: format!("{}: {}", ERR_UNKNOWN, e),
            code: 500,
        })?;
        Ok((document, body))
    }

    /// Fetch one JSON endpoint into a raw value for caching; errors are
    /// swallowed into None so one failed section does not poison the
    /// rest of the cache blob.
    pub async fn fetch_json(
        &self,
        server: &Server,
        path: &str,
        timeout: Duration,
    ) -> Option<Value> {
        let response = self.get(server, path, timeout).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json().await.ok()
    }

    /// Probe whether the node has a running Xray sidecar.
    pub async fn probe_xray(&self, server: &Server) -> bool {
        match self
            .get(server, "/api/remnawave/status", XRAY_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v.get("available").and_then(Value::as_bool))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Pull-and-clear the node's Xray aggregates.
    pub async fn collect_xray_stats(&self, server: &Server) -> Result<XrayCollectReport> {
        let response = self
            .post(server, "/api/remnawave/stats/collect", COLLECT_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PanelError::Upstream(format!(
                "HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(response.json().await?)
    }

    /// Push an authoritative blocklist to a node.
    pub async fn sync_ipset(
        &self,
        server: &Server,
        ips: Vec<String>,
        direction: Direction,
    ) -> Result<NodeSyncResponse> {
        let response = self
            .post(server, "/api/ipset/sync", SYNC_TIMEOUT)
            .json(&IpsetSyncRequest {
                ips,
                permanent: true,
                direction,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PanelError::Upstream(format!(
                "HTTP {}",
                response.status().as_u16()
            )));
        }
        Ok(response.json().await?)
    }

    /// Generic pass-through used by the panel's proxy endpoints.
    pub async fn forward(
        &self,
        server: &Server,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
        timeout: Duration,
    ) -> Result<(u16, Value)> {
        let mut request = self
            .client
            .request(method, format!("{}{}", server.url, path))
            .header("X-API-Key", &server.api_key)
            .timeout(timeout);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let value = response.json().await.unwrap_or(Value::Null);
        Ok((status, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let auth = classify_status(reqwest::StatusCode::UNAUTHORIZED);
        assert_eq!(auth.code, 401);
        assert_eq!(auth.message, ERR_AUTH);

        let server = classify_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(server.code, 500);
        assert!(server.message.contains("HTTP 500"));
    }
}
