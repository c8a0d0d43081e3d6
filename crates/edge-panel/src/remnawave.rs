//! Client for the upstream VPN panel API (users and HWID devices).

use crate::error::{PanelError, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

const TOTAL_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    cookie: Option<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ConnectionCheck {
    pub url: String,
    pub api_reachable: bool,
    pub auth_valid: bool,
    pub error: Option<String>,
}

impl UpstreamClient {
    pub fn new(api_url: &str, api_token: &str, cookie_secret: Option<&str>) -> Result<Self> {
        let cookie = cookie_secret.and_then(|secret| {
            secret
                .split_once(':')
                .map(|(name, value)| (name.to_string(), value.to_string()))
        });
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TOTAL_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: api_url.trim_end_matches('/').to_string(),
            token: api_token.to_string(),
            cookie,
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("X-Forwarded-Proto", "https")
            .header("X-Forwarded-For", "127.0.0.1")
            .header("X-Real-IP", "127.0.0.1")
            .header("X-Api-Key", &self.token)
            .bearer_auth(&self.token);
        if let Some((name, value)) = &self.cookie {
            builder = builder.header("Cookie", format!("{}={}", name, value));
        }
        builder
    }

    async fn get_response(&self, path: &str) -> Result<Value> {
        if self.base_url.is_empty() {
            return Err(PanelError::Upstream("API URL not configured".into()));
        }
        let response = self.request(path).send().await?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(PanelError::Upstream(message));
        }
        Ok(body.get("response").cloned().unwrap_or(body))
    }

    pub async fn check_connection(&self) -> ConnectionCheck {
        let mut check = ConnectionCheck {
            url: self.base_url.clone(),
            api_reachable: false,
            auth_valid: false,
            error: None,
        };
        if self.base_url.is_empty() || self.token.is_empty() {
            check.error = Some("API URL or token not configured".into());
            return check;
        }

        match self.request("/api/system/stats").send().await {
            Ok(response) => {
                check.api_reachable = true;
                match response.status().as_u16() {
                    200 => check.auth_valid = true,
                    401 => check.error = Some("Invalid API token (401 Unauthorized)".into()),
                    403 => check.error = Some("Access forbidden (403)".into()),
                    code => check.error = Some(format!("HTTP {}", code)),
                }
            }
            Err(e) => check.error = Some(e.to_string()),
        }
        check
    }

    async fn users_page(&self, start: usize, size: usize) -> Result<(Vec<Value>, usize)> {
        let body = self
            .get_response(&format!("/api/users?start={}&size={}", start, size))
            .await?;
        let users = body
            .get("users")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = body
            .get("total")
            .and_then(Value::as_u64)
            .map(|t| t as usize)
            .unwrap_or(users.len());
        Ok((users, total))
    }

    /// Fetch every user: the first page learns the total, the rest run
    /// in parallel bounded by a semaphore.
    pub async fn all_users_paginated(
        self: &Arc<Self>,
        size: usize,
        concurrency: usize,
    ) -> Result<Vec<Value>> {
        let (mut all_users, total) = self.users_page(0, size).await?;

        if total <= size {
            debug!("fetched {}/{} users from upstream (single page)", all_users.len(), total);
            return Ok(all_users);
        }

        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut handles = Vec::new();
        let mut offset = size;
        while offset < total {
            let client = self.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                client.users_page(offset, size).await.map(|(users, _)| users)
            }));
            offset += size;
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(users)) => all_users.extend(users),
                Ok(Err(e)) => return Err(PanelError::Upstream(format!("Page fetch failed: {}", e))),
                Err(e) => return Err(PanelError::Upstream(format!("Page fetch failed: {}", e))),
            }
        }

        if all_users.len() < total {
            warn!("fetched {}/{} users (incomplete)", all_users.len(), total);
        } else {
            debug!("fetched {}/{} users from upstream", all_users.len(), total);
        }
        Ok(all_users)
    }

    async fn hwid_page(&self, start: usize, size: usize) -> Result<Vec<Value>> {
        let body = self
            .get_response(&format!("/api/hwid/devices?start={}&size={}", start, size))
            .await?;
        Ok(body
            .get("devices")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Fetch every HWID device, paging sequentially until a short page.
    pub async fn all_hwid_devices_paginated(&self, size: usize) -> Result<Vec<Value>> {
        let mut all_devices = Vec::new();
        let mut start = 0;
        loop {
            let devices = self.hwid_page(start, size).await?;
            let received = devices.len();
            all_devices.extend(devices);
            if received < size {
                break;
            }
            start += size;
        }
        debug!("fetched {} HWID devices from upstream", all_devices.len());
        Ok(all_devices)
    }
}
