//! Systemd service control for HAProxy, with a short status cache.

use crate::driver::HaproxyDriver;
use crate::error::{HaproxyError, Result};
use edge_types::Shell;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const STATUS_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub enabled: bool,
    pub installed: bool,
    pub config_valid: bool,
    pub config_exists: bool,
    pub config_message: String,
    pub config_path: String,
    pub status_output: String,
    pub service_logs: String,
}

/// Hides the systemctl query cost during request bursts.
pub(crate) struct StatusCache {
    inner: Mutex<Option<(Instant, ServiceStatus)>>,
}

impl StatusCache {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    async fn get(&self) -> Option<ServiceStatus> {
        let guard = self.inner.lock().await;
        match guard.as_ref() {
            Some((at, status)) if at.elapsed() < STATUS_CACHE_TTL => Some(status.clone()),
            _ => None,
        }
    }

    async fn put(&self, status: ServiceStatus) {
        *self.inner.lock().await = Some((Instant::now(), status));
    }

    pub(crate) async fn invalidate(&self) {
        *self.inner.lock().await = None;
    }
}

impl HaproxyDriver {
    async fn exec(&self, command: &str, timeout_secs: u64) -> edge_exec::ExecuteResult {
        self.executor.execute(command, timeout_secs, Shell::Sh).await
    }

    /// Validate the config on disk with `haproxy -c -f`.
    pub async fn check_config(&self) -> Result<String> {
        if !self.config_path.exists() {
            return Err(HaproxyError::ConfigInvalid("Config file not found".into()));
        }

        let result = self
            .exec(
                &format!("haproxy -c -f {}", self.config_path.display()),
                30,
            )
            .await;

        if result.success {
            return Ok("Configuration valid".into());
        }

        let mut message = result.stderr.trim().to_string();
        if message.is_empty() {
            message = result.stdout.trim().to_string();
        }
        if message.is_empty() {
            message = "Configuration check failed".into();
        }
        Err(HaproxyError::ConfigInvalid(message))
    }

    pub async fn is_running(&self) -> bool {
        let result = self.exec("systemctl is-active haproxy", 10).await;
        result.success && result.stdout.trim() == "active"
    }

    pub async fn is_installed(&self) -> bool {
        let result = self.exec("command -v haproxy", 10).await;
        result.success && !result.stdout.trim().is_empty()
    }

    pub async fn is_enabled(&self) -> bool {
        let result = self.exec("systemctl is-enabled haproxy", 10).await;
        result.success && result.stdout.trim() == "enabled"
    }

    /// Full service status, cached for five seconds.
    pub async fn status(&self) -> ServiceStatus {
        if let Some(cached) = self.status_cache.get().await {
            return cached;
        }

        let installed = self.is_installed().await;
        let running = installed && self.is_running().await;
        let enabled = installed && self.is_enabled().await;
        let (config_valid, config_message) = if installed {
            match self.check_config().await {
                Ok(msg) => (true, msg),
                Err(e) => (false, e.to_string()),
            }
        } else {
            (false, "HAProxy not installed".into())
        };

        let mut status_output = String::new();
        let mut service_logs = String::new();

        if installed {
            let status_result = self.exec("systemctl status haproxy --no-pager -l", 10).await;
            status_output = if !status_result.stdout.is_empty() {
                status_result.stdout
            } else {
                status_result.stderr
            };

            if !running {
                let logs_result = self.exec("journalctl -u haproxy -n 20 --no-pager", 10).await;
                if logs_result.success {
                    service_logs = logs_result.stdout;
                }
            }
        } else {
            status_output = "HAProxy is not installed. Install with: apt install haproxy".into();
        }

        let status = ServiceStatus {
            running,
            enabled,
            installed,
            config_valid,
            config_exists: self.config_path.exists(),
            config_message,
            config_path: self.config_path.display().to_string(),
            status_output,
            service_logs,
        };

        self.status_cache.put(status.clone()).await;
        status
    }

    pub async fn get_logs(&self, tail: usize) -> String {
        let result = self
            .exec(&format!("journalctl -u haproxy -n {} --no-pager", tail), 30)
            .await;
        if result.success {
            result.stdout
        } else {
            format!(
                "Failed to get logs: {}",
                result.error.unwrap_or(result.stderr)
            )
        }
    }

    /// Reload the config through systemctl.
    ///
    /// Not installed fails; not running either starts the service
    /// (`auto_start`) or succeeds silently with the config saved; running
    /// reloads in place.
    pub async fn reload(&self, auto_start: bool) -> Result<String> {
        self.check_config().await.map_err(|e| {
            HaproxyError::ConfigInvalid(format!("Config error: {}", e))
        })?;

        if !self.is_installed().await {
            return Err(HaproxyError::Service("HAProxy is not installed".into()));
        }

        if !self.is_running().await {
            if auto_start {
                return self.start().await;
            }
            return Ok("Config saved (HAProxy not running)".into());
        }

        let result = self.exec("systemctl reload haproxy", 30).await;
        self.status_cache.invalidate().await;

        if result.success {
            info!("HAProxy reloaded via systemctl");
            Ok("HAProxy reloaded successfully".into())
        } else {
            let message = first_non_empty(&result.stderr, &result.stdout, "Reload failed");
            error!("HAProxy reload failed: {}", message);
            Err(HaproxyError::Service(format!("Reload failed: {}", message)))
        }
    }

    pub async fn restart(&self) -> Result<String> {
        if !self.is_installed().await {
            return Err(HaproxyError::Service("HAProxy is not installed".into()));
        }

        let result = self.exec("systemctl restart haproxy", 30).await;
        self.status_cache.invalidate().await;

        if result.success {
            info!("HAProxy restarted via systemctl");
            Ok("HAProxy restarted successfully".into())
        } else {
            let message = first_non_empty(&result.stderr, &result.stdout, "Restart failed");
            error!("HAProxy restart failed: {}", message);
            Err(HaproxyError::Service(format!("Restart failed: {}", message)))
        }
    }

    /// Start the service and enable autostart on boot.
    pub async fn start(&self) -> Result<String> {
        if !self.is_installed().await {
            return Err(HaproxyError::Service(
                "HAProxy is not installed. Install with: apt install haproxy".into(),
            ));
        }

        if self.is_running().await {
            self.exec("systemctl enable haproxy", 10).await;
            return Ok("HAProxy is already running".into());
        }

        if !self.config_path.exists() {
            return Err(HaproxyError::Service(
                "HAProxy config not found. Create config first.".into(),
            ));
        }
        self.check_config().await.map_err(|e| {
            HaproxyError::ConfigInvalid(format!("Config validation failed: {}", e))
        })?;

        let result = self.exec("systemctl start haproxy", 30).await;
        self.status_cache.invalidate().await;

        if !result.success {
            let message = first_non_empty(&result.stderr, &result.stdout, "Start failed");
            error!("HAProxy start failed: {}", message);
            return Err(HaproxyError::Service(format!("Failed to start: {}", message)));
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        if self.is_running().await {
            let enable = self.exec("systemctl enable haproxy", 10).await;
            if enable.success {
                info!("HAProxy started and enabled for autostart");
                Ok("HAProxy started successfully (autostart enabled)".into())
            } else {
                warn!("HAProxy started but failed to enable autostart: {}", enable.stderr);
                Ok("HAProxy started (warning: autostart not enabled)".into())
            }
        } else {
            let logs = self.get_logs(20).await;
            error!("HAProxy failed to start. Logs: {}", logs);
            Err(HaproxyError::Service(
                "HAProxy failed to start. Check logs for details.".into(),
            ))
        }
    }

    /// Stop the service and disable autostart on boot.
    pub async fn stop(&self) -> Result<String> {
        if !self.is_installed().await {
            return Ok("HAProxy is not installed".into());
        }

        if !self.is_running().await {
            self.exec("systemctl disable haproxy", 10).await;
            return Ok("HAProxy is already stopped".into());
        }

        let result = self.exec("systemctl stop haproxy", 30).await;
        self.status_cache.invalidate().await;

        if !result.success {
            let message = first_non_empty(&result.stderr, &result.stdout, "Stop failed");
            error!("HAProxy stop failed: {}", message);
            return Err(HaproxyError::Service(format!("Failed to stop: {}", message)));
        }

        let disable = self.exec("systemctl disable haproxy", 10).await;
        if disable.success {
            info!("HAProxy stopped and disabled autostart");
            Ok("HAProxy stopped successfully (autostart disabled)".into())
        } else {
            warn!("HAProxy stopped but failed to disable autostart: {}", disable.stderr);
            Ok("HAProxy stopped (warning: autostart still enabled)".into())
        }
    }

    /// Stop without touching the autostart flag, for certificate flows.
    pub(crate) async fn temporary_stop(&self) -> Result<()> {
        if !self.is_installed().await || !self.is_running().await {
            return Ok(());
        }

        let result = self.exec("systemctl stop haproxy", 30).await;
        self.status_cache.invalidate().await;

        if result.success {
            info!("HAProxy temporarily stopped (autostart unchanged)");
            Ok(())
        } else {
            let message = first_non_empty(&result.stderr, &result.stdout, "Stop failed");
            error!("HAProxy temporary stop failed: {}", message);
            Err(HaproxyError::Service(format!("Failed to stop: {}", message)))
        }
    }

    /// Start without touching the autostart flag, for certificate flows.
    pub(crate) async fn temporary_start(&self) -> Result<()> {
        if !self.is_installed().await {
            return Err(HaproxyError::Service("HAProxy is not installed".into()));
        }
        if self.is_running().await {
            return Ok(());
        }
        if !self.config_path.exists() {
            return Err(HaproxyError::Service("HAProxy config not found".into()));
        }
        self.check_config().await?;

        let result = self.exec("systemctl start haproxy", 30).await;
        self.status_cache.invalidate().await;

        if !result.success {
            let message = first_non_empty(&result.stderr, &result.stdout, "Start failed");
            return Err(HaproxyError::Service(format!("Failed to start: {}", message)));
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        if self.is_running().await {
            info!("HAProxy temporarily started (autostart unchanged)");
            Ok(())
        } else {
            Err(HaproxyError::Service("HAProxy failed to start".into()))
        }
    }
}

fn first_non_empty<'a>(a: &'a str, b: &'a str, fallback: &'a str) -> &'a str {
    if !a.trim().is_empty() {
        a
    } else if !b.trim().is_empty() {
        b
    } else {
        fallback
    }
}
