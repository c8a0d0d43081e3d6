//! HAProxy driver: config file ownership and rule CRUD.
//!
//! Every mutating operation follows the same sequence: back up, rewrite,
//! validate with `haproxy -c`, reload; any failure restores the `.bak`
//! copy. Mutations are serialized so no two rule edits can interleave
//! their write/validate/restore steps.

use crate::config::{
    base_config, insert_rule_block, parse_rules, remove_rule_blocks, render_rule_block,
    rules_region, HaproxyRule, RULES_END_MARKER, RULES_START_MARKER,
};
use crate::error::{HaproxyError, Result};
use crate::service::StatusCache;
use edge_exec::HostExecutor;
use edge_network::FirewallDriver;
use edge_types::RuleKind;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::info;

fn rule_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap())
}

/// Partial update for an existing rule. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleUpdate {
    pub rule_type: Option<RuleKind>,
    pub listen_port: Option<u16>,
    pub target_ip: Option<String>,
    pub target_port: Option<u16>,
    pub cert_domain: Option<String>,
    pub target_ssl: Option<bool>,
    pub send_proxy: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub message: String,
    pub reloaded: bool,
}

pub struct HaproxyDriver {
    pub(crate) executor: Arc<HostExecutor>,
    pub(crate) firewall: Arc<FirewallDriver>,
    pub(crate) config_path: PathBuf,
    pub(crate) certs_dir: PathBuf,
    pub(crate) cron_file: PathBuf,
    pub(crate) renewal_script: PathBuf,
    pub(crate) status_cache: StatusCache,
    config_lock: Mutex<()>,
}

pub struct HaproxyPaths {
    pub config_path: PathBuf,
    pub certs_dir: PathBuf,
    pub cron_file: PathBuf,
    pub renewal_script: PathBuf,
}

impl Default for HaproxyPaths {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/haproxy/haproxy.cfg"),
            certs_dir: PathBuf::from("/etc/letsencrypt/live"),
            cron_file: PathBuf::from("/etc/cron.d/certbot-renew"),
            renewal_script: PathBuf::from("/opt/edgewatch-node/renew-certs.sh"),
        }
    }
}

impl HaproxyDriver {
    pub fn new(
        executor: Arc<HostExecutor>,
        firewall: Arc<FirewallDriver>,
        paths: HaproxyPaths,
    ) -> Self {
        Self {
            executor,
            firewall,
            config_path: paths.config_path,
            certs_dir: paths.certs_dir,
            cron_file: paths.cron_file,
            renewal_script: paths.renewal_script,
            status_cache: StatusCache::new(),
            config_lock: Mutex::new(()),
        }
    }

    // ── config file I/O ──

    pub(crate) fn read_config(&self) -> String {
        std::fs::read_to_string(&self.config_path).unwrap_or_default()
    }

    pub(crate) fn write_config(&self, content: &str) -> Result<()> {
        let mut content = content.to_string();
        if !content.ends_with('\n') {
            content.push('\n');
        }
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.config_path, content)?;
        Ok(())
    }

    fn backup_path(&self) -> PathBuf {
        let mut path = self.config_path.as_os_str().to_owned();
        path.push(".bak");
        PathBuf::from(path)
    }

    pub(crate) fn backup_config(&self) {
        if self.config_path.exists() {
            let _ = std::fs::copy(&self.config_path, self.backup_path());
        }
    }

    pub(crate) fn restore_config(&self) {
        let backup = self.backup_path();
        if backup.exists() {
            let _ = std::fs::copy(&backup, &self.config_path);
        }
    }

    /// Create the base config if the file does not exist yet.
    pub fn init_config(&self) -> Result<String> {
        if self.config_path.exists() {
            return Ok("Config already exists".into());
        }
        self.write_config(&base_config())?;
        info!("HAProxy config initialized");
        Ok("Config initialized".into())
    }

    /// Regenerate the base section, optionally carrying the rules region
    /// over from the existing file.
    pub fn regenerate_config(&self, preserve_rules: bool) -> Result<String> {
        let rules_content = if preserve_rules && self.config_path.exists() {
            rules_region(&self.read_config())
                .map(|s| s.to_string())
                .unwrap_or_default()
        } else {
            String::new()
        };

        self.backup_config();
        let mut new_config = base_config();
        if !rules_content.trim().is_empty() {
            new_config = new_config.replace(
                RULES_END_MARKER,
                &format!("{}\n{}", rules_content.trim_end(), RULES_END_MARKER),
            );
        }
        self.write_config(&new_config)?;
        info!("config regenerated");
        Ok("Config regenerated".into())
    }

    // ── rules ──

    pub fn parse_rules(&self) -> Vec<HaproxyRule> {
        parse_rules(&self.read_config())
    }

    pub fn get_rule(&self, name: &str) -> Option<HaproxyRule> {
        self.parse_rules().into_iter().find(|r| r.name == name)
    }

    pub fn rule_exists(&self, name: &str) -> bool {
        self.get_rule(name).is_some()
    }

    fn validate_rule(&self, rule: &HaproxyRule) -> Result<()> {
        if !rule_name_pattern().is_match(&rule.name) {
            return Err(HaproxyError::Validation(
                "Invalid rule name (use a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        if rule.listen_port == 0 {
            return Err(HaproxyError::Validation("Invalid listen port".into()));
        }
        if rule.target_port == 0 {
            return Err(HaproxyError::Validation("Invalid target port".into()));
        }
        Ok(())
    }

    /// Validate the rewritten config and reload; restore the backup on
    /// any failure. Returns the success message.
    async fn commit_config_change(&self, applied: &str) -> Result<String> {
        if let Err(e) = self.check_config().await {
            self.restore_config();
            return Err(e);
        }
        match self.reload(false).await {
            Ok(reload_msg) => {
                if reload_msg.contains("not running") || reload_msg.contains("stopped") {
                    Ok(format!("{} ({})", applied, reload_msg))
                } else {
                    Ok(applied.to_string())
                }
            }
            Err(e) => {
                self.restore_config();
                Err(HaproxyError::Service(format!("Reload failed: {}", e)))
            }
        }
    }

    pub async fn add_rule(&self, rule: HaproxyRule) -> Result<String> {
        let _guard = self.config_lock.lock().await;
        self.add_rule_locked(rule).await
    }

    async fn add_rule_locked(&self, rule: HaproxyRule) -> Result<String> {
        if self.rule_exists(&rule.name) {
            return Err(HaproxyError::RuleExists(rule.name));
        }
        self.validate_rule(&rule)?;

        self.backup_config();
        let mut content = self.read_config();

        if content.is_empty() {
            self.init_config()?;
            content = self.read_config();
        } else if !content.contains(RULES_START_MARKER) {
            info!("adding rule markers to existing config");
            content = format!(
                "{}\n\n{}\n{}\n",
                content.trim_end(),
                RULES_START_MARKER,
                RULES_END_MARKER
            );
        }

        let cert_path = match rule.rule_type {
            RuleKind::Https => {
                let Some(domain) = rule.cert_domain.as_deref() else {
                    self.restore_config();
                    return Err(HaproxyError::Validation(
                        "Certificate domain required for HTTPS".into(),
                    ));
                };
                let path = self.cert_path(domain);
                if !path.exists() {
                    match self.create_combined_cert(domain) {
                        Some(created) => Some(created),
                        None => {
                            self.restore_config();
                            return Err(HaproxyError::Certificate(format!(
                                "Certificate for {} not found",
                                domain
                            )));
                        }
                    }
                } else {
                    Some(path)
                }
            }
            RuleKind::Tcp => None,
        };

        let block = render_rule_block(&rule, cert_path.as_deref());
        let content = insert_rule_block(&content, &block);
        self.write_config(&content)?;

        self.commit_config_change("Rule created").await
    }

    pub async fn delete_rule(&self, name: &str) -> Result<String> {
        let _guard = self.config_lock.lock().await;
        self.delete_rule_locked(name).await
    }

    async fn delete_rule_locked(&self, name: &str) -> Result<String> {
        let rule = self
            .get_rule(name)
            .ok_or_else(|| HaproxyError::RuleNotFound(name.to_string()))?;

        self.backup_config();
        let content = remove_rule_blocks(&self.read_config(), rule.rule_type, name);
        self.write_config(&content)?;

        self.commit_config_change("Rule deleted").await
    }

    /// Update rule fields in place. A change to the rule type,
    /// certificate, target SSL, or PROXY-protocol flag recreates the
    /// whole block; plain port/ip edits rewrite it textually.
    pub async fn update_rule(&self, name: &str, updates: RuleUpdate) -> Result<String> {
        let _guard = self.config_lock.lock().await;

        let rule = self
            .get_rule(name)
            .ok_or_else(|| HaproxyError::RuleNotFound(name.to_string()))?;

        let new_type = updates.rule_type.unwrap_or(rule.rule_type);
        let new_cert = updates
            .cert_domain
            .clone()
            .or_else(|| rule.cert_domain.clone());
        let new_target_ssl = updates.target_ssl.unwrap_or(rule.target_ssl);
        let new_send_proxy = updates.send_proxy.unwrap_or(rule.send_proxy);

        let structural = new_type != rule.rule_type
            || new_cert != rule.cert_domain
            || new_target_ssl != rule.target_ssl
            || new_send_proxy != rule.send_proxy;

        if structural {
            if new_type == RuleKind::Https && new_cert.is_none() {
                return Err(HaproxyError::Validation(
                    "Certificate domain required for HTTPS rules".into(),
                ));
            }
            let new_rule = HaproxyRule {
                name: name.to_string(),
                rule_type: new_type,
                listen_port: updates.listen_port.unwrap_or(rule.listen_port),
                target_ip: updates.target_ip.clone().unwrap_or(rule.target_ip),
                target_port: updates.target_port.unwrap_or(rule.target_port),
                cert_domain: if new_type == RuleKind::Https {
                    new_cert
                } else {
                    None
                },
                target_ssl: new_target_ssl,
                send_proxy: new_send_proxy,
            };

            self.delete_rule_locked(name).await?;
            self.add_rule_locked(new_rule).await?;
            return Ok(format!("Rule recreated with new type: {}", new_type.as_str()));
        }

        self.backup_config();
        let mut content = self.read_config();

        let frontend = format!("{}_{}", rule.rule_type.as_str(), name);
        let backend = format!("backend_{}_{}", rule.rule_type.as_str(), name);

        if let Some(port) = updates.listen_port {
            if port == 0 {
                return Err(HaproxyError::Validation("Invalid listen port".into()));
            }
            let re = Regex::new(&format!(
                r"(?s)(frontend\s+{}.*?bind\s+\*:)\d+",
                regex::escape(&frontend)
            ))
            .map_err(|e| HaproxyError::Validation(e.to_string()))?;
            content = re.replace(&content, format!("${{1}}{}", port)).into_owned();
        }

        if let Some(ip) = &updates.target_ip {
            let re = Regex::new(&format!(
                r"(?s)(backend\s+{}.*?server\s+\S+\s+)\S+:(\d+)",
                regex::escape(&backend)
            ))
            .map_err(|e| HaproxyError::Validation(e.to_string()))?;
            content = re
                .replace(&content, format!("${{1}}{}:${{2}}", ip))
                .into_owned();
        }

        if let Some(port) = updates.target_port {
            if port == 0 {
                return Err(HaproxyError::Validation("Invalid target port".into()));
            }
            let re = Regex::new(&format!(
                r"(?s)(backend\s+{}.*?server\s+\S+\s+\S+:)\d+",
                regex::escape(&backend)
            ))
            .map_err(|e| HaproxyError::Validation(e.to_string()))?;
            content = re.replace(&content, format!("${{1}}{}", port)).into_owned();
        }

        self.write_config(&content)?;
        self.commit_config_change("Rule updated").await
    }

    pub fn get_config(&self) -> String {
        self.read_config()
    }

    /// Replace the whole config file, validating before committing.
    pub async fn apply_config(&self, content: &str, reload_after: bool) -> Result<ApplyOutcome> {
        let _guard = self.config_lock.lock().await;

        self.backup_config();
        self.write_config(content)?;

        if let Err(e) = self.check_config().await {
            self.restore_config();
            return Err(e);
        }

        if !reload_after {
            return Ok(ApplyOutcome {
                message: "Config applied (reload skipped)".into(),
                reloaded: false,
            });
        }

        match self.reload(false).await {
            Ok(reload_msg) => {
                if reload_msg.contains("not running") || reload_msg.contains("stopped") {
                    Ok(ApplyOutcome {
                        message: format!("Config applied ({})", reload_msg),
                        reloaded: false,
                    })
                } else {
                    Ok(ApplyOutcome {
                        message: "Config applied and reloaded".into(),
                        reloaded: true,
                    })
                }
            }
            Err(e) => {
                self.restore_config();
                Err(HaproxyError::Service(format!("Reload failed: {}", e)))
            }
        }
    }

    pub(crate) fn cert_path(&self, domain: &str) -> PathBuf {
        match self.find_cert_dir(domain) {
            Some(dir) => dir.join("combined.pem"),
            None => self.certs_dir.join(domain).join("combined.pem"),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}
