//! Node agent configuration: TOML file with environment overrides.

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub bind_address: String,
    pub port: u16,
    pub api_key: String,
    pub node_name: String,

    pub haproxy_config: PathBuf,
    pub haproxy_certs: PathBuf,

    pub traffic_db_path: PathBuf,
    pub traffic_collect_interval: u64,
    pub traffic_retention_days: i64,

    pub security_max_failed_attempts: u32,
    pub security_ban_duration: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 8081,
            api_key: String::new(),
            node_name: "node".into(),
            haproxy_config: PathBuf::from("/etc/haproxy/haproxy.cfg"),
            haproxy_certs: PathBuf::from("/etc/letsencrypt/live"),
            traffic_db_path: PathBuf::from("/var/lib/monitoring/traffic.db"),
            traffic_collect_interval: 60,
            traffic_retention_days: 30,
            security_max_failed_attempts: 10,
            security_ban_duration: 3600,
        }
    }
}

impl AgentConfig {
    /// Load from `AGENT_CONFIG_PATH` if set, then apply env overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("AGENT_CONFIG_PATH") {
            Ok(path) => {
                let content = std::fs::read_to_string(&path)?;
                toml::from_str(&content)?
            }
            Err(_) => Self::default(),
        };

        if let Ok(value) = std::env::var("AGENT_API_KEY") {
            config.api_key = value;
        }
        if let Ok(value) = std::env::var("AGENT_NODE_NAME") {
            config.node_name = value;
        }
        if let Ok(value) = std::env::var("AGENT_PORT") {
            if let Ok(port) = value.parse() {
                config.port = port;
            }
        }
        if let Ok(value) = std::env::var("AGENT_BIND_ADDRESS") {
            config.bind_address = value;
        }

        if config.api_key.is_empty() {
            anyhow::bail!("API key not configured (set AGENT_API_KEY or api_key in config)");
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AgentConfig::default();
        assert_eq!(config.port, 8081);
        assert_eq!(config.security_max_failed_attempts, 10);
        assert_eq!(config.security_ban_duration, 3600);
    }

    #[test]
    fn parses_partial_toml() {
        let config: AgentConfig =
            toml::from_str("api_key = \"secret\"\nport = 9000\n").unwrap();
        assert_eq!(config.api_key, "secret");
        assert_eq!(config.port, 9000);
        assert_eq!(config.node_name, "node");
    }
}
