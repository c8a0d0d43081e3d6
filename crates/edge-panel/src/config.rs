//! Panel configuration: TOML file with environment overrides.

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub bind_address: String,
    pub port: u16,
    pub database_path: PathBuf,
    /// Bearer token required on the API; empty disables auth (expected
    /// only behind a trusted reverse proxy).
    pub auth_token: String,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 8080,
            database_path: PathBuf::from("/var/lib/edgewatch/panel.db"),
            auth_token: String::new(),
        }
    }
}

impl PanelConfig {
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("PANEL_CONFIG_PATH") {
            Ok(path) => {
                let content = std::fs::read_to_string(&path)?;
                toml::from_str(&content)?
            }
            Err(_) => Self::default(),
        };

        if let Ok(value) = std::env::var("PANEL_DATABASE_PATH") {
            config.database_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("PANEL_AUTH_TOKEN") {
            config.auth_token = value;
        }
        if let Ok(value) = std::env::var("PANEL_PORT") {
            if let Ok(port) = value.parse() {
                config.port = port;
            }
        }
        if let Ok(value) = std::env::var("PANEL_BIND_ADDRESS") {
            config.bind_address = value;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: PanelConfig = toml::from_str("port = 9090\n").unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.bind_address, "0.0.0.0");
    }
}
