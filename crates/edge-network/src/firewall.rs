//! UFW firewall adapter.
//!
//! All mutations go through the shared [`HostRunner`] so they execute in
//! the host namespace when the agent is containerized. Removing a rule
//! that does not exist is treated as success.

use crate::error::{NetworkError, Result};
use edge_exec::{CommandOutput, HostRunner};
use edge_types::{Direction, FirewallAction, Protocol};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{error, info};

const UFW_TIMEOUT: Duration = Duration::from_secs(30);

fn rule_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^\[\s*(\d+)\]\s+(\d+)(?:/(\w+))?\s+(ALLOW|DENY)\s+(IN|OUT|FWD)?\s*(.+?)(\s+\(v6\))?$",
        )
        .unwrap()
    })
}

/// One parsed row of `ufw status numbered`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallRule {
    pub number: u32,
    pub port: u16,
    pub protocol: String,
    pub action: String,
    pub from_ip: String,
    pub direction: String,
    pub ipv6: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallStatus {
    pub active: bool,
    pub default_incoming: String,
    pub default_outgoing: String,
    pub logging: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct FirewallDriver {
    runner: Arc<dyn HostRunner>,
}

impl FirewallDriver {
    pub fn new(runner: Arc<dyn HostRunner>) -> Self {
        Self { runner }
    }

    async fn run_ufw(&self, args: &[&str]) -> CommandOutput {
        self.runner.run("ufw", args, UFW_TIMEOUT).await
    }

    pub async fn is_active(&self) -> bool {
        let out = self.run_ufw(&["status"]).await;
        out.success && out.stdout.contains("Status: active")
    }

    /// Allow a port for incoming traffic.
    pub async fn add_simple(&self, port: u16, protocol: Protocol) -> Result<String> {
        self.add_advanced(port, protocol, FirewallAction::Allow, None, Direction::In)
            .await
    }

    /// Add a rule with full control:
    /// `ufw <action> <direction> [from <ip>] to any port <port> [proto <protocol>]`.
    pub async fn add_advanced(
        &self,
        port: u16,
        protocol: Protocol,
        action: FirewallAction,
        from_ip: Option<&str>,
        direction: Direction,
    ) -> Result<String> {
        if port == 0 {
            return Err(NetworkError::Validation("Invalid port number".into()));
        }

        let port_str = port.to_string();
        let mut args: Vec<&str> = vec![action.as_str(), direction.as_str()];

        let from = from_ip
            .map(str::trim)
            .filter(|ip| !ip.is_empty() && !ip.eq_ignore_ascii_case("any") && !ip.eq_ignore_ascii_case("anywhere"));
        if let Some(ip) = from {
            args.push("from");
            args.push(ip);
        }

        // UFW requires "to any" before "port".
        args.extend(["to", "any", "port", &port_str]);
        if protocol != Protocol::Any {
            args.extend(["proto", protocol.as_str()]);
        }

        let out = self.run_ufw(&args).await;
        let rule_desc = format!(
            "{} {} port {}/{} from {}",
            action.as_str().to_uppercase(),
            direction.as_str().to_uppercase(),
            port,
            protocol,
            from.unwrap_or("Anywhere"),
        );

        if out.success {
            info!("firewall: added rule - {}", rule_desc);
            Ok(format!("Rule added: {}", rule_desc))
        } else {
            error!("failed to add firewall rule: {}", out.stderr);
            Err(NetworkError::Firewall(format!(
                "Failed to add rule: {}",
                pick_error(&out)
            )))
        }
    }

    /// Remove the first matching ALLOW rule for a port.
    pub async fn remove_by_port(&self, port: u16, protocol: Protocol) -> Result<String> {
        if port == 0 {
            return Err(NetworkError::Validation("Invalid port number".into()));
        }

        let port_spec = if protocol == Protocol::Any {
            port.to_string()
        } else {
            format!("{}/{}", port, protocol)
        };
        let out = self.run_ufw(&["--force", "delete", "allow", &port_spec]).await;

        if out.success {
            info!("firewall: closed port {}", port_spec);
            return Ok(format!("Port {} closed successfully", port_spec));
        }

        // Idempotent removal: a rule that was never there counts as gone.
        if out.stderr.contains("Could not delete non-existent rule")
            || out.stdout.contains("Could not delete non-existent rule")
        {
            return Ok(format!("Port {} was not open", port_spec));
        }

        error!("failed to close port {}: {}", port_spec, out.stderr);
        Err(NetworkError::Firewall(format!(
            "Failed to close port: {}",
            pick_error(&out)
        )))
    }

    pub async fn remove_by_number(&self, rule_number: u32) -> Result<String> {
        if rule_number < 1 {
            return Err(NetworkError::Validation("Invalid rule number".into()));
        }

        let number = rule_number.to_string();
        let out = self.run_ufw(&["--force", "delete", &number]).await;

        if out.success {
            info!("firewall: deleted rule #{}", rule_number);
            Ok(format!("Rule #{} deleted successfully", rule_number))
        } else {
            Err(NetworkError::Firewall(format!(
                "Failed to delete rule: {}",
                pick_error(&out)
            )))
        }
    }

    /// Parse `ufw status numbered` into structured rules.
    pub async fn list(&self) -> Vec<FirewallRule> {
        let out = self.run_ufw(&["status", "numbered"]).await;
        if !out.success {
            return Vec::new();
        }
        parse_numbered_output(&out.stdout)
    }

    pub async fn check_port_open(&self, port: u16, protocol: Protocol) -> bool {
        self.list().await.iter().any(|rule| {
            rule.port == port
                && rule.action == "ALLOW"
                && (protocol == Protocol::Any
                    || rule.protocol == "any"
                    || rule.protocol == protocol.as_str())
        })
    }

    pub async fn status(&self) -> FirewallStatus {
        let out = self.run_ufw(&["status", "verbose"]).await;
        if !out.success {
            return FirewallStatus {
                active: false,
                default_incoming: "unknown".into(),
                default_outgoing: "unknown".into(),
                logging: "unknown".into(),
                error: Some(if out.stderr.is_empty() {
                    "Failed to get status".into()
                } else {
                    out.stderr
                }),
            };
        }

        let mut status = FirewallStatus {
            active: out.stdout.contains("Status: active"),
            default_incoming: "deny".into(),
            default_outgoing: "allow".into(),
            logging: "off".into(),
            error: None,
        };

        for line in out.stdout.lines() {
            if line.contains("Default:") {
                let lower = line.to_lowercase();
                if lower.contains("incoming") {
                    status.default_incoming =
                        if lower.contains("deny") { "deny" } else { "allow" }.into();
                }
                if lower.contains("outgoing") {
                    status.default_outgoing =
                        if lower.contains("allow") { "allow" } else { "deny" }.into();
                }
            }
            if line.contains("Logging:") {
                if let Some(value) = line.rsplit(':').next() {
                    status.logging = value.trim().to_lowercase();
                }
            }
        }

        status
    }

    pub async fn enable(&self) -> Result<String> {
        let out = self.run_ufw(&["--force", "enable"]).await;
        if out.success {
            info!("UFW firewall enabled");
            Ok("Firewall enabled successfully".into())
        } else {
            error!("failed to enable UFW: {}", out.stderr);
            Err(NetworkError::Firewall(format!(
                "Failed to enable firewall: {}",
                pick_error(&out)
            )))
        }
    }

    pub async fn disable(&self) -> Result<String> {
        let out = self.run_ufw(&["disable"]).await;
        if out.success {
            info!("UFW firewall disabled");
            Ok("Firewall disabled successfully".into())
        } else {
            Err(NetworkError::Firewall(format!(
                "Failed to disable firewall: {}",
                pick_error(&out)
            )))
        }
    }

    /// Reset UFW to defaults: disable and drop every rule.
    pub async fn reset(&self) -> Result<String> {
        let out = self.run_ufw(&["--force", "reset"]).await;
        if out.success {
            info!("UFW firewall reset to defaults");
            Ok("Firewall reset to defaults".into())
        } else {
            Err(NetworkError::Firewall(format!(
                "Failed to reset firewall: {}",
                pick_error(&out)
            )))
        }
    }
}

fn pick_error(out: &CommandOutput) -> &str {
    if !out.stderr.is_empty() {
        &out.stderr
    } else {
        &out.stdout
    }
}

fn parse_numbered_output(stdout: &str) -> Vec<FirewallRule> {
    let pattern = rule_line_pattern();
    let mut rules = Vec::new();

    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("Status:") || line.starts_with("To") {
            continue;
        }
        let Some(caps) = pattern.captures(line) else {
            continue;
        };

        let number: u32 = match caps[1].parse() {
            Ok(n) => n,
            Err(_) => continue,
        };
        let port: u16 = match caps[2].parse() {
            Ok(p) => p,
            Err(_) => continue,
        };

        rules.push(FirewallRule {
            number,
            port,
            protocol: caps
                .get(3)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "any".into()),
            action: caps[4].to_string(),
            direction: caps
                .get(5)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "IN".into()),
            from_ip: caps[6].trim().to_string(),
            ipv6: line.contains("(v6)"),
        });
    }

    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numbered_status() {
        let output = "\
Status: active

     To                         Action      From
     --                         ------      ----
[ 1] 80/tcp                     ALLOW IN    Anywhere
[ 2] 443                        ALLOW IN    10.0.0.0/8
[ 3] 22/tcp                     DENY IN     Anywhere (v6)
";
        let rules = parse_numbered_output(output);
        assert_eq!(rules.len(), 3);

        assert_eq!(rules[0].number, 1);
        assert_eq!(rules[0].port, 80);
        assert_eq!(rules[0].protocol, "tcp");
        assert_eq!(rules[0].action, "ALLOW");
        assert_eq!(rules[0].from_ip, "Anywhere");
        assert!(!rules[0].ipv6);

        assert_eq!(rules[1].protocol, "any");
        assert_eq!(rules[1].from_ip, "10.0.0.0/8");

        assert_eq!(rules[2].action, "DENY");
        assert!(rules[2].ipv6);
    }

    #[test]
    fn skips_garbage_lines() {
        let rules = parse_numbered_output("Status: inactive\nnot a rule line\n");
        assert!(rules.is_empty());
    }
}
