//! Closed sum types for firewall and routing rule parameters.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Traffic direction: incoming (INPUT chain, match source) or
/// outgoing (OUTPUT chain, match destination).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }

    /// iptables chain this direction maps to.
    pub fn chain(&self) -> &'static str {
        match self {
            Direction::In => "INPUT",
            Direction::Out => "OUTPUT",
        }
    }

    /// ipset match flag (`src` for incoming, `dst` for outgoing).
    pub fn match_flag(&self) -> &'static str {
        match self {
            Direction::In => "src",
            Direction::Out => "dst",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            _ => Err(format!("Unknown direction: {} (use in or out)", s)),
        }
    }
}

/// Transport protocol for firewall and traffic-accounting rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Any,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Any => "any",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "any" | "" => Ok(Protocol::Any),
            _ => Err(format!("Unknown protocol: {} (use tcp, udp, or any)", s)),
        }
    }
}

/// Firewall rule action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallAction {
    Allow,
    Deny,
}

impl FirewallAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirewallAction::Allow => "allow",
            FirewallAction::Deny => "deny",
        }
    }
}

impl FromStr for FirewallAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allow" => Ok(FirewallAction::Allow),
            "deny" => Ok(FirewallAction::Deny),
            _ => Err(format!("Unknown action: {} (use allow or deny)", s)),
        }
    }
}

/// Kind of an HAProxy routing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Tcp,
    Https,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Tcp => "tcp",
            RuleKind::Https => "https",
        }
    }
}

impl FromStr for RuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(RuleKind::Tcp),
            "https" => Ok(RuleKind::Https),
            _ => Err(format!("Unknown rule type: {} (use tcp or https)", s)),
        }
    }
}

/// Certificate issuance method for certbot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertMethod {
    Standalone,
    Webroot,
}

impl Default for CertMethod {
    fn default() -> Self {
        CertMethod::Standalone
    }
}

impl FromStr for CertMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standalone" => Ok(CertMethod::Standalone),
            "webroot" => Ok(CertMethod::Webroot),
            _ => Err(format!("Unknown method: {} (use standalone or webroot)", s)),
        }
    }
}

/// Shell used for host command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    Sh,
    Bash,
}

impl Default for Shell {
    fn default() -> Self {
        Shell::Sh
    }
}

impl Shell {
    pub fn as_str(&self) -> &'static str {
        match self {
            Shell::Sh => "sh",
            Shell::Bash => "bash",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_chain_mapping() {
        assert_eq!(Direction::In.chain(), "INPUT");
        assert_eq!(Direction::Out.chain(), "OUTPUT");
        assert_eq!(Direction::In.match_flag(), "src");
        assert_eq!(Direction::Out.match_flag(), "dst");
    }

    #[test]
    fn direction_round_trip() {
        assert_eq!("in".parse::<Direction>().unwrap(), Direction::In);
        assert_eq!("OUT".parse::<Direction>().unwrap(), Direction::Out);
        assert!("both".parse::<Direction>().is_err());
    }

    #[test]
    fn serde_lowercase() {
        assert_eq!(serde_json::to_string(&Direction::Out).unwrap(), "\"out\"");
        assert_eq!(serde_json::to_string(&Protocol::Udp).unwrap(), "\"udp\"");
        let d: Direction = serde_json::from_str("\"in\"").unwrap();
        assert_eq!(d, Direction::In);
    }
}
