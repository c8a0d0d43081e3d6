//! Wire payloads for the ipset sync API.

use crate::network::Direction;
use serde::{Deserialize, Serialize};

fn default_permanent() -> bool {
    true
}

fn default_direction() -> Direction {
    Direction::In
}

/// Request body for `POST /api/ipset/sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpsetSyncRequest {
    pub ips: Vec<String>,
    #[serde(default = "default_permanent")]
    pub permanent: bool,
    #[serde(default = "default_direction")]
    pub direction: Direction,
}

/// Diff accounting returned by a sync: how the authoritative set compared
/// to the live one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpsetSyncOutcome {
    pub total: usize,
    pub added: usize,
    pub removed: usize,
    pub invalid: Vec<String>,
}

/// Per-direction counts reported by `GET /api/ipset/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectionStatus {
    pub permanent_count: usize,
    pub temp_count: usize,
    pub iptables_rules_exist: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpsetStatus {
    pub incoming: DirectionStatus,
    pub outgoing: DirectionStatus,
    pub temp_timeout: u64,
}
