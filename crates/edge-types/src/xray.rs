//! Wire payloads for the Xray stats collection API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One aggregated `(email, source_ip, host) -> count` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XrayStatEntry {
    pub email: i64,
    pub source_ip: String,
    pub host: String,
    pub count: i64,
}

/// Response body of `POST /api/remnawave/stats/collect`: the snapshot the
/// panel pulls, after which the node resets its in-memory aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XrayCollectReport {
    pub collected_at: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub entries_count: u64,
    pub stats: Vec<XrayStatEntry>,
    #[serde(default)]
    pub total_lines_read: u64,
    #[serde(default)]
    pub total_lines_parsed: u64,
    #[serde(default)]
    pub buffer_dropped_lines: u64,
    #[serde(default)]
    pub dropped_entries: u64,
    #[serde(default)]
    pub auto_flushes: u64,
    #[serde(default)]
    pub memory_usage_mb_before_clear: f64,
}
