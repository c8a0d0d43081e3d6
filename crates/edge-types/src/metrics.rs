//! The composite metrics document served by `GET /api/metrics`.
//!
//! Every byte counter is cumulative since boot; the `*_per_sec` fields are
//! always zero on the node and are filled in only by panel-side derivation.
//! All fields default so that a panel can still parse documents from
//! older or partially degraded nodes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsDocument {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub timezone: TimezoneInfo,
    #[serde(default)]
    pub cpu: CpuInfo,
    #[serde(default)]
    pub memory: MemoryInfo,
    #[serde(default)]
    pub disk: DiskInfo,
    #[serde(default)]
    pub network: NetworkInfo,
    #[serde(default)]
    pub processes: ProcessesInfo,
    #[serde(default)]
    pub system: SystemInfo,
    #[serde(default)]
    pub certificates: CertificatesInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimezoneInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub offset: String,
    #[serde(default)]
    pub offset_seconds: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuInfo {
    #[serde(default)]
    pub cores_physical: usize,
    #[serde(default)]
    pub cores_logical: usize,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage_percent: f64,
    #[serde(default)]
    pub per_cpu_percent: Vec<f64>,
    #[serde(default)]
    pub load_avg_1: f64,
    #[serde(default)]
    pub load_avg_5: f64,
    #[serde(default)]
    pub load_avg_15: f64,
    #[serde(default)]
    pub frequency: CpuFrequency,
    #[serde(default)]
    pub temperatures: HashMap<String, Vec<TemperatureReading>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuFrequency {
    #[serde(default)]
    pub current: f64,
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub label: String,
    pub current: f64,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub critical: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryInfo {
    #[serde(default)]
    pub ram: RamInfo,
    #[serde(default)]
    pub swap: SwapInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RamInfo {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub free: u64,
    #[serde(default)]
    pub available: u64,
    #[serde(default)]
    pub percent: f64,
    #[serde(default)]
    pub buffers: u64,
    #[serde(default)]
    pub cached: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwapInfo {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub free: u64,
    #[serde(default)]
    pub percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskInfo {
    #[serde(default)]
    pub partitions: Vec<PartitionInfo>,
    #[serde(default)]
    pub io: HashMap<String, DiskIoCounters>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub device: String,
    pub mountpoint: String,
    #[serde(default)]
    pub fstype: String,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub free: u64,
    #[serde(default)]
    pub percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskIoCounters {
    #[serde(default)]
    pub read_bytes: u64,
    #[serde(default)]
    pub write_bytes: u64,
    #[serde(default)]
    pub read_count: u64,
    #[serde(default)]
    pub write_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInfo {
    #[serde(default)]
    pub interfaces: Vec<InterfaceInfo>,
    #[serde(default)]
    pub total: InterfaceTotals,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<InterfaceAddress>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub mtu: Option<u64>,
    #[serde(default)]
    pub speed_mbps: Option<u64>,
    #[serde(default)]
    pub is_up: bool,
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
    #[serde(default)]
    pub rx_packets: u64,
    #[serde(default)]
    pub tx_packets: u64,
    #[serde(default)]
    pub rx_errors: u64,
    #[serde(default)]
    pub tx_errors: u64,
    #[serde(default)]
    pub rx_drops: u64,
    #[serde(default)]
    pub tx_drops: u64,
    #[serde(default)]
    pub rx_bytes_per_sec: f64,
    #[serde(default)]
    pub tx_bytes_per_sec: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceAddress {
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
    #[serde(default)]
    pub netmask: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceTotals {
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub tx_bytes: u64,
    #[serde(default)]
    pub rx_packets: u64,
    #[serde(default)]
    pub tx_packets: u64,
    #[serde(default)]
    pub rx_bytes_per_sec: f64,
    #[serde(default)]
    pub tx_bytes_per_sec: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessesInfo {
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub running: usize,
    #[serde(default)]
    pub sleeping: usize,
    #[serde(default)]
    pub top_by_cpu: Vec<ProcessEntry>,
    #[serde(default)]
    pub top_by_memory: Vec<ProcessEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_percent: f64,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub kernel: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub boot_time: String,
    #[serde(default)]
    pub uptime_seconds: u64,
    #[serde(default)]
    pub uptime_human: String,
    #[serde(default)]
    pub connections: LegacyConnections,
    #[serde(default)]
    pub connections_detailed: ConnectionsDetailed,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub timezone: TimezoneInfo,
}

/// Flat counts kept for callers that predate the detailed histogram.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyConnections {
    #[serde(default)]
    pub established: u64,
    #[serde(default)]
    pub listen: u64,
    #[serde(default)]
    pub time_wait: u64,
    #[serde(default)]
    pub other: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionsDetailed {
    #[serde(default)]
    pub tcp: TcpStates,
    #[serde(default)]
    pub udp: UdpStats,
}

/// TCP state histogram parsed from `/proc/net/tcp{,6}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcpStates {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub established: u64,
    #[serde(default)]
    pub listen: u64,
    #[serde(default)]
    pub time_wait: u64,
    #[serde(default)]
    pub close_wait: u64,
    #[serde(default)]
    pub syn_sent: u64,
    #[serde(default)]
    pub syn_recv: u64,
    #[serde(default)]
    pub fin_wait: u64,
    #[serde(default)]
    pub other: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UdpStats {
    #[serde(default)]
    pub total: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertificatesInfo {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub closest_expiry: Option<CertificateExpiry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateExpiry {
    pub domain: String,
    pub days_left: i64,
    pub expiry_date: String,
    pub expired: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_document() {
        let doc: MetricsDocument = serde_json::from_str(
            r#"{"cpu": {"usage_percent": 42.5}, "network": {"total": {"rx_bytes": 1000}}}"#,
        )
        .unwrap();
        assert_eq!(doc.cpu.usage_percent, 42.5);
        assert_eq!(doc.network.total.rx_bytes, 1000);
        assert_eq!(doc.memory.ram.total, 0);
    }

    #[test]
    fn round_trips_tcp_states() {
        let mut doc = MetricsDocument::default();
        doc.system.connections_detailed.tcp.established = 12;
        let json = serde_json::to_string(&doc).unwrap();
        let back: MetricsDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back.system.connections_detailed.tcp.established, 12);
    }
}
