//! Raw host counters read straight from procfs.
//!
//! Cumulative byte counters must come from the host's own accounting,
//! not a sampling library, because the panel derives speeds from
//! successive readings and any gap or reset must be visible.

use edge_types::metrics::{ConnectionsDetailed, InterfaceInfo, TcpStates, UdpStats};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default)]
pub struct NetCounters {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub rx_drops: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub tx_drops: u64,
}

/// Parse `/proc/net/dev`, skipping the loopback interface.
pub fn parse_net_dev(content: &str) -> HashMap<String, NetCounters> {
    let mut result = HashMap::new();
    for line in content.lines().skip(2) {
        let Some((name, values)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name == "lo" {
            continue;
        }
        let fields: Vec<u64> = values
            .split_whitespace()
            .map(|f| f.parse().unwrap_or(0))
            .collect();
        if fields.len() >= 16 {
            result.insert(
                name.to_string(),
                NetCounters {
                    rx_bytes: fields[0],
                    rx_packets: fields[1],
                    rx_errors: fields[2],
                    rx_drops: fields[3],
                    tx_bytes: fields[8],
                    tx_packets: fields[9],
                    tx_errors: fields[10],
                    tx_drops: fields[11],
                },
            );
        }
    }
    result
}

pub fn read_net_dev(path: &Path) -> HashMap<String, NetCounters> {
    std::fs::read_to_string(path)
        .map(|content| parse_net_dev(&content))
        .unwrap_or_default()
}

/// Fill in link-level details from sysfs; addresses are not exported.
pub fn interface_info(name: &str, counters: &NetCounters) -> InterfaceInfo {
    let sys_dir = Path::new("/sys/class/net").join(name);
    let read_trim = |file: &str| -> Option<String> {
        std::fs::read_to_string(sys_dir.join(file))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    InterfaceInfo {
        name: name.to_string(),
        addresses: Vec::new(),
        mac: read_trim("address"),
        mtu: read_trim("mtu").and_then(|s| s.parse().ok()),
        speed_mbps: read_trim("speed")
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .map(|v| v as u64),
        is_up: read_trim("operstate").map(|s| s == "up").unwrap_or(true),
        rx_bytes: counters.rx_bytes,
        tx_bytes: counters.tx_bytes,
        rx_packets: counters.rx_packets,
        tx_packets: counters.tx_packets,
        rx_errors: counters.rx_errors,
        tx_errors: counters.tx_errors,
        rx_drops: counters.rx_drops,
        tx_drops: counters.tx_drops,
        rx_bytes_per_sec: 0.0,
        tx_bytes_per_sec: 0.0,
    }
}

/// Map a `/proc/net/tcp` state nibble onto the histogram.
fn classify_tcp_state(state: &str, stats: &mut TcpStates) {
    stats.total += 1;
    match state {
        "01" => stats.established += 1,
        "0A" => stats.listen += 1,
        "06" => stats.time_wait += 1,
        "08" => stats.close_wait += 1,
        "02" => stats.syn_sent += 1,
        "03" => stats.syn_recv += 1,
        "04" | "05" => stats.fin_wait += 1,
        _ => stats.other += 1,
    }
}

pub fn parse_tcp_states(content: &str, stats: &mut TcpStates) {
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 4 {
            classify_tcp_state(&fields[3].to_uppercase(), stats);
        }
    }
}

/// Read the TCP state histogram and UDP socket count from procfs.
pub fn read_connections(proc_root: &Path) -> ConnectionsDetailed {
    let mut tcp = TcpStates::default();
    for file in ["net/tcp", "net/tcp6"] {
        if let Ok(content) = std::fs::read_to_string(proc_root.join(file)) {
            parse_tcp_states(&content, &mut tcp);
        }
    }

    let mut udp = UdpStats::default();
    for file in ["net/udp", "net/udp6"] {
        if let Ok(content) = std::fs::read_to_string(proc_root.join(file)) {
            udp.total += content.lines().skip(1).filter(|l| !l.trim().is_empty()).count() as u64;
        }
    }

    ConnectionsDetailed { tcp, udp }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiskIo {
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_count: u64,
    pub write_count: u64,
}

const SECTOR_SIZE: u64 = 512;

/// Parse `/proc/diskstats` for whole devices (partitions are skipped by
/// the caller filtering names).
pub fn parse_diskstats(content: &str) -> HashMap<String, DiskIo> {
    let mut result = HashMap::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 14 {
            continue;
        }
        let name = fields[2];
        // Skip loop/ram devices and partition rows (ending in a digit
        // for sdX-style names).
        if name.starts_with("loop") || name.starts_with("ram") {
            continue;
        }
        let reads: u64 = fields[3].parse().unwrap_or(0);
        let sectors_read: u64 = fields[5].parse().unwrap_or(0);
        let writes: u64 = fields[7].parse().unwrap_or(0);
        let sectors_written: u64 = fields[9].parse().unwrap_or(0);
        result.insert(
            name.to_string(),
            DiskIo {
                read_bytes: sectors_read * SECTOR_SIZE,
                write_bytes: sectors_written * SECTOR_SIZE,
                read_count: reads,
                write_count: writes,
            },
        );
    }
    result
}

pub fn read_diskstats(proc_root: &Path) -> HashMap<String, DiskIo> {
    std::fs::read_to_string(proc_root.join("diskstats"))
        .map(|content| parse_diskstats(&content))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_dev_parses_and_skips_lo() {
        let content = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 12345 10 0 0 0 0 0 0 12345 10 0 0 0 0 0 0
  eth0: 1000000 500 1 2 0 0 0 0 500000 400 3 4 0 0 0 0
";
        let parsed = parse_net_dev(content);
        assert_eq!(parsed.len(), 1);
        let eth0 = &parsed["eth0"];
        assert_eq!(eth0.rx_bytes, 1_000_000);
        assert_eq!(eth0.tx_bytes, 500_000);
        assert_eq!(eth0.rx_errors, 1);
        assert_eq!(eth0.tx_drops, 4);
    }

    #[test]
    fn tcp_state_histogram() {
        let content = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  0
   1: 0100007F:1F90 0100007F:A0F2 01 00000000:00000000 00:00000000 00000000  0
   2: 0100007F:1F90 0100007F:A0F4 06 00000000:00000000 00:00000000 00000000  0
   3: 0100007F:1F90 0100007F:A0F6 04 00000000:00000000 00:00000000 00000000  0
   4: 0100007F:1F90 0100007F:A0F8 0B 00000000:00000000 00:00000000 00000000  0
";
        let mut stats = TcpStates::default();
        parse_tcp_states(content, &mut stats);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.listen, 1);
        assert_eq!(stats.established, 1);
        assert_eq!(stats.time_wait, 1);
        assert_eq!(stats.fin_wait, 1);
        assert_eq!(stats.other, 1);
    }

    #[test]
    fn diskstats_converts_sectors() {
        let content = "   8       0 sda 100 0 2048 50 200 0 4096 80 0 0 0 0 0 0 0\n   7       0 loop0 1 0 8 0 0 0 0 0 0 0 0 0 0 0 0\n";
        let parsed = parse_diskstats(content);
        assert_eq!(parsed.len(), 1);
        let sda = &parsed["sda"];
        assert_eq!(sda.read_bytes, 2048 * 512);
        assert_eq!(sda.write_bytes, 4096 * 512);
        assert_eq!(sda.read_count, 100);
        assert_eq!(sda.write_count, 200);
    }
}
