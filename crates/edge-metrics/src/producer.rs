//! The composite metrics snapshot served by `/api/metrics`.
//!
//! Counters are cumulative since boot; all `*_per_sec` fields stay zero
//! because speed derivation is the panel's job. Expensive sections
//! (process table, connection histogram, general system info) are
//! cached for five seconds.

use crate::proc::{self, NetCounters};
use chrono::{DateTime, Utc};
use edge_haproxy::HaproxyDriver;
use edge_types::metrics::{
    CertificateExpiry, CertificatesInfo, CpuFrequency, CpuInfo, DiskInfo, DiskIoCounters,
    InterfaceTotals, LegacyConnections, MemoryInfo, MetricsDocument, NetworkInfo, PartitionInfo,
    ProcessEntry, ProcessesInfo, RamInfo, SwapInfo, SystemInfo, TemperatureReading, TimezoneInfo,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Components, Disks, System};
use tokio::sync::Mutex;
use tracing::debug;

const CACHE_TTL: Duration = Duration::from_secs(5);
const TOP_N: usize = 10;

struct Cached<T> {
    at: Instant,
    value: T,
}

pub struct MetricsProducer {
    server_name: String,
    proc_root: PathBuf,
    net_dev_path: PathBuf,
    haproxy: Option<Arc<HaproxyDriver>>,
    system: Mutex<System>,
    processes_cache: Mutex<Option<Cached<ProcessesInfo>>>,
    system_cache: Mutex<Option<Cached<SystemInfo>>>,
}

impl MetricsProducer {
    pub fn new(server_name: &str, haproxy: Option<Arc<HaproxyDriver>>) -> Self {
        let mut system = System::new_all();
        // Prime the CPU sampler so the first real reading is non-zero.
        system.refresh_cpu();
        Self {
            server_name: server_name.to_string(),
            proc_root: PathBuf::from("/proc"),
            net_dev_path: PathBuf::from("/proc/net/dev"),
            haproxy,
            system: Mutex::new(system),
            processes_cache: Mutex::new(None),
            system_cache: Mutex::new(None),
        }
    }

    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        let root = proc_root.into();
        self.net_dev_path = root.join("net/dev");
        self.proc_root = root;
        self
    }

    pub async fn cpu_info(&self) -> CpuInfo {
        let mut system = self.system.lock().await;
        system.refresh_cpu();

        let per_cpu: Vec<f64> = system.cpus().iter().map(|c| c.cpu_usage() as f64).collect();
        let usage = if per_cpu.is_empty() {
            0.0
        } else {
            per_cpu.iter().sum::<f64>() / per_cpu.len() as f64
        };
        let load = System::load_average();
        let model = system
            .cpus()
            .first()
            .map(|c| c.brand().to_string())
            .unwrap_or_else(|| "Unknown".to_string());
        let frequency = system
            .cpus()
            .first()
            .map(|c| c.frequency() as f64)
            .unwrap_or(0.0);
        let cores_logical = system.cpus().len().max(1);
        let cores_physical = system.physical_core_count().unwrap_or(cores_logical);
        drop(system);

        let mut temperatures = std::collections::HashMap::new();
        let components = Components::new_with_refreshed_list();
        for component in &components {
            let reading = TemperatureReading {
                label: component.label().to_string(),
                current: component.temperature() as f64,
                high: Some(component.max() as f64),
                critical: component.critical().map(|c| c as f64),
            };
            temperatures
                .entry("coretemp".to_string())
                .or_insert_with(Vec::new)
                .push(reading);
        }

        CpuInfo {
            cores_physical,
            cores_logical,
            model,
            usage_percent: usage,
            per_cpu_percent: per_cpu,
            load_avg_1: load.one,
            load_avg_5: load.five,
            load_avg_15: load.fifteen,
            frequency: CpuFrequency {
                current: frequency,
                min: 0.0,
                max: 0.0,
            },
            temperatures,
        }
    }

    pub async fn memory_info(&self) -> MemoryInfo {
        let mut system = self.system.lock().await;
        system.refresh_memory();

        let total = system.total_memory();
        let used = system.used_memory();
        let available = system.available_memory();
        let free = system.free_memory();
        let swap_total = system.total_swap();
        let swap_used = system.used_swap();
        let swap_free = system.free_swap();

        MemoryInfo {
            ram: RamInfo {
                total,
                used,
                free,
                available,
                percent: percent(used, total),
                buffers: 0,
                // available ≈ free + reclaimable page cache
                cached: available.saturating_sub(free),
            },
            swap: SwapInfo {
                total: swap_total,
                used: swap_used,
                free: swap_free,
                percent: percent(swap_used, swap_total),
            },
        }
    }

    pub fn disk_info(&self) -> DiskInfo {
        let disks = Disks::new_with_refreshed_list();
        let mut partitions = Vec::new();
        for disk in &disks {
            let mountpoint = disk.mount_point().display().to_string();
            if mountpoint.starts_with("/snap") || mountpoint.starts_with("/boot/efi") {
                continue;
            }
            let total = disk.total_space();
            let free = disk.available_space();
            let used = total.saturating_sub(free);
            partitions.push(PartitionInfo {
                device: disk.name().to_string_lossy().to_string(),
                mountpoint,
                fstype: disk.file_system().to_string_lossy().to_string(),
                total,
                used,
                free,
                percent: percent(used, total),
            });
        }

        let io = proc::read_diskstats(&self.proc_root)
            .into_iter()
            .map(|(name, io)| {
                (
                    name,
                    DiskIoCounters {
                        read_bytes: io.read_bytes,
                        write_bytes: io.write_bytes,
                        read_count: io.read_count,
                        write_count: io.write_count,
                    },
                )
            })
            .collect();

        DiskInfo { partitions, io }
    }

    pub fn network_info(&self) -> NetworkInfo {
        let counters = proc::read_net_dev(&self.net_dev_path);

        let mut interfaces: Vec<_> = counters
            .iter()
            .map(|(name, c)| proc::interface_info(name, c))
            .collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));

        let total = counters.values().fold(NetCounters::default(), |acc, c| {
            NetCounters {
                rx_bytes: acc.rx_bytes + c.rx_bytes,
                tx_bytes: acc.tx_bytes + c.tx_bytes,
                rx_packets: acc.rx_packets + c.rx_packets,
                tx_packets: acc.tx_packets + c.tx_packets,
                ..acc
            }
        });

        NetworkInfo {
            interfaces,
            total: InterfaceTotals {
                rx_bytes: total.rx_bytes,
                tx_bytes: total.tx_bytes,
                rx_packets: total.rx_packets,
                tx_packets: total.tx_packets,
                rx_bytes_per_sec: 0.0,
                tx_bytes_per_sec: 0.0,
            },
        }
    }

    pub async fn processes_info(&self) -> ProcessesInfo {
        {
            let cache = self.processes_cache.lock().await;
            if let Some(cached) = cache.as_ref() {
                if cached.at.elapsed() < CACHE_TTL {
                    return cached.value.clone();
                }
            }
        }

        let mut system = self.system.lock().await;
        system.refresh_processes();

        let cpu_count = system.cpus().len().max(1) as f64;
        let total_memory = system.total_memory().max(1) as f64;

        let mut processes: Vec<ProcessEntry> = system
            .processes()
            .values()
            .map(|p| ProcessEntry {
                pid: p.pid().as_u32(),
                name: p.name().to_string(),
                cpu_percent: ((p.cpu_usage() as f64 / cpu_count) * 10.0).round() / 10.0,
                memory_percent: p.memory() as f64 / total_memory * 100.0,
                status: format!("{:?}", p.status()).to_lowercase(),
            })
            .collect();
        drop(system);

        let running = processes.iter().filter(|p| p.status == "run").count();
        let sleeping = processes.iter().filter(|p| p.status == "sleep").count();
        let total = processes.len();

        processes.sort_by(|a, b| b.cpu_percent.total_cmp(&a.cpu_percent));
        let top_by_cpu: Vec<_> = processes.iter().take(TOP_N).cloned().collect();
        processes.sort_by(|a, b| b.memory_percent.total_cmp(&a.memory_percent));
        let top_by_memory: Vec<_> = processes.iter().take(TOP_N).cloned().collect();

        let info = ProcessesInfo {
            total,
            running,
            sleeping,
            top_by_cpu,
            top_by_memory,
        };

        *self.processes_cache.lock().await = Some(Cached {
            at: Instant::now(),
            value: info.clone(),
        });
        info
    }

    pub async fn system_info(&self) -> SystemInfo {
        {
            let cache = self.system_cache.lock().await;
            if let Some(cached) = cache.as_ref() {
                if cached.at.elapsed() < CACHE_TTL {
                    let mut value = cached.value.clone();
                    // Uptime keeps moving even while the rest is cached.
                    value.uptime_seconds = System::uptime();
                    value.uptime_human = format_uptime(value.uptime_seconds);
                    return value;
                }
            }
        }

        let boot_time = System::boot_time();
        let uptime_seconds = System::uptime();
        let connections_detailed = proc::read_connections(&self.proc_root);

        let os_name = std::fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|content| {
                content.lines().find_map(|line| {
                    line.strip_prefix("PRETTY_NAME=")
                        .map(|v| v.trim_matches('"').to_string())
                })
            })
            .unwrap_or_else(|| "Unknown".to_string());

        let info = SystemInfo {
            hostname: System::host_name().unwrap_or_default(),
            os: os_name,
            kernel: System::kernel_version().unwrap_or_else(|| "Unknown".to_string()),
            architecture: System::cpu_arch().unwrap_or_default(),
            boot_time: DateTime::<Utc>::from_timestamp(boot_time as i64, 0)
                .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S").to_string())
                .unwrap_or_default(),
            uptime_seconds,
            uptime_human: format_uptime(uptime_seconds),
            connections: LegacyConnections {
                established: connections_detailed.tcp.established,
                listen: connections_detailed.tcp.listen,
                time_wait: connections_detailed.tcp.time_wait,
                other: connections_detailed.tcp.other,
            },
            connections_detailed,
            server_name: self.server_name.clone(),
            timezone: timezone_info(),
        };

        *self.system_cache.lock().await = Some(Cached {
            at: Instant::now(),
            value: info.clone(),
        });
        info
    }

    pub async fn certificates_info(&self) -> CertificatesInfo {
        let Some(haproxy) = &self.haproxy else {
            return CertificatesInfo::default();
        };

        let certs = haproxy.all_certs_info().await;
        if certs.is_empty() {
            return CertificatesInfo::default();
        }

        let closest = &certs[0];
        CertificatesInfo {
            count: certs.len(),
            closest_expiry: Some(CertificateExpiry {
                domain: closest.domain.clone(),
                days_left: closest.days_left,
                expiry_date: closest.expiry_date.clone(),
                expired: closest.expired,
            }),
        }
    }

    /// Collect the full snapshot.
    pub async fn all_metrics(&self) -> MetricsDocument {
        debug!("collecting metrics snapshot");
        let timezone = timezone_info();
        MetricsDocument {
            timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            server_name: self.server_name.clone(),
            timezone,
            cpu: self.cpu_info().await,
            memory: self.memory_info().await,
            disk: self.disk_info(),
            network: self.network_info(),
            processes: self.processes_info().await,
            system: self.system_info().await,
            certificates: self.certificates_info().await,
        }
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 || parts.is_empty() {
        parts.push(format!("{}m", minutes));
    }
    parts.join(" ")
}

fn timezone_info() -> TimezoneInfo {
    let offset_seconds = chrono::Local::now().offset().local_minus_utc() as i64;
    let sign = if offset_seconds >= 0 { '+' } else { '-' };
    let abs = offset_seconds.abs();
    let offset = format!("{}{:02}:{:02}", sign, abs / 3600, (abs % 3600) / 60);

    let name = std::fs::read_to_string("/etc/timezone")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("TZ").ok())
        .unwrap_or_else(|| "UTC".to_string());

    TimezoneInfo {
        name,
        offset,
        offset_seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(0), "0m");
        assert_eq!(format_uptime(90), "1m");
        assert_eq!(format_uptime(3_660), "1h 1m");
        assert_eq!(format_uptime(90_061), "1d 1h 1m");
    }

    #[test]
    fn percent_handles_zero_total() {
        assert_eq!(percent(10, 0), 0.0);
        assert_eq!(percent(50, 100), 50.0);
    }

    #[test]
    fn timezone_offset_shape() {
        let tz = timezone_info();
        assert!(tz.offset.len() == 6, "unexpected offset: {}", tz.offset);
    }

    #[tokio::test]
    async fn snapshot_has_zero_rates_and_cumulative_counters() {
        let producer = MetricsProducer::new("test-node", None);
        let doc = producer.all_metrics().await;
        assert_eq!(doc.server_name, "test-node");
        assert_eq!(doc.network.total.rx_bytes_per_sec, 0.0);
        assert_eq!(doc.network.total.tx_bytes_per_sec, 0.0);
        for iface in &doc.network.interfaces {
            assert_eq!(iface.rx_bytes_per_sec, 0.0);
        }
        assert!(doc.memory.ram.total > 0);
    }

    #[tokio::test]
    async fn system_info_is_cached() {
        let producer = MetricsProducer::new("test-node", None);
        let first = producer.system_info().await;
        let second = producer.system_info().await;
        assert_eq!(first.hostname, second.hostname);
        assert_eq!(first.boot_time, second.boot_time);
    }
}
