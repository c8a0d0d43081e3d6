//! End-to-end accounting tests with a scripted host and fake /proc/net/dev.

use async_trait::async_trait;
use edge_exec::{CommandOutput, HostRunner};
use edge_traffic::{TrafficAccountant, TrafficConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// iptables stub: pretends chains exist and serves scripted counter
/// listings for the accounting chains.
struct FakeIptables {
    in_listing: Mutex<String>,
    out_listing: Mutex<String>,
}

impl FakeIptables {
    fn new() -> Self {
        Self {
            in_listing: Mutex::new(String::new()),
            out_listing: Mutex::new(String::new()),
        }
    }

    async fn set_counters(&self, port: u16, rx: u64, tx: u64) {
        *self.in_listing.lock().await = format!(
            "Chain TRAFFIC_ACCOUNTING_IN\n pkts bytes\n  1 {} tcp dpt:{}\n",
            rx, port
        );
        *self.out_listing.lock().await = format!(
            "Chain TRAFFIC_ACCOUNTING_OUT\n pkts bytes\n  1 {} tcp spt:{}\n",
            tx, port
        );
    }
}

#[async_trait]
impl HostRunner for FakeIptables {
    async fn run(&self, program: &str, args: &[&str], _timeout: Duration) -> CommandOutput {
        if program != "iptables" {
            return CommandOutput::failure("Command not found");
        }
        let stdout = match args {
            ["-L", "TRAFFIC_ACCOUNTING_IN", "-v", "-n", "-x"] => {
                self.in_listing.lock().await.clone()
            }
            ["-L", "TRAFFIC_ACCOUNTING_OUT", "-v", "-n", "-x"] => {
                self.out_listing.lock().await.clone()
            }
            _ => String::new(),
        };
        CommandOutput {
            success: true,
            stdout,
            stderr: String::new(),
        }
    }
}

fn write_net_dev(path: &PathBuf, eth0_rx: u64, eth0_tx: u64) {
    let content = format!(
        "Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 999 1 0 0 0 0 0 0 999 1 0 0 0 0 0 0
  eth0: {rx} 10 0 0 0 0 0 0 {tx} 8 0 0 0 0 0 0
",
        rx = eth0_rx,
        tx = eth0_tx,
    );
    std::fs::write(path, content).unwrap();
}

async fn accountant_with(
    dir: &tempfile::TempDir,
    host: Arc<FakeIptables>,
) -> Arc<TrafficAccountant> {
    let net_dev = dir.path().join("net_dev");
    write_net_dev(&net_dev, 0, 0);
    TrafficAccountant::init(
        host as Arc<dyn HostRunner>,
        TrafficConfig {
            db_path: dir.path().join("traffic.db"),
            collect_interval: 60,
            retention_days: 30,
            proc_net_dev: net_dev,
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn first_tick_is_baseline_only() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(FakeIptables::new());
    let accountant = accountant_with(&dir, host.clone()).await;

    write_net_dev(&dir.path().join("net_dev"), 1_000_000, 500_000);
    accountant.collect_snapshot().await.unwrap();

    // The first observation only establishes a baseline.
    let total = accountant.total_traffic(30).await.unwrap();
    assert_eq!(total.rx_bytes, 0);
    assert_eq!(total.tx_bytes, 0);
}

#[tokio::test]
async fn deltas_accumulate_into_rollups() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(FakeIptables::new());
    let accountant = accountant_with(&dir, host.clone()).await;
    let net_dev = dir.path().join("net_dev");

    write_net_dev(&net_dev, 1_000_000, 500_000);
    accountant.collect_snapshot().await.unwrap();

    write_net_dev(&net_dev, 1_050_000, 520_000);
    accountant.collect_snapshot().await.unwrap();

    write_net_dev(&net_dev, 1_090_000, 530_000);
    accountant.collect_snapshot().await.unwrap();

    let interfaces = accountant.interface_summary(30).await.unwrap();
    assert_eq!(interfaces.len(), 1);
    assert_eq!(interfaces[0].interface, "eth0");
    assert_eq!(interfaces[0].rx_bytes, 90_000);
    assert_eq!(interfaces[0].tx_bytes, 30_000);

    let hourly = accountant.hourly(24, Some("eth0"), None).await.unwrap();
    assert_eq!(hourly.len(), 1);
    assert_eq!(hourly[0].rx_bytes, 90_000);
}

#[tokio::test]
async fn reboot_counts_from_current_value() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(FakeIptables::new());
    let accountant = accountant_with(&dir, host.clone()).await;
    let net_dev = dir.path().join("net_dev");

    write_net_dev(&net_dev, 1_000_000, 0);
    accountant.collect_snapshot().await.unwrap();
    write_net_dev(&net_dev, 1_050_000, 0);
    accountant.collect_snapshot().await.unwrap();

    // Reboot: the counter shrank, so the new value itself is the delta.
    write_net_dev(&net_dev, 4_000, 0);
    accountant.collect_snapshot().await.unwrap();

    let total = accountant.total_traffic(30).await.unwrap();
    assert_eq!(total.rx_bytes, 54_000);
}

#[tokio::test]
async fn port_counters_tracked_after_add() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(FakeIptables::new());
    let accountant = accountant_with(&dir, host.clone()).await;

    let added = accountant.add_tracked_port(443).await;
    assert!(added.success, "{}", added.message);
    assert_eq!(accountant.tracked_ports().await, vec![443]);

    let again = accountant.add_tracked_port(443).await;
    assert!(!again.success);

    host.set_counters(443, 10_000, 4_000).await;
    accountant.collect_snapshot().await.unwrap();
    host.set_counters(443, 25_000, 9_000).await;
    accountant.collect_snapshot().await.unwrap();

    let ports = accountant.port_summary(30).await.unwrap();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].port, 443);
    assert_eq!(ports[0].rx_bytes, 15_000);
    assert_eq!(ports[0].tx_bytes, 5_000);

    let removed = accountant.remove_tracked_port(443).await;
    assert!(removed.success);
    assert!(accountant.tracked_ports().await.is_empty());
}

#[tokio::test]
async fn state_file_preserves_baselines_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let net_dev = dir.path().join("net_dev");

    {
        let host = Arc::new(FakeIptables::new());
        let accountant = accountant_with(&dir, host).await;
        write_net_dev(&net_dev, 2_000_000, 800_000);
        accountant.collect_snapshot().await.unwrap();
        accountant.save_state().await;
    }

    // Restart with counters grown: only the growth is recorded.
    let host = Arc::new(FakeIptables::new());
    let accountant = TrafficAccountant::init(
        host as Arc<dyn HostRunner>,
        TrafficConfig {
            db_path: dir.path().join("traffic.db"),
            collect_interval: 60,
            retention_days: 30,
            proc_net_dev: net_dev.clone(),
        },
    )
    .await
    .unwrap();

    write_net_dev(&net_dev, 2_010_000, 804_000);
    accountant.collect_snapshot().await.unwrap();

    let total = accountant.total_traffic(30).await.unwrap();
    assert_eq!(total.rx_bytes, 10_000);
    assert_eq!(total.tx_bytes, 4_000);
}
