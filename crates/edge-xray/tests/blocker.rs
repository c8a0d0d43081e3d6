//! Torrent blocker behavior tests against an in-memory ipset host.

use async_trait::async_trait;
use edge_exec::{CommandOutput, HostRunner};
use edge_network::IpsetDriver;
use edge_types::Direction;
use edge_xray::TorrentBlocker;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct FakeHost {
    sets: Mutex<HashMap<String, BTreeSet<String>>>,
    conntrack_deletes: Mutex<Vec<String>>,
}

#[async_trait]
impl HostRunner for FakeHost {
    async fn run(&self, program: &str, args: &[&str], _timeout: Duration) -> CommandOutput {
        match program {
            "ipset" => {
                let mut sets = self.sets.lock().await;
                match args {
                    ["create", name, ..] => {
                        sets.entry(name.to_string()).or_default();
                        ok()
                    }
                    ["list", name] => match sets.get(*name) {
                        Some(set) => CommandOutput {
                            success: true,
                            stdout: format!(
                                "Members:\n{}",
                                set.iter().cloned().collect::<Vec<_>>().join("\n")
                            ),
                            stderr: String::new(),
                        },
                        None => CommandOutput::failure("does not exist"),
                    },
                    ["test", name, ip] => {
                        if sets.get(*name).map(|s| s.contains(*ip)).unwrap_or(false) {
                            ok()
                        } else {
                            CommandOutput::failure("is NOT in set")
                        }
                    }
                    ["add", name, ip, ..] => {
                        sets.entry(name.to_string()).or_default().insert(ip.to_string());
                        ok()
                    }
                    ["del", name, ip] => {
                        if sets.get_mut(*name).map(|s| s.remove(*ip)).unwrap_or(false) {
                            ok()
                        } else {
                            CommandOutput::failure("not in set")
                        }
                    }
                    _ => ok(),
                }
            }
            "iptables" | "mkdir" => ok(),
            "conntrack" => {
                if let ["-D", "-s", ip] = args {
                    self.conntrack_deletes.lock().await.push(ip.to_string());
                }
                ok()
            }
            _ => CommandOutput::failure("Command not found"),
        }
    }
}

fn ok() -> CommandOutput {
    CommandOutput {
        success: true,
        ..Default::default()
    }
}

async fn blocker_with(dir: &tempfile::TempDir) -> (Arc<TorrentBlocker>, Arc<FakeHost>) {
    let host = Arc::new(FakeHost::default());
    let ipset = Arc::new(IpsetDriver::with_persistent_file(
        host.clone() as Arc<dyn HostRunner>,
        dir.path().join("blocklist.json"),
    ));
    ipset.init().await.unwrap();
    let blocker = Arc::new(TorrentBlocker::with_paths(
        ipset,
        host.clone() as Arc<dyn HostRunner>,
        "remnanode",
        "/var/log/supervisor/xray.out.log",
        dir.path().join("torrent_blocker.json"),
    ));
    (blocker, host)
}

fn torrent_line(ip: &str) -> String {
    format!(
        "2024/06/01 12:00:00.1 from tcp:{}:42000 accepted tcp:1.2.3.4:6881 [inbound -> torrent]",
        ip
    )
}

fn raw_dest_line(src: &str, dest: &str) -> String {
    format!(
        "2024/06/01 12:00:00.1 from {}:42000 accepted tcp:{}:6881 [inbound -> direct] email: 7",
        src, dest
    )
}

#[tokio::test]
async fn tag_line_temp_bans_source() {
    let dir = tempfile::tempdir().unwrap();
    let (blocker, host) = blocker_with(&dir).await;

    blocker.handle_line(&torrent_line("5.5.5.5")).await;

    let status = blocker.status().await;
    assert_eq!(status.total_blocked, 1);
    assert_eq!(status.tag_blocks, 1);
    assert_eq!(status.active_ips, vec!["5.5.5.5"]);

    // Existing sessions are killed with the ban.
    assert_eq!(*host.conntrack_deletes.lock().await, vec!["5.5.5.5"]);
}

#[tokio::test]
async fn dedup_window_prevents_repeat_bans() {
    let dir = tempfile::tempdir().unwrap();
    let (blocker, _host) = blocker_with(&dir).await;

    blocker.handle_line(&torrent_line("5.5.5.5")).await;
    blocker.handle_line(&torrent_line("5.5.5.5")).await;
    blocker.handle_line(&torrent_line("5.5.5.5")).await;

    assert_eq!(blocker.status().await.total_blocked, 1);
}

#[tokio::test]
async fn whitelisted_source_is_never_banned() {
    let dir = tempfile::tempdir().unwrap();
    let (blocker, _host) = blocker_with(&dir).await;

    // RFC 1918 is whitelisted by default.
    blocker.handle_line(&torrent_line("192.168.1.50")).await;
    assert_eq!(blocker.status().await.total_blocked, 0);
}

#[tokio::test]
async fn behavior_detector_bans_at_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let (blocker, _host) = blocker_with(&dir).await;
    blocker.set_behavior_threshold(10).await;

    for i in 0..10 {
        let dest = format!("1.2.3.{}", i);
        blocker.handle_line(&raw_dest_line("6.6.6.6", &dest)).await;
    }

    let status = blocker.status().await;
    assert_eq!(status.behavior_blocks, 1);
    assert_eq!(status.active_ips, vec!["6.6.6.6"]);
}

#[tokio::test]
async fn domain_destinations_do_not_trip_behavior_detector() {
    let dir = tempfile::tempdir().unwrap();
    let (blocker, _host) = blocker_with(&dir).await;
    blocker.set_behavior_threshold(5).await;

    for i in 0..50 {
        let dest = format!("site{}.example.com", i);
        blocker.handle_line(&raw_dest_line("7.7.7.7", &dest)).await;
    }
    assert_eq!(blocker.status().await.total_blocked, 0);
}

#[tokio::test]
async fn threshold_is_clamped() {
    let dir = tempfile::tempdir().unwrap();
    let (blocker, _host) = blocker_with(&dir).await;

    blocker.set_behavior_threshold(1).await;
    assert_eq!(blocker.behavior_threshold().await, 5);
    blocker.set_behavior_threshold(50_000).await;
    assert_eq!(blocker.behavior_threshold().await, 1000);
}

#[tokio::test]
async fn whitelist_change_unbans_existing_entries() {
    let dir = tempfile::tempdir().unwrap();
    let (blocker, _host) = blocker_with(&dir).await;

    blocker.handle_line(&torrent_line("5.5.5.5")).await;
    assert_eq!(blocker.status().await.active_ips, vec!["5.5.5.5"]);

    let mut whitelist = blocker.whitelist().await;
    whitelist.push("5.5.5.0/24".to_string());
    blocker.set_whitelist(whitelist).await;

    assert!(blocker.status().await.active_ips.is_empty());
}

#[tokio::test]
async fn enabled_state_persists() {
    let dir = tempfile::tempdir().unwrap();

    {
        let (blocker, _host) = blocker_with(&dir).await;
        blocker.start().await;
        blocker.graceful_stop().await;
    }

    // Same state file, fresh blocker: still flagged enabled.
    let host = Arc::new(FakeHost::default());
    let ipset = Arc::new(IpsetDriver::with_persistent_file(
        host.clone() as Arc<dyn HostRunner>,
        dir.path().join("blocklist.json"),
    ));
    let blocker = TorrentBlocker::with_paths(
        ipset,
        host as Arc<dyn HostRunner>,
        "remnanode",
        "/var/log/supervisor/xray.out.log",
        dir.path().join("torrent_blocker.json"),
    );
    assert!(blocker.is_enabled());
}
