//! Integration tests for the ipset driver against an in-memory host.

use async_trait::async_trait;
use edge_exec::{CommandOutput, HostRunner};
use edge_network::IpsetDriver;
use edge_types::Direction;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Emulates just enough of ipset/iptables for driver tests.
#[derive(Default)]
struct FakeHost {
    sets: Mutex<HashMap<String, BTreeSet<String>>>,
    rules: Mutex<HashSet<String>>,
}

#[async_trait]
impl HostRunner for FakeHost {
    async fn run(&self, program: &str, args: &[&str], _timeout: Duration) -> CommandOutput {
        match program {
            "ipset" => self.handle_ipset(args).await,
            "iptables" => self.handle_iptables(args).await,
            "mkdir" => CommandOutput {
                success: true,
                ..Default::default()
            },
            _ => CommandOutput::failure("Command not found"),
        }
    }
}

impl FakeHost {
    async fn handle_ipset(&self, args: &[&str]) -> CommandOutput {
        let mut sets = self.sets.lock().await;
        match args {
            ["create", name, ..] => {
                if sets.contains_key(*name) {
                    CommandOutput::failure("set with the same name already exists")
                } else {
                    sets.insert(name.to_string(), BTreeSet::new());
                    CommandOutput {
                        success: true,
                        ..Default::default()
                    }
                }
            }
            ["destroy", name] => {
                sets.remove(*name);
                CommandOutput {
                    success: true,
                    ..Default::default()
                }
            }
            ["flush", name] => match sets.get_mut(*name) {
                Some(set) => {
                    set.clear();
                    CommandOutput {
                        success: true,
                        ..Default::default()
                    }
                }
                None => CommandOutput::failure("The set with the given name does not exist"),
            },
            ["list", name] => match sets.get(*name) {
                Some(set) => {
                    let members: Vec<_> = set.iter().cloned().collect();
                    CommandOutput {
                        success: true,
                        stdout: format!(
                            "Name: {}\nType: hash:net\nMembers:\n{}",
                            name,
                            members.join("\n")
                        ),
                        stderr: String::new(),
                    }
                }
                None => CommandOutput::failure("The set with the given name does not exist"),
            },
            ["test", name, ip] => match sets.get(*name) {
                Some(set) if set.contains(*ip) => CommandOutput {
                    success: true,
                    ..Default::default()
                },
                _ => CommandOutput::failure(format!("{} is NOT in set {}", ip, name)),
            },
            ["add", name, ip, ..] => match sets.get_mut(*name) {
                Some(set) => {
                    if set.insert(ip.to_string()) {
                        CommandOutput {
                            success: true,
                            ..Default::default()
                        }
                    } else {
                        CommandOutput::failure("Element cannot be added: already added")
                    }
                }
                None => CommandOutput::failure("The set with the given name does not exist"),
            },
            ["del", name, ip] => match sets.get_mut(*name) {
                Some(set) => {
                    if set.remove(*ip) {
                        CommandOutput {
                            success: true,
                            ..Default::default()
                        }
                    } else {
                        CommandOutput::failure("Element cannot be deleted: not in set")
                    }
                }
                None => CommandOutput::failure("The set with the given name does not exist"),
            },
            _ => CommandOutput::failure("unsupported ipset invocation"),
        }
    }

    async fn handle_iptables(&self, args: &[&str]) -> CommandOutput {
        let mut rules = self.rules.lock().await;
        let key = args[1..].join(" ");
        match args.first() {
            Some(&"-C") => {
                if rules.contains(&key) {
                    CommandOutput {
                        success: true,
                        ..Default::default()
                    }
                } else {
                    CommandOutput::failure("No chain/target/match by that name")
                }
            }
            Some(&"-I") | Some(&"-A") => {
                rules.insert(key);
                CommandOutput {
                    success: true,
                    ..Default::default()
                }
            }
            Some(&"-D") => {
                rules.remove(&key);
                CommandOutput {
                    success: true,
                    ..Default::default()
                }
            }
            _ => CommandOutput::failure("unsupported iptables invocation"),
        }
    }
}

fn driver(dir: &tempfile::TempDir) -> (IpsetDriver, Arc<FakeHost>) {
    let host = Arc::new(FakeHost::default());
    let driver = IpsetDriver::with_persistent_file(
        host.clone() as Arc<dyn HostRunner>,
        dir.path().join("blocklist.json"),
    );
    (driver, host)
}

#[tokio::test]
async fn init_creates_sets_and_rules() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, host) = driver(&dir);

    driver.init().await.unwrap();

    let sets = host.sets.lock().await;
    for name in [
        "blocklist_permanent",
        "blocklist_temp",
        "blocklist_out_permanent",
        "blocklist_out_temp",
    ] {
        assert!(sets.contains_key(name), "missing set {}", name);
    }
    drop(sets);

    let status = driver.status().await;
    assert!(status.incoming.iptables_rules_exist);
    assert!(status.outgoing.iptables_rules_exist);
}

#[tokio::test]
async fn sync_reports_diff_accounting() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, _host) = driver(&dir);
    driver.init().await.unwrap();

    driver
        .add("1.1.1.1", true, Direction::In)
        .await
        .unwrap();
    driver
        .add("2.2.2.2", true, Direction::In)
        .await
        .unwrap();

    let outcome = driver
        .sync(
            &[
                "2.2.2.2".to_string(),
                "3.3.3.3".to_string(),
                "junk".to_string(),
            ],
            true,
            Direction::In,
        )
        .await
        .unwrap();

    assert_eq!(outcome.total, 2);
    assert_eq!(outcome.added, 1);
    assert_eq!(outcome.removed, 1);
    assert_eq!(outcome.invalid, vec!["junk"]);

    let mut members = driver.list(true, Direction::In).await;
    members.sort();
    assert_eq!(members, vec!["2.2.2.2", "3.3.3.3"]);
}

#[tokio::test]
async fn sync_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, _host) = driver(&dir);
    driver.init().await.unwrap();

    let ips = vec!["5.5.5.5".to_string(), "10.0.0.0/8".to_string()];
    let first = driver.sync(&ips, true, Direction::In).await.unwrap();
    assert_eq!(first.added, 2);

    let second = driver.sync(&ips, true, Direction::In).await.unwrap();
    assert_eq!(second.added, 0);
    assert_eq!(second.removed, 0);
    assert_eq!(second.total, 2);
}

#[tokio::test]
async fn slash32_normalized_before_set_membership() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, _host) = driver(&dir);
    driver.init().await.unwrap();

    driver
        .add("9.9.9.9/32", true, Direction::In)
        .await
        .unwrap();
    let members = driver.list(true, Direction::In).await;
    assert_eq!(members, vec!["9.9.9.9"]);

    // Syncing the bare form keeps the entry in place.
    let outcome = driver
        .sync(&["9.9.9.9".to_string()], true, Direction::In)
        .await
        .unwrap();
    assert_eq!(outcome.added, 0);
    assert_eq!(outcome.removed, 0);
}

#[tokio::test]
async fn permanent_entries_persist_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(FakeHost::default());
    let path = dir.path().join("blocklist.json");

    {
        let driver =
            IpsetDriver::with_persistent_file(host.clone() as Arc<dyn HostRunner>, &path);
        driver.init().await.unwrap();
        driver.add("8.8.8.8", true, Direction::Out).await.unwrap();
    }

    // Fresh host: sets are gone, state file remains.
    let host2 = Arc::new(FakeHost::default());
    let driver = IpsetDriver::with_persistent_file(host2 as Arc<dyn HostRunner>, &path);
    driver.init().await.unwrap();

    let members = driver.list(true, Direction::Out).await;
    assert_eq!(members, vec!["8.8.8.8"]);
}

#[tokio::test]
async fn set_timeout_rejects_out_of_range() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, _host) = driver(&dir);
    driver.init().await.unwrap();

    assert!(driver.set_timeout(0).await.is_err());
    assert!(driver.set_timeout(86_400 * 31).await.is_err());
    assert!(driver.set_timeout(1200).await.is_ok());
    assert_eq!(driver.temp_timeout(), 1200);
}

#[tokio::test]
async fn set_timeout_flushes_temp_entries() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, _host) = driver(&dir);
    driver.init().await.unwrap();

    driver.add("4.4.4.4", false, Direction::In).await.unwrap();
    assert_eq!(driver.list(false, Direction::In).await.len(), 1);

    driver.set_timeout(300).await.unwrap();
    // Recreating the temp set drops its entries by design.
    assert!(driver.list(false, Direction::In).await.is_empty());
    let status = driver.status().await;
    assert!(status.incoming.iptables_rules_exist);
}
