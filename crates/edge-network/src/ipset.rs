//! Host ipset blocklists, two directions with permanent and TTL'd sets.
//!
//! Four `hash:net` sets back the blocklists:
//!   in:  `blocklist_permanent`, `blocklist_temp`
//!   out: `blocklist_out_permanent`, `blocklist_out_temp`
//! Each is wired to INPUT or OUTPUT through a single
//! `-m set --match-set <set> src|dst -j DROP` rule, so temp bans need no
//! per-entry iptables work. Permanent contents and the temp TTL persist
//! in a JSON file and are replayed on init.

use crate::error::{NetworkError, Result};
use edge_exec::{CommandOutput, HostRunner};
use edge_types::{
    normalize_ip, validate_ip_cidr, Direction, DirectionStatus, IpsetStatus, IpsetSyncOutcome,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const DEFAULT_PERSISTENT_FILE: &str = "/var/lib/monitoring/blocklist.json";

const SET_PERMANENT: &str = "blocklist_permanent";
const SET_TEMP: &str = "blocklist_temp";
const SET_OUT_PERMANENT: &str = "blocklist_out_permanent";
const SET_OUT_TEMP: &str = "blocklist_out_temp";

/// Default TTL for temp bans: 10 minutes.
pub const DEFAULT_TEMP_TIMEOUT: u64 = 600;
const MAX_TEMP_TIMEOUT: u64 = 86_400 * 30;

const CMD_TIMEOUT: Duration = Duration::from_secs(30);

fn set_name(permanent: bool, direction: Direction) -> &'static str {
    match (direction, permanent) {
        (Direction::In, true) => SET_PERMANENT,
        (Direction::In, false) => SET_TEMP,
        (Direction::Out, true) => SET_OUT_PERMANENT,
        (Direction::Out, false) => SET_OUT_TEMP,
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct PersistedState {
    #[serde(default)]
    in_permanent: Vec<String>,
    #[serde(default)]
    out_permanent: Vec<String>,
    #[serde(default)]
    temp_timeout: Option<u64>,
    /// Pre-direction format kept only for reading old state files.
    #[serde(default, skip_serializing)]
    permanent: Vec<String>,
}

pub struct IpsetDriver {
    runner: Arc<dyn HostRunner>,
    persistent_file: PathBuf,
    temp_timeout: AtomicU64,
    initialized: AtomicBool,
    // Mutations are serialized per direction; reads are lock-free.
    in_lock: Mutex<()>,
    out_lock: Mutex<()>,
}

impl IpsetDriver {
    pub fn new(runner: Arc<dyn HostRunner>) -> Self {
        Self::with_persistent_file(runner, DEFAULT_PERSISTENT_FILE)
    }

    pub fn with_persistent_file(runner: Arc<dyn HostRunner>, path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            persistent_file: path.into(),
            temp_timeout: AtomicU64::new(DEFAULT_TEMP_TIMEOUT),
            initialized: AtomicBool::new(false),
            in_lock: Mutex::new(()),
            out_lock: Mutex::new(()),
        }
    }

    fn direction_lock(&self, direction: Direction) -> &Mutex<()> {
        match direction {
            Direction::In => &self.in_lock,
            Direction::Out => &self.out_lock,
        }
    }

    pub fn temp_timeout(&self) -> u64 {
        self.temp_timeout.load(Ordering::Relaxed)
    }

    async fn run_ipset(&self, args: &[&str]) -> CommandOutput {
        self.runner.run("ipset", args, CMD_TIMEOUT).await
    }

    async fn run_iptables(&self, args: &[&str]) -> CommandOutput {
        self.runner.run("iptables", args, CMD_TIMEOUT).await
    }

    // ── ipset primitives ──

    async fn set_exists(&self, name: &str) -> bool {
        self.run_ipset(&["list", name]).await.success
    }

    async fn create_set(&self, name: &str, with_timeout: bool) -> Result<()> {
        if self.set_exists(name).await {
            return Ok(());
        }
        let timeout = self.temp_timeout().to_string();
        let mut args = vec![
            "create", name, "hash:net", "family", "inet", "hashsize", "4096", "maxelem",
            "1000000",
        ];
        if with_timeout {
            args.push("timeout");
            args.push(&timeout);
        }
        let out = self.run_ipset(&args).await;
        if out.success {
            info!("created ipset: {}", name);
            Ok(())
        } else {
            error!("failed to create ipset {}: {}", name, out.stderr);
            Err(NetworkError::Ipset(format!(
                "Failed to create set: {}",
                out.stderr
            )))
        }
    }

    async fn ip_in_set(&self, ip: &str, name: &str) -> bool {
        self.run_ipset(&["test", name, ip]).await.success
    }

    // ── iptables DROP rules ──

    async fn iptables_rule_exists(&self, name: &str, direction: Direction) -> bool {
        self.run_iptables(&[
            "-C",
            direction.chain(),
            "-m",
            "set",
            "--match-set",
            name,
            direction.match_flag(),
            "-j",
            "DROP",
        ])
        .await
        .success
    }

    async fn add_iptables_rule(&self, name: &str, direction: Direction) -> Result<()> {
        if self.iptables_rule_exists(name, direction).await {
            return Ok(());
        }
        let out = self
            .run_iptables(&[
                "-I",
                direction.chain(),
                "-m",
                "set",
                "--match-set",
                name,
                direction.match_flag(),
                "-j",
                "DROP",
            ])
            .await;
        if out.success {
            info!("added iptables {} rule for {}", direction.chain(), name);
            Ok(())
        } else {
            error!("failed to add iptables rule for {}: {}", name, out.stderr);
            Err(NetworkError::Ipset(format!(
                "Failed to add rule: {}",
                out.stderr
            )))
        }
    }

    async fn remove_iptables_rule(&self, name: &str, direction: Direction) -> Result<()> {
        if !self.iptables_rule_exists(name, direction).await {
            return Ok(());
        }
        let out = self
            .run_iptables(&[
                "-D",
                direction.chain(),
                "-m",
                "set",
                "--match-set",
                name,
                direction.match_flag(),
                "-j",
                "DROP",
            ])
            .await;
        if out.success {
            info!("removed iptables {} rule for {}", direction.chain(), name);
            Ok(())
        } else {
            Err(NetworkError::Ipset(format!(
                "Failed to remove rule: {}",
                out.stderr
            )))
        }
    }

    // ── init / persistence ──

    /// Idempotent initialization: create all four sets and their DROP
    /// rules, then replay the persisted permanent lists.
    pub async fn init(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(dir) = self.persistent_file.parent() {
            let dir_str = dir.to_string_lossy().to_string();
            self.runner
                .run("mkdir", &["-p", &dir_str], CMD_TIMEOUT)
                .await;
        }

        let persisted = self.load_persisted();
        if let Some(timeout) = persisted.temp_timeout {
            self.temp_timeout.store(timeout, Ordering::Relaxed);
        }

        for direction in [Direction::In, Direction::Out] {
            self.create_set(set_name(true, direction), false).await?;
            self.create_set(set_name(false, direction), true).await?;
            self.add_iptables_rule(set_name(true, direction), direction)
                .await?;
            self.add_iptables_rule(set_name(false, direction), direction)
                .await?;
        }

        let mut legacy_in = persisted.permanent;
        let mut in_ips = persisted.in_permanent;
        if in_ips.is_empty() && !legacy_in.is_empty() {
            in_ips.append(&mut legacy_in);
        }

        for (direction, ips) in [(Direction::In, in_ips), (Direction::Out, persisted.out_permanent)]
        {
            if ips.is_empty() {
                continue;
            }
            let mut loaded = 0usize;
            for ip in &ips {
                if self.add_inner(ip, true, direction).await.is_ok() {
                    loaded += 1;
                }
            }
            info!("loaded {} {} permanent IPs from file", loaded, direction);
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!("ipset driver initialized (in + out)");
        Ok(())
    }

    fn load_persisted(&self) -> PersistedState {
        match std::fs::read_to_string(&self.persistent_file) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("failed to parse persisted blocklist: {}", e);
                PersistedState::default()
            }),
            Err(_) => PersistedState::default(),
        }
    }

    async fn save_persisted(&self) {
        let state = PersistedState {
            in_permanent: self.list(true, Direction::In).await,
            out_permanent: self.list(true, Direction::Out).await,
            temp_timeout: Some(self.temp_timeout()),
            permanent: Vec::new(),
        };
        if let Some(dir) = self.persistent_file.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        match serde_json::to_string_pretty(&state) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.persistent_file, json) {
                    error!("failed to save blocklist state: {}", e);
                } else {
                    debug!("saved blocklist state");
                }
            }
            Err(e) => error!("failed to serialize blocklist state: {}", e),
        }
    }

    // ── core operations ──

    async fn add_inner(&self, ip: &str, permanent: bool, direction: Direction) -> Result<String> {
        let ip = normalize_ip(ip);
        if !validate_ip_cidr(&ip) {
            return Err(NetworkError::Validation(format!("Invalid IP/CIDR: {}", ip)));
        }

        let name = set_name(permanent, direction);
        if self.ip_in_set(&ip, name).await {
            return Ok(format!("{} already in {}", ip, name));
        }

        let timeout = self.temp_timeout().to_string();
        let mut args = vec!["add", name, ip.as_str()];
        if !permanent {
            args.push("timeout");
            args.push(&timeout);
        }

        let out = self.run_ipset(&args).await;
        if out.success {
            info!("added {} to {}", ip, name);
            return Ok(format!("Added {} to {}", ip, name));
        }
        let stderr = out.stderr.to_lowercase();
        if stderr.contains("already added") || stderr.contains("already in set") {
            return Ok(format!("{} already in {}", ip, name));
        }
        error!("failed to add {} to {}: {}", ip, name, out.stderr);
        Err(NetworkError::Ipset(format!("Failed to add: {}", out.stderr)))
    }

    async fn remove_inner(&self, ip: &str, permanent: bool, direction: Direction) -> Result<String> {
        let ip = normalize_ip(ip);
        if !validate_ip_cidr(&ip) {
            return Err(NetworkError::Validation(format!("Invalid IP/CIDR: {}", ip)));
        }

        let name = set_name(permanent, direction);
        let out = self.run_ipset(&["del", name, &ip]).await;
        if out.success {
            info!("removed {} from {}", ip, name);
            return Ok(format!("Removed {} from {}", ip, name));
        }
        let stderr = out.stderr.to_lowercase();
        if stderr.contains("not in set") || stderr.contains("element is missing") {
            return Ok(format!("{} was not in {}", ip, name));
        }
        error!("failed to remove {} from {}: {}", ip, name, out.stderr);
        Err(NetworkError::Ipset(format!(
            "Failed to remove: {}",
            out.stderr
        )))
    }

    pub async fn add(&self, ip: &str, permanent: bool, direction: Direction) -> Result<String> {
        let _guard = self.direction_lock(direction).lock().await;
        let message = self.add_inner(ip, permanent, direction).await?;
        if permanent {
            self.save_persisted().await;
        }
        Ok(message)
    }

    pub async fn remove(&self, ip: &str, permanent: bool, direction: Direction) -> Result<String> {
        let _guard = self.direction_lock(direction).lock().await;
        let message = self.remove_inner(ip, permanent, direction).await?;
        if permanent {
            self.save_persisted().await;
        }
        Ok(message)
    }

    /// Add many entries. Returns `(succeeded, failed, errors)`.
    pub async fn bulk_add(
        &self,
        ips: &[String],
        permanent: bool,
        direction: Direction,
    ) -> (usize, usize, Vec<String>) {
        let _guard = self.direction_lock(direction).lock().await;
        let mut succeeded = 0;
        let mut failed = 0;
        let mut errors = Vec::new();
        for ip in ips {
            match self.add_inner(ip, permanent, direction).await {
                Ok(_) => succeeded += 1,
                Err(e) => {
                    failed += 1;
                    errors.push(format!("{}: {}", ip, e));
                }
            }
        }
        if permanent && succeeded > 0 {
            self.save_persisted().await;
        }
        (succeeded, failed, errors)
    }

    pub async fn bulk_remove(
        &self,
        ips: &[String],
        permanent: bool,
        direction: Direction,
    ) -> (usize, usize, Vec<String>) {
        let _guard = self.direction_lock(direction).lock().await;
        let mut succeeded = 0;
        let mut failed = 0;
        let mut errors = Vec::new();
        for ip in ips {
            match self.remove_inner(ip, permanent, direction).await {
                Ok(_) => succeeded += 1,
                Err(e) => {
                    failed += 1;
                    errors.push(format!("{}: {}", ip, e));
                }
            }
        }
        if permanent && succeeded > 0 {
            self.save_persisted().await;
        }
        (succeeded, failed, errors)
    }

    /// Replace the set contents with the authoritative list.
    ///
    /// Computes `to_add = new - current` and `to_remove = current - new`,
    /// applies both, persists, and reports counts. Idempotent: syncing
    /// the same list twice yields zero additions and removals.
    pub async fn sync(
        &self,
        ips: &[String],
        permanent: bool,
        direction: Direction,
    ) -> Result<IpsetSyncOutcome> {
        let _guard = self.direction_lock(direction).lock().await;

        let mut wanted: HashSet<String> = HashSet::new();
        let mut invalid = Vec::new();
        for ip in ips {
            let normalized = normalize_ip(ip);
            if validate_ip_cidr(&normalized) {
                wanted.insert(normalized);
            } else {
                invalid.push(ip.clone());
            }
        }

        let current: HashSet<String> = self
            .list(permanent, direction)
            .await
            .into_iter()
            .collect();

        let mut added = 0;
        let mut removed = 0;

        for ip in current.difference(&wanted) {
            if self.remove_inner(ip, permanent, direction).await.is_ok() {
                removed += 1;
            }
        }
        for ip in wanted.difference(&current) {
            if self.add_inner(ip, permanent, direction).await.is_ok() {
                added += 1;
            }
        }

        if permanent {
            self.save_persisted().await;
        }

        let outcome = IpsetSyncOutcome {
            total: wanted.len(),
            added,
            removed,
            invalid,
        };
        info!(
            "synced {}: added {}, removed {}",
            set_name(permanent, direction),
            outcome.added,
            outcome.removed
        );
        Ok(outcome)
    }

    /// List current members of a set. Parses the `Members:` section of
    /// `ipset list`.
    pub async fn list(&self, permanent: bool, direction: Direction) -> Vec<String> {
        let name = set_name(permanent, direction);
        let out = self.run_ipset(&["list", name]).await;
        if !out.success {
            error!("failed to list {}: {}", name, out.stderr);
            return Vec::new();
        }

        let mut ips = Vec::new();
        let mut in_members = false;
        for line in out.stdout.lines() {
            let line = line.trim();
            if line.starts_with("Members:") {
                in_members = true;
                continue;
            }
            if in_members && !line.is_empty() {
                if let Some(first) = line.split_whitespace().next() {
                    ips.push(first.to_string());
                }
            }
        }
        ips
    }

    pub async fn clear_set(&self, permanent: bool, direction: Direction) -> Result<String> {
        let _guard = self.direction_lock(direction).lock().await;
        let name = set_name(permanent, direction);
        let out = self.run_ipset(&["flush", name]).await;
        if out.success {
            info!("cleared {}", name);
            if permanent {
                self.save_persisted().await;
            }
            Ok(format!("Cleared {}", name))
        } else {
            error!("failed to clear {}: {}", name, out.stderr);
            Err(NetworkError::Ipset(format!(
                "Failed to clear: {}",
                out.stderr
            )))
        }
    }

    /// Change the temp-ban TTL. Recreates the temp sets, which destroys
    /// their current entries; a failed rebuild restores the old TTL and
    /// re-attaches the DROP rule.
    pub async fn set_timeout(&self, seconds: u64) -> Result<String> {
        if !(1..=MAX_TEMP_TIMEOUT).contains(&seconds) {
            return Err(NetworkError::Validation(format!(
                "Invalid timeout (1 - {} seconds)",
                MAX_TEMP_TIMEOUT
            )));
        }

        let _in_guard = self.in_lock.lock().await;
        let _out_guard = self.out_lock.lock().await;

        let old_timeout = self.temp_timeout();
        self.temp_timeout.store(seconds, Ordering::Relaxed);

        for direction in [Direction::In, Direction::Out] {
            let temp_set = set_name(false, direction);
            let _ = self.remove_iptables_rule(temp_set, direction).await;
            self.run_ipset(&["destroy", temp_set]).await;

            if let Err(e) = self.create_set(temp_set, true).await {
                self.temp_timeout.store(old_timeout, Ordering::Relaxed);
                let _ = self.create_set(temp_set, true).await;
                let _ = self.add_iptables_rule(temp_set, direction).await;
                return Err(NetworkError::Ipset(format!(
                    "Failed to recreate {} temp set: {}",
                    direction, e
                )));
            }
            self.add_iptables_rule(temp_set, direction).await?;
        }

        self.save_persisted().await;
        info!("changed temp timeout to {}s", seconds);
        Ok(format!("Timeout changed to {} seconds", seconds))
    }

    pub async fn status(&self) -> IpsetStatus {
        let mut statuses = Vec::with_capacity(2);
        for direction in [Direction::In, Direction::Out] {
            let rules_exist = self
                .iptables_rule_exists(set_name(true, direction), direction)
                .await
                && self
                    .iptables_rule_exists(set_name(false, direction), direction)
                    .await;
            statuses.push(DirectionStatus {
                permanent_count: self.list(true, direction).await.len(),
                temp_count: self.list(false, direction).await.len(),
                iptables_rules_exist: rules_exist,
            });
        }
        let outgoing = statuses.pop().unwrap_or(DirectionStatus {
            permanent_count: 0,
            temp_count: 0,
            iptables_rules_exist: false,
        });
        let incoming = statuses.pop().unwrap_or(DirectionStatus {
            permanent_count: 0,
            temp_count: 0,
            iptables_rules_exist: false,
        });
        IpsetStatus {
            incoming,
            outgoing,
            temp_timeout: self.temp_timeout(),
        }
    }
}
