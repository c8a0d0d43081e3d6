//! Host firewall and blocklist drivers for the node agent.
//!
//! Thin adapters over UFW, iptables and ipset; every mutation runs in
//! the host namespace through the shared host runner.

pub mod error;
pub mod firewall;
pub mod ipset;

pub use error::{NetworkError, Result};
pub use firewall::{FirewallDriver, FirewallRule, FirewallStatus};
pub use ipset::{IpsetDriver, DEFAULT_PERSISTENT_FILE, DEFAULT_TEMP_TIMEOUT};
