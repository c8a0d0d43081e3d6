//! HAProxy management for the node agent.
//!
//! Owns the config file (rules live in a sentinel-delimited region),
//! drives the systemd service, and manages Let's Encrypt certificates
//! including the daily renewal cron. Host commands go through the
//! shared host executor.

pub mod certs;
pub mod config;
pub mod driver;
pub mod error;
pub mod service;

pub use certs::{CertInfo, CertOutcome, CronStatus, RenewAllOutcome};
pub use config::{HaproxyRule, RULES_END_MARKER, RULES_START_MARKER};
pub use driver::{ApplyOutcome, HaproxyDriver, HaproxyPaths, RuleUpdate};
pub use error::{HaproxyError, Result};
pub use service::ServiceStatus;
