//! Edgewatch panel: fleet collection, Xray stats aggregation, blocklist
//! synchronization, alerting and anomaly analysis over a relational
//! store, plus the HTTP API that fronts it all.

pub mod alerter;
pub mod anomaly;
pub mod api;
pub mod asn;
pub mod blocklist;
pub mod collector;
pub mod config;
pub mod error;
pub mod infra;
pub mod node_client;
pub mod remnawave;
pub mod store;
pub mod telegram;
pub mod xray_aggregator;

pub use error::{PanelError, Result};
