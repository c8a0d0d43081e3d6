//! Per-port and per-interface traffic accounting for the node agent.
//!
//! Counters are read from `/proc/net/dev` and two dedicated iptables
//! chains; deltas are stored in a local SQLite time series with hourly,
//! daily and monthly roll-ups.

pub mod accountant;
pub mod error;
pub mod store;

pub use accountant::{
    calculate_delta, PortChange, TrafficAccountant, TrafficConfig, CHAIN_IN, CHAIN_OUT,
};
pub use error::{Result, TrafficError};
pub use store::{InterfaceTotals, PeriodTraffic, PortTotals, TotalTraffic};
