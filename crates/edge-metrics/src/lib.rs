//! Host metrics production for the node agent.
//!
//! Returns raw cumulative counters only; the panel derives all rates
//! from successive snapshots.

pub mod error;
pub mod proc;
pub mod producer;

pub use error::{MetricsError, Result};
pub use producer::MetricsProducer;
