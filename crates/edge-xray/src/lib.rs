//! Xray access-log processing on the node: in-memory visit aggregation
//! for the panel's stats pipeline, and torrent detection with ipset
//! temp bans.

pub mod error;
pub mod ingest;
pub mod torrent;

pub use error::{Result, XrayError};
pub use ingest::{IngesterStatus, XrayLogIngester};
pub use torrent::{BlockerStatus, ConnectionTracker, TorrentBlocker};
