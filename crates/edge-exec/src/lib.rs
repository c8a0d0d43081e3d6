//! Host command execution for the containerized node agent.
//!
//! The agent runs privileged with `pid: host`; commands destined for the
//! host are wrapped with `nsenter -t 1` so they execute in the host's
//! mount/UTS/net/IPC/PID/cgroup namespaces. On a bare host the wrapper
//! is skipped transparently.

pub mod error;
pub mod executor;
pub mod runner;

pub use error::{ExecError, Result};
pub use executor::{ExecEvent, ExecuteResult, HostExecutor, DEFAULT_TIMEOUT_SECS, MAX_TIMEOUT_SECS};
pub use runner::{detect_containerized, CommandOutput, HostRunner, NsenterRunner};
