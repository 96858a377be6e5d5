//! Raft replica core.
//!
//! This module provides the per-replica consensus state: durable metadata,
//! the replicated log, the replica context and the request-handling logic
//! shared by all non-leader roles.

pub mod entry;
pub mod follower;
pub mod log;
pub mod message;
pub mod meta;
pub mod replica;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::raft::entry::Command;

/// Where replica state may live. The `<term, vote>` metadata record is
/// disk-backed at every level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLevel {
    Memory,
    #[default]
    Disk,
}

/// State machine driven by committed log entries.
///
/// All calls arrive on the replica's apply thread, in log-index order.
pub trait StateMachine: Send {
    /// Applies a committed command. Service-level failures are consumed by
    /// the implementation; the entry counts as applied either way.
    fn apply_command(&mut self, index: u64, command: &Command);

    /// Captures the current state for log compaction. `None` opts out of
    /// producing a snapshot at this point.
    fn snapshot(&self) -> Result<Option<Vec<u8>>>;

    /// Installs a snapshot produced by `snapshot` on some replica.
    fn install_snapshot(&mut self, index: u64, data: &[u8]) -> Result<()>;

    /// A client session was expired by the cluster.
    fn session_expired(&mut self, session: u64);

    /// A client session was closed by the client.
    fn session_closed(&mut self, session: u64);
}
