//! Replicated log entry types.

use serde::{Deserialize, Serialize};

/// Cluster membership record, persisted through the metadata store and
/// replicated through configuration entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub members: Vec<String>,
}

impl Configuration {
    pub fn new(members: Vec<String>) -> Configuration {
        Configuration { members }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.iter().any(|m| m == id)
    }
}

/// A replicated service operation.
///
/// `timestamp` is the wall-clock reading stamped by the leader when the
/// command was accepted; it drives the replicated clock on every replica.
/// `args` is the service-specific operation, encoded with bincode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub session: u64,
    pub timestamp: u64,
    pub service: String,
    pub args: Vec<u8>,
}

/// A single log entry.
///
/// The variants form a closed set; application dispatches exhaustively on
/// them. Entries with the same index and term are identical on every
/// replica that holds them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entry {
    Command {
        term: u64,
        command: Command,
    },
    Configuration {
        term: u64,
        cluster: Configuration,
    },
    Snapshot {
        term: u64,
        cluster: Configuration,
        data: Vec<u8>,
    },
    NoOp {
        term: u64,
    },
}

impl Entry {
    pub fn term(&self) -> u64 {
        match self {
            Entry::Command { term, .. } => *term,
            Entry::Configuration { term, .. } => *term,
            Entry::Snapshot { term, .. } => *term,
            Entry::NoOp { term } => *term,
        }
    }
}
