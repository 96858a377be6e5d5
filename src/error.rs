//! Error types shared across the replica and service layers.

use thiserror::Error;

/// Errors produced by the replica, its storage, and the service runtime.
///
/// `Io`, `Codec`, `Corrupt` and `Compaction` are fatal to the replica;
/// `NotLeader` and `Closed` are reported back to the caller.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("log corrupt: {0}")]
    Corrupt(String),

    #[error("log compaction failed: {0}")]
    Compaction(String),

    #[error("Not the leader")]
    NotLeader,

    #[error("replica closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, RaftError>;
