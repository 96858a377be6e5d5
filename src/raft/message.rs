//! Request and response types exchanged between replicas.
//!
//! The encoding on the wire is left to the transport; these types carry the
//! protocol fields and derive serde so any self-describing codec works.
//! The ping probe fields are named `log_index`/`log_term` while the sync
//! check uses `prev_log_index`/`prev_log_term`; the names are part of the
//! wire contract even though the check is the same.

use serde::{Deserialize, Serialize};

use crate::raft::entry::Entry;

/// Leader heartbeat with an optional consistency probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingRequest {
    pub id: u64,
    pub term: u64,
    pub leader: Option<String>,
    pub log_index: u64,
    pub log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    pub id: u64,
    pub term: u64,
    pub accepted: bool,
}

/// Log replication request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub id: u64,
    pub term: u64,
    pub leader: Option<String>,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<Entry>,
    pub commit_index: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub id: u64,
    pub term: u64,
    pub accepted: bool,
    pub last_index: u64,
}

/// Vote request from a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollRequest {
    pub id: u64,
    pub term: u64,
    pub candidate: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub id: u64,
    pub term: u64,
    pub granted: bool,
}

/// Client command submission. Only the leader accepts these; every other
/// role answers with an error payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub id: u64,
    pub session: u64,
    pub service: String,
    pub args: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: u64,
    pub index: u64,
    pub error: Option<String>,
}
