//! Prometheus metrics for the replica.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Requests handled, by RPC method
    pub static ref RPC_COUNTER: IntCounterVec = IntCounterVec::new(
        Opts::new("raft_request_counter", "raft requests handled"),
        &["method"]
    )
    .unwrap();

    /// Command entries applied to the state machine
    pub static ref APPLIED_ENTRIES: IntCounter = IntCounter::new(
        "raft_applied_entries",
        "command entries applied to the state machine"
    )
    .unwrap();

    /// Log compactions performed
    pub static ref SNAPSHOTS: IntCounter =
        IntCounter::new("raft_snapshot_counter", "log compactions performed").unwrap();

    /// Current Raft term
    pub static ref CURRENT_TERM: IntGauge =
        IntGauge::new("raft_current_term", "current raft term").unwrap();
}

/// Registers all collectors with the global registry.
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(RPC_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(APPLIED_ENTRIES.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(SNAPSHOTS.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(CURRENT_TERM.clone()));
}
