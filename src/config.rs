//! Runtime configuration.
//!
//! This module handles runtime configuration including replica identity,
//! cluster membership, storage paths and compaction limits.

use log::warn;
use once_cell::sync::OnceCell;
use serde_derive::Deserialize;
use std::sync::Mutex;

use crate::raft::StorageLevel;

/// Global configuration instance
static INSTANCE: OnceCell<Mutex<RuntimeConfig>> = OnceCell::new();

/// Returns a reference to the global configuration instance
pub fn instance() -> &'static Mutex<RuntimeConfig> {
    INSTANCE.get_or_init(|| Mutex::new(RuntimeConfig::new()))
}

/// Configuration for a single cluster member
#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    /// Stable identity of the member
    pub id: String,
    /// Network address of the member
    pub addr: String,
}

/// Runtime configuration for one replica
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// This replica's identity
    pub id: String,
    /// Network address for replica communication
    pub addr: String,
    /// Network address for metrics collection
    pub metrics_addr: String,
    /// Base path for data storage
    pub base_path: String,
    /// Storage level for the log and the configuration record
    pub storage_level: StorageLevel,
    /// Live-entry count past which the log is compacted
    pub max_log_size: u64,
    /// All members of the cluster
    pub node_list: Vec<NodeConfig>,
}

impl RuntimeConfig {
    /// Creates a new RuntimeConfig with default values
    pub fn new() -> Self {
        RuntimeConfig {
            id: "n1".to_string(),
            addr: "0.0.0.0:4000".to_string(),
            metrics_addr: "0.0.0.0:4010".to_string(),
            base_path: "./data".to_string(),
            storage_level: StorageLevel::Disk,
            max_log_size: 65536,
            node_list: Vec::new(),
        }
    }

    /// Loads configuration from a TOML file, falling back to defaults when
    /// the file is missing or malformed.
    pub fn from_toml(path: &str) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return Some(RuntimeConfig::new());
            }
        };
        let config: RuntimeConfig = match toml::from_str(&contents) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return Some(RuntimeConfig::new());
            }
        };
        instance().lock().unwrap().clone_from(&config);
        Some(config)
    }

    /// Cluster member ids, this replica included.
    pub fn member_ids(&self) -> Vec<String> {
        if self.node_list.is_empty() {
            vec![self.id.clone()]
        } else {
            self.node_list.iter().map(|n| n.id.clone()).collect()
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::new()
    }
}
