//! Static cluster configuration, loaded once at startup.

use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use crate::server::ReplicaId;
use crate::utils::MetasyncError;

use serde::{Deserialize, Serialize};

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

/// Cluster-wide static configuration. A node's identity is its index into
/// `raft_addrs`.
///
/// Example file:
/// ```toml
/// raft_addrs = ["127.0.0.1:8080", "127.0.0.1:8081", "127.0.0.1:8082"]
/// block_addrs = ["127.0.0.1:8090"]
/// base_dir = "/tmp/metasync"
/// block_size = 4096
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Ordered list of Raft node addresses.
    pub raft_addrs: Vec<String>,

    /// Block store server addresses.
    #[serde(default)]
    pub block_addrs: Vec<String>,

    /// Base storage directory.
    #[serde(default)]
    pub base_dir: String,

    /// Block size in bytes.
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

impl ClusterConfig {
    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, MetasyncError> {
        let config: ClusterConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MetasyncError> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            MetasyncError::msg(format!(
                "failed to read config '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<(), MetasyncError> {
        if self.raft_addrs.is_empty() {
            return Err(MetasyncError::msg("raft_addrs is empty"));
        }
        if self.raft_addrs.len() > ReplicaId::MAX as usize {
            return Err(MetasyncError::msg(format!(
                "too many raft_addrs: {}",
                self.raft_addrs.len()
            )));
        }
        if self.block_size == 0 {
            return Err(MetasyncError::msg("block_size must be positive"));
        }
        let mut seen = HashSet::new();
        for addr in &self.raft_addrs {
            addr.parse::<SocketAddr>()?;
            if !seen.insert(addr) {
                return Err(MetasyncError::msg(format!(
                    "duplicate raft address '{}'",
                    addr
                )));
            }
        }
        Ok(())
    }

    /// Number of voting members.
    #[inline]
    pub fn population(&self) -> u8 {
        self.raft_addrs.len() as u8
    }

    /// Parsed socket address of every node, in ID order.
    pub fn socket_addrs(&self) -> Result<Vec<SocketAddr>, MetasyncError> {
        self.raft_addrs
            .iter()
            .map(|a| a.parse::<SocketAddr>().map_err(MetasyncError::from))
            .collect()
    }
}
