//! Cluster-level client that finds whichever node can serve a request.

use std::net::SocketAddr;

use crate::client::RpcStub;
use crate::server::{BlockStoreMap, FileInfoMap, FileMetaData, Version};
use crate::utils::MetasyncError;

use tokio::time::Duration;

/// Client talking to a whole cluster. Each request is tried against the
/// nodes in order, starting from the last one that served successfully,
/// moving on whenever a node answers with an error another node might not
/// give (not leader, crashed, unreachable, timed out).
pub struct MetaClient {
    stubs: Vec<RpcStub>,

    /// Index of the node that last served a request.
    preferred: usize,
}

impl MetaClient {
    pub fn new(
        addrs: &[SocketAddr],
        timeout: Duration,
    ) -> Result<Self, MetasyncError> {
        if addrs.is_empty() {
            return Err(MetasyncError::msg("no server addresses given"));
        }
        Ok(MetaClient {
            stubs: addrs
                .iter()
                .map(|&addr| RpcStub::new(addr, timeout))
                .collect(),
            preferred: 0,
        })
    }

    /// Index of the node that served the latest request.
    #[inline]
    pub fn preferred(&self) -> usize {
        self.preferred
    }

    /// Updates a file's metadata, returning its new version.
    pub async fn update_file(
        &mut self,
        meta: &FileMetaData,
    ) -> Result<Version, MetasyncError> {
        let mut last_err = MetasyncError::NotLeader;
        for i in self.try_order() {
            match self.stubs[i].update_file(meta.clone()).await {
                Ok(version) => {
                    self.preferred = i;
                    return Ok(version);
                }
                Err(e) if e.is_retryable_elsewhere() => {
                    pf_debug!("update via {} failed: {}", i, e);
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    pub async fn get_file_info_map(
        &mut self,
    ) -> Result<FileInfoMap, MetasyncError> {
        let mut last_err = MetasyncError::NotLeader;
        for i in self.try_order() {
            match self.stubs[i].get_file_info_map().await {
                Ok(map) => {
                    self.preferred = i;
                    return Ok(map);
                }
                Err(e) if e.is_retryable_elsewhere() => last_err = e,
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    pub async fn get_block_store_map(
        &mut self,
        hashes: &[String],
    ) -> Result<BlockStoreMap, MetasyncError> {
        let mut last_err = MetasyncError::NotLeader;
        for i in self.try_order() {
            match self.stubs[i].get_block_store_map(hashes.to_vec()).await {
                Ok(map) => {
                    self.preferred = i;
                    return Ok(map);
                }
                Err(e) if e.is_retryable_elsewhere() => last_err = e,
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    pub async fn get_block_store_addrs(
        &mut self,
    ) -> Result<Vec<String>, MetasyncError> {
        let mut last_err = MetasyncError::NotLeader;
        for i in self.try_order() {
            match self.stubs[i].get_block_store_addrs().await {
                Ok(addrs) => {
                    self.preferred = i;
                    return Ok(addrs);
                }
                Err(e) if e.is_retryable_elsewhere() => last_err = e,
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    fn try_order(&self) -> Vec<usize> {
        let n = self.stubs.len();
        (0..n).map(|k| (self.preferred + k) % n).collect()
    }
}
