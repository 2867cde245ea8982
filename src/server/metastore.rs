//! Metadata store driven by the apply engine, and the consistent-hash ring
//! that maps blocks onto block store servers.

use std::collections::BTreeMap;

use crate::server::{BlockStoreMap, FileInfoMap, FileMetaData, Version};
use crate::utils::MetasyncError;

use sha2::{Digest, Sha256};

/// Block hash list marking a deleted file.
pub const TOMBSTONE_HASH_LIST: &[&str] = &["0"];

/// Block hash list marking an empty file.
pub const EMPTY_FILE_HASH_LIST: &[&str] = &["-1"];

/// Interface of the metadata store that committed log entries are applied to.
pub trait MetaStore: Send + Sync {
    /// Applies an update, returning the file's resulting version.
    fn update_file(
        &mut self,
        meta: &FileMetaData,
    ) -> Result<Version, MetasyncError>;

    /// Snapshot of all file metadata.
    fn file_info_map(&self) -> FileInfoMap;

    /// Groups given block hashes by the block store responsible for each.
    fn block_store_map(&self, hashes: &[String]) -> BlockStoreMap;

    /// Configured block store addresses.
    fn block_store_addrs(&self) -> Vec<String>;
}

/// Consistent-hash ring over block store addresses.
#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    /// Map from ring position (hex digest) -> server address.
    ring: BTreeMap<String, String>,
}

impl ConsistentHashRing {
    /// Places every given server on the ring.
    pub fn new(addrs: &[String]) -> Self {
        let ring = addrs
            .iter()
            .map(|addr| {
                (Self::hash(&format!("blockstore{}", addr)), addr.clone())
            })
            .collect();
        ConsistentHashRing { ring }
    }

    /// Hex-encoded SHA-256 digest of a string.
    pub fn hash(s: &str) -> String {
        hex::encode(Sha256::digest(s.as_bytes()))
    }

    /// Server responsible for the given block hash: the first one whose ring
    /// position is strictly greater, wrapping around to the smallest.
    pub fn responsible_server(&self, block_hash: &str) -> Option<&String> {
        use std::ops::Bound::{Excluded, Unbounded};
        self.ring
            .range::<str, _>((Excluded(block_hash), Unbounded))
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, addr)| addr)
    }
}

/// In-memory metadata store with last-writer-wins by filename, subject to the
/// successor-version rule.
#[derive(Debug, Clone)]
pub struct MemMetaStore {
    file_meta_map: FileInfoMap,
    block_store_addrs: Vec<String>,
    ring: ConsistentHashRing,
}

impl MemMetaStore {
    pub fn new(block_store_addrs: Vec<String>) -> Self {
        let ring = ConsistentHashRing::new(&block_store_addrs);
        MemMetaStore {
            file_meta_map: FileInfoMap::new(),
            block_store_addrs,
            ring,
        }
    }
}

impl MetaStore for MemMetaStore {
    fn update_file(
        &mut self,
        meta: &FileMetaData,
    ) -> Result<Version, MetasyncError> {
        let current = self
            .file_meta_map
            .get(&meta.filename)
            .map_or(0, |m| m.version);
        if meta.version != current + 1 {
            return Err(MetasyncError::VersionMismatch {
                filename: meta.filename.clone(),
                current,
            });
        }
        self.file_meta_map
            .insert(meta.filename.clone(), meta.clone());
        Ok(meta.version)
    }

    fn file_info_map(&self) -> FileInfoMap {
        self.file_meta_map.clone()
    }

    fn block_store_map(&self, hashes: &[String]) -> BlockStoreMap {
        let mut map = BlockStoreMap::new();
        for hash in hashes {
            if let Some(server) = self.ring.responsible_server(hash) {
                map.entry(server.clone()).or_default().push(hash.clone());
            }
        }
        map
    }

    fn block_store_addrs(&self) -> Vec<String> {
        self.block_store_addrs.clone()
    }
}
