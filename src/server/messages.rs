//! Data types carried by the RPC surface.

use std::collections::HashMap;
use std::fmt;

use crate::server::ReplicaId;
use crate::utils::MetasyncError;

use serde::{Deserialize, Serialize};

/// Leadership epoch number.
pub type Term = u64;

/// Position in the replicated log. The log is 0-indexed without a sentinel;
/// `-1` denotes "no entry".
pub type LogIndex = i64;

/// Version number of a file's metadata.
pub type Version = i32;

/// Metadata of one file: its version and ordered list of block hashes.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct FileMetaData {
    pub filename: String,
    pub version: Version,
    pub block_hash_list: Vec<String>,
}

impl FileMetaData {
    pub fn new(
        filename: impl ToString,
        version: Version,
        block_hash_list: Vec<String>,
    ) -> Self {
        FileMetaData {
            filename: filename.to_string(),
            version,
            block_hash_list,
        }
    }
}

/// Map from filename -> its metadata.
pub type FileInfoMap = HashMap<String, FileMetaData>;

/// Map from block store address -> block hashes it is responsible for.
pub type BlockStoreMap = HashMap<String, Vec<String>>;

/// One entry of the replicated log. `operation == None` marks the no-op entry
/// a leader appends on accession.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub operation: Option<FileMetaData>,
}

impl LogEntry {
    /// Makes a no-op entry of given term.
    pub fn noop(term: Term) -> Self {
        LogEntry {
            term,
            operation: None,
        }
    }
}

/// Role of a node.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Leader,
    Crashed,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// AppendEntries call arguments.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: Term,
    pub leader_id: ReplicaId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

/// AppendEntries call reply.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
    pub matched_index: LogIndex,
}

/// Observation-only snapshot of a node's internals.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct InternalState {
    pub role: Role,
    pub term: Term,
    pub commit_index: LogIndex,
    pub log: Vec<LogEntry>,
    pub meta_map: FileInfoMap,
}

/// Request sent to a node.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    // consensus
    AppendEntries(AppendEntriesArgs),
    SetLeader,
    SendHeartbeat,

    // client-facing
    UpdateFile(FileMetaData),
    GetFileInfoMap,
    GetBlockStoreMap { hashes: Vec<String> },
    GetBlockStoreAddrs,

    // test/chaos
    GetInternalState,
    Crash,
    MakeServerUnreachableFrom { server_ids: Vec<ReplicaId> },
    Restore,
}

/// Reply from a node.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum RpcReply {
    AppendEntries(AppendEntriesReply),
    Success(bool),
    Version(Version),
    FileInfoMap(FileInfoMap),
    BlockStoreMap(BlockStoreMap),
    BlockStoreAddrs(Vec<String>),
    InternalState(Box<InternalState>),
    Error(MetasyncError),
}

impl RpcReply {
    /// Converts an operation result into a reply, mapping errors in-band.
    pub fn from_result<T>(
        result: Result<T, MetasyncError>,
        wrap: impl FnOnce(T) -> RpcReply,
    ) -> Self {
        match result {
            Ok(v) => wrap(v),
            Err(e) => RpcReply::Error(e),
        }
    }
}
