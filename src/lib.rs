//! Metasync: a file-metadata service replicated across a fixed cluster with
//! a Raft-style log, with leadership assigned externally and fault-injection
//! hooks for deterministic testing.

#[macro_use]
mod utils;

mod client;
mod server;

// Helper utilities, functions, and macros
pub use utils::{
    log_prefix, logger_init, MetasyncError, ReplicaMap, ME, NODE_ID,
};

// Server-side types
#[doc(inline)]
pub use server::{
    AppendEntriesArgs, AppendEntriesReply, BlockStoreMap, ClusterConfig,
    ConsistentHashRing, FileInfoMap, FileMetaData, InternalState, LogEntry,
    LogIndex, MemMetaStore, MetaStore, RaftLog, RaftNode, RaftServer,
    RaftTransport, ReplicaConfigRaft, ReplicaId, Role, RpcReply, RpcRequest,
    TcpTransport, Term, Version, DEFAULT_BLOCK_SIZE, EMPTY_FILE_HASH_LIST,
    TOMBSTONE_HASH_LIST,
};

// Client-side types
#[doc(inline)]
pub use client::{MetaClient, RpcStub};
