//! Metadata server functionality modules: replicated log, consensus node,
//! apply engine, chaos controls, and the RPC listener.

mod cluster;
mod control;
mod execution;
mod external;
mod messages;
mod metastore;
mod node;
mod raftlog;
mod replication;
mod transport;

/// Server replica ID type; also a node's index into the cluster address list.
pub type ReplicaId = u8;

pub use cluster::{ClusterConfig, DEFAULT_BLOCK_SIZE};
pub use external::RaftServer;
pub use messages::{
    AppendEntriesArgs, AppendEntriesReply, BlockStoreMap, FileInfoMap,
    FileMetaData, InternalState, LogEntry, LogIndex, Role, RpcReply,
    RpcRequest, Term, Version,
};
pub use metastore::{
    ConsistentHashRing, MemMetaStore, MetaStore, EMPTY_FILE_HASH_LIST,
    TOMBSTONE_HASH_LIST,
};
pub use node::{RaftNode, ReplicaConfigRaft};
pub use raftlog::RaftLog;
pub use transport::{RaftTransport, TcpTransport};
