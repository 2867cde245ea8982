//! Peer transport carrying AppendEntries calls to remote nodes.

use std::net::SocketAddr;

use crate::client::RpcStub;
use crate::server::{AppendEntriesArgs, AppendEntriesReply, ReplicaId};
use crate::utils::MetasyncError;

use async_trait::async_trait;

use tokio::sync::Mutex;
use tokio::time::Duration;

/// Outbound side of the consensus RPC surface. Any error returned is treated
/// by the replication coordinator as a non-response for that attempt.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Invokes AppendEntries on given peer.
    async fn append_entries(
        &self,
        peer: ReplicaId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, MetasyncError>;
}

/// TCP transport keeping one lazily (re)connected stub per remote peer.
pub struct TcpTransport {
    /// My replica ID.
    me: ReplicaId,

    /// Stubs indexed by peer ID; `None` at my own position.
    peers: Vec<Option<Mutex<RpcStub>>>,
}

impl TcpTransport {
    /// Creates a transport over all node addresses in ID order. No
    /// connection is made until the first call to a peer.
    pub fn new(
        me: ReplicaId,
        addrs: &[SocketAddr],
        rpc_timeout: Duration,
    ) -> Self {
        let peers = addrs
            .iter()
            .enumerate()
            .map(|(id, &addr)| {
                if id == me as usize {
                    None
                } else {
                    Some(Mutex::new(RpcStub::new(addr, rpc_timeout)))
                }
            })
            .collect();
        TcpTransport { me, peers }
    }
}

#[async_trait]
impl RaftTransport for TcpTransport {
    async fn append_entries(
        &self,
        peer: ReplicaId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, MetasyncError> {
        let stub = self
            .peers
            .get(peer as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                MetasyncError::msg(format!(
                    "invalid peer ID {} from {}",
                    peer, self.me
                ))
            })?;

        // one outstanding call per peer connection
        let mut stub = stub.lock().await;
        let reply = stub.append_entries(args).await;
        if let Err(ref e) = reply {
            pf_trace!("AppendEntries -> {} failed: {}", peer, e);
        }
        reply
    }
}
