//! RPC listener: accepts connections and serves each with its own servant
//! thread, dispatching requests onto the consensus node.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::server::{
    ClusterConfig, MemMetaStore, RaftNode, ReplicaConfigRaft, ReplicaId,
    RpcReply, RpcRequest, TcpTransport,
};
use crate::utils::{
    read_frame, tcp_bind_with_retry, write_frame, MetasyncError, NODE_ID,
};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

impl RaftNode {
    /// Dispatches one request to its handler and wraps the outcome into a
    /// reply. Failures travel in-band as `RpcReply::Error`.
    pub async fn handle_request(&self, req: RpcRequest) -> RpcReply {
        match req {
            RpcRequest::AppendEntries(args) => RpcReply::from_result(
                self.append_entries(args).await,
                RpcReply::AppendEntries,
            ),
            RpcRequest::SetLeader => RpcReply::from_result(
                self.set_leader().await.map(|_| true),
                RpcReply::Success,
            ),
            RpcRequest::SendHeartbeat => RpcReply::from_result(
                self.send_heartbeat().await.map(|_| true),
                RpcReply::Success,
            ),

            RpcRequest::UpdateFile(meta) => RpcReply::from_result(
                self.update_file(meta).await,
                RpcReply::Version,
            ),
            RpcRequest::GetFileInfoMap => RpcReply::from_result(
                self.get_file_info_map().await,
                RpcReply::FileInfoMap,
            ),
            RpcRequest::GetBlockStoreMap { hashes } => RpcReply::from_result(
                self.get_block_store_map(&hashes).await,
                RpcReply::BlockStoreMap,
            ),
            RpcRequest::GetBlockStoreAddrs => RpcReply::from_result(
                self.get_block_store_addrs().await,
                RpcReply::BlockStoreAddrs,
            ),

            RpcRequest::GetInternalState => {
                RpcReply::InternalState(Box::new(self.internal_state().await))
            }
            RpcRequest::Crash => {
                self.crash().await;
                RpcReply::Success(true)
            }
            RpcRequest::Restore => {
                self.restore().await;
                RpcReply::Success(true)
            }
            RpcRequest::MakeServerUnreachableFrom { server_ids } => {
                RpcReply::from_result(
                    self.make_unreachable_from(&server_ids)
                        .await
                        .map(|_| true),
                    RpcReply::Success,
                )
            }
        }
    }
}

/// A metadata server: one consensus node plus the listener serving it.
pub struct RaftServer {
    /// My replica ID.
    me: ReplicaId,

    /// The node requests are dispatched onto.
    node: Arc<RaftNode>,

    /// Bound listener socket.
    listener: TcpListener,
}

impl RaftServer {
    /// Creates node `id` of given cluster with an in-memory metadata store
    /// and a TCP peer transport, and binds its listening address.
    pub async fn new_and_setup(
        id: ReplicaId,
        cluster: &ClusterConfig,
        config_str: Option<&str>,
    ) -> Result<Self, MetasyncError> {
        let config = ReplicaConfigRaft::from_config_str(config_str)?;
        let addrs = cluster.socket_addrs()?;
        let Some(&bind_addr) = addrs.get(id as usize) else {
            return logged_err!(
                "replica ID {} out of range for {} nodes",
                id,
                addrs.len()
            );
        };

        let transport = TcpTransport::new(id, &addrs, config.rpc_timeout());
        let store = MemMetaStore::new(cluster.block_addrs.clone());
        let node = RaftNode::new(
            id,
            cluster.population(),
            config,
            Box::new(store),
            Box::new(transport),
        )?;

        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        pf_info!("node {} listening on '{}'", id, bind_addr);

        Ok(RaftServer {
            me: id,
            node: Arc::new(node),
            listener,
        })
    }

    /// Handle to the served node.
    pub fn node(&self) -> Arc<RaftNode> {
        self.node.clone()
    }

    /// Accepts connections until a termination signal arrives. Everything
    /// this server logs carries its replica ID.
    pub async fn run(
        self,
        rx_term: watch::Receiver<bool>,
    ) -> Result<(), MetasyncError> {
        NODE_ID.scope(self.me, self.acceptor_thread(rx_term)).await
    }

    async fn acceptor_thread(
        self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), MetasyncError> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            pf_debug!("accepted connection from '{}'", addr);
                            tokio::spawn(NODE_ID.scope(
                                self.me,
                                Self::servant_thread(
                                    self.me,
                                    self.node.clone(),
                                    stream,
                                    addr,
                                    rx_term.clone(),
                                ),
                            ));
                        }
                        Err(e) => {
                            pf_warn!("error accepting connection: {}", e);
                        }
                    }
                },

                _ = rx_term.changed() => {
                    pf_info!("node {} terminating", self.me);
                    return Ok(());
                }
            }
        }
    }

    /// Serves requests arriving on one connection, one at a time. A request
    /// that has been read runs to completion even if the caller goes away.
    async fn servant_thread(
        me: ReplicaId,
        node: Arc<RaftNode>,
        mut conn: TcpStream,
        addr: SocketAddr,
        mut rx_term: watch::Receiver<bool>,
    ) {
        pf_trace!("servant for '{}' on {} spawned", addr, me);

        loop {
            let req: RpcRequest = tokio::select! {
                req = read_frame(&mut conn) => match req {
                    Ok(req) => req,
                    Err(_) => break, // peer closed the connection
                },
                _ = rx_term.changed() => break,
            };

            let reply = node.handle_request(req).await;
            if let Err(e) = write_frame(&mut conn, &reply).await {
                pf_debug!("error replying to '{}': {}", addr, e);
                break;
            }
        }

        pf_trace!("servant for '{}' on {} exited", addr, me);
    }
}
