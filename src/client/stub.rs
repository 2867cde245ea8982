//! Typed connection stub to one metadata server.

use std::net::SocketAddr;

use crate::server::{
    AppendEntriesArgs, AppendEntriesReply, BlockStoreMap, FileInfoMap,
    FileMetaData, InternalState, ReplicaId, RpcReply, RpcRequest, Version,
};
use crate::utils::{
    read_frame, tcp_connect_with_retry, write_frame, MetasyncError,
};

use tokio::net::TcpStream;
use tokio::time::{self, Duration};

/// Unpacks the expected reply variant, surfacing in-band errors.
macro_rules! expect_reply {
    ($reply:expr, $variant:ident) => {
        match $reply {
            RpcReply::$variant(v) => Ok(v),
            RpcReply::Error(e) => Err(e),
            other => Err(MetasyncError::msg(format!(
                "unexpected reply {:?}",
                other
            ))),
        }
    };
}

/// Connection stub to one server. Connects lazily on first call and
/// reconnects after any failed call.
pub struct RpcStub {
    /// Server address.
    addr: SocketAddr,

    /// Bound on each call, connecting included.
    timeout: Duration,

    /// Established connection, if any.
    conn: Option<TcpStream>,
}

impl RpcStub {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        RpcStub {
            addr,
            timeout,
            conn: None,
        }
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sends a request and waits for its reply. Connection problems come
    /// back as `Unreachable`, an expired bound as `Timeout`; either way the
    /// connection is dropped since it may hold a half-exchanged frame.
    pub async fn call(
        &mut self,
        req: &RpcRequest,
    ) -> Result<RpcReply, MetasyncError> {
        let addr = self.addr;
        let conn = &mut self.conn;
        let exchange = async move {
            if conn.is_none() {
                *conn = Some(tcp_connect_with_retry(addr, 0).await?);
            }
            let stream = conn.as_mut().ok_or_else(|| {
                MetasyncError::Unreachable(format!("no connection to {}", addr))
            })?;
            write_frame(stream, req).await?;
            read_frame::<RpcReply, _>(stream).await
        };

        let result = time::timeout(self.timeout, exchange).await;
        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                self.conn = None;
                Err(match e {
                    MetasyncError::Msg(s) => MetasyncError::Unreachable(
                        format!("call to {}: {}", addr, s),
                    ),
                    e => e,
                })
            }
            Err(_) => {
                self.conn = None;
                Err(MetasyncError::Timeout(format!(
                    "call to {} after {:?}",
                    addr, self.timeout
                )))
            }
        }
    }

    pub async fn append_entries(
        &mut self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, MetasyncError> {
        let reply = self.call(&RpcRequest::AppendEntries(args)).await?;
        expect_reply!(reply, AppendEntries)
    }

    pub async fn set_leader(&mut self) -> Result<bool, MetasyncError> {
        let reply = self.call(&RpcRequest::SetLeader).await?;
        expect_reply!(reply, Success)
    }

    pub async fn send_heartbeat(&mut self) -> Result<bool, MetasyncError> {
        let reply = self.call(&RpcRequest::SendHeartbeat).await?;
        expect_reply!(reply, Success)
    }

    pub async fn update_file(
        &mut self,
        meta: FileMetaData,
    ) -> Result<Version, MetasyncError> {
        let reply = self.call(&RpcRequest::UpdateFile(meta)).await?;
        expect_reply!(reply, Version)
    }

    pub async fn get_file_info_map(
        &mut self,
    ) -> Result<FileInfoMap, MetasyncError> {
        let reply = self.call(&RpcRequest::GetFileInfoMap).await?;
        expect_reply!(reply, FileInfoMap)
    }

    pub async fn get_block_store_map(
        &mut self,
        hashes: Vec<String>,
    ) -> Result<BlockStoreMap, MetasyncError> {
        let reply = self.call(&RpcRequest::GetBlockStoreMap { hashes }).await?;
        expect_reply!(reply, BlockStoreMap)
    }

    pub async fn get_block_store_addrs(
        &mut self,
    ) -> Result<Vec<String>, MetasyncError> {
        let reply = self.call(&RpcRequest::GetBlockStoreAddrs).await?;
        expect_reply!(reply, BlockStoreAddrs)
    }

    pub async fn get_internal_state(
        &mut self,
    ) -> Result<InternalState, MetasyncError> {
        let reply = self.call(&RpcRequest::GetInternalState).await?;
        expect_reply!(reply, InternalState).map(|state| *state)
    }

    pub async fn crash(&mut self) -> Result<bool, MetasyncError> {
        let reply = self.call(&RpcRequest::Crash).await?;
        expect_reply!(reply, Success)
    }

    pub async fn restore(&mut self) -> Result<bool, MetasyncError> {
        let reply = self.call(&RpcRequest::Restore).await?;
        expect_reply!(reply, Success)
    }

    pub async fn make_server_unreachable_from(
        &mut self,
        server_ids: Vec<ReplicaId>,
    ) -> Result<bool, MetasyncError> {
        let reply = self
            .call(&RpcRequest::MakeServerUnreachableFrom { server_ids })
            .await?;
        expect_reply!(reply, Success)
    }
}
