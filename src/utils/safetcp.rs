//! Length-prefixed TCP framing and bind/connect helper functions.

use std::marker::Unpin;
use std::net::SocketAddr;

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::MetasyncError;

/// Upper bound on a single frame's payload, to refuse garbage lengths.
const MAX_FRAME_LEN: u64 = 256 * 1024 * 1024;

/// Sends an object of type `T` through `conn_write` as one frame: 8 bytes of
/// big-endian payload length followed by the MessagePack-encoded payload.
pub(crate) async fn write_frame<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), MetasyncError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let obj_bytes = rmp_serde::encode::to_vec(obj)?;
    let mut frame = BytesMut::with_capacity(8 + obj_bytes.len());
    frame.put_u64(obj_bytes.len() as u64); // length first
    frame.put_slice(&obj_bytes);
    conn_write.write_all(&frame).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Receives one frame from `conn_read` and decodes it as an object of type
/// `T`. Not cancellation-safe; callers must drop the connection if a read is
/// interrupted midway (e.g., by a timeout).
pub(crate) async fn read_frame<T, Conn>(
    conn_read: &mut Conn,
) -> Result<T, MetasyncError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    let obj_len = conn_read.read_u64().await?;
    if obj_len > MAX_FRAME_LEN {
        return Err(MetasyncError::msg(format!(
            "frame length {} exceeds limit",
            obj_len
        )));
    }
    #[allow(clippy::cast_possible_truncation)]
    let mut obj_buf = BytesMut::zeroed(obj_len as usize);
    conn_read.read_exact(&mut obj_buf[..]).await?;
    let obj = rmp_serde::decode::from_slice(&obj_buf)?;
    Ok(obj)
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, MetasyncError> {
    loop {
        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        let attempt = socket.bind(bind_addr).and_then(|_| socket.listen(1024));
        match attempt {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, MetasyncError> {
    loop {
        match TcpStream::connect(conn_addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => {
                if retries == 0 {
                    return Err(MetasyncError::Unreachable(format!(
                        "connect to {}: {}",
                        conn_addr, err
                    )));
                }
                retries -= 1;
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
