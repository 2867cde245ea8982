//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;

use serde::{Deserialize, Serialize};

/// Customized error type for metasync. Travels in-band inside RPC replies,
/// hence serializable.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum MetasyncError {
    /// Operation requires leadership that this node does not hold.
    NotLeader,

    /// Node is in simulated-crash mode.
    ServerCrashed,

    /// Receiver's log has no entry matching the given previous index/term.
    /// Internal to AppendEntries processing only.
    LogMismatch,

    /// Peer dropped the call or could not be connected to.
    Unreachable(String),

    /// Call did not complete in time.
    Timeout(String),

    /// Metadata store refused an update whose version is not the successor
    /// of the stored one.
    VersionMismatch { filename: String, current: i32 },

    /// Anything else, carried as its string representation.
    Msg(String),
}

impl MetasyncError {
    pub fn msg(msg: impl ToString) -> Self {
        MetasyncError::Msg(msg.to_string())
    }

    /// Returns true if a client should move on and retry the same request
    /// against another node of the cluster.
    pub fn is_retryable_elsewhere(&self) -> bool {
        matches!(
            self,
            MetasyncError::NotLeader
                | MetasyncError::ServerCrashed
                | MetasyncError::Unreachable(_)
                | MetasyncError::Timeout(_)
        )
    }
}

impl fmt::Display for MetasyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MetasyncError::NotLeader => write!(f, "server is not the leader"),
            MetasyncError::ServerCrashed => write!(f, "server is crashed"),
            MetasyncError::LogMismatch => write!(f, "log mismatch"),
            MetasyncError::Unreachable(s) => write!(f, "unreachable: {}", s),
            MetasyncError::Timeout(s) => write!(f, "timed out: {}", s),
            MetasyncError::VersionMismatch { filename, current } => write!(
                f,
                "version mismatch on '{}': current version {}",
                filename, current
            ),
            MetasyncError::Msg(s) => write!(f, "{}", s), // no literal quotes
        }
    }
}

impl error::Error for MetasyncError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `MetasyncError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for MetasyncError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                MetasyncError::Msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::oneshot::error::TryRecvError);

impl From<tokio::time::error::Elapsed> for MetasyncError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        MetasyncError::Timeout(e.to_string())
    }
}
