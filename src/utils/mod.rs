//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod error;
mod safetcp;

pub use bitmap::ReplicaMap;
pub use error::MetasyncError;
pub use print::{log_prefix, logger_init, ME, NODE_ID};

pub(crate) use safetcp::{
    read_frame, tcp_bind_with_retry, tcp_connect_with_retry, write_frame,
};
