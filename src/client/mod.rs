//! Client-side functionality: per-server RPC stub and cluster client.

mod metaclient;
mod stub;

pub use metaclient::MetaClient;
pub use stub::RpcStub;
