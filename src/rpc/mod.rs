pub mod client;
pub mod types;

pub use client::{HttpNodeRpcClient, NodeRpcClient, NodeRpcError};
pub use types::{NbdTarget, NodeBackupAck, NodeBackupRequest, NodeCancelRequest};
