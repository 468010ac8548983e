//! Hub-side client for the Hub -> Node backup RPC. Exactly
//! one call per backup job, carrying every disk's NBD target, so the Node
//! takes a single VMware snapshot for the whole VM.

use async_trait::async_trait;
use thiserror::Error;

use super::types::{NodeBackupAck, NodeBackupRequest, NodeCancelRequest};

#[derive(Error, Debug)]
pub enum NodeRpcError {
    #[error("node RPC request failed: {0}")]
    RequestFailed(String),
    #[error("node rejected the backup request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait NodeRpcClient: Send + Sync {
    async fn start_backup(&self, request: NodeBackupRequest) -> Result<NodeBackupAck, NodeRpcError>;
    async fn cancel_backup(&self, job_id: &str) -> Result<(), NodeRpcError>;
}

/// Calls the Node's VMA control API over the SSH tunnel. The tunnel itself
/// is out of scope here; this client only needs the Node's
/// loopback-forwarded base URL.
pub struct HttpNodeRpcClient {
    node_base_url: String,
    client: reqwest::Client,
}

impl HttpNodeRpcClient {
    pub fn new(node_base_url: String) -> Self {
        Self {
            node_base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NodeRpcClient for HttpNodeRpcClient {
    async fn start_backup(&self, request: NodeBackupRequest) -> Result<NodeBackupAck, NodeRpcError> {
        let url = format!("{}/backup/start", self.node_base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| NodeRpcError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NodeRpcError::Rejected(format!(
                "node returned {}",
                response.status()
            )));
        }

        response
            .json::<NodeBackupAck>()
            .await
            .map_err(|e| NodeRpcError::RequestFailed(e.to_string()))
    }

    async fn cancel_backup(&self, job_id: &str) -> Result<(), NodeRpcError> {
        let url = format!("{}/backup/cancel/{}", self.node_base_url, job_id);
        let response = self
            .client
            .post(&url)
            .json(&NodeCancelRequest {
                job_id: job_id.to_string(),
            })
            .send()
            .await
            .map_err(|e| NodeRpcError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NodeRpcError::Rejected(format!(
                "node returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
