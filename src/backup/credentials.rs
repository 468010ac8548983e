//! Credential lookup (external collaborator interface).
//!
//! The credential *store* -- encryption at rest, rotation -- stays out of
//! scope; this is only the lookup client the orchestrator calls once per
//! backup job, as late as possible (immediately before the Node RPC).

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct VCenterCredentials {
    pub vcenter_host: String,
    pub username: String,
    pub password: String,
    #[allow(dead_code)]
    pub datacenter: String,
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("credential service request failed: {0}")]
    RequestFailed(String),
    #[error("unknown credential id: {0}")]
    NotFound(String),
}

#[async_trait]
pub trait CredentialClient: Send + Sync {
    async fn get_credentials(&self, credential_id: &str) -> Result<VCenterCredentials, CredentialError>;
}

/// Calls a configured credential-service base URL over `reqwest`.
pub struct HttpCredentialClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCredentialClient {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CredentialClient for HttpCredentialClient {
    async fn get_credentials(&self, credential_id: &str) -> Result<VCenterCredentials, CredentialError> {
        let url = format!("{}/credentials/{}", self.base_url, credential_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CredentialError::RequestFailed(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CredentialError::NotFound(credential_id.to_string()));
        }
        if !response.status().is_success() {
            return Err(CredentialError::RequestFailed(format!(
                "credential service returned {}",
                response.status()
            )));
        }

        response
            .json::<VCenterCredentials>()
            .await
            .map_err(|e| CredentialError::RequestFailed(e.to_string()))
    }
}

/// Test double used by unit tests that exercise the orchestrator without a
/// live credential service.
pub struct StaticCredentialClient {
    pub credentials: VCenterCredentials,
}

#[async_trait]
impl CredentialClient for StaticCredentialClient {
    async fn get_credentials(&self, _credential_id: &str) -> Result<VCenterCredentials, CredentialError> {
        Ok(self.credentials.clone())
    }
}
