//! Node-side client for the Hub's telemetry endpoint. The
//! executor calls this on a fixed interval per job and once more, with a
//! terminal per-disk status, when each disk finishes.

use thiserror::Error;

use crate::telemetry::JobTelemetry;

#[derive(Error, Debug)]
pub enum TelemetryPushError {
    #[error("telemetry push failed: {0}")]
    RequestFailed(String),
}

pub struct TelemetryPushClient {
    hub_base_url: String,
    client: reqwest::Client,
}

impl TelemetryPushClient {
    pub fn new(hub_base_url: String) -> Self {
        Self {
            hub_base_url,
            client: reqwest::Client::new(),
        }
    }

    pub async fn push(&self, telemetry: &JobTelemetry) -> Result<(), TelemetryPushError> {
        let url = format!(
            "{}/telemetry/{}/{}",
            self.hub_base_url, telemetry.job_type, telemetry.job_id
        );
        let response = self
            .client
            .post(&url)
            .json(telemetry)
            .send()
            .await
            .map_err(|e| TelemetryPushError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TelemetryPushError::RequestFailed(format!(
                "hub returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
