use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Configuration for the Hub control-plane process.
///
/// Supports serialization to and deserialization from JSON for persistent
/// configuration. Loaded from `hub.config.json` in the current directory,
/// or generated with default values if no configuration file exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Port the Hub's HTTP API listens on.
    pub port: u16,

    /// Address the Hub binds to.
    pub address: String,

    /// Root directory under which per-VM backup repositories are created.
    pub repository_root: String,

    /// Root directory under which restore mounts are created.
    pub restore_root: String,

    /// Inclusive range of TCP ports handed out to qemu-nbd exporters.
    pub nbd_port_range: (u16, u16),

    /// Device nodes available for restore-mount NBD clients (e.g. `/dev/nbd0`).
    pub nbd_device_pool: Vec<String>,

    /// `--shared=N` value passed to qemu-nbd; must be >= 10 (see design notes).
    pub qemu_nbd_shared_cap: u32,

    /// Seconds of telemetry silence before a running job is marked `stalled`.
    pub stale_threshold_secs: i64,

    /// Seconds of telemetry silence before a running/stalled job is marked `failed`.
    pub failed_threshold_secs: i64,

    /// Idle time-to-live applied to restore mounts on creation and on access.
    pub mount_idle_ttl_secs: i64,

    /// Base URL of the credential lookup service.
    pub credential_service_url: String,

    /// Base URL of the Node's control API, reachable over the out-of-scope
    /// SSH tunnel set up out of band.
    pub node_base_url: String,
}

impl HubConfig {
    pub fn nbd_port_pool(&self) -> RangeInclusive<u16> {
        self.nbd_port_range.0..=self.nbd_port_range.1
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            address: "0.0.0.0".to_string(),
            repository_root: "/var/lib/vmbak/repositories".to_string(),
            restore_root: "/var/lib/vmbak/restores".to_string(),
            nbd_port_range: (10100, 10200),
            nbd_device_pool: (0..8).map(|n| format!("/dev/nbd{n}")).collect(),
            qemu_nbd_shared_cap: 10,
            stale_threshold_secs: 60,
            failed_threshold_secs: 300,
            mount_idle_ttl_secs: 3600,
            credential_service_url: "http://127.0.0.1:9090".to_string(),
            node_base_url: "http://127.0.0.1:9000".to_string(),
        }
    }
}

/// Configuration for the Node source-side executor process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Port the Node's VMA control API listens on.
    pub port: u16,

    /// Address the Node binds to.
    pub address: String,

    /// Base URL the Node uses to call back to the Hub (telemetry, completion).
    pub hub_callback_url: String,

    /// Maximum number of per-disk copy workers run in parallel for one job.
    pub max_parallel_disk_workers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 9000,
            address: "127.0.0.1".to_string(),
            hub_callback_url: "http://127.0.0.1:8000".to_string(),
            max_parallel_disk_workers: 3,
        }
    }
}

/// Errors that can occur while reading or writing a config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConfigError {
    FailedToWrite,
    ParseError,
}

lazy_static! {
    pub static ref HUB_CONFIG: Arc<HubConfig> =
        Arc::new(read_config("hub.config.json").expect("Failed to initialize hub config"));
    pub static ref NODE_CONFIG: Arc<NodeConfig> =
        Arc::new(read_config("node.config.json").expect("Failed to initialize node config"));
}

/// Reads a JSON config file, writing out a default one the first time it's missing.
///
/// Mirrors the read-or-default-and-persist behavior every deployment of this
/// config pattern uses: the first run on a fresh host produces a config file an
/// operator can then hand-edit.
fn read_config<T>(path: &str) -> Result<T, ConfigError>
where
    T: Default + Serialize + for<'de> Deserialize<'de>,
{
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => {
            let default = T::default();
            write_config(path, &default)?;
            return Ok(default);
        }
    };

    serde_json::from_str(&content).map_err(|_| ConfigError::ParseError)
}

fn write_config<T: Serialize>(path: &str, config: &T) -> Result<(), ConfigError> {
    let content = serde_json::to_string_pretty(config).map_err(|_| ConfigError::ParseError)?;
    std::fs::write(path, content).map_err(|_| ConfigError::FailedToWrite)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_hub_port_pool_has_101_values() {
        let config = HubConfig::default();
        assert_eq!(config.nbd_port_pool().count(), 101);
    }

    #[test]
    fn default_qemu_nbd_shared_cap_meets_minimum() {
        assert!(HubConfig::default().qemu_nbd_shared_cap >= 10);
    }
}
