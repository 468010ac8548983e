//! Wire types shared by the Hub's RPC client and the Node's `/backup/start`
//! handler.

use serde::{Deserialize, Serialize};

/// One `(vmware_disk_key -> nbd://127.0.0.1:port/export)` target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbdTarget {
    pub vmware_disk_key: i64,
    pub disk_index: i64,
    pub nbd_port: u16,
    pub export_name: String,
    /// Base change-id for CBT, carried per disk for incrementals.
    pub base_change_id: Option<String>,
    /// Disk size as known at backup start, used to size the full-copy loop.
    pub size_bytes: i64,
    pub datastore: String,
    pub vmdk_path: String,
}

impl NbdTarget {
    pub fn nbd_url(&self) -> String {
        format!("nbd://127.0.0.1:{}/{}", self.nbd_port, self.export_name)
    }
}

/// `key0:nbd://127.0.0.1:port0/export0,key1:nbd://127.0.0.1:port1/export1,...`
pub fn targets_string(targets: &[NbdTarget]) -> String {
    targets
        .iter()
        .map(|t| format!("{}:{}", t.vmware_disk_key, t.nbd_url()))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeBackupRequest {
    pub job_id: String,
    pub vm_name: String,
    pub vm_path: String,
    pub vcenter_host: String,
    pub vcenter_user: String,
    pub vcenter_password: String,
    pub backup_type: String,
    pub nbd_targets: String,
    /// Structured form of `nbd_targets`, passed alongside the comma-separated
    /// string the wire format specifies so the Node doesn't have to
    /// re-parse its own serialization.
    pub targets: Vec<NbdTarget>,
    pub hub_callback_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeBackupAck {
    pub job_id: String,
    pub accepted: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCancelRequest {
    pub job_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_string_matches_scenario_1() {
        let targets = vec![
            NbdTarget {
                vmware_disk_key: 2000,
                disk_index: 0,
                nbd_port: 10104,
                export_name: "pgtest1-disk0".to_string(),
                base_change_id: None,
                size_bytes: 10_737_418_240,
                datastore: "datastore1".to_string(),
                vmdk_path: "pgtest1/pgtest1.vmdk".to_string(),
            },
            NbdTarget {
                vmware_disk_key: 2001,
                disk_index: 1,
                nbd_port: 10105,
                export_name: "pgtest1-disk1".to_string(),
                base_change_id: None,
                size_bytes: 53_687_091_200,
                datastore: "datastore1".to_string(),
                vmdk_path: "pgtest1/pgtest1_1.vmdk".to_string(),
            },
        ];
        assert_eq!(
            targets_string(&targets),
            "2000:nbd://127.0.0.1:10104/pgtest1-disk0,2001:nbd://127.0.0.1:10105/pgtest1-disk1"
        );
    }
}
