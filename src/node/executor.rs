//! Node-side executor: given one Hub RPC naming every disk
//! of a VM, takes exactly one snapshot, copies each disk's data (full or
//! CBT-delta) into the Hub's waiting NBD exporters with a bounded number
//! of parallel workers, and reports progress and per-disk completion
//! through telemetry pushes.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use log::{error, info, warn};
use parking_lot::RwLock;
use thiserror::Error;

use crate::node::nbd_client::NbdWriteClient;
use crate::node::telemetry_push::TelemetryPushClient;
use crate::node::vmware::{VCenterClient, VCenterError, VCenterSession};
use crate::rpc::types::{NbdTarget, NodeBackupRequest};
use crate::telemetry::{DiskTelemetry, JobTelemetry};

const COPY_CHUNK_BYTES: u64 = 4 * 1024 * 1024;
const JOB_TYPE: &str = "backup";

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("vcenter error: {0}")]
    VCenter(#[from] VCenterError),
    #[error("nbd client error: {0}")]
    Nbd(#[from] crate::node::nbd_client::NbdClientError),
    #[error("backup job {0} was cancelled")]
    Cancelled(String),
}

pub struct BackupExecutor {
    vcenter: Arc<dyn VCenterClient>,
    telemetry: Arc<TelemetryPushClient>,
    worker_count: usize,
    cancelled_jobs: RwLock<HashSet<String>>,
}

impl BackupExecutor {
    pub fn new(vcenter: Arc<dyn VCenterClient>, telemetry: Arc<TelemetryPushClient>, worker_count: usize) -> Self {
        Self {
            vcenter,
            telemetry,
            worker_count: worker_count.max(1),
            cancelled_jobs: RwLock::new(HashSet::new()),
        }
    }

    pub fn cancel(&self, job_id: &str) {
        self.cancelled_jobs.write().insert(job_id.to_string());
    }

    fn is_cancelled(&self, job_id: &str) -> bool {
        self.cancelled_jobs.read().contains(job_id)
    }

    /// Runs the whole job to completion (or failure), pushing telemetry as
    /// it goes. Errors here are reported to the Hub as a failed job
    /// telemetry push rather than propagated, since by this point the Hub
    /// has already accepted the job and is waiting on telemetry alone.
    pub async fn run(self: Arc<Self>, request: NodeBackupRequest) {
        let job_id = request.job_id.clone();
        if let Err(e) = self.run_inner(&request).await {
            error!("backup job {job_id} failed: {e}");
            let failure = JobTelemetry {
                job_id: job_id.clone(),
                job_type: JOB_TYPE.to_string(),
                status: "failed".to_string(),
                current_phase: Some("failed".to_string()),
                bytes_transferred: 0,
                total_bytes: None,
                transfer_speed_bps: None,
                eta_seconds: None,
                progress_percent: 0.0,
                timestamp: Utc::now(),
                disks: request
                    .targets
                    .iter()
                    .map(|t| DiskTelemetry {
                        disk_index: t.disk_index,
                        bytes_transferred: 0,
                        progress_percent: 0.0,
                        status: "failed".to_string(),
                        error_message: Some(e.to_string()),
                        disk_change_id: None,
                    })
                    .collect(),
            };
            if let Err(push_err) = self.telemetry.push(&failure).await {
                error!("could not report failure of job {job_id} to hub: {push_err}");
            }
        }
        self.cancelled_jobs.write().remove(&job_id);
    }

    async fn run_inner(&self, request: &NodeBackupRequest) -> Result<(), ExecutorError> {
        let session = self
            .vcenter
            .login(&request.vcenter_host, &request.vcenter_user, &request.vcenter_password)
            .await?;

        info!(
            "job {}: taking snapshot of {} ({} disks)",
            request.job_id,
            request.vm_name,
            request.targets.len()
        );
        self.push_job_phase(request, "snapshot").await;
        let snapshot_moref = self.vcenter.create_snapshot(&session, &request.vm_path).await?;

        let copy_result = self.copy_all_disks(request, &session, &snapshot_moref).await;

        if let Err(e) = self.vcenter.remove_snapshot(&session, &snapshot_moref).await {
            warn!("job {}: failed to remove snapshot {snapshot_moref}: {e}", request.job_id);
        }

        copy_result
    }

    async fn copy_all_disks(
        &self,
        request: &NodeBackupRequest,
        session: &VCenterSession,
        snapshot_moref: &str,
    ) -> Result<(), ExecutorError> {
        let job_id = request.job_id.clone();
        let results: Vec<Result<(), ExecutorError>> = stream::iter(request.targets.iter().map(|target| {
            self.copy_one_disk(&job_id, &request.backup_type, session, snapshot_moref, target)
        }))
        .buffer_unordered(self.worker_count)
        .collect()
        .await;

        for result in results {
            result?;
        }
        Ok(())
    }

    async fn copy_one_disk(
        &self,
        job_id: &str,
        backup_type: &str,
        session: &VCenterSession,
        snapshot_moref: &str,
        target: &NbdTarget,
    ) -> Result<(), ExecutorError> {
        if self.is_cancelled(job_id) {
            self.push_disk_terminal(job_id, target, 0, false, Some("cancelled".to_string()), None)
                .await;
            return Err(ExecutorError::Cancelled(job_id.to_string()));
        }

        let mut nbd = NbdWriteClient::connect("127.0.0.1", target.nbd_port, &target.export_name).await?;

        let extents = if backup_type == "incremental" {
            let base = target.base_change_id.as_deref().unwrap_or_default();
            self.vcenter
                .query_changed_areas(session, snapshot_moref, target.vmware_disk_key, base, target.size_bytes as u64)
                .await?
        } else {
            full_disk_extents(target.size_bytes as u64)
        };

        let mut bytes_done: i64 = 0;
        let total: i64 = extents.iter().map(|e| e.length as i64).sum();
        let mut gate = SendGate::new();

        for extent in &extents {
            if self.is_cancelled(job_id) {
                self.push_disk_terminal(job_id, target, bytes_done, false, Some("cancelled".to_string()), None)
                    .await;
                return Err(ExecutorError::Cancelled(job_id.to_string()));
            }

            let mut remaining = extent.length;
            let mut offset = extent.offset;
            while remaining > 0 {
                let chunk_len = remaining.min(COPY_CHUNK_BYTES);
                let data = self
                    .vcenter
                    .read_disk_range(session, &target.datastore, &target.vmdk_path, offset, chunk_len)
                    .await?;
                nbd.write_at(offset, &data).await?;

                offset += chunk_len;
                remaining -= chunk_len;
                bytes_done += chunk_len as i64;

                let progress = if total > 0 {
                    (bytes_done as f64 / total as f64) * 100.0
                } else {
                    100.0
                };
                if gate.should_send(progress) {
                    self.push_disk_progress(job_id, target, bytes_done, progress).await;
                }
            }
        }

        nbd.disconnect().await?;

        let change_id = self
            .vcenter
            .current_change_id(session, snapshot_moref, target.vmware_disk_key)
            .await?;
        self.push_disk_terminal(job_id, target, bytes_done, true, None, Some(change_id))
            .await;
        Ok(())
    }

    /// Mandatory job-start telemetry: one push naming the current phase
    /// with every disk still at zero progress, before any bytes move.
    async fn push_job_phase(&self, request: &NodeBackupRequest, phase: &str) {
        let telemetry = JobTelemetry {
            job_id: request.job_id.clone(),
            job_type: JOB_TYPE.to_string(),
            status: "running".to_string(),
            current_phase: Some(phase.to_string()),
            bytes_transferred: 0,
            total_bytes: None,
            transfer_speed_bps: None,
            eta_seconds: None,
            progress_percent: 0.0,
            timestamp: Utc::now(),
            disks: request
                .targets
                .iter()
                .map(|t| DiskTelemetry {
                    disk_index: t.disk_index,
                    bytes_transferred: 0,
                    progress_percent: 0.0,
                    status: "running".to_string(),
                    error_message: None,
                    disk_change_id: None,
                })
                .collect(),
        };
        if let Err(e) = self.telemetry.push(&telemetry).await {
            warn!("job {}: telemetry push failed: {e}", request.job_id);
        }
    }

    async fn push_disk_progress(&self, job_id: &str, target: &NbdTarget, bytes: i64, progress: f64) {
        self.push(job_id, target, "transferring", bytes, progress, None, None).await;
    }

    async fn push_disk_terminal(
        &self,
        job_id: &str,
        target: &NbdTarget,
        bytes: i64,
        succeeded: bool,
        error_message: Option<String>,
        change_id: Option<String>,
    ) {
        let status = if succeeded { "completed" } else { "failed" };
        self.push(job_id, target, status, bytes, 100.0, error_message, change_id)
            .await;
    }

    async fn push(
        &self,
        job_id: &str,
        target: &NbdTarget,
        status: &str,
        bytes: i64,
        progress: f64,
        error_message: Option<String>,
        change_id: Option<String>,
    ) {
        let telemetry = JobTelemetry {
            job_id: job_id.to_string(),
            job_type: JOB_TYPE.to_string(),
            status: if status == "failed" { "failed".to_string() } else { "running".to_string() },
            current_phase: Some(status.to_string()),
            bytes_transferred: bytes,
            total_bytes: None,
            transfer_speed_bps: None,
            eta_seconds: None,
            progress_percent: progress,
            timestamp: Utc::now(),
            disks: vec![DiskTelemetry {
                disk_index: target.disk_index,
                bytes_transferred: bytes,
                progress_percent: progress,
                status: status.to_string(),
                error_message,
                disk_change_id: change_id,
            }],
        };
        if let Err(e) = self.telemetry.push(&telemetry).await {
            warn!("job {job_id} disk {}: telemetry push failed: {e}", target.disk_index);
        }
    }
}

fn full_disk_extents(size_bytes: u64) -> Vec<crate::node::vmware::DiskExtent> {
    vec![crate::node::vmware::DiskExtent {
        offset: 0,
        length: size_bytes,
    }]
}

const SEND_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
const SEND_PROGRESS_DELTA: f64 = 10.0;

/// Throttles per-disk progress pushes to whichever fires first: 5s since
/// the last send, or 10 percentage points of progress since the last send.
struct SendGate {
    last_sent_at: std::time::Instant,
    last_sent_percent: f64,
}

impl SendGate {
    fn new() -> Self {
        Self {
            last_sent_at: std::time::Instant::now(),
            last_sent_percent: 0.0,
        }
    }

    fn should_send(&mut self, progress_percent: f64) -> bool {
        let due = self.last_sent_at.elapsed() >= SEND_INTERVAL
            || progress_percent - self.last_sent_percent >= SEND_PROGRESS_DELTA;
        if due {
            self.last_sent_at = std::time::Instant::now();
            self.last_sent_percent = progress_percent;
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_gate_fires_on_ten_point_progress_jump() {
        let mut gate = SendGate::new();
        assert!(!gate.should_send(5.0));
        assert!(gate.should_send(10.0));
        assert!(!gate.should_send(15.0));
        assert!(gate.should_send(20.0));
    }
}
