//! Telemetry push ingestion. One endpoint, one message shape; a per-disk
//! sub-update whose `status` is terminal and carries a `disk_change_id`
//! doubles as that disk's completion callback, since both are FK lookups
//! on `(backup_job_id, disk_index)` and must be idempotent the same way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{MySql, Pool};

use crate::db::queries::{contexts as contexts_db, disks as disks_db, jobs as jobs_db};
use crate::error::CoreError;
use crate::nbd::{NbdPortAllocator, QemuNbdSupervisor};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskTelemetry {
    pub disk_index: i64,
    pub bytes_transferred: i64,
    pub progress_percent: f64,
    pub status: String,
    pub error_message: Option<String>,
    /// Present only on a disk's final (terminal) sub-update.
    pub disk_change_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTelemetry {
    pub job_id: String,
    pub job_type: String,
    pub status: String,
    pub current_phase: Option<String>,
    pub bytes_transferred: i64,
    pub total_bytes: Option<i64>,
    #[allow(dead_code)]
    pub transfer_speed_bps: Option<f64>,
    #[allow(dead_code)]
    pub eta_seconds: Option<f64>,
    pub progress_percent: f64,
    #[allow(dead_code)]
    pub timestamp: DateTime<Utc>,
    pub disks: Vec<DiskTelemetry>,
}

/// Applies one push in a single logical unit of work: the parent's
/// aggregate fields, then each disk sub-update, then -- if every disk is
/// now terminal -- the parent's own finalization and resource release.
pub async fn ingest(
    pool: &Pool<MySql>,
    allocator: &NbdPortAllocator,
    supervisor: &QemuNbdSupervisor,
    telemetry: JobTelemetry,
) -> Result<(), CoreError> {
    let job = jobs_db::get_job(pool, &telemetry.job_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("unknown job_id '{}'", telemetry.job_id)))?;

    if job.status().is_terminal() {
        log::warn!(
            "telemetry for already-terminal job {} discarded",
            telemetry.job_id
        );
        return Ok(());
    }

    let now = Utc::now();
    jobs_db::apply_telemetry(
        pool,
        &telemetry.job_id,
        telemetry.bytes_transferred,
        telemetry.total_bytes,
        telemetry.progress_percent,
        telemetry.current_phase.as_deref(),
        now,
    )
    .await?;

    for disk in &telemetry.disks {
        apply_disk_update(pool, allocator, supervisor, &telemetry.job_id, disk, now).await?;
    }

    maybe_finalize(pool, allocator, supervisor, &job.id, &job.context_id).await?;
    Ok(())
}

async fn apply_disk_update(
    pool: &Pool<MySql>,
    allocator: &NbdPortAllocator,
    supervisor: &QemuNbdSupervisor,
    job_id: &str,
    disk: &DiskTelemetry,
    now: DateTime<Utc>,
) -> Result<(), CoreError> {
    let terminal = matches!(disk.status.as_str(), "completed" | "failed");
    if terminal {
        disks_db::complete_disk(
            pool,
            job_id,
            disk.disk_index,
            disk.bytes_transferred,
            disk.disk_change_id.as_deref(),
            disk.status == "completed",
            disk.error_message.as_deref(),
            now,
        )
        .await?;
        // The Node is done with this disk; release its port and exporter
        // immediately rather than waiting for the whole job to finish.
        release_disk_resources(pool, allocator, supervisor, job_id, disk.disk_index).await;
    } else {
        disks_db::apply_telemetry(
            pool,
            job_id,
            disk.disk_index,
            disk.bytes_transferred,
            disk.progress_percent,
            Some(disk.status.as_str()),
            disk.error_message.as_deref(),
        )
        .await?;
    }
    Ok(())
}

async fn release_disk_resources(
    pool: &Pool<MySql>,
    allocator: &NbdPortAllocator,
    supervisor: &QemuNbdSupervisor,
    job_id: &str,
    disk_index: i64,
) {
    if let Ok(Some(disk)) = disks_db::get_disk(pool, job_id, disk_index).await {
        let port = allocator
            .job_ports(job_id)
            .into_iter()
            .find(|p| p.disk_index == disk_index)
            .map(|p| p.port);
        if let Some(port) = port {
            supervisor.stop(port).await;
            allocator.release(port);
        }
        let _ = disk.id; // disk row itself is left in place for history
    }
}

/// Once every child disk is terminal: aggregate byte counts, set the
/// parent's final status, bump context counters, and release anything
/// still held (idempotent -- most resources are already gone per-disk).
async fn maybe_finalize(
    pool: &Pool<MySql>,
    allocator: &NbdPortAllocator,
    supervisor: &QemuNbdSupervisor,
    job_id: &str,
    context_id: &str,
) -> Result<(), CoreError> {
    if !disks_db::all_terminal(pool, job_id).await? {
        return Ok(());
    }

    let total_bytes = disks_db::sum_bytes_for_job(pool, job_id).await?;
    let failed = disks_db::any_failed(pool, job_id).await?;
    let status = if failed { "failed" } else { "completed" };
    let error_message = if failed {
        Some("one or more disks failed to complete")
    } else {
        None
    };

    jobs_db::finalize(pool, job_id, total_bytes, status, error_message, Utc::now()).await?;
    contexts_db::record_job_outcome(pool, context_id, job_id, !failed).await?;

    allocator.release_by_job_id(job_id);
    supervisor.stop_by_job_id(job_id).await;
    Ok(())
}
