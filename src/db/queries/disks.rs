//! Queries against `backup_disks`, one row per disk of one backup job.

use chrono::{DateTime, Utc};
use sqlx::{MySql, Pool};

use crate::db::tables::BackupDisk;

pub async fn create_disk(
    pool: &Pool<MySql>,
    backup_job_id: &str,
    disk_index: i64,
    vmware_disk_key: i64,
    qcow2_path: &str,
    backing_path: Option<&str>,
    size_gb: f64,
) -> Result<BackupDisk, sqlx::Error> {
    sqlx::query(
        "INSERT INTO backup_disks
            (backup_job_id, disk_index, vmware_disk_key, qcow2_path, backing_path, size_gb,
             bytes_transferred, progress_percent, status)
         VALUES (?, ?, ?, ?, ?, ?, 0, 0, 'pending')",
    )
    .bind(backup_job_id)
    .bind(disk_index)
    .bind(vmware_disk_key)
    .bind(qcow2_path)
    .bind(backing_path)
    .bind(size_gb)
    .execute(pool)
    .await?;

    get_disk(pool, backup_job_id, disk_index)
        .await?
        .ok_or_else(|| sqlx::Error::RowNotFound)
}

pub async fn get_disk(
    pool: &Pool<MySql>,
    backup_job_id: &str,
    disk_index: i64,
) -> Result<Option<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>(
        "SELECT * FROM backup_disks WHERE backup_job_id = ? AND disk_index = ?",
    )
    .bind(backup_job_id)
    .bind(disk_index)
    .fetch_optional(pool)
    .await
}

pub async fn get_disk_by_id(pool: &Pool<MySql>, id: i64) -> Result<Option<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>("SELECT * FROM backup_disks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn list_disks_for_job(
    pool: &Pool<MySql>,
    backup_job_id: &str,
) -> Result<Vec<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>(
        "SELECT * FROM backup_disks WHERE backup_job_id = ? ORDER BY disk_index ASC",
    )
    .bind(backup_job_id)
    .fetch_all(pool)
    .await
}

/// The most recent *completed* disk row for `(context_id, disk_index)`,
/// i.e. the base a new incremental inherits its `disk_change_id` from.
/// Failed increments are skipped by construction (only completed rows
/// are ever considered).
pub async fn most_recent_completed_for_disk(
    pool: &Pool<MySql>,
    context_id: &str,
    disk_index: i64,
) -> Result<Option<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>(
        "SELECT d.* FROM backup_disks d
         JOIN backup_jobs j ON j.id = d.backup_job_id
         WHERE j.context_id = ? AND d.disk_index = ? AND d.status = 'completed'
         ORDER BY j.created_at DESC LIMIT 1",
    )
    .bind(context_id)
    .bind(disk_index)
    .fetch_optional(pool)
    .await
}

/// Telemetry sub-update for one disk: monotonic-max on bytes, discarded
/// if the disk is already terminal.
pub async fn apply_telemetry(
    pool: &Pool<MySql>,
    backup_job_id: &str,
    disk_index: i64,
    bytes_transferred: i64,
    progress_percent: f64,
    status: Option<&str>,
    error_message: Option<&str>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE backup_disks
         SET bytes_transferred = GREATEST(bytes_transferred, ?),
             progress_percent = GREATEST(progress_percent, ?),
             status = COALESCE(?, status),
             error_message = COALESCE(?, error_message)
         WHERE backup_job_id = ? AND disk_index = ? AND status NOT IN ('completed', 'failed')",
    )
    .bind(bytes_transferred)
    .bind(progress_percent)
    .bind(status)
    .bind(error_message)
    .bind(backup_job_id)
    .bind(disk_index)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Idempotent per `(backup_job_id, disk_index)`: a second completion call
/// for an already-terminal disk affects zero rows.
pub async fn complete_disk(
    pool: &Pool<MySql>,
    backup_job_id: &str,
    disk_index: i64,
    bytes_transferred: i64,
    disk_change_id: Option<&str>,
    succeeded: bool,
    error_message: Option<&str>,
    completed_at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let status = if succeeded { "completed" } else { "failed" };
    // disk_change_id is only ever written on success (see design notes: a
    // change-id recorded against an incomplete image would corrupt the
    // next incremental's base).
    let change_id = if succeeded { disk_change_id } else { None };

    let result = sqlx::query(
        "UPDATE backup_disks
         SET status = ?, bytes_transferred = ?, disk_change_id = COALESCE(?, disk_change_id),
             error_message = ?, completed_at = ?, progress_percent = 100.0
         WHERE backup_job_id = ? AND disk_index = ? AND status NOT IN ('completed', 'failed')",
    )
    .bind(status)
    .bind(bytes_transferred)
    .bind(change_id)
    .bind(error_message)
    .bind(completed_at)
    .bind(backup_job_id)
    .bind(disk_index)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn sum_bytes_for_job(pool: &Pool<MySql>, backup_job_id: &str) -> Result<i64, sqlx::Error> {
    let sum: Option<i64> =
        sqlx::query_scalar("SELECT SUM(bytes_transferred) FROM backup_disks WHERE backup_job_id = ?")
            .bind(backup_job_id)
            .fetch_one(pool)
            .await?;
    Ok(sum.unwrap_or(0))
}

pub async fn all_terminal(pool: &Pool<MySql>, backup_job_id: &str) -> Result<bool, sqlx::Error> {
    let remaining: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM backup_disks WHERE backup_job_id = ? AND status NOT IN ('completed', 'failed')",
    )
    .bind(backup_job_id)
    .fetch_one(pool)
    .await?;
    Ok(remaining == 0)
}

pub async fn any_failed(pool: &Pool<MySql>, backup_job_id: &str) -> Result<bool, sqlx::Error> {
    let failed: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM backup_disks WHERE backup_job_id = ? AND status = 'failed'")
            .bind(backup_job_id)
            .fetch_one(pool)
            .await?;
    Ok(failed > 0)
}

/// Whether `qcow2_path` is used as a backing file by any other disk row --
/// i.e. whether deleting it would break a descendant in the chain.
pub async fn is_backing_file_target(pool: &Pool<MySql>, qcow2_path: &str) -> Result<bool, sqlx::Error> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM backup_disks WHERE backing_path = ?")
            .bind(qcow2_path)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}
