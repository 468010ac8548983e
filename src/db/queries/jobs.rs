//! Queries against `backup_jobs`, the parent row of one VM backup run.

use chrono::{DateTime, Utc};
use sqlx::{MySql, Pool};

use crate::db::tables::BackupJob;

/// `backup-{vm}-{unix_ts}`, stable and sortable.
pub fn new_backup_id(vm_name: &str, now: DateTime<Utc>) -> String {
    format!("backup-{vm_name}-{}", now.timestamp())
}

/// Inserts the parent row in `pending`. Must happen before any child
/// `backup_disks` row is created so the foreign key holds.
pub async fn create_job(
    pool: &Pool<MySql>,
    id: &str,
    context_id: &str,
    vm_name: &str,
    repository_id: i64,
    backup_type: &str,
    parent_backup_id: Option<&str>,
    created_at: DateTime<Utc>,
) -> Result<BackupJob, sqlx::Error> {
    sqlx::query(
        "INSERT INTO backup_jobs
            (id, context_id, vm_name, repository_id, backup_type, status, parent_backup_id,
             created_at, bytes_transferred, progress_percent)
         VALUES (?, ?, ?, ?, ?, 'pending', ?, ?, 0, 0)",
    )
    .bind(id)
    .bind(context_id)
    .bind(vm_name)
    .bind(repository_id)
    .bind(backup_type)
    .bind(parent_backup_id)
    .bind(created_at)
    .execute(pool)
    .await?;

    get_job(pool, id)
        .await?
        .ok_or_else(|| sqlx::Error::RowNotFound)
}

pub async fn get_job(pool: &Pool<MySql>, id: &str) -> Result<Option<BackupJob>, sqlx::Error> {
    sqlx::query_as::<_, BackupJob>("SELECT * FROM backup_jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn list_jobs(
    pool: &Pool<MySql>,
    vm_name: Option<&str>,
    status: Option<&str>,
) -> Result<Vec<BackupJob>, sqlx::Error> {
    match (vm_name, status) {
        (Some(vm), Some(st)) => {
            sqlx::query_as::<_, BackupJob>(
                "SELECT * FROM backup_jobs WHERE vm_name = ? AND status = ? ORDER BY created_at DESC",
            )
            .bind(vm)
            .bind(st)
            .fetch_all(pool)
            .await
        }
        (Some(vm), None) => {
            sqlx::query_as::<_, BackupJob>(
                "SELECT * FROM backup_jobs WHERE vm_name = ? ORDER BY created_at DESC",
            )
            .bind(vm)
            .fetch_all(pool)
            .await
        }
        (None, Some(st)) => {
            sqlx::query_as::<_, BackupJob>(
                "SELECT * FROM backup_jobs WHERE status = ? ORDER BY created_at DESC",
            )
            .bind(st)
            .fetch_all(pool)
            .await
        }
        (None, None) => {
            sqlx::query_as::<_, BackupJob>("SELECT * FROM backup_jobs ORDER BY created_at DESC")
                .fetch_all(pool)
                .await
        }
    }
}

/// Most recent completed job for a context -- the chain's current leaf.
pub async fn most_recent_completed_for_context(
    pool: &Pool<MySql>,
    context_id: &str,
) -> Result<Option<BackupJob>, sqlx::Error> {
    sqlx::query_as::<_, BackupJob>(
        "SELECT * FROM backup_jobs
         WHERE context_id = ? AND status = 'completed'
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(context_id)
    .fetch_optional(pool)
    .await
}

pub async fn set_running(pool: &Pool<MySql>, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE backup_jobs SET status = 'running' WHERE id = ? AND status = 'pending'")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Applies one telemetry push. `bytes_transferred` only ever moves up
/// (monotonic max), and a terminal job discards the update entirely.
pub async fn apply_telemetry(
    pool: &Pool<MySql>,
    id: &str,
    bytes_transferred: i64,
    total_bytes: Option<i64>,
    progress_percent: f64,
    current_phase: Option<&str>,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE backup_jobs
         SET bytes_transferred = GREATEST(bytes_transferred, ?),
             total_bytes = COALESCE(?, total_bytes),
             progress_percent = GREATEST(progress_percent, ?),
             current_phase = COALESCE(?, current_phase),
             last_telemetry_at = ?,
             status = CASE WHEN status = 'stalled' THEN 'running' ELSE status END
         WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(bytes_transferred)
    .bind(total_bytes)
    .bind(progress_percent)
    .bind(current_phase)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn mark_stalled(pool: &Pool<MySql>, id: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE backup_jobs SET status = 'stalled', error_message = 'no telemetry updates for 60s'
         WHERE id = ? AND status = 'running'",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn mark_failed_stale(
    pool: &Pool<MySql>,
    id: &str,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE backup_jobs
         SET status = 'failed', completed_at = ?,
             error_message = 'no telemetry updates for 300s'
         WHERE id = ? AND status IN ('running', 'stalled')",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Jobs the stale-job detector should consider: running with a telemetry
/// baseline. Jobs whose `last_telemetry_at` is still NULL (pre-telemetry
/// Node, or a job that hasn't sent its first update yet) are skipped.
pub async fn scan_running_with_telemetry(pool: &Pool<MySql>) -> Result<Vec<BackupJob>, sqlx::Error> {
    sqlx::query_as::<_, BackupJob>(
        "SELECT * FROM backup_jobs
         WHERE status IN ('running', 'stalled') AND last_telemetry_at IS NOT NULL",
    )
    .fetch_all(pool)
    .await
}

/// Finalizes the parent once every child disk is terminal.
pub async fn finalize(
    pool: &Pool<MySql>,
    id: &str,
    bytes_transferred: i64,
    status: &str,
    error_message: Option<&str>,
    completed_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE backup_jobs
         SET bytes_transferred = ?, status = ?, error_message = ?, completed_at = ?
         WHERE id = ?",
    )
    .bind(bytes_transferred)
    .bind(status)
    .bind(error_message)
    .bind(completed_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_cancelled(pool: &Pool<MySql>, id: &str, now: DateTime<Utc>) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE backup_jobs SET status = 'cancelled', completed_at = ? WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_job(pool: &Pool<MySql>, id: &str) -> Result<(), sqlx::Error> {
    // Cascades to backup_disks, which cascades to restore_mounts.
    sqlx::query("DELETE FROM backup_jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_id_is_stable_format() {
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(new_backup_id("pgtest1", now), format!("backup-pgtest1-{}", now.timestamp()));
    }
}
