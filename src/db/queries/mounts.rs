//! Queries against `restore_mounts`.

use chrono::{DateTime, Utc};
use sqlx::{MySql, Pool};

use crate::db::tables::RestoreMount;

#[allow(clippy::too_many_arguments)]
pub async fn create_mount(
    pool: &Pool<MySql>,
    id: &str,
    backup_disk_id: i64,
    qcow2_path: &str,
    nbd_device: &str,
    mount_path: &str,
    filesystem_type: Option<&str>,
    partition_device: Option<&str>,
    lvm_vg_name: Option<&str>,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<RestoreMount, sqlx::Error> {
    sqlx::query(
        "INSERT INTO restore_mounts
            (id, backup_disk_id, qcow2_path, nbd_device, mount_path, filesystem_type,
             partition_device, lvm_vg_name, status, created_at, last_accessed_at, expires_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'mounted', ?, ?, ?)",
    )
    .bind(id)
    .bind(backup_disk_id)
    .bind(qcow2_path)
    .bind(nbd_device)
    .bind(mount_path)
    .bind(filesystem_type)
    .bind(partition_device)
    .bind(lvm_vg_name)
    .bind(now)
    .bind(now)
    .bind(expires_at)
    .execute(pool)
    .await?;

    get_mount(pool, id).await?.ok_or_else(|| sqlx::Error::RowNotFound)
}

pub async fn get_mount(pool: &Pool<MySql>, id: &str) -> Result<Option<RestoreMount>, sqlx::Error> {
    sqlx::query_as::<_, RestoreMount>("SELECT * FROM restore_mounts WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn list_mounts(pool: &Pool<MySql>) -> Result<Vec<RestoreMount>, sqlx::Error> {
    sqlx::query_as::<_, RestoreMount>("SELECT * FROM restore_mounts ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
}

pub async fn touch_mount(
    pool: &Pool<MySql>,
    id: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE restore_mounts SET last_accessed_at = ?, expires_at = ? WHERE id = ?")
        .bind(now)
        .bind(expires_at)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_status(pool: &Pool<MySql>, id: &str, status: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE restore_mounts SET status = ? WHERE id = ?")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn expired_mounts(pool: &Pool<MySql>, now: DateTime<Utc>) -> Result<Vec<RestoreMount>, sqlx::Error> {
    sqlx::query_as::<_, RestoreMount>(
        "SELECT * FROM restore_mounts WHERE expires_at < ? AND status = 'mounted'",
    )
    .bind(now)
    .fetch_all(pool)
    .await
}

pub async fn delete_mount(pool: &Pool<MySql>, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM restore_mounts WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}
