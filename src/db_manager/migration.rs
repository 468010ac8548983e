use log::info;
use sqlx::{MySql, Pool};

use crate::db_manager::error::DatabaseError;

/// Creates the Hub's schema if it does not already exist.
///
/// There is exactly one schema version for this core: no platform-specific
/// schemas, no confirm-to-migrate flow. A fresh database gets all five
/// tables created idempotently; an existing database is left untouched.
pub struct MigrationManager;

impl MigrationManager {
    pub async fn initialize_schema(pool: &Pool<MySql>) -> Result<(), DatabaseError> {
        info!("ensuring vmbak schema is present");

        Self::create_table(
            pool,
            "repositories",
            r#"
            CREATE TABLE IF NOT EXISTS repositories (
                id         BIGINT UNSIGNED AUTO_INCREMENT PRIMARY KEY,
                name       VARCHAR(255) NOT NULL,
                root_path  VARCHAR(1024) NOT NULL,
                created_at DATETIME NOT NULL
            )
            "#,
        )
        .await?;

        Self::create_table(
            pool,
            "vm_disk_inventory",
            r#"
            CREATE TABLE IF NOT EXISTS vm_disk_inventory (
                id              BIGINT UNSIGNED AUTO_INCREMENT PRIMARY KEY,
                vm_name         VARCHAR(255) NOT NULL,
                disk_index      INT UNSIGNED NOT NULL,
                vmware_disk_key INT UNSIGNED NOT NULL,
                size_bytes      BIGINT UNSIGNED NOT NULL,
                datastore       VARCHAR(255) NOT NULL,
                vmdk_path       VARCHAR(1024) NOT NULL,
                label           VARCHAR(255) NOT NULL,
                credential_id   VARCHAR(255) NOT NULL,
                vm_path         VARCHAR(1024) NOT NULL,
                UNIQUE KEY vm_disk_unique (vm_name, disk_index)
            )
            "#,
        )
        .await?;

        Self::create_table(
            pool,
            "vm_backup_contexts",
            r#"
            CREATE TABLE IF NOT EXISTS vm_backup_contexts (
                id                  VARCHAR(128) PRIMARY KEY,
                vm_name             VARCHAR(255) NOT NULL,
                repository_id       BIGINT UNSIGNED NOT NULL,
                total_backups_run   BIGINT UNSIGNED NOT NULL DEFAULT 0,
                successful_backups  BIGINT UNSIGNED NOT NULL DEFAULT 0,
                failed_backups      BIGINT UNSIGNED NOT NULL DEFAULT 0,
                last_backup_id      VARCHAR(128),
                UNIQUE KEY vm_repo_unique (vm_name, repository_id)
            )
            "#,
        )
        .await?;

        Self::create_table(
            pool,
            "backup_jobs",
            r#"
            CREATE TABLE IF NOT EXISTS backup_jobs (
                id                  VARCHAR(128) PRIMARY KEY,
                context_id          VARCHAR(128) NOT NULL,
                vm_name             VARCHAR(255) NOT NULL,
                repository_id       BIGINT UNSIGNED NOT NULL,
                backup_type         VARCHAR(16) NOT NULL,
                status              VARCHAR(16) NOT NULL,
                parent_backup_id    VARCHAR(128),
                created_at          DATETIME NOT NULL,
                completed_at        DATETIME,
                bytes_transferred   BIGINT UNSIGNED NOT NULL DEFAULT 0,
                total_bytes         BIGINT UNSIGNED,
                progress_percent    DOUBLE NOT NULL DEFAULT 0,
                current_phase       VARCHAR(32),
                last_telemetry_at   DATETIME,
                error_message       TEXT,
                FOREIGN KEY (context_id) REFERENCES vm_backup_contexts(id)
            )
            "#,
        )
        .await?;

        Self::create_table(
            pool,
            "backup_disks",
            r#"
            CREATE TABLE IF NOT EXISTS backup_disks (
                id                  BIGINT UNSIGNED AUTO_INCREMENT PRIMARY KEY,
                backup_job_id       VARCHAR(128) NOT NULL,
                disk_index          INT UNSIGNED NOT NULL,
                vmware_disk_key     INT UNSIGNED NOT NULL,
                qcow2_path          VARCHAR(1024) NOT NULL,
                backing_path        VARCHAR(1024),
                size_gb             DOUBLE NOT NULL,
                disk_change_id      VARCHAR(255),
                bytes_transferred   BIGINT UNSIGNED NOT NULL DEFAULT 0,
                progress_percent    DOUBLE NOT NULL DEFAULT 0,
                status              VARCHAR(16) NOT NULL,
                error_message       TEXT,
                completed_at        DATETIME,
                UNIQUE KEY job_disk_unique (backup_job_id, disk_index),
                FOREIGN KEY (backup_job_id) REFERENCES backup_jobs(id) ON DELETE CASCADE
            )
            "#,
        )
        .await?;

        Self::create_table(
            pool,
            "restore_mounts",
            r#"
            CREATE TABLE IF NOT EXISTS restore_mounts (
                id                  VARCHAR(64) PRIMARY KEY,
                backup_disk_id      BIGINT UNSIGNED NOT NULL,
                qcow2_path          VARCHAR(1024) NOT NULL,
                nbd_device          VARCHAR(32) NOT NULL,
                mount_path          VARCHAR(1024) NOT NULL,
                filesystem_type     VARCHAR(32),
                partition_device    VARCHAR(64),
                lvm_vg_name         VARCHAR(255),
                status              VARCHAR(16) NOT NULL,
                created_at          DATETIME NOT NULL,
                last_accessed_at    DATETIME NOT NULL,
                expires_at          DATETIME NOT NULL,
                FOREIGN KEY (backup_disk_id) REFERENCES backup_disks(id) ON DELETE CASCADE
            )
            "#,
        )
        .await?;

        info!("schema ready");
        Ok(())
    }

    async fn create_table(
        pool: &Pool<MySql>,
        name: &str,
        ddl: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| DatabaseError::SchemaError(format!("table '{}': {}", name, e)))?;
        Ok(())
    }
}
