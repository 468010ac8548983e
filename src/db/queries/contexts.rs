//! Queries against `vm_backup_contexts` -- the persistent
//! "we back up this VM into this repository" record.

use sqlx::{MySql, Pool};

use crate::db::tables::VmBackupContext;

/// Deterministic, stable across backups and readable in file paths.
pub fn context_id(vm_name: &str, repository_id: i64) -> String {
    format!("ctx-{vm_name}-{repository_id}")
}

pub async fn get_context(
    pool: &Pool<MySql>,
    id: &str,
) -> Result<Option<VmBackupContext>, sqlx::Error> {
    sqlx::query_as::<_, VmBackupContext>("SELECT * FROM vm_backup_contexts WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Finds the context for `(vm_name, repository_id)`, creating it on first use.
pub async fn find_or_create_context(
    pool: &Pool<MySql>,
    vm_name: &str,
    repository_id: i64,
) -> Result<VmBackupContext, sqlx::Error> {
    let id = context_id(vm_name, repository_id);
    if let Some(existing) = get_context(pool, &id).await? {
        return Ok(existing);
    }

    sqlx::query(
        "INSERT INTO vm_backup_contexts
            (id, vm_name, repository_id, total_backups_run, successful_backups, failed_backups, last_backup_id)
         VALUES (?, ?, ?, 0, 0, 0, NULL)
         ON DUPLICATE KEY UPDATE id = id",
    )
    .bind(&id)
    .bind(vm_name)
    .bind(repository_id)
    .execute(pool)
    .await?;

    get_context(pool, &id)
        .await?
        .ok_or_else(|| sqlx::Error::RowNotFound)
}

/// Called once a parent `backup_jobs` row reaches a terminal state.
pub async fn record_job_outcome(
    pool: &Pool<MySql>,
    context_id: &str,
    backup_id: &str,
    succeeded: bool,
) -> Result<(), sqlx::Error> {
    if succeeded {
        sqlx::query(
            "UPDATE vm_backup_contexts
             SET total_backups_run = total_backups_run + 1,
                 successful_backups = successful_backups + 1,
                 last_backup_id = ?
             WHERE id = ?",
        )
        .bind(backup_id)
        .bind(context_id)
        .execute(pool)
        .await?;
    } else {
        sqlx::query(
            "UPDATE vm_backup_contexts
             SET total_backups_run = total_backups_run + 1,
                 failed_backups = failed_backups + 1
             WHERE id = ?",
        )
        .bind(context_id)
        .execute(pool)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_id_is_deterministic_and_readable() {
        assert_eq!(context_id("pgtest1", 1), "ctx-pgtest1-1");
        assert_eq!(context_id("pgtest1", 1), context_id("pgtest1", 1));
    }
}
