//! Backup chain resolution: a full backup is its own root, an incremental
//! names its parent via `backup_jobs.parent_backup_id`. A
//! chain is restorable end-to-end only if every ancestor image file still
//! exists at its recorded path.

use sqlx::{MySql, Pool};

use crate::db::queries::{disks as disks_db, jobs as jobs_db};
use crate::db::tables::BackupJob;
use crate::error::CoreError;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ChainEntry {
    pub backup_id: String,
    pub backup_type: String,
    pub status: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub is_restorable: bool,
}

/// Walks `parent_backup_id` from the newest job in the context back to the
/// root full backup, oldest first.
pub async fn resolve_chain(pool: &Pool<MySql>, context_id: &str) -> Result<Vec<ChainEntry>, CoreError> {
    let jobs = jobs_db::list_jobs(pool, None, None)
        .await
        .map_err(CoreError::from)?
        .into_iter()
        .filter(|j| j.context_id == context_id)
        .collect::<Vec<_>>();

    // Walk forward from each full backup (no parent) following the chain
    // children reference via parent_backup_id; since disks within a job
    // all share the same parent, job-level walking is sufficient.
    let mut by_id: std::collections::HashMap<String, BackupJob> =
        jobs.into_iter().map(|j| (j.id.clone(), j)).collect();

    // Find leaves: jobs no other job names as its parent.
    let parented: std::collections::HashSet<String> = by_id
        .values()
        .filter_map(|j| j.parent_backup_id.clone())
        .collect();

    let mut chains: Vec<Vec<String>> = Vec::new();
    let roots: Vec<String> = by_id
        .values()
        .filter(|j| j.parent_backup_id.is_none())
        .map(|j| j.id.clone())
        .collect();

    for root in roots {
        let mut chain = vec![root.clone()];
        let mut current = root;
        loop {
            let next = by_id
                .values()
                .find(|j| j.parent_backup_id.as_deref() == Some(current.as_str()))
                .map(|j| j.id.clone());
            match next {
                Some(n) => {
                    chain.push(n.clone());
                    current = n;
                }
                None => break,
            }
        }
        chains.push(chain);
    }

    // A chain with no entries counted as "parented" elsewhere is a complete
    // walk; flatten them all (in practice one chain per context per disk
    // family, but the walk supports concurrent chains if they ever exist).
    let _ = parented;
    let mut ordered_ids: Vec<String> = Vec::new();
    for chain in chains {
        ordered_ids.extend(chain);
    }

    let mut entries = Vec::with_capacity(ordered_ids.len());
    for id in ordered_ids {
        let job = by_id.remove(&id).expect("id came from by_id");
        let restorable = is_restorable(pool, &job).await?;
        entries.push(ChainEntry {
            backup_id: job.id,
            backup_type: job.backup_type,
            status: job.status,
            created_at: job.created_at,
            is_restorable: restorable,
        });
    }
    Ok(entries)
}

/// A job is restorable only if every one of its disks' image files (and,
/// transitively, every ancestor's) still exists on disk.
async fn is_restorable(pool: &Pool<MySql>, job: &BackupJob) -> Result<bool, CoreError> {
    let disks = disks_db::list_disks_for_job(pool, &job.id)
        .await
        .map_err(CoreError::from)?;
    for disk in &disks {
        if tokio::fs::metadata(&disk.qcow2_path).await.is_err() {
            return Ok(false);
        }
        if let Some(backing) = &disk.backing_path {
            if tokio::fs::metadata(backing).await.is_err() {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// A backup whose image is a backing target for any later backup MUST NOT
/// be deleted; deleting a leaf is allowed (the parent becomes the new leaf).
pub async fn assert_deletable(pool: &Pool<MySql>, backup_id: &str) -> Result<(), CoreError> {
    let disks = disks_db::list_disks_for_job(pool, backup_id)
        .await
        .map_err(CoreError::from)?;
    for disk in &disks {
        if disks_db::is_backing_file_target(pool, &disk.qcow2_path)
            .await
            .map_err(CoreError::from)?
        {
            return Err(CoreError::Precondition(format!(
                "backup '{backup_id}' is a backing file for a later backup and cannot be deleted"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, context_id: &str, parent: Option<&str>) -> BackupJob {
        BackupJob {
            id: id.to_string(),
            context_id: context_id.to_string(),
            vm_name: "pgtest1".to_string(),
            repository_id: 1,
            backup_type: if parent.is_none() { "full" } else { "incremental" }.to_string(),
            status: "completed".to_string(),
            parent_backup_id: parent.map(|p| p.to_string()),
            created_at: chrono::Utc::now(),
            completed_at: None,
            bytes_transferred: 0,
            total_bytes: None,
            progress_percent: 100.0,
            current_phase: None,
            last_telemetry_at: None,
            error_message: None,
        }
    }

    #[test]
    fn chain_walk_orders_root_first() {
        let f = job("F", "ctx", None);
        let i1 = job("I1", "ctx", Some("F"));
        let i2 = job("I2", "ctx", Some("I1"));
        let by_id: std::collections::HashMap<_, _> = [f, i1, i2]
            .into_iter()
            .map(|j| (j.id.clone(), j))
            .collect();
        let root = by_id
            .values()
            .find(|j| j.parent_backup_id.is_none())
            .unwrap()
            .id
            .clone();
        let mut chain = vec![root.clone()];
        let mut current = root;
        loop {
            match by_id
                .values()
                .find(|j| j.parent_backup_id.as_deref() == Some(current.as_str()))
                .map(|j| j.id.clone())
            {
                Some(n) => {
                    chain.push(n.clone());
                    current = n;
                }
                None => break,
            }
        }
        assert_eq!(chain, vec!["F", "I1", "I2"]);
    }
}
