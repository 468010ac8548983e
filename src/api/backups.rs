//! Backup surface: start, inspect, list, chain-walk and delete VM backups.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rocket::serde::json::Json;
use rocket::{delete, get, post, routes, Route, State};
use serde::{Deserialize, Serialize};
use sqlx::{MySql, Pool};

use crate::backup::chain::{self, ChainEntry};
use crate::backup::orchestrator::{BackupOrchestrator, StartBackupResponse};
use crate::db::queries::{contexts as contexts_db, disks as disks_db, jobs as jobs_db};
use crate::db::tables::{BackupDisk, BackupJob};
use crate::error::CoreError;

#[derive(Debug, Deserialize)]
pub struct StartBackupRequest {
    pub vm_name: String,
    pub repository_id: i64,
    pub backup_type: String,
}

#[post("/backups", format = "json", data = "<request>")]
async fn start_backup(
    request: Json<StartBackupRequest>,
    orchestrator: &State<Arc<BackupOrchestrator>>,
) -> Result<Json<StartBackupResponse>, CoreError> {
    let request = request.into_inner();
    let response = orchestrator
        .start_backup(&request.vm_name, request.repository_id, &request.backup_type)
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
pub struct BackupDetail {
    #[serde(flatten)]
    pub job: BackupJob,
    pub disks: Vec<BackupDisk>,
}

#[get("/backups/<backup_id>")]
async fn get_backup(
    backup_id: &str,
    pool: &State<Pool<MySql>>,
) -> Result<Json<BackupDetail>, CoreError> {
    let job = jobs_db::get_job(pool, backup_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("backup '{backup_id}' not found")))?;
    let disks = disks_db::list_disks_for_job(pool, backup_id).await?;
    Ok(Json(BackupDetail { job, disks }))
}

#[get("/backups?<vm_name>&<status>")]
async fn list_backups(
    vm_name: Option<&str>,
    status: Option<&str>,
    pool: &State<Pool<MySql>>,
) -> Result<Json<Vec<BackupJob>>, CoreError> {
    let jobs = jobs_db::list_jobs(pool, vm_name, status).await?;
    Ok(Json(jobs))
}

#[derive(Debug, Serialize)]
pub struct ChainResponse {
    pub vm_name: String,
    pub repository_id: i64,
    pub entries: Vec<ChainEntry>,
}

#[get("/backups/chain?<vm_name>&<repository_id>")]
async fn get_chain(
    vm_name: &str,
    repository_id: i64,
    pool: &State<Pool<MySql>>,
) -> Result<Json<ChainResponse>, CoreError> {
    let context_id = contexts_db::context_id(vm_name, repository_id);
    let entries = chain::resolve_chain(pool, &context_id).await?;
    Ok(Json(ChainResponse {
        vm_name: vm_name.to_string(),
        repository_id,
        entries,
    }))
}

#[derive(Debug, Serialize)]
pub struct DeleteAck {
    pub backup_id: String,
    pub deleted: bool,
    pub deleted_at: DateTime<Utc>,
}

#[delete("/backups/<backup_id>")]
async fn delete_backup(
    backup_id: &str,
    orchestrator: &State<Arc<BackupOrchestrator>>,
) -> Result<Json<DeleteAck>, CoreError> {
    orchestrator.delete_backup(backup_id).await?;
    Ok(Json(DeleteAck {
        backup_id: backup_id.to_string(),
        deleted: true,
        deleted_at: Utc::now(),
    }))
}

pub fn routes() -> Vec<Route> {
    routes![start_backup, get_backup, list_backups, get_chain, delete_backup]
}
