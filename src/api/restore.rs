//! Restore surface: mount a backup disk read-only, browse it, stream
//! files and directories out of it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rocket::fs::NamedFile;
use rocket::http::Header;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::{delete, get, post, routes, Request, Route, State};
use serde::{Deserialize, Serialize};
use sqlx::{MySql, Pool};

use crate::db::queries::{disks as disks_db, mounts as mounts_db};
use crate::db::tables::RestoreMount;
use crate::error::CoreError;
use crate::restore::browse::{self, ArchiveFormat, FileEntry, ListResult};
use crate::restore::mount::MountManager;

#[derive(Debug, Deserialize)]
pub struct CreateMountRequest {
    pub backup_id: String,
    pub disk_index: i64,
}

#[derive(Debug, Serialize)]
pub struct CreateMountResponse {
    pub mount_id: String,
    pub mount_path: String,
    pub filesystem_type: Option<String>,
    pub nbd_device: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[post("/restore/mount", format = "json", data = "<request>")]
async fn create_mount(
    request: Json<CreateMountRequest>,
    pool: &State<Pool<MySql>>,
    manager: &State<Arc<MountManager>>,
) -> Result<Json<CreateMountResponse>, CoreError> {
    let request = request.into_inner();
    let disk = disks_db::get_disk(pool, &request.backup_id, request.disk_index)
        .await?
        .ok_or_else(|| {
            CoreError::Validation(format!(
                "backup '{}' has no disk {}",
                request.backup_id, request.disk_index
            ))
        })?;

    let mount = manager.create_mount(disk.id).await?;
    Ok(Json(CreateMountResponse {
        mount_id: mount.id,
        mount_path: mount.mount_path,
        filesystem_type: mount.filesystem_type,
        nbd_device: mount.nbd_device,
        expires_at: mount.expires_at,
    }))
}

#[get("/restore/mounts")]
async fn list_mounts(pool: &State<Pool<MySql>>) -> Result<Json<Vec<RestoreMount>>, CoreError> {
    let mounts = mounts_db::list_mounts(pool).await?;
    Ok(Json(mounts))
}

/// Looks up an active mount, refreshes its idle expiry, and hands back its
/// root path -- the one piece of state every browse/download handler needs.
async fn active_mount_root(
    pool: &Pool<MySql>,
    manager: &MountManager,
    mount_id: &str,
) -> Result<PathBuf, CoreError> {
    let mount = mounts_db::get_mount(pool, mount_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("mount '{mount_id}' not found")))?;
    if mount.status() != crate::db::tables::RestoreMountStatus::Mounted {
        return Err(CoreError::MountUnavailable(format!(
            "mount '{mount_id}' is {}",
            mount.status()
        )));
    }
    manager.touch(mount_id).await?;
    Ok(PathBuf::from(mount.mount_path))
}

#[get("/restore/<mount_id>/files?<path>&<recursive>")]
async fn list_files(
    mount_id: &str,
    path: Option<&str>,
    recursive: Option<bool>,
    pool: &State<Pool<MySql>>,
    manager: &State<Arc<MountManager>>,
) -> Result<Json<ListResult>, CoreError> {
    let root = active_mount_root(pool, manager, mount_id).await?;
    let target = browse::resolve_path(&root, path.unwrap_or("/"))?;
    let result = browse::list_dir(&root, &target, recursive.unwrap_or(false)).await?;
    Ok(Json(result))
}

#[get("/restore/<mount_id>/file-info?<path>")]
async fn file_info(
    mount_id: &str,
    path: &str,
    pool: &State<Pool<MySql>>,
    manager: &State<Arc<MountManager>>,
) -> Result<Json<FileEntry>, CoreError> {
    let root = active_mount_root(pool, manager, mount_id).await?;
    let target = browse::resolve_path(&root, path)?;
    let entry = browse::file_info(&root, &target).await?;
    Ok(Json(entry))
}

/// Wraps `NamedFile` (sized body, Content-Type from extension) to add the
/// filename-preserving `Content-Disposition` header the download needs.
pub struct FileDownload {
    file: NamedFile,
    filename: String,
}

impl<'r> Responder<'r, 'static> for FileDownload {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        let mut built = self.file.respond_to(request)?;
        built.set_header(Header::new(
            "Content-Disposition",
            browse::content_disposition(&self.filename),
        ));
        Ok(built)
    }
}

#[get("/restore/<mount_id>/download?<path>")]
async fn download_file(
    mount_id: &str,
    path: &str,
    pool: &State<Pool<MySql>>,
    manager: &State<Arc<MountManager>>,
) -> Result<FileDownload, CoreError> {
    let root = active_mount_root(pool, manager, mount_id).await?;
    let target = browse::resolve_path(&root, path)?;
    let filename = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());

    let file = NamedFile::open(&target)
        .await
        .map_err(|e| CoreError::NotFound(format!("{}: {e}", target.display())))?;
    Ok(FileDownload { file, filename })
}

/// A streamed archive body of unknown length -- the reader feeds off the
/// background task in `restore::browse::stream_directory` as it produces
/// bytes, so the response headers go out before the archive is finished.
pub struct DirectoryDownload {
    reader: tokio::io::DuplexStream,
    content_type: &'static str,
    filename: String,
}

impl<'r> Responder<'r, 'static> for DirectoryDownload {
    fn respond_to(self, _request: &'r Request<'_>) -> response::Result<'static> {
        rocket::Response::build()
            .raw_header("Content-Type", self.content_type)
            .raw_header("Content-Disposition", browse::content_disposition(&self.filename))
            .streamed_body(self.reader)
            .ok()
    }
}

#[get("/restore/<mount_id>/download-directory?<path>&<format>")]
async fn download_directory(
    mount_id: &str,
    path: Option<&str>,
    format: Option<&str>,
    pool: &State<Pool<MySql>>,
    manager: &State<Arc<MountManager>>,
) -> Result<DirectoryDownload, CoreError> {
    let root = active_mount_root(pool, manager, mount_id).await?;
    let target = browse::resolve_path(&root, path.unwrap_or("/"))?;
    let archive_format = format
        .map(ArchiveFormat::parse)
        .unwrap_or(Some(ArchiveFormat::Zip))
        .ok_or_else(|| CoreError::Validation(format!("unknown archive format '{}'", format.unwrap_or(""))))?;

    let dir_name = dir_label(&target, &root);
    let reader = browse::stream_directory(target, archive_format).await?;

    Ok(DirectoryDownload {
        reader,
        content_type: archive_format.content_type(),
        filename: format!("{dir_name}.{}", archive_format.extension()),
    })
}

fn dir_label(target: &Path, root: &Path) -> String {
    if target == root {
        "mount".to_string()
    } else {
        target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "mount".to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct UnmountAck {
    pub mount_id: String,
    pub unmounted: bool,
}

#[delete("/restore/<mount_id>")]
async fn unmount(
    mount_id: &str,
    manager: &State<Arc<MountManager>>,
) -> Result<Json<UnmountAck>, CoreError> {
    manager.delete_mount(mount_id).await?;
    Ok(Json(UnmountAck {
        mount_id: mount_id.to_string(),
        unmounted: true,
    }))
}

pub fn routes() -> Vec<Route> {
    routes![
        create_mount,
        list_mounts,
        list_files,
        file_info,
        download_file,
        download_directory,
        unmount,
    ]
}
