//! Creation of the copy-on-write image files backup disks are written
//! into, under `repository_root/context_id/disk-{index}/...`.

use chrono::Utc;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("failed to create directory {0}: {1}")]
    CreateDir(String, String),
    #[error("qemu-img create failed: {0}")]
    QemuImg(String),
}

/// `repository_root/context_id/disk-{index}/backup-{vm}-disk{index}-{YYYYMMDD-HHMMSS}.qcow2`
pub fn image_path(repository_root: &str, context_id: &str, vm_name: &str, disk_index: i64) -> String {
    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    format!(
        "{repository_root}/{context_id}/disk-{disk_index}/backup-{vm_name}-disk{disk_index}-{timestamp}.qcow2"
    )
}

/// Creates a new qcow2 image. For a full backup `backing_path` is `None`;
/// for an incremental it is the absolute path of the most recent completed
/// backup's image for this disk, referenced as the new image's backing file
/// so the child stores only diverging blocks.
pub async fn create_image(
    path: &str,
    size_bytes: i64,
    backing_path: Option<&str>,
) -> Result<(), ImageError> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ImageError::CreateDir(parent.display().to_string(), e.to_string()))?;
    }

    let mut cmd = Command::new("qemu-img");
    cmd.arg("create").arg("-f").arg("qcow2");
    if let Some(backing) = backing_path {
        cmd.arg("-b").arg(backing).arg("-F").arg("qcow2");
    }
    cmd.arg(path);
    // qemu-img requires an explicit size even with a backing file (it
    // defaults to the backing file's virtual size if omitted, but we pass
    // it through so a shrunk/grown VMware disk is represented honestly).
    cmd.arg(size_bytes.to_string());

    let output = cmd
        .output()
        .await
        .map_err(|e| ImageError::QemuImg(e.to_string()))?;
    if !output.status.success() {
        return Err(ImageError::QemuImg(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_path_matches_filesystem_layout() {
        let path = image_path("/repo", "ctx-pgtest1-1", "pgtest1", 0);
        assert!(path.starts_with("/repo/ctx-pgtest1-1/disk-0/backup-pgtest1-disk0-"));
        assert!(path.ends_with(".qcow2"));
    }
}
