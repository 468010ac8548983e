//! Restore mount manager: attaches a backup disk's qcow2
//! image read-only to a kernel NBD device, discovers what's on it, mounts
//! the most promising filesystem, and tracks the mount's idle lifetime.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use log::{info, warn};
use sqlx::{MySql, Pool};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::sleep;
use uuid::Uuid;

use crate::db::queries::{disks as disks_db, mounts as mounts_db};
use crate::db::tables::RestoreMount;
use crate::restore::blockdev::{self, BlockDevError};
use crate::restore::device_pool::{DevicePoolError, NbdDevicePool};

const SCAN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum MountError {
    #[error("backup disk {0} not found")]
    DiskNotFound(i64),
    #[error("backup disk {0} has not completed yet")]
    DiskNotReady(i64),
    #[error(transparent)]
    DevicePool(#[from] DevicePoolError),
    #[error("failed to attach nbd device: {0}")]
    AttachFailed(String),
    #[error(transparent)]
    BlockDev(#[from] BlockDevError),
    #[error("no mountable filesystem found on backup disk {0}")]
    NoFilesystemFound(i64),
    #[error("failed to mount {0} at {1}: {2}")]
    MountFailed(String, String, String),
    #[error("mount {0} not found")]
    MountNotFound(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub struct MountManager {
    pool: Pool<MySql>,
    devices: Arc<NbdDevicePool>,
    restore_root: String,
    idle_ttl_secs: i64,
}

impl MountManager {
    pub fn new(pool: Pool<MySql>, devices: Arc<NbdDevicePool>, restore_root: String, idle_ttl_secs: i64) -> Self {
        Self {
            pool,
            devices,
            restore_root,
            idle_ttl_secs,
        }
    }

    /// Attaches `backup_disk_id`'s image read-only, discovers a mountable
    /// filesystem on it, mounts it, and records a `restore_mounts` row.
    /// Any failure after device attachment tears the device back down.
    pub async fn create_mount(&self, backup_disk_id: i64) -> Result<RestoreMount, MountError> {
        let disk = disks_db::get_disk_by_id(&self.pool, backup_disk_id)
            .await?
            .ok_or(MountError::DiskNotFound(backup_disk_id))?;
        if disk.status() != crate::db::tables::DiskStatus::Completed {
            return Err(MountError::DiskNotReady(backup_disk_id));
        }

        let mount_id = format!("mount-{}", Uuid::new_v4());
        let device = self.devices.allocate(&mount_id)?;

        match self.attach_and_mount(&mount_id, &device, &disk.qcow2_path, backup_disk_id).await {
            Ok((mount_path, filesystem_type, partition_device, lvm_vg_name)) => {
                let now = Utc::now();
                let expires_at = now + ChronoDuration::seconds(self.idle_ttl_secs);
                let mount = mounts_db::create_mount(
                    &self.pool,
                    &mount_id,
                    backup_disk_id,
                    &disk.qcow2_path,
                    &device,
                    &mount_path,
                    filesystem_type.as_deref(),
                    partition_device.as_deref(),
                    lvm_vg_name.as_deref(),
                    now,
                    expires_at,
                )
                .await?;
                Ok(mount)
            }
            Err(e) => {
                self.teardown_device(&device, &mount_id, None).await;
                self.devices.release(&device);
                Err(e)
            }
        }
    }

    async fn attach_and_mount(
        &self,
        mount_id: &str,
        device: &str,
        qcow2_path: &str,
        backup_disk_id: i64,
    ) -> Result<(String, Option<String>, Option<String>, Option<String>), MountError> {
        let output = Command::new("qemu-nbd")
            .arg("--read-only")
            .arg(format!("--connect={device}"))
            .arg(qcow2_path)
            .output()
            .await
            .map_err(|e| MountError::AttachFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(MountError::AttachFailed(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        blockdev::partprobe(device).await?;
        let candidates = self.choose_mount_target(device, backup_disk_id).await?;

        let mount_path = format!("{}/{}", self.restore_root, mount_id);
        tokio::fs::create_dir_all(&mount_path)
            .await
            .map_err(|e| MountError::MountFailed(candidates.device_path.clone(), mount_path.clone(), e.to_string()))?;

        let mut cmd = Command::new("mount");
        cmd.arg("-o").arg("ro");
        if let Some(fstype) = &candidates.fstype {
            cmd.arg("-t").arg(fstype);
        }
        cmd.arg(&candidates.device_path).arg(&mount_path);
        let output = cmd
            .output()
            .await
            .map_err(|e| MountError::MountFailed(candidates.device_path.clone(), mount_path.clone(), e.to_string()))?;
        if !output.status.success() {
            return Err(MountError::MountFailed(
                candidates.device_path.clone(),
                mount_path.clone(),
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }

        Ok((mount_path, candidates.fstype, candidates.partition_device, candidates.lvm_vg_name))
    }

    /// Enumerates the device's partitions, activates any LVM volume groups
    /// found, and deterministically picks a mount candidate: a label/name
    /// hinting at "root" or "OS" wins outright, otherwise the largest
    /// mountable filesystem wins, and ties break on ascending device-node
    /// name so the choice never depends on enumeration order.
    async fn choose_mount_target(&self, device: &str, backup_disk_id: i64) -> Result<MountTarget, MountError> {
        let partitions = blockdev::list_block_devices(device).await?;

        let mut candidates: Vec<Candidate> = Vec::new();

        for part in &partitions {
            if part.device_type != "part" && part.device_type != "disk" {
                continue;
            }
            match part.fstype.as_deref() {
                Some("LVM2_member") => {
                    let path = format!("/dev/{}", part.name);
                    let vgs = blockdev::activate_lvm_on_device(&path).await?;
                    for vg in vgs {
                        for lv in blockdev::list_logical_volumes(&vg).await? {
                            if is_usable_fs(lv.fstype.as_deref()) {
                                candidates.push(Candidate {
                                    device_path: lv.lv_path.clone(),
                                    fstype: lv.fstype.clone(),
                                    size_bytes: lv.size_bytes,
                                    is_hinted: is_hinted(lv.label.as_deref()) || is_hinted(Some(&lv.lv_name)),
                                    lvm_vg_name: Some(vg.clone()),
                                });
                            }
                        }
                    }
                }
                fstype if is_usable_fs(fstype) => {
                    let path = format!("/dev/{}", part.name);
                    candidates.push(Candidate {
                        device_path: path,
                        fstype: part.fstype.clone(),
                        size_bytes: part.size_bytes,
                        is_hinted: is_hinted(part.label.as_deref()) || is_hinted(Some(&part.name)),
                        lvm_vg_name: None,
                    });
                }
                _ => {}
            }
        }

        candidates.sort_by(|a, b| {
            b.is_hinted
                .cmp(&a.is_hinted)
                .then_with(|| b.size_bytes.cmp(&a.size_bytes))
                .then_with(|| a.device_path.cmp(&b.device_path))
        });

        let chosen = candidates
            .into_iter()
            .next()
            .ok_or(MountError::NoFilesystemFound(backup_disk_id))?;

        let partition_device = if chosen.device_path != device {
            Some(chosen.device_path.clone())
        } else {
            None
        };
        Ok(MountTarget {
            device_path: chosen.device_path,
            fstype: chosen.fstype,
            partition_device,
            lvm_vg_name: chosen.lvm_vg_name,
        })
    }

    pub async fn touch(&self, mount_id: &str) -> Result<(), MountError> {
        mounts_db::get_mount(&self.pool, mount_id)
            .await?
            .ok_or_else(|| MountError::MountNotFound(mount_id.to_string()))?;
        let now = Utc::now();
        let expires_at = now + ChronoDuration::seconds(self.idle_ttl_secs);
        mounts_db::touch_mount(&self.pool, mount_id, now, expires_at).await?;
        Ok(())
    }

    /// Idempotent: unmounting a `mount_id` that doesn't exist (or was
    /// already torn down) is a no-op success, per spec.md's unmount contract.
    pub async fn delete_mount(&self, mount_id: &str) -> Result<(), MountError> {
        let Some(mount) = mounts_db::get_mount(&self.pool, mount_id).await? else {
            return Ok(());
        };

        mounts_db::set_status(&self.pool, mount_id, "unmounting").await?;
        self.teardown_device(&mount.nbd_device, mount_id, Some(&mount)).await;
        self.devices.release_by_mount_id(mount_id);
        mounts_db::delete_mount(&self.pool, mount_id).await?;
        Ok(())
    }

    async fn teardown_device(&self, device: &str, mount_id: &str, mount: Option<&RestoreMount>) {
        if let Some(mount) = mount {
            let _ = Command::new("umount").arg(&mount.mount_path).output().await;
            let _ = tokio::fs::remove_dir(&mount.mount_path).await;
            if let Some(vg) = &mount.lvm_vg_name {
                if let Err(e) = blockdev::deactivate_lvm(vg).await {
                    warn!("mount {mount_id}: failed to deactivate volume group {vg}: {e}");
                }
            }
        }
        let _ = Command::new("qemu-nbd").arg("-d").arg(device).output().await;
    }

    /// Background task: unmounts anything past its idle expiry.
    pub async fn run_idle_scanner(self: Arc<Self>) {
        loop {
            sleep(SCAN_INTERVAL).await;
            if let Err(e) = self.scan_once().await {
                warn!("restore mount idle scan failed: {e}");
            }
        }
    }

    async fn scan_once(&self) -> Result<(), MountError> {
        for mount in mounts_db::expired_mounts(&self.pool, Utc::now()).await? {
            info!("mount {} idle past expiry, unmounting", mount.id);
            if let Err(e) = self.delete_mount(&mount.id).await {
                warn!("failed to unmount expired mount {}: {e}", mount.id);
            }
        }
        Ok(())
    }
}

struct MountTarget {
    device_path: String,
    fstype: Option<String>,
    partition_device: Option<String>,
    lvm_vg_name: Option<String>,
}

struct Candidate {
    device_path: String,
    fstype: Option<String>,
    size_bytes: u64,
    is_hinted: bool,
    lvm_vg_name: Option<String>,
}

fn is_usable_fs(fstype: Option<&str>) -> bool {
    matches!(fstype, Some(f) if f != "swap" && f != "LVM2_member" && !f.is_empty())
}

/// "root"/"OS" hints in a filesystem label or volume/LV name, matched
/// case-insensitively against whole words so e.g. "rootfs" and "OS-disk"
/// both count but "chroot" and "costume" don't.
fn is_hinted(name: Option<&str>) -> bool {
    let Some(name) = name else { return false };
    let lower = name.to_ascii_lowercase();
    lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|w| w == "root" || w == "rootfs" || w == "os")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_usable_fs_excludes_swap_and_lvm_member() {
        assert!(!is_usable_fs(Some("swap")));
        assert!(!is_usable_fs(Some("LVM2_member")));
        assert!(!is_usable_fs(None));
        assert!(is_usable_fs(Some("ext4")));
        assert!(is_usable_fs(Some("xfs")));
    }

    #[test]
    fn is_hinted_matches_root_and_os_names() {
        assert!(is_hinted(Some("root")));
        assert!(is_hinted(Some("rootfs")));
        assert!(is_hinted(Some("OS-disk")));
        assert!(is_hinted(Some("lv_root")));
        assert!(!is_hinted(Some("data")));
        assert!(!is_hinted(None));
    }
}
