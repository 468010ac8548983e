use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A storage location the Hub can place backup image files under.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    pub root_path: String,
    pub created_at: DateTime<Utc>,
}

/// One disk of a VM, as discovered out-of-band and consumed read-only here.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct VmDiskInventoryRow {
    pub id: i64,
    pub vm_name: String,
    pub disk_index: i64,
    pub vmware_disk_key: i64,
    pub size_bytes: i64,
    pub datastore: String,
    pub vmdk_path: String,
    pub label: String,
    pub credential_id: String,
    pub vm_path: String,
}

/// The persistent "we back up this VM into this repository" record.
///
/// Created lazily on first backup; owns the chain of backup_jobs run against it.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct VmBackupContext {
    pub id: String,
    pub vm_name: String,
    pub repository_id: i64,
    pub total_backups_run: i64,
    pub successful_backups: i64,
    pub failed_backups: i64,
    pub last_backup_id: Option<String>,
}

/// `backup_jobs.backup_type` -- 'full' or 'incremental'.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupType {
    Full,
    Incremental,
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupType::Full => write!(f, "full"),
            BackupType::Incremental => write!(f, "incremental"),
        }
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            other => Err(format!("unknown backup_type '{other}'")),
        }
    }
}

/// `backup_jobs.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupJobStatus {
    Pending,
    Running,
    Stalled,
    Completed,
    Failed,
    Cancelled,
}

impl BackupJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BackupJobStatus::Completed | BackupJobStatus::Failed | BackupJobStatus::Cancelled
        )
    }
}

impl fmt::Display for BackupJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupJobStatus::Pending => "pending",
            BackupJobStatus::Running => "running",
            BackupJobStatus::Stalled => "stalled",
            BackupJobStatus::Completed => "completed",
            BackupJobStatus::Failed => "failed",
            BackupJobStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for BackupJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BackupJobStatus::Pending),
            "running" => Ok(BackupJobStatus::Running),
            "stalled" => Ok(BackupJobStatus::Stalled),
            "completed" => Ok(BackupJobStatus::Completed),
            "failed" => Ok(BackupJobStatus::Failed),
            "cancelled" => Ok(BackupJobStatus::Cancelled),
            other => Err(format!("unknown backup job status '{other}'")),
        }
    }
}

/// `backup_disks.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl DiskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DiskStatus::Completed | DiskStatus::Failed)
    }
}

impl fmt::Display for DiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiskStatus::Pending => "pending",
            DiskStatus::Running => "running",
            DiskStatus::Completed => "completed",
            DiskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for DiskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DiskStatus::Pending),
            "running" => Ok(DiskStatus::Running),
            "completed" => Ok(DiskStatus::Completed),
            "failed" => Ok(DiskStatus::Failed),
            other => Err(format!("unknown disk status '{other}'")),
        }
    }
}

/// The parent row of a single VM backup run.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: String,
    pub context_id: String,
    pub vm_name: String,
    pub repository_id: i64,
    pub backup_type: String,
    pub status: String,
    /// The direct chain ancestor this job was built against, if incremental.
    pub parent_backup_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub bytes_transferred: i64,
    pub total_bytes: Option<i64>,
    pub progress_percent: f64,
    pub current_phase: Option<String>,
    pub last_telemetry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl BackupJob {
    pub fn status(&self) -> BackupJobStatus {
        self.status.parse().unwrap_or(BackupJobStatus::Failed)
    }
}

/// One disk of one backup job.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct BackupDisk {
    pub id: i64,
    pub backup_job_id: String,
    pub disk_index: i64,
    pub vmware_disk_key: i64,
    pub qcow2_path: String,
    /// Absolute path of the image this one is layered on, if incremental.
    pub backing_path: Option<String>,
    pub size_gb: f64,
    pub disk_change_id: Option<String>,
    pub bytes_transferred: i64,
    pub progress_percent: f64,
    pub status: String,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BackupDisk {
    pub fn status(&self) -> DiskStatus {
        self.status.parse().unwrap_or(DiskStatus::Failed)
    }
}

/// `restore_mounts.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreMountStatus {
    Mounting,
    Mounted,
    Unmounting,
    Failed,
}

impl fmt::Display for RestoreMountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RestoreMountStatus::Mounting => "mounting",
            RestoreMountStatus::Mounted => "mounted",
            RestoreMountStatus::Unmounting => "unmounting",
            RestoreMountStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for RestoreMountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mounting" => Ok(RestoreMountStatus::Mounting),
            "mounted" => Ok(RestoreMountStatus::Mounted),
            "unmounting" => Ok(RestoreMountStatus::Unmounting),
            "failed" => Ok(RestoreMountStatus::Failed),
            other => Err(format!("unknown restore mount status '{other}'")),
        }
    }
}

/// A transient read-only filesystem view of one backup disk.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct RestoreMount {
    pub id: String,
    pub backup_disk_id: i64,
    pub qcow2_path: String,
    pub nbd_device: String,
    pub mount_path: String,
    pub filesystem_type: Option<String>,
    pub partition_device: Option<String>,
    pub lvm_vg_name: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RestoreMount {
    pub fn status(&self) -> RestoreMountStatus {
        self.status.parse().unwrap_or(RestoreMountStatus::Failed)
    }
}
