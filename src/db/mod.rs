pub mod queries;
pub mod tables;

pub use tables::{
    BackupDisk, BackupJob, BackupJobStatus, DiskStatus, Repository, RestoreMount,
    RestoreMountStatus, VmBackupContext, VmDiskInventoryRow,
};
