//! VM disk inventory: a read-only input to the orchestrator, populated by
//! out-of-scope discovery against vCenter.

use async_trait::async_trait;
use sqlx::{MySql, Pool};

use crate::db::queries::inventory as db;
use crate::db::tables::VmDiskInventoryRow;

#[derive(Debug, Clone)]
pub struct DiskDescriptor {
    pub disk_index: i64,
    pub vmware_disk_key: i64,
    pub size_bytes: i64,
    pub datastore: String,
    pub vmdk_path: String,
    #[allow(dead_code)]
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct VmDescriptor {
    pub vm_name: String,
    pub vm_path: String,
    pub credential_id: String,
    pub disks: Vec<DiskDescriptor>,
}

impl From<Vec<VmDiskInventoryRow>> for VmDescriptor {
    fn from(rows: Vec<VmDiskInventoryRow>) -> Self {
        let vm_name = rows.first().map(|r| r.vm_name.clone()).unwrap_or_default();
        let vm_path = rows.first().map(|r| r.vm_path.clone()).unwrap_or_default();
        let credential_id = rows.first().map(|r| r.credential_id.clone()).unwrap_or_default();
        let disks = rows
            .into_iter()
            .map(|r| DiskDescriptor {
                disk_index: r.disk_index,
                vmware_disk_key: r.vmware_disk_key,
                size_bytes: r.size_bytes,
                datastore: r.datastore,
                vmdk_path: r.vmdk_path,
                label: r.label,
            })
            .collect();
        Self {
            vm_name,
            vm_path,
            credential_id,
            disks,
        }
    }
}

/// Consumed at backup start so the orchestrator has something concrete to
/// call without reaching into vCenter itself (out of scope per spec §1).
#[async_trait]
pub trait VmInventoryProvider: Send + Sync {
    async fn disks_for(&self, vm_name: &str) -> Result<Option<VmDescriptor>, sqlx::Error>;
}

pub struct DbInventoryProvider {
    pool: Pool<MySql>,
}

impl DbInventoryProvider {
    pub fn new(pool: Pool<MySql>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VmInventoryProvider for DbInventoryProvider {
    async fn disks_for(&self, vm_name: &str) -> Result<Option<VmDescriptor>, sqlx::Error> {
        let rows = db::disks_for_vm(&self.pool, vm_name).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(rows.into()))
    }
}
