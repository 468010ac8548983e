//! Queries against `vm_disk_inventory`, the read-only input populated by
//! out-of-scope discovery. The orchestrator only ever reads this table.

use sqlx::{MySql, Pool};

use crate::db::tables::VmDiskInventoryRow;

pub async fn disks_for_vm(
    pool: &Pool<MySql>,
    vm_name: &str,
) -> Result<Vec<VmDiskInventoryRow>, sqlx::Error> {
    sqlx::query_as::<_, VmDiskInventoryRow>(
        "SELECT * FROM vm_disk_inventory WHERE vm_name = ? ORDER BY disk_index ASC",
    )
    .bind(vm_name)
    .fetch_all(pool)
    .await
}

pub async fn upsert_disk(
    pool: &Pool<MySql>,
    row: &VmDiskInventoryRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO vm_disk_inventory
            (vm_name, disk_index, vmware_disk_key, size_bytes, datastore, vmdk_path, label, credential_id, vm_path)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON DUPLICATE KEY UPDATE
            vmware_disk_key = VALUES(vmware_disk_key),
            size_bytes = VALUES(size_bytes),
            datastore = VALUES(datastore),
            vmdk_path = VALUES(vmdk_path),
            label = VALUES(label),
            credential_id = VALUES(credential_id),
            vm_path = VALUES(vm_path)",
    )
    .bind(&row.vm_name)
    .bind(row.disk_index)
    .bind(row.vmware_disk_key)
    .bind(row.size_bytes)
    .bind(&row.datastore)
    .bind(&row.vmdk_path)
    .bind(&row.label)
    .bind(&row.credential_id)
    .bind(&row.vm_path)
    .execute(pool)
    .await?;
    Ok(())
}
