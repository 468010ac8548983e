//! Backup orchestrator: accepts a start request, prepares
//! one image + port + qemu-nbd exporter per disk, invokes the Node with a
//! single RPC covering every disk, and tears everything down on success
//! or failure. Completion itself arrives through telemetry ingestion
//! (`crate::telemetry::ingest`), not through this module.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sqlx::{MySql, Pool};

use crate::backup::credentials::CredentialClient;
use crate::backup::image;
use crate::backup::inventory::VmInventoryProvider;
use crate::db::queries::{contexts as contexts_db, disks as disks_db, jobs as jobs_db, repositories as repos_db};
use crate::error::CoreError;
use crate::nbd::{NbdPortAllocator, QemuNbdSupervisor};
use crate::rpc::{NbdTarget, NodeBackupRequest, NodeRpcClient};

pub struct BackupOrchestrator {
    pool: Pool<MySql>,
    allocator: Arc<NbdPortAllocator>,
    supervisor: Arc<QemuNbdSupervisor>,
    inventory: Arc<dyn VmInventoryProvider>,
    credentials: Arc<dyn CredentialClient>,
    node_rpc: Arc<dyn NodeRpcClient>,
    repository_root: String,
    hub_callback_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskResult {
    pub disk_index: i64,
    pub vmware_disk_key: i64,
    pub nbd_port: u16,
    pub nbd_export_name: String,
    pub qcow2_path: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartBackupResponse {
    pub backup_id: String,
    pub vm_context_id: String,
    pub disk_results: Vec<DiskResult>,
    pub nbd_targets_string: String,
    pub status: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl BackupOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Pool<MySql>,
        allocator: Arc<NbdPortAllocator>,
        supervisor: Arc<QemuNbdSupervisor>,
        inventory: Arc<dyn VmInventoryProvider>,
        credentials: Arc<dyn CredentialClient>,
        node_rpc: Arc<dyn NodeRpcClient>,
        repository_root: String,
        hub_callback_url: String,
    ) -> Self {
        Self {
            pool,
            allocator,
            supervisor,
            inventory,
            credentials,
            node_rpc,
            repository_root,
            hub_callback_url,
        }
    }

    pub async fn start_backup(
        &self,
        vm_name: &str,
        repository_id: i64,
        backup_type: &str,
    ) -> Result<StartBackupResponse, CoreError> {
        if backup_type != "full" && backup_type != "incremental" {
            return Err(CoreError::Validation(format!(
                "unknown backup_type '{backup_type}'"
            )));
        }

        let vm = self
            .inventory
            .disks_for(vm_name)
            .await
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::Validation(format!("unknown VM '{vm_name}'")))?;
        if vm.disks.is_empty() {
            return Err(CoreError::Validation(format!("VM '{vm_name}' has no disks")));
        }
        if vm.credential_id.is_empty() {
            return Err(CoreError::Validation(format!(
                "VM '{vm_name}' has no credential_id configured"
            )));
        }

        repos_db::get_repository(&self.pool, repository_id)
            .await
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::Validation(format!("unknown repository '{repository_id}'")))?;

        let context_id = contexts_db::context_id(vm_name, repository_id);

        // Preconditions are fully checked -- including, for incrementals,
        // that every disk has a prior completed backup with a non-empty
        // change-id -- before any row is created or any resource allocated.
        let mut bases = Vec::with_capacity(vm.disks.len());
        if backup_type == "incremental" {
            for disk in &vm.disks {
                let prior = disks_db::most_recent_completed_for_disk(
                    &self.pool,
                    &context_id,
                    disk.disk_index,
                )
                .await
                .map_err(CoreError::from)?;
                let prior = prior.ok_or_else(|| {
                    CoreError::Precondition(format!(
                        "no completed full backup exists for disk {} of '{vm_name}'; cannot take an incremental",
                        disk.disk_index
                    ))
                })?;
                let change_id = prior.disk_change_id.clone().ok_or_else(|| {
                    CoreError::Precondition(format!(
                        "prior backup for disk {} of '{vm_name}' has no change-id",
                        disk.disk_index
                    ))
                })?;
                bases.push((prior.qcow2_path, change_id));
            }
        } else {
            bases.resize(vm.disks.len(), (String::new(), String::new()));
        }

        let context = contexts_db::find_or_create_context(&self.pool, vm_name, repository_id)
            .await
            .map_err(CoreError::from)?;

        let now = Utc::now();
        let backup_id = jobs_db::new_backup_id(vm_name, now);
        let parent_backup_id = if backup_type == "incremental" {
            jobs_db::most_recent_completed_for_context(&self.pool, &context.id)
                .await
                .map_err(CoreError::from)?
                .map(|j| j.id)
        } else {
            None
        };

        jobs_db::create_job(
            &self.pool,
            &backup_id,
            &context.id,
            vm_name,
            repository_id,
            backup_type,
            parent_backup_id.as_deref(),
            now,
        )
        .await
        .map_err(CoreError::from)?;

        tracing::info!(
            backup_id = %backup_id,
            vm_name = vm_name,
            backup_type = backup_type,
            disk_count = vm.disks.len(),
            "backup job created"
        );

        match self
            .prepare_disks(&backup_id, &context.id, vm_name, backup_type, &vm.disks, &bases)
            .await
        {
            Ok(disk_results) => {
                jobs_db::set_running(&self.pool, &backup_id)
                    .await
                    .map_err(CoreError::from)?;

                let targets: Vec<NbdTarget> = disk_results
                    .iter()
                    .zip(bases.iter())
                    .zip(vm.disks.iter())
                    .map(|((d, (_, change_id)), disk)| NbdTarget {
                        vmware_disk_key: d.vmware_disk_key,
                        disk_index: d.disk_index,
                        nbd_port: d.nbd_port,
                        export_name: d.nbd_export_name.clone(),
                        base_change_id: if backup_type == "incremental" {
                            Some(change_id.clone())
                        } else {
                            None
                        },
                        size_bytes: disk.size_bytes,
                        datastore: disk.datastore.clone(),
                        vmdk_path: disk.vmdk_path.clone(),
                    })
                    .collect();
                let nbd_targets_string = crate::rpc::types::targets_string(&targets);

                let credentials = self
                    .credentials
                    .get_credentials(&vm_disk_credential_id(&vm))
                    .await;

                let node_request_result = match credentials {
                    Ok(creds) => {
                        self.node_rpc
                            .start_backup(NodeBackupRequest {
                                job_id: backup_id.clone(),
                                vm_name: vm_name.to_string(),
                                vm_path: vm.vm_path.clone(),
                                vcenter_host: creds.vcenter_host,
                                vcenter_user: creds.username,
                                vcenter_password: creds.password,
                                backup_type: backup_type.to_string(),
                                nbd_targets: nbd_targets_string.clone(),
                                targets,
                                hub_callback_url: self.hub_callback_url.clone(),
                            })
                            .await
                            .map_err(|e| CoreError::ExternalFailure(e.to_string()))
                    }
                    Err(e) => Err(CoreError::ExternalFailure(e.to_string())),
                };

                if let Err(e) = node_request_result {
                    self.fail_job(&backup_id, &e.to_string()).await;
                    return Err(e);
                }

                Ok(StartBackupResponse {
                    backup_id,
                    vm_context_id: context.id,
                    disk_results,
                    nbd_targets_string,
                    status: "running".to_string(),
                    created_at: now,
                })
            }
            Err(e) => {
                self.fail_job(&backup_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Creates each disk's image, allocates its port, and launches its
    /// qemu-nbd exporter in `disk_index` order. Any failure rolls back
    /// every port/process this call started.
    async fn prepare_disks(
        &self,
        backup_id: &str,
        context_id: &str,
        vm_name: &str,
        backup_type: &str,
        disks: &[crate::backup::inventory::DiskDescriptor],
        bases: &[(String, String)],
    ) -> Result<Vec<DiskResult>, CoreError> {
        let mut results = Vec::with_capacity(disks.len());

        for (disk, (backing_path, _)) in disks.iter().zip(bases.iter()) {
            if let Err(e) = self
                .prepare_one_disk(backup_id, context_id, vm_name, backup_type, disk, backing_path)
                .await
            {
                self.rollback(backup_id).await;
                return Err(e);
            } else {
                let port = self
                    .allocator
                    .job_ports(backup_id)
                    .into_iter()
                    .find(|p| p.disk_index == disk.disk_index)
                    .map(|p| p.port)
                    .expect("port was just allocated for this disk");
                let qcow2_path = disks_db::get_disk(&self.pool, backup_id, disk.disk_index)
                    .await
                    .map_err(CoreError::from)?
                    .map(|d| d.qcow2_path)
                    .unwrap_or_default();
                results.push(DiskResult {
                    disk_index: disk.disk_index,
                    vmware_disk_key: disk.vmware_disk_key,
                    nbd_port: port,
                    nbd_export_name: export_name(vm_name, disk.disk_index),
                    qcow2_path,
                    status: "pending".to_string(),
                });
            }
        }
        Ok(results)
    }

    async fn prepare_one_disk(
        &self,
        backup_id: &str,
        context_id: &str,
        vm_name: &str,
        backup_type: &str,
        disk: &crate::backup::inventory::DiskDescriptor,
        backing_path: &str,
    ) -> Result<(), CoreError> {
        let path = image::image_path(&self.repository_root, context_id, vm_name, disk.disk_index);
        let backing = if backup_type == "incremental" {
            Some(backing_path)
        } else {
            None
        };
        image::create_image(&path, disk.size_bytes, backing)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        let port = self
            .allocator
            .allocate(backup_id, disk.disk_index)
            .map_err(|e| CoreError::ResourceExhaustion(e.to_string()))?;

        let name = export_name(vm_name, disk.disk_index);
        self.supervisor
            .start(backup_id, disk.disk_index, port, &name, &path, false)
            .await
            .map_err(|e| CoreError::Timeout(e.to_string()))?;

        disks_db::create_disk(
            &self.pool,
            backup_id,
            disk.disk_index,
            disk.vmware_disk_key,
            &path,
            backing,
            disk.size_bytes as f64 / 1_073_741_824.0,
        )
        .await
        .map_err(CoreError::from)?;

        Ok(())
    }

    async fn rollback(&self, backup_id: &str) {
        self.supervisor.stop_by_job_id(backup_id).await;
        self.allocator.release_by_job_id(backup_id);
    }

    async fn fail_job(&self, backup_id: &str, error: &str) {
        tracing::warn!(backup_id = %backup_id, error = error, "backup job failed");
        self.rollback(backup_id).await;
        let _ = jobs_db::finalize(&self.pool, backup_id, 0, "failed", Some(error), Utc::now()).await;
    }

    /// Explicit cancellation: signal the Node to abort, then
    /// release resources and mark the parent `cancelled`.
    pub async fn cancel_backup(&self, backup_id: &str) -> Result<(), CoreError> {
        self.node_rpc
            .cancel_backup(backup_id)
            .await
            .map_err(|e| CoreError::ExternalFailure(e.to_string()))?;
        self.rollback(backup_id).await;
        jobs_db::mark_cancelled(&self.pool, backup_id, Utc::now())
            .await
            .map_err(CoreError::from)?;
        Ok(())
    }

    /// Rejects if any image belonging to this backup is a backing file for
    /// a later backup.
    pub async fn delete_backup(&self, backup_id: &str) -> Result<(), CoreError> {
        crate::backup::chain::assert_deletable(&self.pool, backup_id).await?;
        jobs_db::delete_job(&self.pool, backup_id)
            .await
            .map_err(CoreError::from)
    }
}

fn export_name(vm_name: &str, disk_index: i64) -> String {
    format!("{vm_name}-disk{disk_index}")
}

fn vm_disk_credential_id(vm: &crate::backup::inventory::VmDescriptor) -> String {
    vm.credential_id.clone()
}
