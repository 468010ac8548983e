//! Starts, health-checks and stops `qemu-nbd` processes, one per exported
//! backup image.
//!
//! The default single-connection cap (`--shared=1`) causes client-side
//! negotiation hangs when a data mover opens an auxiliary connection for
//! block-status metadata; the cap here must be >= 10 (see design notes).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};

const LISTEN_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum QemuNbdError {
    #[error("failed to spawn qemu-nbd: {0}")]
    SpawnFailed(String),
    #[error("qemu-nbd did not start listening on port {0} within the timeout")]
    NotListening(u16),
    #[error("qcow2 image not readable: {0}")]
    ImageUnreadable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterStatus {
    Starting,
    Running,
    Stopped,
    Crashed,
}

struct ExporterRecord {
    job_id: String,
    disk_index: i64,
    port: u16,
    #[allow(dead_code)]
    export_name: String,
    #[allow(dead_code)]
    qcow2_path: String,
    child: Child,
    #[allow(dead_code)]
    started_at: DateTime<Utc>,
    last_health_check: DateTime<Utc>,
    status: ExporterStatus,
}

/// Supervises every qemu-nbd process the Hub currently has exporting an
/// image file, keyed by the port it listens on.
pub struct QemuNbdSupervisor {
    records: RwLock<HashMap<u16, ExporterRecord>>,
    shared_cap: u32,
}

impl QemuNbdSupervisor {
    pub fn new(shared_cap: u32) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            shared_cap,
        }
    }

    /// Launches qemu-nbd writable against `qcow2_path`, waits for it to
    /// start listening, and records it as `running`.
    pub async fn start(
        &self,
        job_id: &str,
        disk_index: i64,
        port: u16,
        export_name: &str,
        qcow2_path: &str,
        read_only: bool,
    ) -> Result<(), QemuNbdError> {
        if tokio::fs::metadata(qcow2_path).await.is_err() {
            return Err(QemuNbdError::ImageUnreadable(qcow2_path.to_string()));
        }

        let mut cmd = Command::new("qemu-nbd");
        cmd.arg("--format=qcow2")
            .arg(format!("--export-name={export_name}"))
            .arg("--bind=127.0.0.1")
            .arg(format!("--port={port}"))
            .arg(format!("--shared={}", self.shared_cap.max(10)))
            .arg("--persistent");
        if read_only {
            cmd.arg("--read-only");
        } else {
            cmd.arg("--discard=unmap");
        }
        cmd.arg(qcow2_path);
        cmd.stdout(Stdio::null()).stderr(Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| QemuNbdError::SpawnFailed(e.to_string()))?;

        let record = ExporterRecord {
            job_id: job_id.to_string(),
            disk_index,
            port,
            export_name: export_name.to_string(),
            qcow2_path: qcow2_path.to_string(),
            child,
            started_at: Utc::now(),
            last_health_check: Utc::now(),
            status: ExporterStatus::Starting,
        };
        self.records.write().insert(port, record);

        match timeout(LISTEN_TIMEOUT, wait_until_listening(port)).await {
            Ok(true) => {
                if let Some(record) = self.records.write().get_mut(&port) {
                    record.status = ExporterStatus::Running;
                }
                info!("qemu-nbd listening on 127.0.0.1:{port} (job {job_id} disk {disk_index})");
                Ok(())
            }
            _ => {
                self.kill_record(port).await;
                Err(QemuNbdError::NotListening(port))
            }
        }
    }

    /// Sends SIGTERM, waits up to `STOP_TIMEOUT`, then force-kills.
    /// Idempotent against an already-stopped record.
    pub async fn stop(&self, port: u16) {
        self.kill_record(port).await;
    }

    pub async fn stop_by_job_id(&self, job_id: &str) {
        let ports: Vec<u16> = {
            let records = self.records.read();
            records
                .values()
                .filter(|r| r.job_id == job_id)
                .map(|r| r.port)
                .collect()
        };
        for port in ports {
            self.stop(port).await;
        }
    }

    async fn kill_record(&self, port: u16) {
        let child = {
            let mut records = self.records.write();
            records.remove(&port).map(|r| r.child)
        };
        let Some(mut child) = child else { return };

        if let Some(pid) = child.id() {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("failed to send SIGTERM to qemu-nbd pid {pid}: {e}");
            }
        }
        if timeout(STOP_TIMEOUT, child.wait()).await.is_err() {
            let _ = child.kill().await;
        }
    }

    /// Background task: probes every running record on a fixed interval.
    /// Liveness = process alive AND port still accepting connections.
    pub async fn run_health_monitor(self: Arc<Self>) {
        loop {
            sleep(HEALTH_CHECK_INTERVAL).await;
            let ports: Vec<u16> = self.records.read().keys().copied().collect();
            for port in ports {
                let alive = {
                    let mut records = self.records.write();
                    match records.get_mut(&port) {
                        Some(r) => matches!(r.child.try_wait(), Ok(None)),
                        None => continue,
                    }
                };
                let listening = alive && probe_listening(port).await;
                let mut records = self.records.write();
                if let Some(record) = records.get_mut(&port) {
                    record.last_health_check = Utc::now();
                    if listening {
                        if record.status == ExporterStatus::Starting {
                            record.status = ExporterStatus::Running;
                        }
                    } else if record.status != ExporterStatus::Crashed {
                        warn!(
                            "qemu-nbd on port {port} (job {} disk {}) failed health check",
                            record.job_id, record.disk_index
                        );
                        record.status = ExporterStatus::Crashed;
                    }
                }
            }
        }
    }

    pub fn status(&self, port: u16) -> Option<ExporterStatus> {
        self.records.read().get(&port).map(|r| r.status)
    }

    /// Stops every running process. Called on Hub shutdown.
    pub async fn stop_all(&self) {
        let ports: Vec<u16> = self.records.read().keys().copied().collect();
        for port in ports {
            self.stop(port).await;
        }
    }
}

async fn wait_until_listening(port: u16) -> bool {
    loop {
        if probe_listening(port).await {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
}

async fn probe_listening(port: u16) -> bool {
    match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(mut stream) => {
            let _ = stream.shutdown().await;
            true
        }
        Err(e) => {
            error!("probe of 127.0.0.1:{port} failed: {e}");
            false
        }
    }
}
