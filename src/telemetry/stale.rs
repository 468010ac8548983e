//! Stale-job detector: every 30s, fails jobs that have gone
//! quiet on telemetry. Jobs with `last_telemetry_at IS NULL` -- a Node that
//! predates telemetry -- are never touched; their completion still arrives
//! via the end-of-job callback folded into telemetry ingestion.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use sqlx::{MySql, Pool};
use tokio::time::sleep;

use crate::db::queries::jobs as jobs_db;
use crate::nbd::{NbdPortAllocator, QemuNbdSupervisor};

const SCAN_INTERVAL: Duration = Duration::from_secs(30);

pub struct StaleJobDetector {
    pool: Pool<MySql>,
    allocator: Arc<NbdPortAllocator>,
    supervisor: Arc<QemuNbdSupervisor>,
    stale_threshold_secs: i64,
    failed_threshold_secs: i64,
}

impl StaleJobDetector {
    pub fn new(
        pool: Pool<MySql>,
        allocator: Arc<NbdPortAllocator>,
        supervisor: Arc<QemuNbdSupervisor>,
        stale_threshold_secs: i64,
        failed_threshold_secs: i64,
    ) -> Self {
        Self {
            pool,
            allocator,
            supervisor,
            stale_threshold_secs,
            failed_threshold_secs,
        }
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            sleep(SCAN_INTERVAL).await;
            if let Err(e) = self.scan_once().await {
                warn!("stale-job scan failed: {e}");
            }
        }
    }

    pub async fn scan_once(&self) -> Result<(), sqlx::Error> {
        let now = Utc::now();
        for job in jobs_db::scan_running_with_telemetry(&self.pool).await? {
            let Some(last) = job.last_telemetry_at else { continue };
            let silence = (now - last).num_seconds();

            if silence > self.failed_threshold_secs {
                if jobs_db::mark_failed_stale(&self.pool, &job.id, now).await? > 0 {
                    warn!(
                        "job {} failed: no telemetry for {}s (threshold {}s)",
                        job.id, silence, self.failed_threshold_secs
                    );
                    self.allocator.release_by_job_id(&job.id);
                    self.supervisor.stop_by_job_id(&job.id).await;
                }
            } else if silence > self.stale_threshold_secs && job.status == "running" {
                if jobs_db::mark_stalled(&self.pool, &job.id).await? > 0 {
                    info!(
                        "job {} stalled: no telemetry for {}s (threshold {}s)",
                        job.id, silence, self.stale_threshold_secs
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // The 60s/300s boundary semantics ("exactly 60s is still running,
    // strictly greater is stalled") are exercised against `apply_telemetry`
    // and `mark_stalled`/`mark_failed_stale`'s SQL directly in integration
    // tests against a real pool; the in-process unit here only covers the
    // pure threshold arithmetic.
    #[test]
    fn boundary_is_strictly_greater_than() {
        let threshold = 60i64;
        let exactly_at = 60i64;
        let just_over = 61i64;
        assert!(!(exactly_at > threshold));
        assert!(just_over > threshold);
    }
}
