//! Node source-side executor binary: the process run next to (or with
//! network access to) vCenter, reachable from the Hub over an SSH tunnel.

use std::sync::Arc;

use vmbak::config::NODE_CONFIG;
use vmbak::initialization;
use vmbak::node::{self, BackupExecutor, HttpVCenterClient, TelemetryPushClient, VCenterClient};

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    initialization::setup_logging().await;

    let vcenter: Arc<dyn VCenterClient> = Arc::new(HttpVCenterClient::new());
    let telemetry = Arc::new(TelemetryPushClient::new(NODE_CONFIG.hub_callback_url.clone()));
    let executor = Arc::new(BackupExecutor::new(
        vcenter,
        telemetry,
        NODE_CONFIG.max_parallel_disk_workers,
    ));

    let rocket = node::build_rocket(NODE_CONFIG.port, executor);
    initialization::launch_server(rocket).await
}
