//! Node HTTP surface: the two handlers the Hub's `NodeRpcClient` calls,
//! backup start and cancel.

use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{post, routes, Route, State};

use crate::error::CoreError;
use crate::node::executor::BackupExecutor;
use crate::rpc::types::{NodeBackupAck, NodeBackupRequest, NodeCancelRequest};

#[post("/backup/start", format = "json", data = "<request>")]
async fn start_backup(
    request: Json<NodeBackupRequest>,
    executor: &State<Arc<BackupExecutor>>,
) -> Json<NodeBackupAck> {
    let request = request.into_inner();
    let job_id = request.job_id.clone();
    let executor = executor.inner().clone();

    // Accept immediately and run the copy in the background; the Hub
    // learns everything else through telemetry pushes.
    tokio::spawn(async move { executor.run(request).await });

    Json(NodeBackupAck {
        job_id,
        accepted: true,
        message: None,
    })
}

#[post("/backup/cancel/<job_id>", format = "json", data = "<request>")]
async fn cancel_backup(
    job_id: String,
    request: Json<NodeCancelRequest>,
    executor: &State<Arc<BackupExecutor>>,
) -> Result<Json<NodeBackupAck>, CoreError> {
    if request.job_id != job_id {
        return Err(CoreError::Validation(
            "job_id in path and body must match".to_string(),
        ));
    }
    executor.cancel(&job_id);
    Ok(Json(NodeBackupAck {
        job_id,
        accepted: true,
        message: None,
    }))
}

pub fn routes() -> Vec<Route> {
    routes![start_backup, cancel_backup]
}
