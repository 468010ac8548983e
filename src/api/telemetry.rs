//! Telemetry push surface: one endpoint, one message shape, shared by
//! every job type the Node reports on.

use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{post, routes, Route, State};
use serde::Serialize;
use sqlx::{MySql, Pool};

use crate::error::CoreError;
use crate::nbd::{NbdPortAllocator, QemuNbdSupervisor};
use crate::telemetry::{self, JobTelemetry};

#[derive(Debug, Serialize)]
pub struct TelemetryAck {
    pub job_id: String,
    pub accepted: bool,
}

#[post("/telemetry/<job_type>/<job_id>", format = "json", data = "<body>")]
async fn push_telemetry(
    job_type: &str,
    job_id: &str,
    body: Json<JobTelemetry>,
    pool: &State<Pool<MySql>>,
    allocator: &State<Arc<NbdPortAllocator>>,
    supervisor: &State<Arc<QemuNbdSupervisor>>,
) -> Result<Json<TelemetryAck>, CoreError> {
    let telemetry = body.into_inner();
    if telemetry.job_id != job_id || telemetry.job_type != job_type {
        return Err(CoreError::Validation(
            "job_id/job_type in path and body must match".to_string(),
        ));
    }

    telemetry::ingest(pool, allocator, supervisor, telemetry).await?;
    Ok(Json(TelemetryAck {
        job_id: job_id.to_string(),
        accepted: true,
    }))
}

pub fn routes() -> Vec<Route> {
    routes![push_telemetry]
}
