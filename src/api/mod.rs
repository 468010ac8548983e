//! Hub HTTP surface: backup control, telemetry ingestion and the restore
//! subsystem, mounted together under one prefix in `server.rs`.

pub mod backups;
pub mod restore;
pub mod telemetry;

use rocket::Route;

pub fn routes() -> Vec<Route> {
    let mut routes = Vec::new();
    routes.extend(backups::routes());
    routes.extend(telemetry::routes());
    routes.extend(restore::routes());
    routes
}
