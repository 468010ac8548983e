//! The Node source-side executor process: talks to vCenter, takes the
//! single per-VM snapshot, and streams disk data into the Hub's NBD
//! exporters.

pub mod executor;
pub mod nbd_client;
pub mod server;
pub mod telemetry_push;
pub mod vmware;

use std::sync::Arc;

use colored::Colorize;
use rocket::{Build, Rocket};

pub use executor::BackupExecutor;
pub use telemetry_push::TelemetryPushClient;
pub use vmware::{HttpVCenterClient, VCenterClient};

use crate::cors::{cors_preflight, CORS};

pub fn build_rocket(port: u16, executor: Arc<BackupExecutor>) -> Rocket<Build> {
    crate::logging::print_banner("VMBAK NODE STARTUP", |s| s.bright_cyan());

    log::info!("{}", "Mounting node routes".cyan());
    rocket::build()
        .configure(rocket::Config {
            port,
            address: std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
            ..Default::default()
        })
        .manage(executor)
        .attach(CORS)
        .mount("/", rocket::routes![cors_preflight])
        .mount("/", server::routes())
}
