//! Hub Rocket app assembly: wires the shared pool and every in-memory
//! subsystem into request-handler state and mounts the API.

use std::sync::Arc;

use colored::Colorize;
use rocket::{Build, Rocket};
use sqlx::{MySql, Pool};

use crate::backup::BackupOrchestrator;
use crate::cors::{cors_preflight, CORS};
use crate::nbd::{NbdPortAllocator, QemuNbdSupervisor};
use crate::restore::MountManager;

pub trait RocketExt {
    fn mount_routes(self, routes: Vec<(&'static str, Vec<rocket::Route>)>) -> Self;
}

impl RocketExt for Rocket<Build> {
    fn mount_routes(self, routes: Vec<(&'static str, Vec<rocket::Route>)>) -> Self {
        let mut rocket = self;
        for (path, routes) in routes {
            log::info!("{}", format!("mounting routes at {path}").green());
            rocket = rocket.mount(path, routes);
        }
        rocket
    }
}

#[allow(clippy::too_many_arguments)]
pub fn build_rocket(
    port: u16,
    pool: Pool<MySql>,
    allocator: Arc<NbdPortAllocator>,
    supervisor: Arc<QemuNbdSupervisor>,
    orchestrator: Arc<BackupOrchestrator>,
    mount_manager: Arc<MountManager>,
) -> Rocket<Build> {
    crate::logging::print_banner("VMBAK HUB STARTUP", |s| s.bright_cyan());

    log::info!("{}", "building rocket instance".cyan());
    let rocket_instance = rocket::build()
        .configure(rocket::Config {
            port,
            address: std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
            ..Default::default()
        })
        .manage(pool)
        .manage(allocator)
        .manage(supervisor)
        .manage(orchestrator)
        .manage(mount_manager)
        .attach(CORS);

    log::info!("{}", "mounting api routes".cyan());
    rocket_instance.mount_routes(vec![
        ("/", rocket::routes![cors_preflight]),
        ("/api/v1", crate::api::routes()),
    ])
}
