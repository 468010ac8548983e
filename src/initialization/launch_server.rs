use anyhow::Result;
use colored::Colorize;
use rocket::{Build, Rocket};

/// Launches an assembled Rocket instance, logging a startup banner first.
///
/// # Errors
/// Returns an error if the Rocket server fails to launch.
pub async fn launch_server(rocket: Rocket<Build>) -> Result<()> {
    log::info!("{}", "launching server...".bright_cyan().bold());
    rocket.launch().await?;
    Ok(())
}
