use anyhow::Result;
use colored::Colorize;
use std::sync::Arc;

use crate::db_manager::DatabaseManager;

/// Connects to the Hub's MySQL database, creating it if necessary, and runs
/// the idempotent schema setup for the backup data model.
///
/// # Errors
/// Returns an error if the connection or schema initialization fails.
pub async fn setup_database(connection_url: &str, db_name: &str) -> Result<Arc<DatabaseManager>> {
    log::info!("{}", format!("database: {connection_url} ({db_name})").blue());
    let db_manager = Arc::new(DatabaseManager::new(connection_url, db_name).await?);
    Ok(db_manager)
}
