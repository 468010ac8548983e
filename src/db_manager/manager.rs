use sqlx::{MySql, Pool};

use crate::db_manager::connection::ConnectionManager;
use crate::db_manager::error::DatabaseError;
use crate::db_manager::migration::MigrationManager;

/// Central manager for all database operations on the Hub.
pub struct DatabaseManager {
    connection_manager: ConnectionManager,
}

impl DatabaseManager {
    /// Creates a new database manager and ensures the schema is present.
    pub async fn new(connection_url: &str, db_name: &str) -> Result<Self, DatabaseError> {
        let connection_manager = ConnectionManager::new(connection_url, db_name).await?;
        let manager = Self { connection_manager };
        manager.initialize_schema().await?;
        Ok(manager)
    }

    pub async fn initialize_schema(&self) -> Result<(), DatabaseError> {
        MigrationManager::initialize_schema(self.get_main_pool()).await
    }

    pub fn get_main_pool(&self) -> &Pool<MySql> {
        self.connection_manager.main_pool()
    }
}
