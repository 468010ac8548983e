use sqlx::{MySql, MySqlPool, Pool};
use log::info;
use crate::db_manager::error::DatabaseError;

/// Owns the single MySQL pool shared by the rest of the Hub.
///
/// There is no per-tenant database split -- one database holds contexts,
/// jobs, disks and restore mounts for every VM the Hub backs up.
pub struct ConnectionManager {
    main_pool: Pool<MySql>,
}

impl ConnectionManager {
    /// Creates a new connection manager, ensuring the target database exists.
    pub async fn new(base_url: &str, db_name: &str) -> Result<Self, DatabaseError> {
        info!("Connecting to MySQL server at {}", base_url);
        tracing::info!(db_name = db_name, "connecting to mysql server");
        let server_pool = MySqlPool::connect(base_url)
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        Self::ensure_database_exists(&server_pool, db_name).await?;

        let main_db_url = format!("{}/{}", base_url, db_name);
        info!("Connecting to main database at {}", main_db_url);
        let main_pool = MySqlPool::connect(&main_db_url).await.map_err(|e| {
            DatabaseError::ConnectionError(format!("failed to connect to main database: {}", e))
        })?;

        info!("database connection established");
        tracing::info!(db_name = db_name, "database connection established");
        Ok(Self { main_pool })
    }

    /// Ensures a database exists, creating it if necessary.
    pub async fn ensure_database_exists(
        pool: &Pool<MySql>,
        db_name: &str,
    ) -> Result<(), DatabaseError> {
        info!("ensuring database exists: {}", db_name);
        let query = format!("CREATE DATABASE IF NOT EXISTS `{}`", db_name);
        sqlx::query(&query).execute(pool).await?;
        Ok(())
    }

    pub fn main_pool(&self) -> &Pool<MySql> {
        &self.main_pool
    }
}
