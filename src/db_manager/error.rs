use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("failed to connect to database: {0}")]
    ConnectionError(String),

    #[error("schema setup failed: {0}")]
    SchemaError(String),

    #[error("sql error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("other error: {0}")]
    Other(String),
}
