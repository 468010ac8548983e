//! Queries against the `repositories` table.
//!
//! `repositories` is the minimal table backing `repository_root/...`
//! paths; full repository configuration management stays out of scope.

use sqlx::{MySql, Pool};

use crate::db::tables::Repository;

pub async fn get_repository(pool: &Pool<MySql>, id: i64) -> Result<Option<Repository>, sqlx::Error> {
    sqlx::query_as::<_, Repository>("SELECT * FROM repositories WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn create_repository(
    pool: &Pool<MySql>,
    name: &str,
    root_path: &str,
) -> Result<Repository, sqlx::Error> {
    sqlx::query("INSERT INTO repositories (name, root_path, created_at) VALUES (?, ?, ?)")
        .bind(name)
        .bind(root_path)
        .bind(chrono::Utc::now())
        .execute(pool)
        .await?;

    let id: i64 = sqlx::query_scalar("SELECT LAST_INSERT_ID()")
        .fetch_one(pool)
        .await?;

    sqlx::query_as::<_, Repository>("SELECT * FROM repositories WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
}

pub async fn list_repositories(pool: &Pool<MySql>) -> Result<Vec<Repository>, sqlx::Error> {
    sqlx::query_as::<_, Repository>("SELECT * FROM repositories ORDER BY id")
        .fetch_all(pool)
        .await
}
