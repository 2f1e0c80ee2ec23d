//! MySQL connection pool

use crate::error::Result;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::time::Duration;
use tracing::info;

pub type DbPool = MySqlPool;

/// Open a pool and check it with a trivial query.
pub async fn init_pool(database_url: &str) -> Result<DbPool> {
    let pool = MySqlPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;

    info!(
        "Connected to {}",
        database_url.split('@').nth(1).unwrap_or("database")
    );
    Ok(pool)
}
