//! PostgreSQL pool for the directory.

use crate::config::DatabaseConfig;
use crate::services::error::DirectoryError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Open the pool and bring the directory schema up to date.
///
/// `acquire_timeout` bounds how long a directory read may wait for a
/// connection, so it should not exceed the per-read deadline.
pub async fn connect(
    config: &DatabaseConfig,
    acquire_timeout: Duration,
) -> Result<PgPool, DirectoryError> {
    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Connecting to directory database"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(acquire_timeout)
        .idle_timeout(Duration::from_secs(600))
        .connect(&config.url)
        .await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| DirectoryError::Backend(anyhow::anyhow!("Directory migration failed: {}", e)))?;

    tracing::info!("Directory database ready");
    Ok(pool)
}
