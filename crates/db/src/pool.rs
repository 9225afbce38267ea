//! Postgres connection pool.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::DbError;

/// Shared Postgres pool backing the blob store and ledger archive.
pub type DbPool = PgPool;

/// Connect to `database_url` with at most `max_connections` connections.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, DbError> {
    info!(max_connections, "connecting to ledger database");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply the embedded migrations in `./migrations` (workspace root).
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!("applying swarm core migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
