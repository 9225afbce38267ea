//! Blob table operations.

use chrono::Utc;
use sqlx::PgPool;

use crate::{models::BlobRow, DbError};

/// Insert a blob under its content hash. Re-inserting the same content is a no-op.
pub async fn put_blob(pool: &PgPool, content_hash: &str, bytes: &[u8]) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO blobs (content_hash, bytes, size_bytes, created_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (content_hash) DO NOTHING
        "#,
    )
    .bind(content_hash)
    .bind(bytes)
    .bind(bytes.len() as i64)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch a blob by content hash.
pub async fn get_blob(pool: &PgPool, content_hash: &str) -> Result<BlobRow, DbError> {
    let row = sqlx::query_as::<_, BlobRow>(
        r#"SELECT content_hash, bytes, size_bytes, created_at FROM blobs WHERE content_hash = $1"#,
    )
    .bind(content_hash)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}
