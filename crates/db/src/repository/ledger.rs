//! Ledger archive operations.
//!
//! The in-memory ledger is authoritative while a node coordinates an
//! execution; this table keeps a durable copy so a restarted node can reload
//! and re-validate the chain.

use chrono::Utc;
use sqlx::PgPool;

use crate::{models::LedgerRecordRow, DbError};

/// Archive one record at position `seq` of the execution's chain.
///
/// Archiving the same position twice with the same hash is a no-op; a
/// different hash at an occupied position is reported by Postgres as a
/// primary-key violation and surfaces as `DbError::Sqlx`.
pub async fn archive_record(
    pool: &PgPool,
    execution_id: &str,
    seq: i64,
    record_hash: &str,
    node_id: &str,
    record: serde_json::Value,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO ledger_records (execution_id, seq, record_hash, node_id, record, archived_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (record_hash) DO NOTHING
        "#,
    )
    .bind(execution_id)
    .bind(seq)
    .bind(record_hash)
    .bind(node_id)
    .bind(record)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// Load an execution's archived chain in order.
pub async fn load_records(pool: &PgPool, execution_id: &str) -> Result<Vec<LedgerRecordRow>, DbError> {
    let rows = sqlx::query_as::<_, LedgerRecordRow>(
        r#"
        SELECT execution_id, seq, record_hash, node_id, record, archived_at
        FROM ledger_records
        WHERE execution_id = $1
        ORDER BY seq ASC
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
