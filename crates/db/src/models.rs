//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models. The typed ledger record lives in the
//! `engine` crate and is stored here as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// blobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct BlobRow {
    /// Hex BLAKE3 digest of `bytes`.
    pub content_hash: String,
    pub bytes: Vec<u8>,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ledger_records
// ---------------------------------------------------------------------------

/// One archived execution ledger record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LedgerRecordRow {
    pub execution_id: String,
    /// Position in the execution's chain, starting at 0.
    pub seq: i64,
    pub record_hash: String,
    pub node_id: String,
    pub record: serde_json::Value,
    pub archived_at: DateTime<Utc>,
}
