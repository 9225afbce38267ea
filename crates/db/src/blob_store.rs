//! Postgres-backed [`BlobStore`].

use async_trait::async_trait;
use fabric::{BlobStore, ContentHash, FabricError};
use tracing::{debug, warn};

use crate::repository::blobs;
use crate::{DbError, DbPool};

/// Durable content-addressed store over the `blobs` table.
#[derive(Clone)]
pub struct PgBlobStore {
    pool: DbPool,
}

impl PgBlobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BlobStore for PgBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ContentHash, FabricError> {
        let hash = ContentHash::of(&bytes);
        blobs::put_blob(&self.pool, &hash.to_hex(), &bytes).await?;
        debug!(%hash, size = bytes.len(), "blob stored");
        Ok(hash)
    }

    async fn get(&self, hash: &ContentHash) -> Result<Vec<u8>, FabricError> {
        let row = match blobs::get_blob(&self.pool, &hash.to_hex()).await {
            Ok(row) => row,
            Err(DbError::NotFound) => return Err(FabricError::BlobNotFound(*hash)),
            Err(e) => return Err(e.into()),
        };

        if ContentHash::of(&row.bytes) != *hash {
            warn!(%hash, "stored blob does not match its content hash");
            return Err(FabricError::BlobCorrupted(*hash));
        }
        Ok(row.bytes)
    }
}
