//! Content-addressed blob store contract and the in-memory implementation.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{ContentHash, FabricError};

/// Content-addressed storage: `put` returns the BLAKE3 hash of the bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> Result<ContentHash, FabricError>;

    async fn get(&self, hash: &ContentHash) -> Result<Vec<u8>, FabricError>;

    async fn contains(&self, hash: &ContentHash) -> Result<bool, FabricError> {
        match self.get(hash).await {
            Ok(_) => Ok(true),
            Err(FabricError::BlobNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Process-local blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<ContentHash, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<ContentHash, FabricError> {
        let hash = ContentHash::of(&bytes);
        self.blobs.entry(hash).or_insert(bytes);
        Ok(hash)
    }

    async fn get(&self, hash: &ContentHash) -> Result<Vec<u8>, FabricError> {
        self.blobs
            .get(hash)
            .map(|b| b.value().clone())
            .ok_or(FabricError::BlobNotFound(*hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_is_idempotent_and_addressed_by_content() {
        let store = MemoryBlobStore::new();
        let h1 = store.put(b"snapshot".to_vec()).await.unwrap();
        let h2 = store.put(b"snapshot".to_vec()).await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&h1).await.unwrap(), b"snapshot");
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let store = MemoryBlobStore::new();
        let missing = ContentHash::of(b"nope");
        assert!(matches!(
            store.get(&missing).await,
            Err(FabricError::BlobNotFound(h)) if h == missing
        ));
        assert!(!store.contains(&missing).await.unwrap());
    }
}
