//! In-memory content-addressed blob store.

use async_trait::async_trait;
use sediment_core::ids::ObjectHash;
use sediment_core::ports::BlobStore;
use sediment_core::repo::ObjectRef;
use sediment_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Compute the content address of a byte slice.
pub fn content_hash(content: &[u8]) -> ObjectHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    ObjectHash::new(hex::encode(hasher.finalize()))
}

/// Blob store keeping objects in process memory. Identical content is
/// stored once.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<ObjectHash, Arc<Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct objects stored.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, content: Vec<u8>) -> Result<ObjectRef> {
        let hash = content_hash(&content);
        let size_bytes = content.len() as u64;
        self.objects
            .write()
            .await
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(content));
        Ok(ObjectRef { hash, size_bytes })
    }

    async fn get(&self, hash: &ObjectHash) -> Result<Vec<u8>> {
        self.objects
            .read()
            .await
            .get(hash)
            .map(|c| c.as_ref().clone())
            .ok_or_else(|| Error::ObjectNotFound(hash.to_string()))
    }

    async fn delete(&self, hash: &ObjectHash) -> Result<()> {
        self.objects.write().await.remove(hash);
        Ok(())
    }

    async fn exists(&self, hash: &ObjectHash) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identical_content_shares_storage() {
        let store = MemoryBlobStore::new();
        let a = store.put(b"foo\n".to_vec()).await.unwrap();
        let b = store.put(b"foo\n".to_vec()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.size_bytes, 4);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(&a.hash).await.unwrap(), b"foo\n".to_vec());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryBlobStore::new();
        let obj = store.put(b"bar".to_vec()).await.unwrap();
        assert!(store.exists(&obj.hash).await.unwrap());
        store.delete(&obj.hash).await.unwrap();
        assert!(!store.exists(&obj.hash).await.unwrap());
        assert!(matches!(
            store.get(&obj.hash).await,
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_content_hash_is_sha256() {
        assert_eq!(
            content_hash(b"").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
