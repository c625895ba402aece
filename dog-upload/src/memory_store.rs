use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use parking_lot::RwLock;

use crate::{BlobStore, ByteStream, PutResult, UploadResult};

/// In-memory blob store for testing and development
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored under `prefix/`
    pub fn keys_under(&self, prefix: &str) -> Vec<String> {
        let dir = dir_prefix(prefix);
        self.blobs
            .read()
            .keys()
            .filter(|k| k.starts_with(&dir))
            .cloned()
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

fn dir_prefix(prefix: &str) -> String {
    format!("{}/", prefix.trim_end_matches('/'))
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, mut stream: ByteStream) -> UploadResult<PutResult> {
        // A failed stream leaves the old value intact
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        let size_bytes = buf.len() as u64;
        self.blobs.write().insert(key.to_string(), buf.freeze());
        Ok(PutResult { size_bytes })
    }

    async fn get(&self, key: &str) -> UploadResult<Option<Bytes>> {
        Ok(self.blobs.read().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> UploadResult<()> {
        self.blobs.write().remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> UploadResult<usize> {
        let dir = dir_prefix(prefix);
        let mut blobs = self.blobs.write();
        let before = blobs.len();
        blobs.retain(|k, _| !k.starts_with(&dir));
        Ok(before - blobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes_stream;

    #[tokio::test]
    async fn put_replaces_existing_value() {
        let store = MemoryBlobStore::new();
        store.put("a/1", bytes_stream(Bytes::from_static(b"one"))).await.unwrap();
        let result = store.put("a/1", bytes_stream(Bytes::from_static(b"three"))).await.unwrap();

        assert_eq!(result.size_bytes, 5);
        assert_eq!(store.get("a/1").await.unwrap(), Some(Bytes::from_static(b"three")));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn delete_prefix_respects_path_boundaries() {
        let store = MemoryBlobStore::new();
        for key in ["s/upl_1/chunk_1", "s/upl_1/chunk_2", "s/upl_10/chunk_1"] {
            store.put(key, bytes_stream(Bytes::from_static(b"x"))).await.unwrap();
        }

        assert_eq!(store.delete_prefix("s/upl_1").await.unwrap(), 2);
        assert!(store.contains("s/upl_10/chunk_1"));
        assert_eq!(store.delete_prefix("s/upl_1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_key_reads_as_none_and_deletes_cleanly() {
        let store = MemoryBlobStore::new();
        assert_eq!(store.get("nope").await.unwrap(), None);
        store.delete("nope").await.unwrap();
    }
}
