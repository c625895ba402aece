use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use std::pin::Pin;

use crate::{SessionId, UploadResult};

/// Stream of bytes for blob content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Wrap an in-memory buffer as a single-item [`ByteStream`]
pub fn bytes_stream(data: Bytes) -> ByteStream {
    Box::pin(futures_util::stream::once(async move { Ok(data) }))
}

/// Durable key/value byte storage for staged chunks and assembled artifacts.
///
/// `put` must replace atomically: readers see either the old bytes or the new ones.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a blob from a stream, replacing any existing value
    async fn put(&self, key: &str, stream: ByteStream) -> UploadResult<PutResult>;

    /// Fetch a blob, `None` if the key does not exist
    async fn get(&self, key: &str) -> UploadResult<Option<Bytes>>;

    /// Fetch a blob as a stream, `None` if the key does not exist.
    ///
    /// Backends that can read incrementally should override this; the default
    /// buffers the whole blob through [`BlobStore::get`].
    async fn get_stream(&self, key: &str) -> UploadResult<Option<ByteStream>> {
        Ok(self.get(key).await?.map(bytes_stream))
    }

    /// Delete a blob. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> UploadResult<()>;

    /// Delete every blob under the `prefix/` path, returning how many were removed
    async fn delete_prefix(&self, prefix: &str) -> UploadResult<usize>;
}

/// Result of a successful put operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    pub size_bytes: u64,
}

/// Strategy for laying out staging and artifact keys
pub trait KeyStrategy: Send + Sync {
    /// Key for one staged chunk
    fn staging_key(&self, session_id: &SessionId, chunk_number: u32) -> String;

    /// Prefix covering every staged chunk of a session
    fn staging_prefix(&self, session_id: &SessionId) -> String;

    /// Key for the assembled artifact
    fn artifact_key(&self, session_id: &SessionId, filename: &str) -> String;
}

/// Default layout: `<staging>/<session>/chunk_<n>` and `<completed>/<session>/<filename>`
#[derive(Debug, Clone)]
pub struct DefaultKeyStrategy {
    staging_prefix: String,
    completed_prefix: String,
}

impl DefaultKeyStrategy {
    pub fn new<S: Into<String>, C: Into<String>>(staging_prefix: S, completed_prefix: C) -> Self {
        Self {
            staging_prefix: staging_prefix.into().trim_end_matches('/').to_string(),
            completed_prefix: completed_prefix.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for DefaultKeyStrategy {
    fn default() -> Self {
        Self::new("uploads/chunks", "uploads/completed")
    }
}

impl KeyStrategy for DefaultKeyStrategy {
    fn staging_key(&self, session_id: &SessionId, chunk_number: u32) -> String {
        format!("{}/chunk_{}", self.staging_prefix(session_id), chunk_number)
    }

    fn staging_prefix(&self, session_id: &SessionId) -> String {
        format!("{}/{}", self.staging_prefix, session_id)
    }

    fn artifact_key(&self, session_id: &SessionId, filename: &str) -> String {
        format!("{}/{}/{}", self.completed_prefix, session_id, filename)
    }
}
