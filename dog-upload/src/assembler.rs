use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::{
    BlobStore, ByteStream, ChecksumScope, IntegrityVerifier, KeyStrategy, SessionId,
    UploadError, UploadResult, UploadSession,
};

/// A verified, durably stored artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledArtifact {
    pub key: String,
    pub size_bytes: u64,
    pub checksum: String,
}

/// Concatenates staged chunks in order into the final artifact and validates it
pub struct Assembler {
    store: Arc<dyn BlobStore>,
    keys: Arc<dyn KeyStrategy>,
    verifier: Arc<IntegrityVerifier>,
}

impl Assembler {
    pub fn new(
        store: Arc<dyn BlobStore>,
        keys: Arc<dyn KeyStrategy>,
        verifier: Arc<IntegrityVerifier>,
    ) -> Self {
        Self {
            store,
            keys,
            verifier,
        }
    }

    /// Concatenate staged chunks `1..=total_chunks` into a single stream.
    ///
    /// A missing chunk ends the stream with an error and is reported through `missing`.
    fn concat_chunk_streams(&self, session: &UploadSession, missing: Arc<AtomicU32>) -> ByteStream {
        let store = self.store.clone();
        let chunk_keys: Vec<(u32, String)> = (1..=session.total_chunks)
            .map(|n| (n, self.keys.staging_key(&session.id, n)))
            .collect();

        let stream = async_stream::stream! {
            for (chunk_number, key) in chunk_keys {
                match store.get(&key).await {
                    Ok(Some(bytes)) => {
                        yield Ok(bytes);
                    }
                    Ok(None) => {
                        missing.store(chunk_number, Ordering::SeqCst);
                        yield Err(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            format!("Chunk {} missing at {}", chunk_number, key),
                        ));
                        return;
                    }
                    Err(e) => {
                        yield Err(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            format!("Failed to read chunk {}: {}", chunk_number, e),
                        ));
                        return;
                    }
                }
            }
        };
        Box::pin(stream)
    }

    /// Build and verify the artifact for a fully covered session.
    ///
    /// On any error the artifact key is deleted before returning, so a failed
    /// assembly never leaves a readable artifact behind.
    pub async fn assemble(&self, session: &UploadSession) -> UploadResult<AssembledArtifact> {
        let key = self.keys.artifact_key(&session.id, &session.original_filename);

        match self.build(session, &key).await {
            Ok(artifact) => Ok(artifact),
            Err(e) => {
                self.discard_artifact(&session.id, &key).await;
                Err(e)
            }
        }
    }

    async fn build(&self, session: &UploadSession, key: &str) -> UploadResult<AssembledArtifact> {
        let missing = Arc::new(AtomicU32::new(0));
        let stream = self.concat_chunk_streams(session, missing.clone());

        let put = self.store.put(key, stream).await;
        let chunk_number = missing.load(Ordering::SeqCst);
        if chunk_number != 0 {
            return Err(UploadError::IncompleteAssembly { chunk_number });
        }
        let put = put?;
        debug!(session_id = %session.id, size_bytes = put.size_bytes, "Artifact written");
        if put.size_bytes != session.declared_size {
            warn!(
                session_id = %session.id,
                declared_size = session.declared_size,
                size_bytes = put.size_bytes,
                "Assembled size differs from declared size"
            );
        }

        let checksum = self.checksum_stored(key).await?;
        let checksum = self
            .verifier
            .check(checksum, &session.expected_checksum, ChecksumScope::File)?;

        Ok(AssembledArtifact {
            key: key.to_string(),
            size_bytes: put.size_bytes,
            checksum,
        })
    }

    /// Hash the stored artifact as it streams back from the store
    async fn checksum_stored(&self, key: &str) -> UploadResult<String> {
        let mut stored = self.store.get_stream(key).await?.ok_or_else(|| {
            UploadError::storage(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Artifact vanished after write: {}", key),
            ))
        })?;

        let mut hasher = self.verifier.algorithm().hasher();
        while let Some(piece) = stored.next().await {
            hasher.update(&piece?);
        }
        Ok(hasher.finalize())
    }

    /// Delete an artifact that must not stay readable. Errors are logged, never returned.
    pub async fn discard_artifact(&self, session_id: &SessionId, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            warn!(
                session_id = %session_id,
                key = %key,
                error = %e,
                "Failed to delete partial artifact"
            );
        }
    }

    /// Remove every staged chunk of a session. Errors are logged, never returned.
    pub async fn purge_staged(&self, session_id: &SessionId) {
        let prefix = self.keys.staging_prefix(session_id);
        match self.store.delete_prefix(&prefix).await {
            Ok(removed) => debug!(session_id = %session_id, removed, "Purged staged chunks"),
            Err(e) => warn!(session_id = %session_id, error = %e, "Failed to purge staged chunks"),
        }
    }
}
