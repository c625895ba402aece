use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, error, info, instrument, warn};

use crate::assembler::Assembler;
use crate::state::ChunkAdmission;
use crate::{
    bytes_stream, BlobStore, ChecksumAlgorithm, ChecksumScope, ChunkProgress, Clock,
    DefaultKeyStrategy, IntegrityVerifier, KeyStrategy, OwnerId, ResumeInfo, SessionId,
    SessionRepository, SessionStateMachine, SystemClock, UploadConfig, UploadError, UploadEvent,
    UploadMetadata, UploadResult, UploadSession, UploadStatus, UploadStatusReport,
};

const COMMIT_ATTEMPTS: u32 = 3;
const COMMIT_BACKOFF: Duration = Duration::from_millis(20);

/// Terminal outcome of an assembly, as recorded on the session
enum Verdict {
    Complete { final_path: String },
    Fail { reason: String },
}

/// Per-session async mutexes. Entries are dropped once a session is terminal.
#[derive(Default)]
struct SessionLocks {
    inner: parking_lot::Mutex<HashMap<SessionId, Arc<AsyncMutex<()>>>>,
}

impl SessionLocks {
    fn get(&self, session_id: &SessionId) -> Arc<AsyncMutex<()>> {
        self.inner
            .lock()
            .entry(session_id.clone())
            .or_default()
            .clone()
    }

    fn release(&self, session_id: &SessionId) {
        self.inner.lock().remove(session_id);
    }
}

/// Orchestrates chunked uploads: initialize, upload chunks, resume, cancel.
///
/// Chunk bytes for different chunk numbers are written in parallel. Recording a
/// chunk, checking coverage and every status change happen under the session's
/// lock, and the `uploading -> assembling` claim is persisted there. Only the
/// caller that made the claim runs the assembler.
pub struct ChunkUploadCoordinator {
    store: Arc<dyn BlobStore>,
    sessions: Arc<dyn SessionRepository>,
    keys: Arc<dyn KeyStrategy>,
    verifier: Arc<IntegrityVerifier>,
    clock: Arc<dyn Clock>,
    config: UploadConfig,
    locks: SessionLocks,
    events: broadcast::Sender<UploadEvent>,
}

impl ChunkUploadCoordinator {
    pub fn new<S, R>(store: S, sessions: R, config: UploadConfig) -> Self
    where
        S: BlobStore + 'static,
        R: SessionRepository + 'static,
    {
        let (events, _) = broadcast::channel(1000);
        let keys = DefaultKeyStrategy::new(&config.staging_prefix, &config.completed_prefix);

        Self {
            store: Arc::new(store),
            sessions: Arc::new(sessions),
            keys: Arc::new(keys),
            verifier: Arc::new(IntegrityVerifier::default()),
            clock: Arc::new(SystemClock),
            config,
            locks: SessionLocks::default(),
            events,
        }
    }

    /// Use a custom time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a checksum algorithm other than SHA-256
    pub fn with_checksum<A: ChecksumAlgorithm + 'static>(mut self, algorithm: A) -> Self {
        self.verifier = Arc::new(IntegrityVerifier::new(algorithm));
        self
    }

    /// Use a custom key layout
    pub fn with_key_strategy<K: KeyStrategy + 'static>(mut self, keys: K) -> Self {
        self.keys = Arc::new(keys);
        self
    }

    /// Subscribe to session lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn assembler(&self) -> Assembler {
        Assembler::new(self.store.clone(), self.keys.clone(), self.verifier.clone())
    }

    fn emit(&self, event: UploadEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn load(&self, session_id: &SessionId) -> UploadResult<UploadSession> {
        self.sessions
            .find(session_id)
            .await?
            .ok_or_else(|| UploadError::not_found(session_id.as_str()))
    }

    fn validate_metadata(&self, metadata: &UploadMetadata) -> UploadResult<()> {
        let filename = metadata.filename.trim();
        if filename.is_empty() {
            return Err(UploadError::validation("Filename is required"));
        }
        if filename != metadata.filename
            || filename == "."
            || filename == ".."
            || filename.contains(['/', '\\', '\0'])
        {
            return Err(UploadError::validation(format!(
                "Invalid filename: {:?}",
                metadata.filename
            )));
        }
        if metadata.mime_type.trim().is_empty() {
            return Err(UploadError::validation("Mime type is required"));
        }
        if metadata.declared_size == 0 {
            return Err(UploadError::validation("Declared size must be positive"));
        }
        if metadata.declared_size > self.config.max_upload_bytes {
            return Err(UploadError::validation(format!(
                "Upload size {} exceeds maximum {}",
                metadata.declared_size, self.config.max_upload_bytes
            )));
        }
        if metadata.total_chunks == 0 || metadata.total_chunks > self.config.max_total_chunks {
            return Err(UploadError::validation(format!(
                "Invalid total chunks: {} (must be 1-{})",
                metadata.total_chunks, self.config.max_total_chunks
            )));
        }
        if metadata.expected_checksum.trim().is_empty() {
            return Err(UploadError::validation("Expected checksum is required"));
        }
        Ok(())
    }

    fn validate_chunk(
        &self,
        session: &UploadSession,
        chunk_number: u32,
        data: &Bytes,
        claimed_checksum: &str,
    ) -> UploadResult<()> {
        if chunk_number == 0 || chunk_number > session.total_chunks {
            return Err(UploadError::validation(format!(
                "Invalid chunk number: {} (must be 1-{})",
                chunk_number, session.total_chunks
            )));
        }
        if data.is_empty() {
            return Err(UploadError::validation("Chunk is empty"));
        }
        if data.len() as u64 > self.config.max_chunk_bytes {
            return Err(UploadError::validation(format!(
                "Chunk size {} exceeds maximum {}",
                data.len(),
                self.config.max_chunk_bytes
            )));
        }
        if claimed_checksum.trim().is_empty() {
            return Err(UploadError::validation("Chunk checksum is required"));
        }
        Ok(())
    }

    /// Start a new upload session in `pending`
    #[instrument(skip(self, metadata, owner_id), fields(filename = %metadata.filename, owner_id = %owner_id))]
    pub async fn initialize(
        &self,
        metadata: UploadMetadata,
        owner_id: OwnerId,
    ) -> UploadResult<SessionId> {
        self.validate_metadata(&metadata)?;

        let now = self.clock.now();
        let total_chunks = metadata.total_chunks;
        let session = UploadSession::new(SessionId::new(), owner_id.clone(), metadata, now);
        let session = self.sessions.create(session).await?;

        info!(session_id = %session.id, total_chunks, "Upload session initialized");
        self.emit(UploadEvent::Initialized {
            session_id: session.id.clone(),
            owner_id,
            total_chunks,
            at: now,
        });

        Ok(session.id)
    }

    /// Accept one chunk.
    ///
    /// Checksum and validation failures leave the session untouched. The call
    /// that completes coverage also runs assembly and returns the terminal status.
    #[instrument(skip(self, session_id, data, claimed_checksum), fields(session_id = %session_id, size = data.len()))]
    pub async fn upload_chunk(
        &self,
        session_id: &SessionId,
        chunk_number: u32,
        data: Bytes,
        claimed_checksum: &str,
    ) -> UploadResult<ChunkProgress> {
        let session = self.load(session_id).await?;
        if SessionStateMachine::admit_chunk(session.status)? == ChunkAdmission::AlreadySatisfied {
            debug!(status = %session.status, "Chunk ignored, session already has full coverage");
            return Ok(session.chunk_progress());
        }

        self.validate_chunk(&session, chunk_number, &data, claimed_checksum)?;
        if let Err(e) = self
            .verifier
            .verify(&data, claimed_checksum, ChecksumScope::Chunk(chunk_number))
        {
            warn!(chunk_number, error = %e, "Rejected chunk");
            return Err(e);
        }

        let key = self.keys.staging_key(session_id, chunk_number);
        self.store.put(&key, bytes_stream(data)).await?;

        let lock = self.locks.get(session_id);
        let claimed = {
            let _guard = lock.lock().await;
            let mut session = self.load(session_id).await?;

            match SessionStateMachine::admit_chunk(session.status) {
                Ok(ChunkAdmission::Accept) => {}
                Ok(ChunkAdmission::AlreadySatisfied) => {
                    // Staging is purged after the terminal commit; don't leave this write behind
                    if session.status.is_terminal() {
                        self.discard_staged(&key).await;
                        self.locks.release(session_id);
                    }
                    return Ok(session.chunk_progress());
                }
                Err(e) => {
                    self.discard_staged(&key).await;
                    self.locks.release(session_id);
                    return Err(e);
                }
            }

            let now = self.clock.now();
            let claimed = SessionStateMachine::record_chunk(
                &mut session,
                chunk_number,
                claimed_checksum.trim().to_string(),
                now,
            )?;
            let session = self.sessions.update(session).await?;

            debug!(
                chunk_number,
                uploaded = session.uploaded_count(),
                total = session.total_chunks,
                "Chunk recorded"
            );
            self.emit(UploadEvent::ChunkAccepted {
                session_id: session.id.clone(),
                chunk_number,
                uploaded_count: session.uploaded_count(),
                at: now,
            });

            if !claimed {
                return Ok(session.chunk_progress());
            }
            session
        };

        info!("All chunks received, assembling");
        let session = self.finalize(claimed).await?;
        Ok(session.chunk_progress())
    }

    async fn discard_staged(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            warn!(key = %key, error = %e, "Failed to discard staged chunk");
        }
    }

    /// Assemble a claimed session and commit its terminal status.
    ///
    /// Staging is purged and the lock entry released however the commit ends.
    /// A completion that cannot be recorded deletes the artifact and is
    /// recorded as a failure instead. If nothing can be recorded the session
    /// stays `assembling` until the reaper fails it.
    async fn finalize(&self, claimed: UploadSession) -> UploadResult<UploadSession> {
        let assembler = self.assembler();
        let outcome = assembler.assemble(&claimed).await;
        let mut verdict = match &outcome {
            Ok(artifact) => Verdict::Complete {
                final_path: artifact.key.clone(),
            },
            Err(e) => Verdict::Fail {
                reason: e.to_string(),
            },
        };

        let mut committed = self.commit_with_retry(&claimed.id, &verdict).await;
        let unrecorded = match (&committed, &verdict) {
            (Err(e), Verdict::Complete { final_path }) => Some((e.to_string(), final_path.clone())),
            _ => None,
        };
        if let Some((error, final_path)) = unrecorded {
            warn!(session_id = %claimed.id, error = %error, "Could not record completion, failing the session");
            assembler.discard_artifact(&claimed.id, &final_path).await;
            verdict = Verdict::Fail {
                reason: UploadError::storage(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("failed to record completion: {}", error),
                ))
                .to_string(),
            };
            committed = self.commit_with_retry(&claimed.id, &verdict).await;
        }

        self.locks.release(&claimed.id);
        assembler.purge_staged(&claimed.id).await;

        let (session, applied) = match committed {
            Ok(committed) => committed,
            Err(e) => {
                error!(
                    session_id = %claimed.id,
                    error = %e,
                    "Could not record assembly outcome, session left assembling"
                );
                return Err(e);
            }
        };
        if !applied {
            // Failed elsewhere while assembling; this artifact belongs to no session
            if let Verdict::Complete { final_path } = &verdict {
                assembler.discard_artifact(&claimed.id, final_path).await;
            }
            debug!(session_id = %session.id, status = %session.status, "Session resolved during assembly");
            return Ok(session);
        }

        let now = self.clock.now();
        match verdict {
            Verdict::Complete { final_path } => {
                if let Ok(artifact) = &outcome {
                    info!(
                        session_id = %session.id,
                        final_path = %final_path,
                        size_bytes = artifact.size_bytes,
                        "Upload completed"
                    );
                }
                self.emit(UploadEvent::Completed {
                    session_id: session.id.clone(),
                    owner_id: session.owner_id.clone(),
                    final_path,
                    at: now,
                });
            }
            Verdict::Fail { reason } => {
                warn!(session_id = %session.id, error = %reason, "Upload failed during assembly");
                self.emit(UploadEvent::Failed {
                    session_id: session.id.clone(),
                    error: reason,
                    at: now,
                });
            }
        }

        Ok(session)
    }

    /// Record `verdict` on a session that is still `assembling`.
    ///
    /// Returns the stored session and whether the verdict was applied.
    async fn commit_verdict(
        &self,
        session_id: &SessionId,
        verdict: &Verdict,
    ) -> UploadResult<(UploadSession, bool)> {
        let lock = self.locks.get(session_id);
        let _guard = lock.lock().await;

        let mut session = self.load(session_id).await?;
        if session.status != UploadStatus::Assembling {
            return Ok((session, false));
        }

        let now = self.clock.now();
        match verdict {
            Verdict::Complete { final_path } => {
                SessionStateMachine::complete(&mut session, final_path.clone(), now)?
            }
            Verdict::Fail { reason } => SessionStateMachine::fail(&mut session, reason.clone(), now)?,
        }
        let session = self.sessions.update(session).await?;
        Ok((session, true))
    }

    async fn commit_with_retry(
        &self,
        session_id: &SessionId,
        verdict: &Verdict,
    ) -> UploadResult<(UploadSession, bool)> {
        let mut attempt = 1;
        loop {
            match self.commit_verdict(session_id, verdict).await {
                Ok(committed) => return Ok(committed),
                Err(e) if attempt < COMMIT_ATTEMPTS => {
                    warn!(session_id = %session_id, attempt, error = %e, "Retrying terminal commit");
                    tokio::time::sleep(COMMIT_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read-only view a client uses to resend only missing chunks
    pub async fn resume(&self, session_id: &SessionId) -> UploadResult<ResumeInfo> {
        let session = self.load(session_id).await?;
        Ok(ResumeInfo::from(&session))
    }

    /// Read-only status summary, including the failure reason
    pub async fn status(&self, session_id: &SessionId) -> UploadResult<UploadStatusReport> {
        let session = self.load(session_id).await?;
        Ok(UploadStatusReport::from(&session))
    }

    /// Cancel a pending or uploading session and purge its staged chunks.
    ///
    /// Returns `Ok(false)` for unknown sessions and `Ok(true)` if the session is
    /// (now) cancelled or already failed. Completed and assembling sessions
    /// cannot be cancelled.
    #[instrument(skip(self, session_id), fields(session_id = %session_id))]
    pub async fn cancel(&self, session_id: &SessionId) -> UploadResult<bool> {
        if self.sessions.find(session_id).await?.is_none() {
            return Ok(false);
        }
        self.cancel_where(session_id, |_| true).await
    }

    /// Cancel only if `predicate` still holds for the session under its lock
    pub(crate) async fn cancel_where<F>(&self, session_id: &SessionId, predicate: F) -> UploadResult<bool>
    where
        F: FnOnce(&UploadSession) -> bool,
    {
        let lock = self.locks.get(session_id);
        let guard = lock.lock().await;

        let Some(mut session) = self.sessions.find(session_id).await? else {
            drop(guard);
            self.locks.release(session_id);
            return Ok(false);
        };

        match session.status {
            UploadStatus::Cancelled => {
                drop(guard);
                self.locks.release(session_id);
                return Ok(true);
            }
            UploadStatus::Failed => {
                drop(guard);
                self.locks.release(session_id);
                self.assembler().purge_staged(session_id).await;
                return Ok(true);
            }
            _ => {}
        }

        if let Err(e) = SessionStateMachine::ensure_cancellable(session.status) {
            drop(guard);
            if session.status.is_terminal() {
                self.locks.release(session_id);
            }
            return Err(e);
        }
        if !predicate(&session) {
            return Ok(false);
        }

        let now = self.clock.now();
        SessionStateMachine::transition(&mut session, UploadStatus::Cancelled, now)?;
        self.sessions.update(session).await?;
        drop(guard);
        self.locks.release(session_id);

        self.assembler().purge_staged(session_id).await;
        info!("Upload cancelled");
        self.emit(UploadEvent::Cancelled {
            session_id: session_id.clone(),
            at: now,
        });

        Ok(true)
    }

    /// Fail a session stuck in `assembling` if `predicate` still holds under its lock.
    ///
    /// Deletes any artifact at the session's key and purges staging.
    pub(crate) async fn fail_assembling_where<F>(
        &self,
        session_id: &SessionId,
        reason: &str,
        predicate: F,
    ) -> UploadResult<bool>
    where
        F: FnOnce(&UploadSession) -> bool,
    {
        let lock = self.locks.get(session_id);
        let guard = lock.lock().await;

        let Some(mut session) = self.sessions.find(session_id).await? else {
            drop(guard);
            self.locks.release(session_id);
            return Ok(false);
        };
        if session.status != UploadStatus::Assembling || !predicate(&session) {
            return Ok(false);
        }

        let now = self.clock.now();
        SessionStateMachine::fail(&mut session, reason.to_string(), now)?;
        let session = self.sessions.update(session).await?;
        drop(guard);
        self.locks.release(session_id);

        let assembler = self.assembler();
        let key = self.keys.artifact_key(session_id, &session.original_filename);
        assembler.discard_artifact(session_id, &key).await;
        assembler.purge_staged(session_id).await;

        warn!(session_id = %session_id, reason, "Failed session stuck in assembling");
        self.emit(UploadEvent::Failed {
            session_id: session_id.clone(),
            error: reason.to_string(),
            at: now,
        });

        Ok(true)
    }

    /// Sessions that have not reached a terminal status
    pub async fn active_sessions(&self) -> UploadResult<Vec<UploadSession>> {
        self.sessions.list_active().await
    }
}
