use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::{SessionId, UploadError, UploadResult, UploadSession};

/// Storage for upload session records
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Create a new upload session. Fails if the id already exists.
    async fn create(&self, session: UploadSession) -> UploadResult<UploadSession>;

    /// Get an upload session, `None` if unknown
    async fn find(&self, session_id: &SessionId) -> UploadResult<Option<UploadSession>>;

    /// Replace an existing upload session
    async fn update(&self, session: UploadSession) -> UploadResult<UploadSession>;

    /// All sessions that have not reached a terminal status
    async fn list_active(&self) -> UploadResult<Vec<UploadSession>>;
}

/// In-memory session repository
#[derive(Debug, Clone, Default)]
pub struct MemorySessionRepository {
    sessions: Arc<RwLock<HashMap<SessionId, UploadSession>>>,
}

impl MemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn create(&self, session: UploadSession) -> UploadResult<UploadSession> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.id) {
            return Err(UploadError::validation(format!(
                "Upload session already exists: {}",
                session.id
            )));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn find(&self, session_id: &SessionId) -> UploadResult<Option<UploadSession>> {
        Ok(self.sessions.read().get(session_id).cloned())
    }

    async fn update(&self, session: UploadSession) -> UploadResult<UploadSession> {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(&session.id) {
            Some(existing) => {
                *existing = session.clone();
                Ok(session)
            }
            None => Err(UploadError::not_found(session.id.as_str())),
        }
    }

    async fn list_active(&self) -> UploadResult<Vec<UploadSession>> {
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|s| !s.status.is_terminal())
            .cloned()
            .collect())
    }
}

/// Session repository that keeps one JSON document per session in a directory
#[derive(Debug, Clone)]
pub struct FileSessionRepository {
    dir: PathBuf,
}

impl FileSessionRepository {
    pub async fn new(dir: impl AsRef<Path>) -> UploadResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn record_path(&self, session_id: &SessionId) -> UploadResult<PathBuf> {
        let id = session_id.as_str();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(UploadError::validation(format!("Invalid session id: {}", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    async fn write_record(&self, path: &Path, session: &UploadSession) -> UploadResult<()> {
        let body = serde_json::to_vec_pretty(session)?;
        let temp_path = path.with_extension(format!("json.tmp.{}", Uuid::new_v4()));
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&body).await?;
            file.sync_all().await?;
        }
        fs::rename(&temp_path, path).await?;
        Ok(())
    }

    async fn read_record(path: &Path) -> UploadResult<Option<UploadSession>> {
        match fs::read(path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SessionRepository for FileSessionRepository {
    async fn create(&self, session: UploadSession) -> UploadResult<UploadSession> {
        let path = self.record_path(&session.id)?;
        if fs::try_exists(&path).await? {
            return Err(UploadError::validation(format!(
                "Upload session already exists: {}",
                session.id
            )));
        }
        self.write_record(&path, &session).await?;
        Ok(session)
    }

    async fn find(&self, session_id: &SessionId) -> UploadResult<Option<UploadSession>> {
        let path = self.record_path(session_id)?;
        Self::read_record(&path).await
    }

    async fn update(&self, session: UploadSession) -> UploadResult<UploadSession> {
        let path = self.record_path(&session.id)?;
        if !fs::try_exists(&path).await? {
            return Err(UploadError::not_found(session.id.as_str()));
        }
        self.write_record(&path, &session).await?;
        Ok(session)
    }

    async fn list_active(&self) -> UploadResult<Vec<UploadSession>> {
        let mut active = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(session) = Self::read_record(&path).await? {
                if !session.status.is_terminal() {
                    active.push(session);
                }
            }
        }
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OwnerId, UploadMetadata, UploadStatus};
    use chrono::Utc;

    fn session() -> UploadSession {
        UploadSession::new(
            SessionId::new(),
            OwnerId::new("user-1"),
            UploadMetadata::new("a.jpg")
                .with_mime_type("image/jpeg")
                .with_declared_size(300)
                .with_total_chunks(3)
                .with_expected_checksum("abc123"),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn memory_create_find_update() {
        let repo = MemorySessionRepository::new();
        let mut s = repo.create(session()).await.unwrap();

        assert!(repo.create(s.clone()).await.is_err());

        s.chunk_checksums.insert(2, "c2".into());
        s.status = UploadStatus::Uploading;
        repo.update(s.clone()).await.unwrap();

        let found = repo.find(&s.id).await.unwrap().unwrap();
        assert_eq!(found.status, UploadStatus::Uploading);
        assert_eq!(found.uploaded_count(), 1);
        assert!(repo.find(&SessionId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_update_of_unknown_session_is_not_found() {
        let repo = MemorySessionRepository::new();
        let err = repo.update(session()).await.unwrap_err();
        assert!(matches!(err, UploadError::NotFound { .. }));
    }

    #[tokio::test]
    async fn file_repository_round_trips_and_lists_active() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileSessionRepository::new(dir.path()).await.unwrap();

        let active = repo.create(session()).await.unwrap();
        let mut done = repo.create(session()).await.unwrap();
        done.status = UploadStatus::Cancelled;
        repo.update(done.clone()).await.unwrap();

        let found = repo.find(&active.id).await.unwrap().unwrap();
        assert_eq!(found.original_filename, "a.jpg");
        assert_eq!(found.expected_checksum, "abc123");
        assert_eq!(found.status, UploadStatus::Pending);

        let listed = repo.list_active().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, active.id);
    }

    #[tokio::test]
    async fn file_repository_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileSessionRepository::new(dir.path()).await.unwrap();
        let result = repo.find(&SessionId::from("../etc/passwd")).await;
        assert!(matches!(result, Err(UploadError::Validation { .. })));
    }
}
