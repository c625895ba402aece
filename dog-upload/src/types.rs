use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Unique identifier for an upload session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random session ID
    pub fn new() -> Self {
        Self(format!("upl_{}", Uuid::new_v4().simple()))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of the principal uploading the file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of an upload session
///
/// `Assembling` is the persisted assembly claim: the session has full coverage
/// and exactly one caller is concatenating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Assembling,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Assembling => "assembling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-supplied description of the file about to be uploaded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub filename: String,
    pub mime_type: String,
    pub declared_size: u64,
    pub total_chunks: u32,
    pub expected_checksum: String,
}

impl UploadMetadata {
    pub fn new<S: Into<String>>(filename: S) -> Self {
        Self {
            filename: filename.into(),
            mime_type: "application/octet-stream".to_string(),
            ..Self::default()
        }
    }

    pub fn with_mime_type<S: Into<String>>(mut self, mime_type: S) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared_size = size;
        self
    }

    pub fn with_total_chunks(mut self, total: u32) -> Self {
        self.total_chunks = total;
        self
    }

    pub fn with_expected_checksum<S: Into<String>>(mut self, checksum: S) -> Self {
        self.expected_checksum = checksum.into();
        self
    }
}

/// Upload session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: SessionId,
    pub owner_id: OwnerId,

    pub original_filename: String,
    pub mime_type: String,
    pub declared_size: u64,
    pub expected_checksum: String,
    pub total_chunks: u32,

    /// Recorded checksum per chunk number. The uploaded count is `len()` of this map.
    pub chunk_checksums: BTreeMap<u32, String>,

    pub status: UploadStatus,
    pub final_path: Option<String>,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    pub fn new(
        id: SessionId,
        owner_id: OwnerId,
        metadata: UploadMetadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            owner_id,
            original_filename: metadata.filename,
            mime_type: metadata.mime_type,
            declared_size: metadata.declared_size,
            expected_checksum: metadata.expected_checksum,
            total_chunks: metadata.total_chunks,
            chunk_checksums: BTreeMap::new(),
            status: UploadStatus::Pending,
            final_path: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn uploaded_count(&self) -> u32 {
        self.chunk_checksums.len() as u32
    }

    pub fn uploaded_chunks(&self) -> BTreeSet<u32> {
        self.chunk_checksums.keys().copied().collect()
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        (1..=self.total_chunks)
            .filter(|n| !self.chunk_checksums.contains_key(n))
            .collect()
    }

    /// Every chunk number in `1..=total_chunks` has a recorded entry.
    pub fn has_full_coverage(&self) -> bool {
        self.chunk_checksums.len() == self.total_chunks as usize
            && (1..=self.total_chunks).all(|n| self.chunk_checksums.contains_key(&n))
    }

    /// Percentage of chunks received, rounded to the nearest integer
    pub fn progress(&self) -> u32 {
        if self.total_chunks == 0 {
            return 0;
        }
        ((self.uploaded_count() as f64 / self.total_chunks as f64) * 100.0).round() as u32
    }

    pub fn chunk_progress(&self) -> ChunkProgress {
        ChunkProgress {
            status: self.status,
            uploaded_count: self.uploaded_count(),
            total_chunks: self.total_chunks,
            progress: self.progress(),
            final_path: self.final_path.clone(),
        }
    }
}

/// Returned after a chunk upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkProgress {
    pub status: UploadStatus,
    pub uploaded_count: u32,
    pub total_chunks: u32,
    pub progress: u32,
    pub final_path: Option<String>,
}

/// What a resuming client needs to know to send only the missing chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeInfo {
    pub status: UploadStatus,
    pub uploaded_chunks: BTreeSet<u32>,
    pub missing_chunks: Vec<u32>,
    pub total_chunks: u32,
    pub progress: u32,
    pub final_path: Option<String>,
}

impl From<&UploadSession> for ResumeInfo {
    fn from(session: &UploadSession) -> Self {
        Self {
            status: session.status,
            uploaded_chunks: session.uploaded_chunks(),
            missing_chunks: session.missing_chunks(),
            total_chunks: session.total_chunks,
            progress: session.progress(),
            final_path: session.final_path.clone(),
        }
    }
}

/// Summary view of a session, including the failure reason if any
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatusReport {
    pub session_id: SessionId,
    pub status: UploadStatus,
    pub progress: u32,
    pub uploaded_count: u32,
    pub total_chunks: u32,
    pub final_path: Option<String>,
    pub error_message: Option<String>,
}

impl From<&UploadSession> for UploadStatusReport {
    fn from(session: &UploadSession) -> Self {
        Self {
            session_id: session.id.clone(),
            status: session.status,
            progress: session.progress(),
            uploaded_count: session.uploaded_count(),
            total_chunks: session.total_chunks,
            final_path: session.final_path.clone(),
            error_message: session.error_message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total: u32) -> UploadSession {
        UploadSession::new(
            SessionId::new(),
            OwnerId::new("user-1"),
            UploadMetadata::new("a.jpg")
                .with_declared_size(300)
                .with_total_chunks(total)
                .with_expected_checksum("abc123"),
            Utc::now(),
        )
    }

    #[test]
    fn progress_is_rounded_percentage() {
        let mut s = session(3);
        assert_eq!(s.progress(), 0);
        s.chunk_checksums.insert(1, "c1".into());
        assert_eq!(s.progress(), 33);
        s.chunk_checksums.insert(2, "c2".into());
        assert_eq!(s.progress(), 67);
        s.chunk_checksums.insert(3, "c3".into());
        assert_eq!(s.progress(), 100);
    }

    #[test]
    fn coverage_requires_every_number() {
        let mut s = session(3);
        s.chunk_checksums.insert(1, "c1".into());
        s.chunk_checksums.insert(3, "c3".into());
        assert!(!s.has_full_coverage());
        assert_eq!(s.missing_chunks(), vec![2]);

        s.chunk_checksums.insert(2, "c2".into());
        assert!(s.has_full_coverage());
        assert!(s.missing_chunks().is_empty());
    }

    #[test]
    fn out_of_range_entries_never_count_as_coverage() {
        let mut s = session(2);
        s.chunk_checksums.insert(1, "c1".into());
        s.chunk_checksums.insert(5, "c5".into());
        assert_eq!(s.uploaded_count(), 2);
        assert!(!s.has_full_coverage());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&UploadStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        assert!(UploadStatus::Failed.is_terminal());
        assert!(!UploadStatus::Assembling.is_terminal());
    }

    #[test]
    fn session_ids_are_prefixed_and_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert!(a.as_str().starts_with("upl_"));
        assert_ne!(a, b);
    }
}
