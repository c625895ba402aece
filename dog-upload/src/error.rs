use thiserror::Error;

use crate::UploadStatus;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Which checksum failed verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumScope {
    Chunk(u32),
    File,
}

impl std::fmt::Display for ChecksumScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chunk(n) => write!(f, "chunk {}", n),
            Self::File => write!(f, "assembled file"),
        }
    }
}

/// Errors that can occur during chunked upload operations
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Upload session not found: {session_id}")]
    NotFound { session_id: String },

    #[error("Invalid request: {message}")]
    Validation { message: String },

    #[error("Checksum mismatch for {scope}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        scope: ChecksumScope,
        expected: String,
        actual: String,
    },

    #[error("Incomplete assembly: chunk {chunk_number} missing from staging")]
    IncompleteAssembly { chunk_number: u32 },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: UploadStatus, to: UploadStatus },

    #[error("Cannot {operation} a session in state {status}")]
    InvalidState {
        status: UploadStatus,
        operation: &'static str,
    },

    #[error("Storage backend error: {source}")]
    Storage {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl UploadError {
    /// Create a storage error from any error type
    pub fn storage<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage {
            source: Box::new(error),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(session_id: S) -> Self {
        Self::NotFound {
            session_id: session_id.into(),
        }
    }

    pub fn invalid_state(status: UploadStatus, operation: &'static str) -> Self {
        Self::InvalidState { status, operation }
    }

    /// True for chunk-level failures the client can fix by resending the chunk
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::ChecksumMismatch {
                    scope: ChecksumScope::Chunk(_),
                    ..
                }
        )
    }

    /// True when the operation is illegal for the session's current status
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. } | Self::InvalidTransition { .. }
        )
    }

    /// True for storage-layer failures
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. } | Self::Io { .. } | Self::Serialization { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_mismatch_is_retryable_but_file_mismatch_is_not() {
        let chunk = UploadError::ChecksumMismatch {
            scope: ChecksumScope::Chunk(3),
            expected: "a".into(),
            actual: "b".into(),
        };
        let file = UploadError::ChecksumMismatch {
            scope: ChecksumScope::File,
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(chunk.is_retryable());
        assert!(!file.is_retryable());
        assert_eq!(
            file.to_string(),
            "Checksum mismatch for assembled file: expected a, got b"
        );
    }

    #[test]
    fn io_errors_count_as_storage() {
        let err: UploadError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(err.is_storage());
        assert!(!err.is_retryable());
    }
}
