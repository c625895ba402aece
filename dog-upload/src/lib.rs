//! # dog-upload: Resumable chunked uploads with end-to-end integrity
//!
//! `dog-upload` accepts large payloads (images, media) as numbered chunks over an
//! unreliable channel, verifies every chunk and the assembled file against
//! client-supplied checksums, and produces the final artifact all-or-nothing.
//!
//! ## Key Features
//!
//! - **Out-of-order and concurrent chunks**: per-session serialization, parallel blob writes
//! - **Idempotent retries**: re-sending a chunk number overwrites it and never inflates progress
//! - **Coverage, not counting**: assembly starts only when every number `1..=N` is present
//! - **Exactly-once assembly**: the `uploading -> assembling` claim is persisted under the session lock
//! - **Storage agnostic**: memory and filesystem backends, or bring your own [`BlobStore`]
//! - **Resumable**: [`ChunkUploadCoordinator::resume`] reports exactly which chunks are missing
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_upload::prelude::*;
//! use bytes::Bytes;
//!
//! # #[tokio::main]
//! # async fn main() -> UploadResult<()> {
//! let uploads = ChunkUploadCoordinator::new(
//!     MemoryBlobStore::new(),
//!     MemorySessionRepository::new(),
//!     UploadConfig::default(),
//! );
//! let verifier = IntegrityVerifier::default();
//!
//! let chunks = [Bytes::from_static(b"hello, "), Bytes::from_static(b"world")];
//! let metadata = UploadMetadata::new("hello.txt")
//!     .with_mime_type("text/plain")
//!     .with_declared_size(12)
//!     .with_total_chunks(2)
//!     .with_expected_checksum(verifier.compute(b"hello, world"));
//!
//! let id = uploads.initialize(metadata, OwnerId::new("user-123")).await?;
//!
//! // Chunks may arrive in any order
//! uploads.upload_chunk(&id, 2, chunks[1].clone(), &verifier.compute(&chunks[1])).await?;
//! let progress = uploads.upload_chunk(&id, 1, chunks[0].clone(), &verifier.compute(&chunks[0])).await?;
//!
//! assert_eq!(progress.status, UploadStatus::Completed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐
//! │  ChunkUploadCoordinator  │  ← initialize / upload_chunk / resume / cancel
//! ├────────────┬─────────────┤
//! │ Assembler  │ StateMachine│  ← ordered concat + whole-file check / transitions
//! ├────────────┴─────────────┤
//! │ BlobStore │ SessionRepo  │  ← storage primitives
//! └──────────────────────────┘
//! ```

pub mod assembler;
mod checksum;
mod clock;
mod config;
mod coordinator;
mod error;
mod events;
mod fs_store;
mod memory_store;
mod reaper;
mod session_store;
pub mod state;
pub mod store;
mod types;

// Re-export main types for clean API
pub use assembler::{AssembledArtifact, Assembler};
pub use checksum::{ChecksumAlgorithm, ChecksumHasher, IntegrityVerifier, Sha256Checksum};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::UploadConfig;
pub use coordinator::ChunkUploadCoordinator;
pub use error::{ChecksumScope, UploadError, UploadResult};
pub use events::UploadEvent;
pub use fs_store::FilesystemBlobStore;
pub use memory_store::MemoryBlobStore;
pub use reaper::StaleSessionReaper;
pub use session_store::{FileSessionRepository, MemorySessionRepository, SessionRepository};
pub use state::{ChunkAdmission, SessionStateMachine};
pub use store::{bytes_stream, BlobStore, ByteStream, DefaultKeyStrategy, KeyStrategy, PutResult};
pub use types::{
    ChunkProgress, OwnerId, ResumeInfo, SessionId, UploadMetadata, UploadSession,
    UploadStatus, UploadStatusReport,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ChunkUploadCoordinator, IntegrityVerifier, MemoryBlobStore, MemorySessionRepository,
        OwnerId, SessionId, UploadConfig, UploadError, UploadMetadata, UploadResult,
        UploadStatus,
    };
}
