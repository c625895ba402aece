use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{OwnerId, SessionId};

/// Lifecycle events for upload sessions.
///
/// `Completed` is the hand-off to downstream artifact processing and is sent
/// exactly once per completed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadEvent {
    Initialized {
        session_id: SessionId,
        owner_id: OwnerId,
        total_chunks: u32,
        at: DateTime<Utc>,
    },

    ChunkAccepted {
        session_id: SessionId,
        chunk_number: u32,
        uploaded_count: u32,
        at: DateTime<Utc>,
    },

    Completed {
        session_id: SessionId,
        owner_id: OwnerId,
        final_path: String,
        at: DateTime<Utc>,
    },

    Failed {
        session_id: SessionId,
        error: String,
        at: DateTime<Utc>,
    },

    Cancelled {
        session_id: SessionId,
        at: DateTime<Utc>,
    },
}

impl UploadEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Initialized { session_id, .. }
            | Self::ChunkAccepted { session_id, .. }
            | Self::Completed { session_id, .. }
            | Self::Failed { session_id, .. }
            | Self::Cancelled { session_id, .. } => session_id,
        }
    }
}
