use chrono::{DateTime, Utc};

use crate::{UploadError, UploadResult, UploadSession, UploadStatus};

/// What an incoming chunk should do given the session's status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAdmission {
    /// Store and record the chunk
    Accept,
    /// Acknowledge without storing: the session already has everything it needs
    AlreadySatisfied,
}

/// Owns the legal status transitions of an upload session
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStateMachine;

impl SessionStateMachine {
    pub fn can_transition(from: UploadStatus, to: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (from, to),
            (Pending, Uploading)
                | (Uploading, Uploading)
                | (Uploading, Assembling)
                | (Assembling, Completed)
                | (Assembling, Failed)
                | (Uploading, Failed)
                | (Pending, Cancelled)
                | (Uploading, Cancelled)
        )
    }

    /// Move `session` to `to`, stamping `updated_at`
    pub fn transition(
        session: &mut UploadSession,
        to: UploadStatus,
        now: DateTime<Utc>,
    ) -> UploadResult<()> {
        if !Self::can_transition(session.status, to) {
            return Err(UploadError::InvalidTransition {
                from: session.status,
                to,
            });
        }
        session.status = to;
        session.updated_at = now;
        Ok(())
    }

    /// Decide whether a chunk upload may proceed.
    ///
    /// Completed and assembling sessions acknowledge retries as no-ops;
    /// failed and cancelled sessions reject them.
    pub fn admit_chunk(status: UploadStatus) -> UploadResult<ChunkAdmission> {
        match status {
            UploadStatus::Pending | UploadStatus::Uploading => Ok(ChunkAdmission::Accept),
            UploadStatus::Assembling | UploadStatus::Completed => {
                Ok(ChunkAdmission::AlreadySatisfied)
            }
            UploadStatus::Failed | UploadStatus::Cancelled => {
                Err(UploadError::invalid_state(status, "upload a chunk to"))
            }
        }
    }

    /// Record a verified chunk, moving `pending -> uploading` on the first one.
    ///
    /// Returns true if this call finished coverage and claimed assembly
    /// (`uploading -> assembling`). Only one caller can ever see true.
    pub fn record_chunk(
        session: &mut UploadSession,
        chunk_number: u32,
        checksum: String,
        now: DateTime<Utc>,
    ) -> UploadResult<bool> {
        if Self::admit_chunk(session.status)? != ChunkAdmission::Accept {
            return Ok(false);
        }
        if chunk_number == 0 || chunk_number > session.total_chunks {
            return Err(UploadError::validation(format!(
                "Invalid chunk number: {} (must be 1-{})",
                chunk_number, session.total_chunks
            )));
        }

        session.chunk_checksums.insert(chunk_number, checksum);
        Self::transition(session, UploadStatus::Uploading, now)?;

        if session.has_full_coverage() {
            Self::transition(session, UploadStatus::Assembling, now)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn ensure_cancellable(status: UploadStatus) -> UploadResult<()> {
        if Self::can_transition(status, UploadStatus::Cancelled) {
            Ok(())
        } else {
            Err(UploadError::invalid_state(status, "cancel"))
        }
    }

    pub fn complete(
        session: &mut UploadSession,
        final_path: String,
        now: DateTime<Utc>,
    ) -> UploadResult<()> {
        Self::transition(session, UploadStatus::Completed, now)?;
        session.final_path = Some(final_path);
        session.completed_at = Some(now);
        session.error_message = None;
        Ok(())
    }

    pub fn fail(session: &mut UploadSession, reason: String, now: DateTime<Utc>) -> UploadResult<()> {
        Self::transition(session, UploadStatus::Failed, now)?;
        session.final_path = None;
        session.error_message = Some(reason);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OwnerId, SessionId, UploadMetadata};
    use UploadStatus::*;

    fn session(total: u32) -> UploadSession {
        UploadSession::new(
            SessionId::new(),
            OwnerId::new("u"),
            UploadMetadata::new("a.jpg")
                .with_declared_size(10)
                .with_total_chunks(total)
                .with_expected_checksum("x"),
            Utc::now(),
        )
    }

    #[test]
    fn no_transition_leaves_a_terminal_state() {
        let all = [Pending, Uploading, Assembling, Completed, Failed, Cancelled];
        for from in [Completed, Failed, Cancelled] {
            for to in all {
                assert!(!SessionStateMachine::can_transition(from, to), "{from} -> {to}");
            }
        }
        assert!(!SessionStateMachine::can_transition(Assembling, Uploading));
        assert!(!SessionStateMachine::can_transition(Assembling, Cancelled));
        assert!(!SessionStateMachine::can_transition(Pending, Completed));
    }

    #[test]
    fn first_chunk_moves_to_uploading_and_last_claims_assembly() {
        let mut s = session(2);
        let now = Utc::now();

        assert!(!SessionStateMachine::record_chunk(&mut s, 2, "c2".into(), now).unwrap());
        assert_eq!(s.status, Uploading);

        // Re-upload of the same number neither inflates the count nor claims
        assert!(!SessionStateMachine::record_chunk(&mut s, 2, "c2".into(), now).unwrap());
        assert_eq!(s.uploaded_count(), 1);

        assert!(SessionStateMachine::record_chunk(&mut s, 1, "c1".into(), now).unwrap());
        assert_eq!(s.status, Assembling);

        // A late duplicate after the claim is acknowledged but never claims again
        assert!(!SessionStateMachine::record_chunk(&mut s, 1, "c1".into(), now).unwrap());
    }

    #[test]
    fn out_of_range_chunk_is_rejected_without_mutation() {
        let mut s = session(2);
        let err = SessionStateMachine::record_chunk(&mut s, 3, "c3".into(), Utc::now()).unwrap_err();
        assert!(matches!(err, UploadError::Validation { .. }));
        assert_eq!(s.status, Pending);
        assert_eq!(s.uploaded_count(), 0);
    }

    #[test]
    fn admission_rules() {
        assert_eq!(SessionStateMachine::admit_chunk(Pending).unwrap(), ChunkAdmission::Accept);
        assert_eq!(
            SessionStateMachine::admit_chunk(Completed).unwrap(),
            ChunkAdmission::AlreadySatisfied
        );
        assert!(SessionStateMachine::admit_chunk(Failed).unwrap_err().is_invalid_state());
        assert!(SessionStateMachine::admit_chunk(Cancelled).unwrap_err().is_invalid_state());
    }

    #[test]
    fn complete_sets_final_path_and_fail_records_reason() {
        let now = Utc::now();
        let mut ok = session(1);
        SessionStateMachine::record_chunk(&mut ok, 1, "c1".into(), now).unwrap();
        SessionStateMachine::complete(&mut ok, "done/a.jpg".into(), now).unwrap();
        assert_eq!(ok.final_path.as_deref(), Some("done/a.jpg"));
        assert_eq!(ok.completed_at, Some(now));

        let mut bad = session(1);
        SessionStateMachine::record_chunk(&mut bad, 1, "c1".into(), now).unwrap();
        SessionStateMachine::fail(&mut bad, "checksum".into(), now).unwrap();
        assert_eq!(bad.status, Failed);
        assert!(bad.final_path.is_none());
        assert_eq!(bad.error_message.as_deref(), Some("checksum"));

        assert!(SessionStateMachine::complete(&mut bad, "x".into(), now).is_err());
    }

    #[test]
    fn cancel_only_from_pending_or_uploading() {
        assert!(SessionStateMachine::ensure_cancellable(Pending).is_ok());
        assert!(SessionStateMachine::ensure_cancellable(Uploading).is_ok());
        for status in [Assembling, Completed, Failed, Cancelled] {
            assert!(SessionStateMachine::ensure_cancellable(status).is_err());
        }
    }
}
