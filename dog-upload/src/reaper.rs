use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::{ChunkUploadCoordinator, UploadResult, UploadStatus};

const STUCK_ASSEMBLY_REASON: &str = "Assembly did not finish within the stale window";

/// Cleans up sessions idle longer than `stale_after`.
///
/// Pending and uploading sessions are cancelled. Sessions stuck in
/// `assembling`, whose outcome could not be recorded, are failed.
pub struct StaleSessionReaper {
    coordinator: Arc<ChunkUploadCoordinator>,
    stale_after: Duration,
    interval: Duration,
}

impl StaleSessionReaper {
    /// Create a reaper using the coordinator's configured window and interval
    pub fn new(coordinator: Arc<ChunkUploadCoordinator>) -> Self {
        let stale_after = coordinator.config().stale_after;
        let interval = coordinator.config().reaper_interval;
        Self {
            coordinator,
            stale_after,
            interval,
        }
    }

    /// Create reaper with custom interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start the reaper background task
    pub async fn start(self) -> UploadResult<()> {
        let mut ticker = interval(self.interval);

        info!("Starting stale session reaper with interval: {:?}", self.interval);

        loop {
            ticker.tick().await;

            match self.reap_stale_sessions().await {
                Ok(reaped) if reaped > 0 => info!("Reaped {} stale upload sessions", reaped),
                Ok(_) => debug!("No stale upload sessions found"),
                Err(e) => warn!("Error during stale session reaping: {}", e),
            }
        }
    }

    /// Run one reaper cycle, returning how many sessions were cancelled or failed
    pub async fn reap_stale_sessions(&self) -> UploadResult<usize> {
        let window = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let cutoff = self
            .coordinator
            .now()
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let is_stale = |updated_at: DateTime<Utc>| updated_at < cutoff;

        let mut reaped = 0;
        for session in self.coordinator.active_sessions().await? {
            if !is_stale(session.updated_at) {
                continue;
            }

            // Staleness is re-checked under the session lock so a chunk landing now keeps the session alive
            let result = match session.status {
                UploadStatus::Pending | UploadStatus::Uploading => {
                    debug!(session_id = %session.id, "Reaping stale upload session");
                    self.coordinator
                        .cancel_where(&session.id, |current| is_stale(current.updated_at))
                        .await
                }
                UploadStatus::Assembling => {
                    warn!(session_id = %session.id, "Session stuck in assembling past the stale window");
                    self.coordinator
                        .fail_assembling_where(&session.id, STUCK_ASSEMBLY_REASON, |current| {
                            is_stale(current.updated_at)
                        })
                        .await
                }
                _ => continue,
            };

            match result {
                Ok(true) => reaped += 1,
                Ok(false) => {}
                Err(e) => warn!(session_id = %session.id, error = %e, "Failed to reap session"),
            }
        }

        Ok(reaped)
    }
}
