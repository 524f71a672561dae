use crate::index::ReservationIndex;
use log::{debug, trace};
use std::sync::Arc;
use std::time::Duration;
use token_core::error::SelectionError;
use token_core::id::{RecordId, SelectionId};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Timed release of in-memory reservations.
///
/// Each successful selection schedules one timer that releases all of its
/// records when it fires. Timers are never cancelled by confirm or rollback:
/// releasing an already free record is a no-op, and a record that was
/// consumed in the meantime is simply gone.
#[derive(Debug, Clone)]
pub struct UnlockScheduler {
    handle: Handle,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl UnlockScheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Scheduler bound to the runtime of the calling task
    pub fn current() -> Result<Self, SelectionError> {
        let handle = Handle::try_current().map_err(|e| {
            SelectionError::Runtime(format!("auto-unlock requires a tokio runtime: {}", e))
        })?;
        Ok(Self::new(handle))
    }

    /// Release `record_ids` for `selection_id` after `delay`
    pub fn schedule(
        &self,
        index: Arc<ReservationIndex>,
        selection_id: SelectionId,
        record_ids: Vec<RecordId>,
        delay: Duration,
    ) {
        if self.cancel.is_cancelled() {
            debug!(
                "Scheduler is shut down, auto-unlock for {} not scheduled",
                selection_id
            );
            return;
        }

        let cancel = self.cancel.clone();
        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        trace!("Auto-unlock for {} cancelled by shutdown", selection_id);
                    }
                    _ = tokio::time::sleep(delay) => {
                        let released = record_ids
                            .iter()
                            .filter(|id| index.expire(id, &selection_id))
                            .count();
                        if released > 0 {
                            debug!(
                                "Auto-unlocked {} of {} records for selection {}",
                                released,
                                record_ids.len(),
                                selection_id
                            );
                        }
                    }
                }
            },
            &self.handle,
        );
    }

    /// Number of timers that have not fired yet
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Drop all pending timers without releasing their records and wait for
    /// the timer tasks to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
