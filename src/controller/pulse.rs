//! Single-coil pulse: read, flip, hold, revert

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{CoilId, Inner};
use crate::error::ControlError;
use crate::metrics;

/// How a pulse ended
#[derive(Debug, Clone)]
pub enum PulseOutcome {
    /// Held for the full duration, then reverted
    Completed,
    /// Reverted early on request
    Cancelled,
    /// Cancelled before the flip; nothing was written
    Aborted,
    Failed(ControlError),
}

impl PulseOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PulseOutcome::Completed => "completed",
            PulseOutcome::Cancelled => "cancelled",
            PulseOutcome::Aborted => "aborted",
            PulseOutcome::Failed(_) => "failed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, PulseOutcome::Completed)
    }
}

/// Handle to a scheduled pulse
///
/// Dropping the handle does not cancel the pulse.
#[derive(Debug)]
pub struct PulseHandle {
    coil: CoilId,
    cancel: CancellationToken,
    task: JoinHandle<PulseOutcome>,
}

impl PulseHandle {
    pub(super) fn new(coil: CoilId, cancel: CancellationToken, task: JoinHandle<PulseOutcome>) -> Self {
        Self { coil, cancel, task }
    }

    pub fn coil(&self) -> CoilId {
        self.coil
    }

    /// Request an early revert
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the revert (or failure) and return the outcome
    pub async fn wait(self) -> PulseOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => PulseOutcome::Failed(ControlError::Task(e.to_string())),
        }
    }
}

impl Inner {
    /// Flip the coil, hold until `duration` after start or cancellation, revert
    ///
    /// The caller holds the coil's exclusivity lock. Once the flip has been
    /// written the revert is always attempted, so a pulse never writes more
    /// than twice.
    pub(super) async fn run_pulse(
        &self,
        index: usize,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> PulseOutcome {
        let coil = &self.coils[index];
        let started_at = Instant::now();

        if cancel.is_cancelled() {
            return PulseOutcome::Aborted;
        }

        let original = match self.link.read_coil(coil.address).await {
            Ok(value) => value,
            Err(e) => return PulseOutcome::Failed(ControlError::from_link(coil.id, e)),
        };
        self.cache(index, original);

        if cancel.is_cancelled() {
            debug!("Pulse on coil {} cancelled before flip", coil.id);
            return PulseOutcome::Aborted;
        }

        if let Err(err) = self.write_state(index, !original).await {
            return PulseOutcome::Failed(err);
        }
        debug!("Coil {} flipped to {}", coil.id, !original);

        let cancelled = tokio::select! {
            _ = tokio::time::sleep_until(started_at + duration) => false,
            _ = cancel.cancelled() => true,
        };

        match self.write_coil(index, original).await {
            Ok(()) => {
                self.set_state(index, original);
                if cancelled {
                    PulseOutcome::Cancelled
                } else {
                    PulseOutcome::Completed
                }
            }
            Err(e) => {
                metrics::record_fault(coil.id);
                PulseOutcome::Failed(ControlError::Fault {
                    coil: coil.id,
                    address: coil.address,
                    reason: e.to_string(),
                })
            }
        }
    }
}
