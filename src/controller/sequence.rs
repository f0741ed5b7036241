//! Automation sequence: pulse a list of coils in order, optionally looping

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::pulse::PulseOutcome;
use super::{CoilId, Inner};
use crate::error::ControlError;
use crate::metrics;

/// Parameters of one automation session
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceRun {
    pub steps: Vec<CoilId>,
    pub press_duration: Duration,
    pub wait_duration: Duration,
    pub looping: bool,
}

/// How a sequence run ended
#[derive(Debug, Clone)]
pub enum SequenceOutcome {
    /// A non-looping run reached its last step
    Completed,
    /// Stopped on request; touched coils were forced off
    Stopped,
    /// A step failed and the run was abandoned
    Failed(ControlError),
}

impl SequenceOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SequenceOutcome::Completed => "completed",
            SequenceOutcome::Stopped => "stopped",
            SequenceOutcome::Failed(_) => "failed",
        }
    }
}

/// Handle to a running sequence
#[derive(Debug)]
pub struct SequenceHandle {
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

impl SequenceHandle {
    pub(super) fn new(token: CancellationToken, done: watch::Receiver<bool>) -> Self {
        Self { token, done }
    }

    /// Request a stop; observed at the next step boundary or wait
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !*self.done.borrow()
    }

    /// Wait until the run has ended, including any rest cleanup
    pub async fn wait(mut self) {
        let _ = self.done.wait_for(|done| *done).await;
    }
}

impl Inner {
    pub(super) async fn run_sequence(
        &self,
        run: &SequenceRun,
        token: &CancellationToken,
    ) -> SequenceOutcome {
        let mut touched = Vec::new();
        let outcome = self.drive_sequence(run, token, &mut touched).await;

        if let SequenceOutcome::Stopped = outcome {
            self.force_rest(&touched).await;
        }
        outcome
    }

    async fn drive_sequence(
        &self,
        run: &SequenceRun,
        token: &CancellationToken,
        touched: &mut Vec<usize>,
    ) -> SequenceOutcome {
        let mut cycle: u64 = 0;

        loop {
            cycle += 1;
            debug!("Sequence cycle {}", cycle);

            for (position, &coil) in run.steps.iter().enumerate() {
                if token.is_cancelled() {
                    return SequenceOutcome::Stopped;
                }

                let index = coil - 1;
                let slot = &self.slots[index];

                // A manual pulse on this coil finishes before the step starts
                let guard = tokio::select! {
                    guard = Arc::clone(&slot.lock).lock_owned() => guard,
                    _ = token.cancelled() => return SequenceOutcome::Stopped,
                };

                let step_token = token.child_token();
                slot.begin_job(run.press_duration, step_token.clone());
                if !touched.contains(&index) {
                    touched.push(index);
                }

                debug!("Sequence step {}: coil {}", position + 1, coil);
                metrics::record_sequence_step(coil);

                let outcome = self.run_pulse(index, run.press_duration, &step_token).await;
                slot.end_job();
                drop(guard);

                if let PulseOutcome::Failed(err) = outcome {
                    error!("Sequence aborted at step {}", position + 1);
                    self.report(&err);
                    return SequenceOutcome::Failed(err);
                }

                if token.is_cancelled() {
                    return SequenceOutcome::Stopped;
                }

                let last_step = position + 1 == run.steps.len();
                if !run.wait_duration.is_zero() && (run.looping || !last_step) {
                    tokio::select! {
                        _ = tokio::time::sleep(run.wait_duration) => {}
                        _ = token.cancelled() => return SequenceOutcome::Stopped,
                    }
                }
            }

            if !run.looping {
                return SequenceOutcome::Completed;
            }
        }
    }

    /// Drive the given coils to their rest (off) state
    ///
    /// Coils currently held by a manual pulse are skipped; that pulse
    /// restores them itself.
    async fn force_rest(&self, indices: &[usize]) {
        for &index in indices {
            let coil = self.coils[index].id;
            let Ok(_guard) = self.slots[index].lock.try_lock() else {
                debug!("Coil {} held by a manual pulse, skipping rest", coil);
                continue;
            };

            if let Err(err) = self.write_state(index, false).await {
                self.report(&err);
            }
        }
    }
}
