//! Coil pulse & sequence controller
//!
//! Owns the run/stop state for manual pulses and for the automation sequence.
//! Every pulse and every sequence run executes on its own tokio task; the
//! public surface is safe to call concurrently from any task.
//!
//! Per coil: `Idle -> Pulsing -> Idle`. A coil is `Pulsing` while its
//! exclusivity lock is held, which is what bounds every pulse to exactly one
//! flip and one revert.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{ControlError, LinkError};
use crate::input;
use crate::link::CoilLink;
use crate::metrics::{self, PulseMetrics};

pub mod event;
pub mod pulse;
pub mod sequence;

pub use event::ControllerEvent;
pub use pulse::{PulseHandle, PulseOutcome};
pub use sequence::{SequenceHandle, SequenceOutcome, SequenceRun};

/// 1-based logical coil id, in panel display order
pub type CoilId = usize;

const EVENT_CAPACITY: usize = 256;

/// One addressable boolean output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Coil {
    pub id: CoilId,
    pub address: u16,
}

/// Point-in-time view of a coil for rendering
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoilSnapshot {
    pub id: CoilId,
    pub address: u16,
    /// Last read or written value; `None` until first observed
    pub state: Option<bool>,
    pub pulsing: bool,
    /// Time left before the scheduled revert, if pulsing
    pub remaining_ms: Option<u64>,
}

/// Result of [`PulseController::refresh_all`]
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    pub states: Vec<(CoilId, bool)>,
    pub errors: Vec<ControlError>,
}

impl RefreshReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// An in-flight pulse, manual or sequence step
struct PulseJob {
    duration: Duration,
    started_at: Instant,
    cancel: CancellationToken,
}

struct CoilSlot {
    /// Held for the whole flip..revert window
    lock: Arc<AsyncMutex<()>>,
    state: Mutex<Option<bool>>,
    job: Mutex<Option<PulseJob>>,
}

impl CoilSlot {
    fn new() -> Self {
        Self {
            lock: Arc::new(AsyncMutex::new(())),
            state: Mutex::new(None),
            job: Mutex::new(None),
        }
    }

    fn begin_job(&self, duration: Duration, cancel: CancellationToken) {
        *self.job.lock() = Some(PulseJob {
            duration,
            started_at: Instant::now(),
            cancel,
        });
    }

    fn end_job(&self) {
        *self.job.lock() = None;
    }
}

struct ActiveSequence {
    token: CancellationToken,
    task: JoinHandle<SequenceOutcome>,
}

impl ActiveSequence {
    async fn stop(self) {
        self.token.cancel();
        match self.task.await {
            Ok(outcome) => debug!("Sequence ended: {:?}", outcome),
            Err(e) => error!("Sequence task failed: {}", e),
        }
    }
}

struct Inner {
    link: Arc<dyn CoilLink>,
    coils: Vec<Coil>,
    slots: Vec<CoilSlot>,
    events: broadcast::Sender<ControllerEvent>,
    sequence: AsyncMutex<Option<ActiveSequence>>,
    sequence_running: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Inner {
    fn emit(&self, event: ControllerEvent) {
        debug!("Controller event: {:?}", event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn report(&self, err: &ControlError) {
        match err {
            ControlError::Fault { .. } => error!("FAULT: {}", err),
            ControlError::Connection(_) => {
                error!("{}", err);
                metrics::record_link_status(self.link.is_connected());
            }
            _ => error!("{}", err),
        }
        self.emit(ControllerEvent::error(err));
    }

    /// Update the cache without notifying
    fn cache(&self, index: usize, value: bool) {
        *self.slots[index].state.lock() = Some(value);
    }

    /// Update the cache and notify observers
    fn set_state(&self, index: usize, value: bool) {
        self.cache(index, value);
        self.emit(ControllerEvent::CoilStateChanged {
            coil: self.coils[index].id,
            state: value,
        });
    }

    async fn write_coil(&self, index: usize, value: bool) -> Result<(), LinkError> {
        let coil = &self.coils[index];
        let result = self.link.write_coil(coil.address, value).await;
        metrics::record_coil_write(coil.id, result.is_ok());
        result
    }

    /// Write, then cache and notify on success
    async fn write_state(&self, index: usize, value: bool) -> Result<(), ControlError> {
        let coil_id = self.coils[index].id;
        self.write_coil(index, value)
            .await
            .map_err(|e| ControlError::from_link(coil_id, e))?;
        self.set_state(index, value);
        Ok(())
    }
}

/// Thread-safe handle to the controller; clones share state
#[derive(Clone)]
pub struct PulseController {
    inner: Arc<Inner>,
}

impl PulseController {
    /// Build a controller over `link` with one coil per address, ids `1..=N`
    pub fn new(link: Arc<dyn CoilLink>, addresses: &[u16]) -> Result<Self, ControlError> {
        input::validate_addresses(addresses)?;

        let coils: Vec<Coil> = addresses
            .iter()
            .enumerate()
            .map(|(i, &address)| Coil { id: i + 1, address })
            .collect();
        let slots = coils.iter().map(|_| CoilSlot::new()).collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            "Pulse controller ready: {} coils on {}",
            coils.len(),
            link.target()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                link,
                coils,
                slots,
                events,
                sequence: AsyncMutex::new(None),
                sequence_running: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        })
    }

    pub fn coils(&self) -> &[Coil] {
        &self.inner.coils
    }

    pub fn coil(&self, coil: CoilId) -> Result<&Coil, ControlError> {
        let index = self.index_of(coil)?;
        Ok(&self.inner.coils[index])
    }

    /// Subscribe to state-change and error notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.shutdown.is_cancelled() && self.inner.link.is_connected()
    }

    fn index_of(&self, coil: CoilId) -> Result<usize, ControlError> {
        if coil == 0 || coil > self.inner.coils.len() {
            return Err(ControlError::UnknownCoil(coil));
        }
        Ok(coil - 1)
    }

    fn ensure_open(&self) -> Result<(), ControlError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ControlError::Connection(LinkError::Closed));
        }
        Ok(())
    }

    /// Flip `coil`, hold it for `duration`, then restore its original state
    ///
    /// Returns once the pulse is scheduled; the flip and revert happen on a
    /// background task. A coil that is already pulsing is rejected with
    /// [`ControlError::Busy`] and left untouched.
    pub fn pulse(&self, coil: CoilId, duration: Duration) -> Result<PulseHandle, ControlError> {
        let index = self.index_of(coil)?;
        if duration.is_zero() {
            return Err(ControlError::validation("pulse duration must be positive"));
        }
        self.ensure_open()?;

        let slot = &self.inner.slots[index];
        let guard = Arc::clone(&slot.lock).try_lock_owned().map_err(|_| {
            warn!("Pulse on coil {} rejected: already pulsing", coil);
            metrics::record_busy_rejection(coil);
            ControlError::Busy(coil)
        })?;

        let cancel = self.inner.shutdown.child_token();
        slot.begin_job(duration, cancel.clone());

        info!("Pulsing coil {} for {:?}", coil, duration);

        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let task = self.inner.tasks.spawn(async move {
            let pulse_metrics = PulseMetrics::start(coil);
            let outcome = inner.run_pulse(index, duration, &token).await;
            inner.slots[index].end_job();
            drop(guard);

            pulse_metrics.finish(outcome.label());
            match &outcome {
                PulseOutcome::Failed(err) => inner.report(err),
                other => info!("Pulse on coil {} {}", coil, other.label()),
            }
            outcome
        });

        Ok(PulseHandle::new(coil, cancel, task))
    }

    /// Cut the pulse on `coil` short; the revert happens immediately
    ///
    /// Returns false when nothing was pulsing.
    pub fn cancel(&self, coil: CoilId) -> bool {
        let Ok(index) = self.index_of(coil) else {
            return false;
        };

        match self.inner.slots[index].job.lock().as_ref() {
            Some(job) => {
                info!("Cancelling pulse on coil {}", coil);
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight pulse; returns how many were signalled
    pub fn cancel_all(&self) -> usize {
        self.inner
            .coils
            .iter()
            .filter(|c| self.cancel(c.id))
            .count()
    }

    pub fn is_pulsing(&self, coil: CoilId) -> bool {
        self.index_of(coil)
            .map(|index| self.inner.slots[index].job.lock().is_some())
            .unwrap_or(false)
    }

    /// Cached state; `None` until the coil has been read or written
    pub fn current_state(&self, coil: CoilId) -> Option<bool> {
        let index = self.index_of(coil).ok()?;
        *self.inner.slots[index].state.lock()
    }

    pub fn snapshot(&self) -> Vec<CoilSnapshot> {
        let now = Instant::now();
        self.inner
            .coils
            .iter()
            .zip(&self.inner.slots)
            .map(|(coil, slot)| {
                let job = slot.job.lock();
                let remaining_ms = job.as_ref().map(|job| {
                    let deadline = job.started_at + job.duration;
                    deadline.saturating_duration_since(now).as_millis() as u64
                });
                CoilSnapshot {
                    id: coil.id,
                    address: coil.address,
                    state: *slot.state.lock(),
                    pulsing: job.is_some(),
                    remaining_ms,
                }
            })
            .collect()
    }

    /// Read one coil from the device and update the cache
    pub async fn refresh(&self, coil: CoilId) -> Result<bool, ControlError> {
        let index = self.index_of(coil)?;
        let address = self.inner.coils[index].address;

        match self.inner.link.read_coil(address).await {
            Ok(value) => {
                self.inner.set_state(index, value);
                Ok(value)
            }
            Err(e) => {
                let err = ControlError::from_link(coil, e);
                self.inner.report(&err);
                Err(err)
            }
        }
    }

    /// Read every coil once; failures are reported and collected, not fatal
    pub async fn refresh_all(&self) -> RefreshReport {
        let mut report = RefreshReport::default();

        for coil in &self.inner.coils {
            match self.refresh(coil.id).await {
                Ok(state) => report.states.push((coil.id, state)),
                Err(err) => report.errors.push(err),
            }
        }

        report
    }

    /// Run `steps` in order, pulsing each for `press_duration` and pausing
    /// `wait_duration` between steps
    ///
    /// A sequence already running is stopped (with its rest cleanup) first.
    pub async fn start_sequence(
        &self,
        steps: Vec<CoilId>,
        press_duration: Duration,
        wait_duration: Duration,
        looping: bool,
    ) -> Result<SequenceHandle, ControlError> {
        input::validate_sequence(&steps, self.inner.coils.len())?;
        if press_duration.is_zero() {
            return Err(ControlError::validation("press duration must be positive"));
        }
        self.ensure_open()?;

        let mut active = self.inner.sequence.lock().await;
        if let Some(previous) = active.take() {
            info!("Stopping running sequence before starting a new one");
            previous.stop().await;
        }

        let run = SequenceRun {
            steps,
            press_duration,
            wait_duration,
            looping,
        };
        info!(
            "Starting sequence {:?} (press {:?}, wait {:?}, loop {})",
            run.steps, run.press_duration, run.wait_duration, run.looping
        );

        let token = self.inner.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(false);

        self.inner.sequence_running.store(true, Ordering::SeqCst);
        metrics::record_sequence_running(true);
        self.inner
            .emit(ControllerEvent::SequenceStateChanged { running: true });

        let inner = Arc::clone(&self.inner);
        let run_token = token.clone();
        let task = self.inner.tasks.spawn(async move {
            let outcome = inner.run_sequence(&run, &run_token).await;
            info!("Sequence {}", outcome.label());

            inner.sequence_running.store(false, Ordering::SeqCst);
            metrics::record_sequence_running(false);
            inner.emit(ControllerEvent::SequenceStateChanged { running: false });
            let _ = done_tx.send(true);
            outcome
        });

        *active = Some(ActiveSequence {
            token: token.clone(),
            task,
        });

        Ok(SequenceHandle::new(token, done_rx))
    }

    /// Stop the sequence and wait for its rest cleanup to finish
    ///
    /// Returns false when no sequence was running.
    pub async fn stop_sequence(&self) -> bool {
        let was_running = self.inner.sequence_running.load(Ordering::SeqCst);
        let active = self.inner.sequence.lock().await.take();

        match active {
            Some(active) => {
                if was_running {
                    info!("Stopping sequence");
                }
                active.stop().await;
                was_running
            }
            None => false,
        }
    }

    pub fn is_sequence_running(&self) -> bool {
        self.inner.sequence_running.load(Ordering::SeqCst)
    }

    /// Cancel all pulses, stop the sequence and switch every coil off
    pub async fn all_off(&self) -> Result<(), ControlError> {
        info!("Switching all coils off");
        self.cancel_all();
        self.stop_sequence().await;

        let mut first_error = None;
        for index in 0..self.inner.coils.len() {
            // Waits for a cancelled pulse to finish its revert
            let _guard = self.inner.slots[index].lock.lock().await;
            if let Err(err) = self.inner.write_state(index, false).await {
                self.inner.report(&err);
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Revert every pulse, stop the sequence, wait for background tasks and
    /// close the link
    pub async fn shutdown(&self) {
        info!("Shutting down pulse controller");
        self.inner.shutdown.cancel();
        self.stop_sequence().await;

        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        if let Err(e) = self.inner.link.close().await {
            warn!("Failed to close link: {}", e);
        }
        metrics::record_link_status(false);
    }
}
