//! Controller Integration Tests for CoilPulse
//!
//! Drives the pulse controller against the simulated coil bank (and a mockall
//! link where exact call counts matter). Timing assertions run on tokio's
//! paused clock.

use async_trait::async_trait;
use mockall::mock;
use mockall::predicate::eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

use coilpulse::controller::{ControllerEvent, PulseController, PulseOutcome};
use coilpulse::error::{ControlError, ErrorKind, LinkError};
use coilpulse::link::memory::WriteRecord;
use coilpulse::link::{CoilLink, MemoryCoilLink};

const ADDRESSES: [u16; 4] = [8192, 8193, 8194, 8195];

mock! {
    pub Link {}

    #[async_trait]
    impl CoilLink for Link {
        async fn read_coil(&self, address: u16) -> Result<bool, LinkError>;
        async fn write_coil(&self, address: u16, value: bool) -> Result<(), LinkError>;
        async fn close(&self) -> Result<(), LinkError>;
        fn is_connected(&self) -> bool;
        fn target(&self) -> String;
    }
}

/// Helper to create a controller over a fresh simulated bank
fn setup() -> (Arc<MemoryCoilLink>, PulseController) {
    let link = Arc::new(MemoryCoilLink::with_coils(&ADDRESSES));
    let controller = PulseController::new(link.clone(), &ADDRESSES).unwrap();
    (link, controller)
}

fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s)
}

/// Collect everything already sitting in the event channel
fn drain(rx: &mut broadcast::Receiver<ControllerEvent>) -> Vec<ControllerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Paused-clock timers fire on millisecond ticks
fn assert_near(actual: Duration, expected: Duration) {
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(
        diff <= Duration::from_millis(10),
        "expected ~{:?}, got {:?}",
        expected,
        actual
    );
}

fn offsets(writes: &[WriteRecord], origin: Instant) -> Vec<(u16, bool, Duration)> {
    writes
        .iter()
        .map(|w| (w.address, w.value, w.at - origin))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_completed_pulse_restores_original_state() {
    let (link, controller) = setup();
    link.set(8194, true);

    for (coil, address) in [(1, 8192), (3, 8194)] {
        let before = link.get(address);
        let handle = controller.pulse(coil, secs(1.5)).unwrap();
        assert!(handle.wait().await.is_completed());

        assert_eq!(link.get(address), before);
        assert_eq!(controller.current_state(coil), Some(before));
    }
}

#[tokio::test(start_paused = true)]
async fn test_completed_pulse_writes_exactly_twice() {
    let (link, controller) = setup();
    let origin = Instant::now();

    let handle = controller.pulse(2, secs(3.0)).unwrap();
    assert!(handle.wait().await.is_completed());

    let writes = offsets(&link.writes(), origin);
    assert_eq!(writes.len(), 2);
    assert_eq!((writes[0].0, writes[0].1), (8193, true));
    assert_eq!((writes[1].0, writes[1].1), (8193, false));
    assert_near(writes[1].2 - writes[0].2, secs(3.0));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_reverts_at_cancel_time() {
    let (link, controller) = setup();
    let origin = Instant::now();

    let handle = controller.pulse(1, secs(10.0)).unwrap();
    tokio::time::sleep(secs(3.0)).await;

    assert!(controller.is_pulsing(1));
    assert!(controller.cancel(1));
    assert!(matches!(handle.wait().await, PulseOutcome::Cancelled));

    let writes = offsets(&link.writes(), origin);
    assert_eq!(writes.len(), 2);
    assert!(writes[0].1);
    assert!(!writes[1].1);
    assert_near(writes[1].2, secs(3.0));

    // The scheduled revert never fires on top of the early one
    tokio::time::sleep(secs(20.0)).await;
    assert_eq!(link.writes().len(), 2);
    assert!(!controller.is_pulsing(1));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_through_handle() {
    let (link, controller) = setup();

    let handle = controller.pulse(4, secs(5.0)).unwrap();
    tokio::time::sleep(secs(1.0)).await;
    handle.cancel();
    tokio::time::sleep(secs(0.1)).await;

    assert!(handle.is_finished());
    assert!(!link.get(8195));
    assert_eq!(link.writes_to(8195).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_busy_pulse_is_rejected_without_writes() {
    let (link, controller) = setup();

    let handle = controller.pulse(1, secs(5.0)).unwrap();
    tokio::time::sleep(secs(1.0)).await;
    let writes_before = link.writes().len();

    let second = controller.pulse(1, secs(1.0));
    assert!(matches!(second, Err(ControlError::Busy(1))));
    assert_eq!(link.writes().len(), writes_before);

    assert!(handle.wait().await.is_completed());
    assert_eq!(link.writes_to(8192).len(), 2);

    // Idle again, so a new pulse is accepted
    let again = controller.pulse(1, secs(1.0)).unwrap();
    assert!(again.wait().await.is_completed());
    assert_eq!(link.writes_to(8192).len(), 4);
}

#[tokio::test]
async fn test_rejected_pulses_never_touch_the_link() {
    let mut mock = MockLink::new();
    mock.expect_target().returning(|| "mock".to_string());
    mock.expect_read_coil().never();
    mock.expect_write_coil().never();

    let controller = PulseController::new(Arc::new(mock), &ADDRESSES).unwrap();

    assert_err!(controller.pulse(1, Duration::ZERO));
    assert_err!(
        controller
            .start_sequence(vec![1, 7], secs(1.0), secs(1.0), false)
            .await
    );
    assert!(matches!(
        controller.pulse(0, secs(1.0)),
        Err(ControlError::UnknownCoil(0))
    ));
    assert!(matches!(
        controller.pulse(5, secs(1.0)),
        Err(ControlError::UnknownCoil(5))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_non_looping_sequence_runs_in_order() {
    let (link, controller) = setup();
    let mut events = controller.subscribe();
    let origin = Instant::now();

    let handle = controller
        .start_sequence(vec![1, 2, 3], secs(2.0), secs(1.0), false)
        .await
        .unwrap();
    handle.wait().await;

    let writes = offsets(&link.writes(), origin);
    let expected = [
        (8192, true, 0.0),
        (8192, false, 2.0),
        (8193, true, 3.0),
        (8193, false, 5.0),
        (8194, true, 6.0),
        (8194, false, 8.0),
    ];
    assert_eq!(writes.len(), expected.len());
    for (actual, (address, value, at)) in writes.iter().zip(expected) {
        assert_eq!((actual.0, actual.1), (address, value));
        assert_near(actual.2, secs(at));
    }

    assert!(!controller.is_sequence_running());

    // Stopped means stopped: nothing else is written
    tokio::time::sleep(secs(30.0)).await;
    assert_eq!(link.writes().len(), 6);

    let events = drain(&mut events);
    assert_eq!(
        events.first(),
        Some(&ControllerEvent::SequenceStateChanged { running: true })
    );
    assert_eq!(
        events.last(),
        Some(&ControllerEvent::SequenceStateChanged { running: false })
    );
}

#[tokio::test(start_paused = true)]
async fn test_looping_sequence_until_stopped() {
    let (link, controller) = setup();

    let handle = controller
        .start_sequence(vec![1, 2], secs(1.0), secs(1.0), true)
        .await
        .unwrap();
    assert!(handle.is_running());

    // Two full cycles plus the first press of the third
    tokio::time::sleep(secs(8.5)).await;
    assert!(controller.is_sequence_running());
    assert!(link.get(8192));

    let before_stop = link.writes().len();
    assert!(controller.stop_sequence().await);
    assert!(!controller.is_sequence_running());
    assert!(!handle.is_running());

    // In-flight press reverted, then both touched coils forced to rest
    let after_stop: Vec<(u16, bool)> = link.writes()[before_stop..]
        .iter()
        .map(|w| (w.address, w.value))
        .collect();
    assert_eq!(after_stop, vec![(8192, false), (8192, false), (8193, false)]);
    assert!(!link.get(8192));
    assert!(!link.get(8193));

    // Coils outside the sequence were never touched
    assert!(link.writes_to(8194).is_empty());

    let total = link.writes().len();
    tokio::time::sleep(secs(30.0)).await;
    assert_eq!(link.writes().len(), total);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_wait_does_not_pulse_next_coil() {
    let (link, controller) = setup();

    controller
        .start_sequence(vec![1, 2, 3], secs(1.0), secs(5.0), true)
        .await
        .unwrap();

    // Coil 1 pressed and released, now in the 5 s wait
    tokio::time::sleep(secs(2.0)).await;
    let started = Instant::now();
    assert!(controller.stop_sequence().await);

    // Stop returns promptly instead of sitting out the wait
    assert!(started.elapsed() < secs(0.1));
    assert!(link.writes_to(8193).is_empty());
    assert!(link.writes_to(8194).is_empty());
}

#[tokio::test]
async fn test_stop_sequence_when_idle() {
    let (link, controller) = setup();

    assert!(!controller.stop_sequence().await);
    assert!(link.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_starting_a_sequence_replaces_the_running_one() {
    let (link, controller) = setup();

    controller
        .start_sequence(vec![1], secs(1.0), secs(1.0), true)
        .await
        .unwrap();
    tokio::time::sleep(secs(0.5)).await;

    let second = controller
        .start_sequence(vec![4], secs(1.0), Duration::ZERO, false)
        .await
        .unwrap();

    // First run was cut short and its coil forced to rest before the second began
    assert!(!link.get(8192));
    second.wait().await;

    let coil4 = link.writes_to(8195);
    assert_eq!(coil4.len(), 2);
    let last_coil1 = link.writes_to(8192).last().cloned().unwrap();
    assert!(last_coil1.at <= coil4[0].at);
    assert!(!controller.is_sequence_running());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_pulses_on_distinct_coils() {
    let (link, controller) = setup();
    let origin = Instant::now();

    let first = controller.pulse(1, secs(4.0)).unwrap();
    let second = controller.pulse(2, secs(4.0)).unwrap();

    let (a, b) = tokio::join!(first.wait(), second.wait());
    assert!(a.is_completed());
    assert!(b.is_completed());

    // Both held side by side rather than one after the other
    assert_near(Instant::now() - origin, secs(4.0));
    for address in [8192, 8193] {
        let writes = offsets(&link.writes_to(address), origin);
        assert_eq!(writes.len(), 2);
        assert_near(writes[0].2, Duration::ZERO);
        assert_near(writes[1].2, secs(4.0));
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_pulses_over_slow_transport() {
    let link = Arc::new(MemoryCoilLink::with_coils(&ADDRESSES).with_latency(secs(0.05)));
    let controller = PulseController::new(link.clone(), &ADDRESSES).unwrap();
    let origin = Instant::now();

    let handles: Vec<_> = (1..=4)
        .map(|coil| controller.pulse(coil, secs(2.0)).unwrap())
        .collect();
    for handle in handles {
        assert!(handle.wait().await.is_completed());
    }

    // Transport latency adds up, hold times do not
    assert!(Instant::now() - origin < secs(2.5));
    assert_eq!(link.writes().len(), 8);
}

#[tokio::test]
async fn test_refresh_all_reads_every_coil_once() {
    let pattern = [true, false, true, true];

    let mut mock = MockLink::new();
    mock.expect_target().returning(|| "mock".to_string());
    for (address, value) in ADDRESSES.iter().zip(pattern) {
        mock.expect_read_coil()
            .with(eq(*address))
            .times(1)
            .returning(move |_| Ok(value));
    }
    mock.expect_write_coil().never();

    let controller = PulseController::new(Arc::new(mock), &ADDRESSES).unwrap();
    let mut events = controller.subscribe();

    let report = controller.refresh_all().await;

    assert!(report.is_ok());
    assert_eq!(
        report.states,
        vec![(1, true), (2, false), (3, true), (4, true)]
    );
    for (i, value) in pattern.iter().enumerate() {
        assert_eq!(controller.current_state(i + 1), Some(*value));
    }
    assert!(drain(&mut events)
        .iter()
        .all(|e| matches!(e, ControllerEvent::CoilStateChanged { .. })));
}

#[tokio::test]
async fn test_refresh_failure_is_reported_not_fatal() {
    let (link, controller) = setup();
    link.fail_reads(8193);
    let mut events = controller.subscribe();

    let report = controller.refresh_all().await;

    assert!(!report.is_ok());
    assert_eq!(report.states.len(), 3);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].coil(), Some(2));
    assert_eq!(controller.current_state(2), None);

    let errors: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, ControllerEvent::Error { .. }))
        .collect();
    assert_eq!(errors.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_revert_failure_raises_fault() {
    let (link, controller) = setup();
    // Flip goes through, revert does not
    link.fail_writes_after(8192, 1);
    let mut events = controller.subscribe();

    let faulty = controller.pulse(1, secs(2.0)).unwrap();
    let healthy = controller.pulse(2, secs(3.0)).unwrap();

    let outcome = faulty.wait().await;
    match outcome {
        PulseOutcome::Failed(ControlError::Fault { coil, address, .. }) => {
            assert_eq!(coil, 1);
            assert_eq!(address, 8192);
        }
        other => panic!("expected fault, got {:?}", other),
    }

    // Coil left energized and reported as such
    assert!(link.get(8192));
    assert_eq!(controller.current_state(1), Some(true));
    assert!(!controller.is_pulsing(1));

    // The other coil carries on unaffected
    assert!(healthy.wait().await.is_completed());
    assert!(!link.get(8193));

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        ControllerEvent::Error {
            coil: Some(1),
            kind: ErrorKind::Fault,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn test_failed_flip_is_io_error_not_fault() {
    let (link, controller) = setup();
    link.fail_writes_after(8192, 0);

    let outcome = controller.pulse(1, secs(1.0)).unwrap().wait().await;

    assert!(matches!(
        outcome,
        PulseOutcome::Failed(ControlError::Io { coil: 1, .. })
    ));
    assert!(link.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_flip_writes_nothing() {
    let link = Arc::new(MemoryCoilLink::with_coils(&ADDRESSES).with_latency(secs(1.0)));
    let controller = PulseController::new(link.clone(), &ADDRESSES).unwrap();

    let handle = controller.pulse(1, secs(5.0)).unwrap();
    // Still waiting on the read of the original state
    tokio::time::sleep(secs(0.5)).await;
    assert!(controller.cancel(1));

    assert!(matches!(handle.wait().await, PulseOutcome::Aborted));
    assert!(link.writes().is_empty());
    assert!(!link.get(8192));
    assert!(!controller.is_pulsing(1));

    // The coil is free again
    let again = controller.pulse(1, secs(1.0)).unwrap();
    assert!(again.wait().await.is_completed());
    assert_eq!(link.writes_to(8192).len(), 2);
}

#[tokio::test]
async fn test_lost_session_reported_as_connection_error() {
    let mut mock = MockLink::new();
    mock.expect_target().returning(|| "mock".to_string());
    mock.expect_is_connected().returning(|| false);
    mock.expect_read_coil()
        .returning(|_| Err(LinkError::connection("10.3.200.10:502", "connection reset")));
    mock.expect_write_coil().never();

    let controller = PulseController::new(Arc::new(mock), &ADDRESSES).unwrap();
    let mut events = controller.subscribe();

    let outcome = controller.pulse(2, secs(1.0)).unwrap().wait().await;
    match outcome {
        PulseOutcome::Failed(err) => assert_eq!(err.kind(), ErrorKind::Connection),
        other => panic!("expected connection error, got {:?}", other),
    }

    let report = controller.refresh_all().await;
    assert_eq!(report.errors.len(), 4);
    assert!(report
        .errors
        .iter()
        .all(|e| e.kind() == ErrorKind::Connection));

    assert!(!controller.is_connected());
    assert!(drain(&mut events).iter().all(|e| matches!(
        e,
        ControllerEvent::Error {
            kind: ErrorKind::Connection,
            ..
        }
    )));
}

#[tokio::test]
async fn test_closed_link_surfaces_connection_error() {
    let (link, controller) = setup();
    link.close().await.unwrap();

    let outcome = controller.pulse(1, secs(1.0)).unwrap().wait().await;

    match outcome {
        PulseOutcome::Failed(err) => assert_eq!(err.kind(), ErrorKind::Connection),
        other => panic!("expected connection error, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_sequence_step_failure_aborts_run() {
    let (link, controller) = setup();
    link.fail_reads(8193);
    let mut events = controller.subscribe();

    let handle = controller
        .start_sequence(vec![1, 2, 3], secs(1.0), secs(1.0), false)
        .await
        .unwrap();
    handle.wait().await;

    assert_eq!(link.writes_to(8192).len(), 2);
    assert!(link.writes_to(8193).is_empty());
    assert!(link.writes_to(8194).is_empty());

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        ControllerEvent::Error {
            coil: Some(2),
            kind: ErrorKind::Io,
            ..
        }
    )));
    assert_eq!(
        events.last(),
        Some(&ControllerEvent::SequenceStateChanged { running: false })
    );
}

#[tokio::test(start_paused = true)]
async fn test_sequence_waits_for_manual_pulse_on_same_coil() {
    let (link, controller) = setup();
    let origin = Instant::now();

    let manual = controller.pulse(1, secs(3.0)).unwrap();
    tokio::time::sleep(secs(0.5)).await;

    let handle = controller
        .start_sequence(vec![1], secs(1.0), Duration::ZERO, false)
        .await
        .unwrap();
    assert!(manual.wait().await.is_completed());
    handle.wait().await;

    let writes = offsets(&link.writes_to(8192), origin);
    assert_eq!(writes.len(), 4);
    assert_eq!(
        writes.iter().map(|w| w.1).collect::<Vec<_>>(),
        vec![true, false, true, false]
    );
    assert_near(writes[2].2, secs(3.0));
    assert_near(writes[3].2, secs(4.0));
}

#[tokio::test(start_paused = true)]
async fn test_manual_pulse_rejected_while_sequence_holds_coil() {
    let (_, controller) = setup();

    controller
        .start_sequence(vec![2], secs(5.0), Duration::ZERO, false)
        .await
        .unwrap();
    tokio::time::sleep(secs(1.0)).await;

    assert!(controller.is_pulsing(2));
    assert!(matches!(
        controller.pulse(2, secs(1.0)),
        Err(ControlError::Busy(2))
    ));

    // Manual and sequence cancellation stay independent
    assert!(controller.pulse(3, secs(1.0)).is_ok());
    controller.cancel(3);
    assert!(controller.is_sequence_running());
}

#[tokio::test(start_paused = true)]
async fn test_all_off_switches_everything_off() {
    let (link, controller) = setup();
    link.set(8195, true);

    let handle = controller.pulse(1, secs(30.0)).unwrap();
    controller
        .start_sequence(vec![2, 3], secs(10.0), secs(1.0), true)
        .await
        .unwrap();
    tokio::time::sleep(secs(1.0)).await;

    assert_ok!(controller.all_off().await);

    assert!(matches!(handle.wait().await, PulseOutcome::Cancelled));
    assert!(!controller.is_sequence_running());
    for (i, address) in ADDRESSES.iter().enumerate() {
        assert!(!link.get(*address));
        assert_eq!(controller.current_state(i + 1), Some(false));
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_reverts_and_closes() {
    let (link, controller) = setup();

    let handle = controller.pulse(1, secs(60.0)).unwrap();
    controller
        .start_sequence(vec![2], secs(60.0), Duration::ZERO, true)
        .await
        .unwrap();
    tokio::time::sleep(secs(1.0)).await;

    let started = Instant::now();
    controller.shutdown().await;

    assert!(started.elapsed() < secs(0.1));
    assert!(matches!(handle.wait().await, PulseOutcome::Cancelled));
    assert!(!link.get(8192));
    assert!(!link.get(8193));
    assert!(!link.is_connected());
    assert!(!controller.is_sequence_running());
}
