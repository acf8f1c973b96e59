//! End-to-end occupancy scenarios through the session manager
//!
//! Time is paused: every sleep advances the tokio clock instantly, so the
//! 120 s motion timeout and the startup guard run in virtual time.

use motion_shim::domain::types::{
    DeviceId, DiagnosticKind, DiagnosticLevel, EventKind, RawZoneStatus, SensorEvent,
};
use motion_shim::infra::{Metrics, Timings};
use motion_shim::services::{Occupancy, RecordingSink, SessionManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn zone(device: &DeviceId, bits: i64) -> SensorEvent {
    SensorEvent::new(device.clone(), EventKind::ZoneStatus(RawZoneStatus::Integer(bits)))
}

fn start(device: &DeviceId, restored: Option<bool>) -> SensorEvent {
    SensorEvent::new(device.clone(), EventKind::SessionStart { restored_occupancy: restored })
}

fn setup() -> (SessionManager, Arc<RecordingSink>, Arc<Metrics>) {
    let sink = Arc::new(RecordingSink::new());
    let metrics = Arc::new(Metrics::new());
    let manager = SessionManager::new(Timings::default(), sink.clone(), metrics.clone());
    (manager, sink, metrics)
}

#[tokio::test(start_paused = true)]
async fn test_guaranteed_clear_after_motion_timeout() {
    let (mut manager, sink, metrics) = setup();
    let hall = DeviceId::new("hall");

    manager.dispatch(start(&hall, None)).await;
    manager.dispatch(zone(&hall, 1)).await;
    sleep(secs(3)).await;
    // Fast cycle: ignored, the timer governs
    manager.dispatch(zone(&hall, 0)).await;

    sleep(secs(116)).await;
    assert_eq!(sink.occupancy_updates(&hall), vec![true]);

    sleep(secs(2)).await;
    assert_eq!(sink.occupancy_updates(&hall), vec![true, false]);
    assert_eq!(metrics.clear_timers_fired(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_clear_rearms_timer() {
    let (mut manager, sink, _) = setup();
    let hall = DeviceId::new("hall");
    let t0 = Instant::now();

    manager.dispatch(start(&hall, None)).await;
    manager.dispatch(zone(&hall, 1)).await;
    sleep(secs(45)).await;
    manager.dispatch(zone(&hall, 0)).await;

    let snap = manager.snapshot(&hall).await.unwrap();
    assert_eq!(snap.occupancy.clear_at, Some(t0 + secs(165)));
    assert_eq!(snap.occupancy.motion_event_count, 2);
    assert_eq!(snap.occupancy.clear_event_count, 1);

    // Still occupied past the original deadline
    sleep(secs(80)).await;
    assert_eq!(sink.occupancy_updates(&hall), vec![true]);

    sleep(secs(45)).await;
    assert_eq!(sink.occupancy_updates(&hall), vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn test_clear_without_prior_motion_is_motion() {
    let (mut manager, sink, _) = setup();
    let hall = DeviceId::new("hall");
    let t0 = Instant::now();

    manager.dispatch(start(&hall, None)).await;
    sleep(secs(10)).await;
    manager.dispatch(zone(&hall, 0)).await;

    let snap = manager.snapshot(&hall).await.unwrap();
    assert_eq!(snap.occupancy.occupancy, Occupancy::Occupied);
    assert_eq!(snap.occupancy.clear_at, Some(t0 + secs(130)));
    // Startup guard already forced a clear at t=5, then the reset turned it on
    assert_eq!(sink.occupancy_updates(&hall), vec![false, true]);
}

#[tokio::test(start_paused = true)]
async fn test_startup_override_of_restored_occupancy() {
    let (mut manager, sink, metrics) = setup();
    let hall = DeviceId::new("hall");

    manager.dispatch(start(&hall, Some(true))).await;
    let snap = manager.snapshot(&hall).await.unwrap();
    assert_eq!(snap.occupancy.occupancy, Occupancy::Occupied);
    assert!(snap.occupancy.startup_guard_active);

    sleep(secs(6)).await;
    let snap = manager.snapshot(&hall).await.unwrap();
    assert_eq!(snap.occupancy.occupancy, Occupancy::Clear);
    assert!(!snap.occupancy.startup_guard_active);
    assert_eq!(sink.occupancy_updates(&hall), vec![false]);
    assert_eq!(metrics.report().startup_clears_forced, 1);
}

#[tokio::test(start_paused = true)]
async fn test_motion_before_startup_guard_cancels_it() {
    let (mut manager, sink, _) = setup();
    let hall = DeviceId::new("hall");
    let t0 = Instant::now();

    manager.dispatch(start(&hall, Some(true))).await;
    sleep(secs(2)).await;
    manager.dispatch(zone(&hall, 1)).await;

    sleep(secs(10)).await;
    let snap = manager.snapshot(&hall).await.unwrap();
    assert_eq!(snap.occupancy.occupancy, Occupancy::Occupied);
    assert_eq!(snap.occupancy.clear_at, Some(t0 + secs(122)));
    assert!(!snap.occupancy.startup_guard_active);
    // Restored occupancy was already on: no transition to publish
    assert!(sink.occupancy_updates(&hall).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_silent_device_warning_once_per_window() {
    let (mut manager, sink, _) = setup();
    let hall = DeviceId::new("hall");

    manager.dispatch(start(&hall, None)).await;
    // Health ticks every 300 s; silence threshold 3600 s
    sleep(secs(3600 + 900)).await;
    assert_eq!(
        sink.diagnostic_count(&hall, DiagnosticLevel::Warning, DiagnosticKind::SilentDevice),
        1
    );

    manager.dispatch(SensorEvent::new(hall.clone(), EventKind::CheckIn)).await;
    sleep(secs(301)).await;
    assert_eq!(
        sink.diagnostic_count(&hall, DiagnosticLevel::Info, DiagnosticKind::SilentDevice),
        1
    );
    // Silence never touches occupancy beyond the startup clear
    assert_eq!(sink.occupancy_updates(&hall), vec![false]);
}

#[tokio::test(start_paused = true)]
async fn test_run_until_shutdown_ends_sessions() {
    let (mut manager, sink, metrics) = setup();
    let hall = DeviceId::new("hall");
    let attic = DeviceId::new("attic");
    let (event_tx, event_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = tokio::spawn(async move {
        manager.run(event_rx, shutdown_rx).await;
        manager
    });

    event_tx.send(zone(&hall, 1)).await.unwrap();
    event_tx.send(zone(&attic, 1)).await.unwrap();
    sleep(secs(1)).await;
    shutdown_tx.send(true).unwrap();

    let manager = runner.await.unwrap();
    assert_eq!(manager.session_count(), 0);
    assert_eq!(sink.occupancy_updates(&hall), vec![true]);
    assert_eq!(sink.occupancy_updates(&attic), vec![true]);
    assert_eq!(
        sink.diagnostic_count(&hall, DiagnosticLevel::Info, DiagnosticKind::MotionCounts),
        1
    );

    let summary = metrics.report();
    assert_eq!(summary.sessions_started, 2);
    assert_eq!(summary.sessions_ended, 2);
    assert_eq!(summary.active_sessions, 0);
}
