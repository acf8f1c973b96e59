//! Per-device session actor
//!
//! One task per paired sensor. The task owns every piece of session state
//! and serializes all transitions (events, the clear timer, the startup
//! guard and health ticks) through a single select loop, so no locking is
//! needed and a replaced deadline can never fire.

use crate::domain::types::{
    battery_percentage, DeviceId, DiagnosticKind, DiagnosticLevel, EventKind, SensorEvent,
};
use crate::domain::zone_status::{self, ZoneStatus, ZoneStatusDecode};
use crate::infra::config::Timings;
use crate::infra::metrics::{DeviceGauge, Metrics};
use crate::services::health::{HealthEdge, HealthMonitor};
use crate::services::occupancy::{ClearDisposition, MotionAccepted, OccupancyMachine, OccupancySnapshot};
use crate::services::poll_control::PollControl;
use crate::services::sink::SignalSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Input to a session task
#[derive(Debug)]
pub enum SessionInput {
    Event(SensorEvent),
    /// Request a point-in-time view of the session
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub device: DeviceId,
    pub occupancy: OccupancySnapshot,
    pub last_comm_at: Instant,
    pub poll_applied: Option<u32>,
    pub poll_failures: u64,
}

pub struct DeviceSession {
    device: DeviceId,
    machine: OccupancyMachine,
    health: HealthMonitor,
    health_interval: Duration,
    poll: PollControl,
    /// Flags from the last valid zone status, for edge detection
    flags: ZoneStatus,
    last_comm_at: Instant,
    sink: Arc<dyn SignalSink>,
    metrics: Arc<Metrics>,
}

impl DeviceSession {
    /// Create a session and run its start-up actions
    ///
    /// Arms the startup guard and pushes the check-in interval.
    pub fn start(
        device: DeviceId,
        timings: &Timings,
        restored_occupancy: Option<bool>,
        sink: Arc<dyn SignalSink>,
        metrics: Arc<Metrics>,
        now: Instant,
    ) -> Self {
        let mut session = Self {
            machine: OccupancyMachine::new(now, timings, restored_occupancy),
            health: HealthMonitor::new(
                timings.stuck_warning_threshold,
                timings.silent_device_threshold,
            ),
            health_interval: timings.health_interval,
            poll: PollControl::new(timings.checkin_interval_qs),
            flags: ZoneStatus::default(),
            last_comm_at: now,
            device,
            sink,
            metrics,
        };

        info!(
            device = %session.device,
            restored_occupancy = ?restored_occupancy,
            motion_timeout_s = %timings.motion_timeout.as_secs(),
            startup_guard_s = %timings.startup_guard_delay.as_secs(),
            "session_started"
        );

        session.poll.push(session.sink.as_ref(), &session.device, &session.metrics);
        session.publish_gauge();
        session
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Run until every sender for `rx` is dropped
    pub async fn run(mut self, mut rx: mpsc::Receiver<SessionInput>) {
        let mut health_tick =
            interval_at(Instant::now() + self.health_interval, self.health_interval);
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let clear_at = self.machine.clear_deadline();
            let guard_at = self.machine.startup_deadline();

            tokio::select! {
                // Queued events first: motion received before a deadline must
                // be able to replace it.
                biased;

                input = rx.recv() => match input {
                    Some(SessionInput::Event(event)) => {
                        let started = std::time::Instant::now();
                        self.handle_event(&event);
                        let latency_us =
                            u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
                        self.metrics.record_event_processed(latency_us);
                    }
                    Some(SessionInput::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    None => break,
                },
                _ = sleep_until_opt(clear_at) => self.on_clear_timer(Instant::now()),
                _ = sleep_until_opt(guard_at) => self.on_startup_guard(Instant::now()),
                _ = health_tick.tick() => self.on_health_tick(Instant::now()),
            }
        }

        self.finish();
    }

    /// Apply one inbound event
    ///
    /// Deadlines already due at the event's receive time fire first, so a
    /// late wakeup can never let new motion swallow a pending clear.
    pub fn handle_event(&mut self, event: &SensorEvent) {
        let now = event.received_at;
        self.on_startup_guard(now);
        self.on_clear_timer(now);
        self.last_comm_at = now;

        match &event.kind {
            EventKind::ZoneStatus(raw) => {
                let decoded = zone_status::decode(raw);
                self.metrics.record_zone_status(decoded.is_malformed());
                match decoded {
                    ZoneStatusDecode::Valid(status) => self.on_zone_status(status, now),
                    ZoneStatusDecode::Malformed(reason) => {
                        warn!(device = %self.device, reason = %reason, "zone_status_malformed");
                        self.sink.log_diagnostic(
                            &self.device,
                            DiagnosticLevel::Warning,
                            DiagnosticKind::MalformedZoneStatus,
                            &format!("ignored malformed zone status: {reason}"),
                        );
                        self.sink.set_motion_zone_state(&self.device, false);
                    }
                }
            }
            EventKind::CheckIn => {
                self.metrics.record_check_in();
                debug!(device = %self.device, "check_in");
            }
            EventKind::BatteryVoltage(volts) => {
                let percent = battery_percentage(*volts);
                debug!(device = %self.device, volts = %volts, percent = %percent, "battery_report");
                self.sink.set_battery_percentage(&self.device, percent);
            }
            EventKind::Reconfigure => {
                info!(device = %self.device, "reconfigure_requested");
                self.poll.push(self.sink.as_ref(), &self.device, &self.metrics);
            }
            // Lifecycle events are consumed by the session manager
            EventKind::SessionStart { .. } | EventKind::SessionEnd => {
                debug!(device = %self.device, kind = %event.kind.as_str(), "lifecycle_event_ignored");
            }
        }

        self.publish_gauge();
    }

    fn on_zone_status(&mut self, status: ZoneStatus, now: Instant) {
        debug!(
            device = %self.device,
            raw = %format!("0x{:04x}", status.raw),
            motion = %status.motion,
            "zone_status"
        );
        self.sink.set_motion_zone_state(&self.device, status.motion);
        self.update_flags(status);

        if status.motion {
            let accepted = self.machine.accept_motion(now);
            self.on_motion_accepted(accepted);
            return;
        }

        let handled = self.machine.hardware_clear(now);
        self.metrics.record_clear(handled.motion.is_some());
        match handled.disposition {
            ClearDisposition::FastCycle { elapsed } => {
                debug!(
                    device = %self.device,
                    elapsed_ms = %elapsed.as_millis(),
                    "clear_ignored_fast_cycle"
                );
            }
            disposition => {
                let elapsed_s = match disposition {
                    ClearDisposition::StuckReset { elapsed: Some(elapsed) } => {
                        format!("{:.1}", elapsed.as_secs_f64())
                    }
                    _ => "-".to_string(),
                };
                info!(
                    device = %self.device,
                    disposition = %disposition.as_str(),
                    elapsed_s = %elapsed_s,
                    "clear_reclassified_as_motion"
                );
            }
        }
        if let Some(accepted) = handled.motion {
            self.on_motion_accepted(accepted);
        }
    }

    fn on_motion_accepted(&mut self, accepted: MotionAccepted) {
        self.metrics.record_motion_accepted();
        if accepted.guard_cancelled {
            self.metrics.record_startup_guard_cancelled();
            info!(device = %self.device, "startup_guard_cancelled");
        }
        if accepted.became_occupied {
            info!(device = %self.device, "occupancy_on");
            self.sink.set_occupancy(&self.device, true);
        }
        debug!(
            device = %self.device,
            motion_events = %self.machine.motion_event_count(),
            clear_in_s = %self.machine.motion_timeout().as_secs(),
            "clear_timer_armed"
        );
    }

    /// Raise on the rising edge of each trouble flag, note when it clears
    fn update_flags(&mut self, status: ZoneStatus) {
        let edges = [
            (self.flags.tamper, status.tamper, DiagnosticKind::Tamper, "tamper"),
            (self.flags.low_battery, status.low_battery, DiagnosticKind::LowBattery, "battery low"),
            (
                self.flags.supervision_failure,
                status.supervision_failure,
                DiagnosticKind::SupervisionFailure,
                "supervision failure",
            ),
        ];
        for (was, is, kind, label) in edges {
            match (was, is) {
                (false, true) => {
                    warn!(device = %self.device, kind = %kind.as_str(), "device_warning");
                    self.metrics.record_warning(kind);
                    self.sink.log_diagnostic(
                        &self.device,
                        DiagnosticLevel::Warning,
                        kind,
                        &format!("{label} reported"),
                    );
                }
                (true, false) => {
                    info!(device = %self.device, kind = %kind.as_str(), "device_warning_cleared");
                    self.sink.log_diagnostic(
                        &self.device,
                        DiagnosticLevel::Info,
                        kind,
                        &format!("{label} cleared"),
                    );
                }
                _ => {}
            }
        }
        self.flags = status;
    }

    fn on_clear_timer(&mut self, now: Instant) {
        if !self.machine.fire_clear_timer(now) {
            return;
        }
        self.metrics.record_clear_timer_fired();
        info!(device = %self.device, "occupancy_off_timeout");
        self.sink.set_occupancy(&self.device, false);
        self.publish_gauge();
    }

    fn on_startup_guard(&mut self, now: Instant) {
        if !self.machine.fire_startup_guard(now) {
            return;
        }
        self.metrics.record_startup_clear_forced();
        info!(device = %self.device, "startup_clear_forced");
        // Always re-emit: the host may be showing a restored "occupied"
        self.sink.set_occupancy(&self.device, false);
        self.publish_gauge();
    }

    fn on_health_tick(&mut self, now: Instant) {
        let check = self.health.evaluate(
            self.machine.occupancy().is_occupied(),
            self.machine.last_motion_at(),
            self.last_comm_at,
            now,
        );
        if check.is_empty() {
            return;
        }
        if let Some(edge) = check.stuck {
            self.report_health(edge, DiagnosticKind::StuckOccupancy, "occupied without new motion");
        }
        if let Some(edge) = check.silent {
            self.report_health(edge, DiagnosticKind::SilentDevice, "no communication");
        }
    }

    fn report_health(&mut self, edge: HealthEdge, kind: DiagnosticKind, label: &str) {
        match edge {
            HealthEdge::Raised(elapsed) => {
                warn!(
                    device = %self.device,
                    kind = %kind.as_str(),
                    elapsed_s = %elapsed.as_secs(),
                    "health_warning"
                );
                self.metrics.record_warning(kind);
                self.sink.log_diagnostic(
                    &self.device,
                    DiagnosticLevel::Warning,
                    kind,
                    &format!("{label} for {}s", elapsed.as_secs()),
                );
            }
            HealthEdge::Recovered => {
                info!(device = %self.device, kind = %kind.as_str(), "health_recovered");
                self.sink.log_diagnostic(
                    &self.device,
                    DiagnosticLevel::Info,
                    kind,
                    &format!("recovered: {label}"),
                );
            }
        }
    }

    fn publish_gauge(&self) {
        self.metrics.set_device_gauge(
            &self.device,
            DeviceGauge {
                occupied: self.machine.occupancy().is_occupied(),
                motion_events: self.machine.motion_event_count(),
                clear_events: self.machine.clear_event_count(),
            },
        );
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            device: self.device.clone(),
            occupancy: self.machine.snapshot(),
            last_comm_at: self.last_comm_at,
            poll_applied: self.poll.applied(),
            poll_failures: self.poll.failures(),
        }
    }

    /// End of session: pending deadlines die with the machine
    fn finish(self) {
        let motion_events = self.machine.motion_event_count();
        let clear_events = self.machine.clear_event_count();
        info!(
            device = %self.device,
            motion_events = %motion_events,
            clear_events = %clear_events,
            "session_ended"
        );
        self.sink.log_diagnostic(
            &self.device,
            DiagnosticLevel::Info,
            DiagnosticKind::MotionCounts,
            &format!("session ended: {motion_events} motion events, {clear_events} clear events"),
        );
        self.metrics.record_session_ended(&self.device);
    }
}

/// Sleep until `deadline`, or forever when there is none
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::RawZoneStatus;
    use crate::services::occupancy::Occupancy;
    use crate::services::sink::RecordingSink;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn zone(device: &DeviceId, bits: i64, at: Instant) -> SensorEvent {
        SensorEvent::at(device.clone(), EventKind::ZoneStatus(RawZoneStatus::Integer(bits)), at)
    }

    fn create_session(
        restored: Option<bool>,
        start: Instant,
    ) -> (DeviceSession, Arc<RecordingSink>, Arc<Metrics>) {
        let sink = Arc::new(RecordingSink::new());
        let metrics = Arc::new(Metrics::new());
        let session = DeviceSession::start(
            DeviceId::new("hall"),
            &Timings::default(),
            restored,
            sink.clone(),
            metrics.clone(),
            start,
        );
        (session, sink, metrics)
    }

    #[test]
    fn test_start_pushes_poll_config() {
        let start = Instant::now();
        let (session, sink, _) = create_session(None, start);

        assert_eq!(sink.poll_pushes(session.device()), vec![(3600, true)]);
        assert_eq!(session.snapshot().poll_applied, Some(3600));
    }

    #[test]
    fn test_motion_then_fast_clear_then_timeout() {
        let start = Instant::now();
        let (mut session, sink, metrics) = create_session(None, start);
        let device = session.device().clone();

        session.handle_event(&zone(&device, 1, start));
        session.handle_event(&zone(&device, 0, start + secs(3)));

        assert_eq!(sink.occupancy_updates(&device), vec![true]);
        assert_eq!(sink.motion_zone_updates(&device), vec![true, false]);

        session.on_clear_timer(start + secs(119));
        assert_eq!(sink.last_occupancy(&device), Some(true));

        session.on_clear_timer(start + secs(120));
        assert_eq!(sink.occupancy_updates(&device), vec![true, false]);
        assert_eq!(metrics.clear_timers_fired(), 1);
    }

    #[test]
    fn test_overdue_clear_fires_before_late_motion() {
        let start = Instant::now();
        let (mut session, sink, metrics) = create_session(None, start);
        let device = session.device().clone();

        session.handle_event(&zone(&device, 1, start));
        // The timer branch never ran: motion arrives after the deadline
        session.handle_event(&zone(&device, 1, start + secs(121)));

        assert_eq!(sink.occupancy_updates(&device), vec![true, false, true]);
        assert_eq!(metrics.clear_timers_fired(), 1);
        assert_eq!(session.snapshot().occupancy.clear_at, Some(start + secs(241)));
    }

    #[test]
    fn test_overdue_startup_guard_fires_before_motion() {
        let start = Instant::now();
        let (mut session, sink, metrics) = create_session(Some(true), start);
        let device = session.device().clone();

        session.handle_event(&zone(&device, 1, start + secs(8)));

        // Forced clear first, then the motion turns occupancy back on
        assert_eq!(sink.occupancy_updates(&device), vec![false, true]);
        assert_eq!(metrics.report().startup_clears_forced, 1);
        assert_eq!(metrics.report().startup_guards_cancelled, 0);
    }

    #[test]
    fn test_malformed_report_is_not_a_clear() {
        let start = Instant::now();
        let (mut session, sink, metrics) = create_session(None, start);
        let device = session.device().clone();

        session.handle_event(&zone(&device, 1, start));
        let bad = SensorEvent::at(
            device.clone(),
            EventKind::ZoneStatus(RawZoneStatus::Unparseable("\"garbage\"".into())),
            start + secs(40),
        );
        session.handle_event(&bad);

        let snap = session.snapshot();
        assert_eq!(snap.occupancy.clear_event_count, 0);
        assert_eq!(snap.occupancy.motion_event_count, 1);
        assert_eq!(snap.occupancy.clear_at, Some(start + secs(120)));
        assert_eq!(snap.last_comm_at, start + secs(40));
        assert_eq!(metrics.malformed_reports(), 1);
        assert_eq!(
            sink.diagnostic_count(
                &device,
                DiagnosticLevel::Warning,
                DiagnosticKind::MalformedZoneStatus
            ),
            1
        );

        let negative = zone(&device, -4, start + secs(41));
        session.handle_event(&negative);
        assert_eq!(metrics.malformed_reports(), 2);
    }

    #[test]
    fn test_trouble_flags_warn_on_rising_edge_only() {
        let start = Instant::now();
        let (mut session, sink, _) = create_session(None, start);
        let device = session.device().clone();

        // motion + tamper, twice, then tamper cleared
        session.handle_event(&zone(&device, 0x05, start));
        session.handle_event(&zone(&device, 0x05, start + secs(1)));
        session.handle_event(&zone(&device, 0x01, start + secs(2)));

        assert_eq!(
            sink.diagnostic_count(&device, DiagnosticLevel::Warning, DiagnosticKind::Tamper),
            1
        );
        assert_eq!(sink.diagnostic_count(&device, DiagnosticLevel::Info, DiagnosticKind::Tamper), 1);
        // Tamper never touches occupancy
        assert_eq!(sink.occupancy_updates(&device), vec![true]);
    }

    #[test]
    fn test_low_battery_and_supervision_flags() {
        let start = Instant::now();
        let (mut session, sink, _) = create_session(None, start);
        let device = session.device().clone();

        session.handle_event(&zone(&device, 0x48, start));

        assert_eq!(
            sink.diagnostic_count(&device, DiagnosticLevel::Warning, DiagnosticKind::LowBattery),
            1
        );
        assert_eq!(
            sink.diagnostic_count(
                &device,
                DiagnosticLevel::Warning,
                DiagnosticKind::SupervisionFailure
            ),
            1
        );
    }

    #[test]
    fn test_check_in_updates_last_comm_only() {
        let start = Instant::now();
        let (mut session, sink, _) = create_session(None, start);
        let device = session.device().clone();

        session.handle_event(&SensorEvent::at(device.clone(), EventKind::CheckIn, start + secs(900)));

        let snap = session.snapshot();
        assert_eq!(snap.last_comm_at, start + secs(900));
        assert_eq!(snap.occupancy.occupancy, Occupancy::Clear);
        // Only the overdue startup clear; the check-in itself changes nothing
        assert_eq!(sink.occupancy_updates(&device), vec![false]);
    }

    #[test]
    fn test_battery_voltage_passthrough() {
        let start = Instant::now();
        let (mut session, sink, _) = create_session(None, start);
        let device = session.device().clone();

        session.handle_event(&SensorEvent::at(device.clone(), EventKind::BatteryVoltage(2.45), start));

        assert!(sink
            .calls()
            .contains(&crate::services::sink::SinkCall::Battery { device, percent: 50 }));
    }

    #[test]
    fn test_reconfigure_retries_failed_poll_config() {
        let start = Instant::now();
        let sink = Arc::new(RecordingSink::new());
        sink.set_poll_config_failing(true);
        let metrics = Arc::new(Metrics::new());
        let mut session = DeviceSession::start(
            DeviceId::new("hall"),
            &Timings::default(),
            None,
            sink.clone(),
            metrics.clone(),
            start,
        );
        let device = session.device().clone();
        assert_eq!(session.snapshot().poll_applied, None);

        sink.set_poll_config_failing(false);
        session.handle_event(&SensorEvent::at(device.clone(), EventKind::Reconfigure, start + secs(60)));

        assert_eq!(sink.poll_pushes(&device), vec![(3600, false), (3600, true)]);
        let snap = session.snapshot();
        assert_eq!(snap.poll_applied, Some(3600));
        assert_eq!(snap.poll_failures, 1);
        assert_eq!(metrics.poll_configs_failed(), 1);
    }

    #[test]
    fn test_startup_guard_overrides_restored_occupancy() {
        let start = Instant::now();
        let (mut session, sink, _) = create_session(Some(true), start);
        let device = session.device().clone();

        session.on_startup_guard(start + secs(5));

        assert_eq!(sink.occupancy_updates(&device), vec![false]);
        assert!(!session.snapshot().occupancy.startup_guard_active);
    }

    #[test]
    fn test_startup_guard_reemits_clear_even_when_clear() {
        let start = Instant::now();
        let (mut session, sink, _) = create_session(None, start);
        let device = session.device().clone();

        session.on_startup_guard(start + secs(5));
        session.on_startup_guard(start + secs(6));

        assert_eq!(sink.occupancy_updates(&device), vec![false]);
    }

    #[test]
    fn test_health_tick_latches_silent_warning() {
        let start = Instant::now();
        let (mut session, sink, _) = create_session(None, start);
        let device = session.device().clone();

        session.on_health_tick(start + secs(3600));
        session.on_health_tick(start + secs(3900));
        assert_eq!(
            sink.diagnostic_count(&device, DiagnosticLevel::Warning, DiagnosticKind::SilentDevice),
            1
        );

        session.handle_event(&SensorEvent::at(device.clone(), EventKind::CheckIn, start + secs(4000)));
        session.on_health_tick(start + secs(4200));
        assert_eq!(
            sink.diagnostic_count(&device, DiagnosticLevel::Info, DiagnosticKind::SilentDevice),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_clears_after_motion_timeout() {
        let sink = Arc::new(RecordingSink::new());
        let metrics = Arc::new(Metrics::new());
        let device = DeviceId::new("hall");
        let session = DeviceSession::start(
            device.clone(),
            &Timings::default(),
            None,
            sink.clone(),
            metrics.clone(),
            Instant::now(),
        );
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(session.run(rx));

        let motion = SensorEvent::new(device.clone(), EventKind::ZoneStatus(RawZoneStatus::Integer(1)));
        tx.send(SessionInput::Event(motion)).await.unwrap();
        tokio::time::sleep(secs(3)).await;
        let clear = SensorEvent::new(device.clone(), EventKind::ZoneStatus(RawZoneStatus::Integer(0)));
        tx.send(SessionInput::Event(clear)).await.unwrap();

        tokio::time::sleep(secs(116)).await;
        assert_eq!(sink.last_occupancy(&device), Some(true));

        tokio::time::sleep(secs(2)).await;
        assert_eq!(sink.occupancy_updates(&device), vec![true, false]);
        assert_eq!(metrics.clear_timers_fired(), 1);

        drop(tx);
        task.await.unwrap();
        assert_eq!(
            sink.diagnostic_count(&device, DiagnosticLevel::Info, DiagnosticKind::MotionCounts),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_queued_late_motion_still_clears() {
        let sink = Arc::new(RecordingSink::new());
        let metrics = Arc::new(Metrics::new());
        let device = DeviceId::new("hall");
        let start = Instant::now();
        let session = DeviceSession::start(
            device.clone(),
            &Timings::default(),
            None,
            sink.clone(),
            metrics.clone(),
            start,
        );
        let (tx, rx) = mpsc::channel(16);

        // Both reports are queued before the task first polls, so the queue
        // wins every select round and the timer branch never gets a turn
        tx.send(SessionInput::Event(zone(&device, 1, start))).await.unwrap();
        tx.send(SessionInput::Event(zone(&device, 1, start + secs(130)))).await.unwrap();
        let task = tokio::spawn(session.run(rx));

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(SessionInput::Snapshot(reply_tx)).await.unwrap();
        let snap = reply_rx.await.unwrap();

        assert_eq!(sink.occupancy_updates(&device), vec![true, false, true]);
        assert_eq!(metrics.clear_timers_fired(), 1);
        assert_eq!(snap.occupancy.clear_at, Some(start + secs(250)));

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_snapshot_and_stuck_reset() {
        let sink = Arc::new(RecordingSink::new());
        let metrics = Arc::new(Metrics::new());
        let device = DeviceId::new("hall");
        let start = Instant::now();
        let session = DeviceSession::start(
            device.clone(),
            &Timings::default(),
            None,
            sink.clone(),
            metrics.clone(),
            start,
        );
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(session.run(rx));

        let motion = SensorEvent::new(device.clone(), EventKind::ZoneStatus(RawZoneStatus::Integer(1)));
        tx.send(SessionInput::Event(motion)).await.unwrap();
        tokio::time::sleep(secs(45)).await;
        let clear = SensorEvent::new(device.clone(), EventKind::ZoneStatus(RawZoneStatus::Integer(0)));
        tx.send(SessionInput::Event(clear)).await.unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(SessionInput::Snapshot(reply_tx)).await.unwrap();
        let snap = reply_rx.await.unwrap();

        assert_eq!(snap.occupancy.occupancy, Occupancy::Occupied);
        assert_eq!(snap.occupancy.clear_at, Some(start + secs(165)));
        assert_eq!(snap.occupancy.motion_event_count, 2);
        assert_eq!(snap.occupancy.clear_event_count, 1);

        drop(tx);
        task.await.unwrap();
    }
}
