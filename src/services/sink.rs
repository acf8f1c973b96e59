//! Outbound signal sink
//!
//! Sessions never talk to MQTT directly. Everything they emit goes through
//! [`SignalSink`], implemented by the MQTT egress sender in production, by
//! [`LogSink`] when egress is disabled and by [`RecordingSink`] in tests.

use crate::domain::types::{DeviceId, DiagnosticKind, DiagnosticLevel};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Host-side receiver of derived signals
///
/// All methods must be non-blocking: they are called from the session task
/// while it holds the session state.
pub trait SignalSink: Send + Sync {
    /// Derived occupancy; called on every transition, tolerates repeats
    fn set_occupancy(&self, device: &DeviceId, occupied: bool);

    /// Raw hardware motion passthrough
    fn set_motion_zone_state(&self, device: &DeviceId, motion: bool);

    fn set_battery_percentage(&self, device: &DeviceId, percent: u8);

    fn log_diagnostic(
        &self,
        device: &DeviceId,
        level: DiagnosticLevel,
        kind: DiagnosticKind,
        message: &str,
    );

    /// Push the check-in interval to the device's poll control facility
    fn configure_poll_interval(&self, device: &DeviceId, quarter_seconds: u32)
        -> anyhow::Result<()>;
}

/// Sink that only logs, for running without MQTT egress
#[derive(Debug, Default)]
pub struct LogSink;

impl SignalSink for LogSink {
    fn set_occupancy(&self, device: &DeviceId, occupied: bool) {
        debug!(device = %device, occupied = %occupied, "sink_occupancy");
    }

    fn set_motion_zone_state(&self, device: &DeviceId, motion: bool) {
        debug!(device = %device, motion = %motion, "sink_motion_zone");
    }

    fn set_battery_percentage(&self, device: &DeviceId, percent: u8) {
        debug!(device = %device, percent = %percent, "sink_battery");
    }

    fn log_diagnostic(
        &self,
        device: &DeviceId,
        level: DiagnosticLevel,
        kind: DiagnosticKind,
        _message: &str,
    ) {
        debug!(device = %device, level = %level.as_str(), kind = %kind.as_str(), "sink_diagnostic");
    }

    fn configure_poll_interval(
        &self,
        device: &DeviceId,
        quarter_seconds: u32,
    ) -> anyhow::Result<()> {
        debug!(device = %device, quarter_seconds = %quarter_seconds, "sink_poll_interval");
        Ok(())
    }
}

/// One call made on a [`RecordingSink`]
#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Occupancy { device: DeviceId, occupied: bool },
    MotionZone { device: DeviceId, motion: bool },
    Battery { device: DeviceId, percent: u8 },
    Diagnostic { device: DeviceId, level: DiagnosticLevel, kind: DiagnosticKind },
    PollInterval { device: DeviceId, quarter_seconds: u32, ok: bool },
}

/// In-memory sink that records every call, for tests
#[derive(Debug, Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    fail_poll_config: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent poll configuration pushes fail (or succeed again)
    pub fn set_poll_config_failing(&self, failing: bool) {
        self.fail_poll_config.store(failing, Ordering::Relaxed);
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().clone()
    }

    /// Occupancy values published for a device, in order
    pub fn occupancy_updates(&self, device: &DeviceId) -> Vec<bool> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                SinkCall::Occupancy { device: d, occupied } if d == device => Some(*occupied),
                _ => None,
            })
            .collect()
    }

    /// Last published occupancy for a device
    pub fn last_occupancy(&self, device: &DeviceId) -> Option<bool> {
        self.occupancy_updates(device).last().copied()
    }

    /// Raw motion passthrough values for a device, in order
    pub fn motion_zone_updates(&self, device: &DeviceId) -> Vec<bool> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                SinkCall::MotionZone { device: d, motion } if d == device => Some(*motion),
                _ => None,
            })
            .collect()
    }

    /// Number of diagnostics of a kind at a level for a device
    pub fn diagnostic_count(
        &self,
        device: &DeviceId,
        level: DiagnosticLevel,
        kind: DiagnosticKind,
    ) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| {
                matches!(call, SinkCall::Diagnostic { device: d, level: l, kind: k }
                    if d == device && *l == level && *k == kind)
            })
            .count()
    }

    /// Poll interval pushes for a device as (quarter_seconds, succeeded)
    pub fn poll_pushes(&self, device: &DeviceId) -> Vec<(u32, bool)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                SinkCall::PollInterval { device: d, quarter_seconds, ok } if d == device => {
                    Some((*quarter_seconds, *ok))
                }
                _ => None,
            })
            .collect()
    }
}

impl SignalSink for RecordingSink {
    fn set_occupancy(&self, device: &DeviceId, occupied: bool) {
        self.calls.lock().push(SinkCall::Occupancy { device: device.clone(), occupied });
    }

    fn set_motion_zone_state(&self, device: &DeviceId, motion: bool) {
        self.calls.lock().push(SinkCall::MotionZone { device: device.clone(), motion });
    }

    fn set_battery_percentage(&self, device: &DeviceId, percent: u8) {
        self.calls.lock().push(SinkCall::Battery { device: device.clone(), percent });
    }

    fn log_diagnostic(
        &self,
        device: &DeviceId,
        level: DiagnosticLevel,
        kind: DiagnosticKind,
        _message: &str,
    ) {
        self.calls.lock().push(SinkCall::Diagnostic { device: device.clone(), level, kind });
    }

    fn configure_poll_interval(
        &self,
        device: &DeviceId,
        quarter_seconds: u32,
    ) -> anyhow::Result<()> {
        let ok = !self.fail_poll_config.load(Ordering::Relaxed);
        self.calls.lock().push(SinkCall::PollInterval {
            device: device.clone(),
            quarter_seconds,
            ok,
        });
        if ok {
            Ok(())
        } else {
            anyhow::bail!("poll control unavailable")
        }
    }
}
