//! Shared types for the motion shim

use serde::Serialize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Get current epoch time in milliseconds
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Device identity (the hub's friendly name for the sensor)
///
/// Cheap to clone: every session, log line and egress payload carries one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub Arc<str>);

impl DeviceId {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Raw zone status as it arrived on the wire
///
/// Kept as the untyped JSON value so that decoding (and the malformed-input
/// path) happens in exactly one place, see [`crate::domain::zone_status`].
#[derive(Debug, Clone, PartialEq)]
pub enum RawZoneStatus {
    Integer(i64),
    Unparseable(String),
}

impl RawZoneStatus {
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value.as_i64() {
            Some(v) => Self::Integer(v),
            None => Self::Unparseable(value.to_string()),
        }
    }
}

/// Classification of inbound sensor events
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// IAS zone status change notification
    ZoneStatus(RawZoneStatus),
    /// Periodic poll-control check-in (liveness only)
    CheckIn,
    /// Attribute report carrying battery voltage in volts
    BatteryVoltage(f64),
    /// Sensor joined / was re-paired; optional host-restored occupancy
    SessionStart { restored_occupancy: Option<bool> },
    /// Sensor removed
    SessionEnd,
    /// Host asked for the device to be reconfigured
    Reconfigure,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ZoneStatus(_) => "zone_status",
            EventKind::CheckIn => "check_in",
            EventKind::BatteryVoltage(_) => "battery_voltage",
            EventKind::SessionStart { .. } => "session_start",
            EventKind::SessionEnd => "session_end",
            EventKind::Reconfigure => "reconfigure",
        }
    }
}

/// Parsed event for internal processing
#[derive(Debug, Clone)]
pub struct SensorEvent {
    pub device: DeviceId,
    pub kind: EventKind,
    /// When the event was received (monotonic, drives all elapsed-time logic)
    pub received_at: Instant,
}

impl SensorEvent {
    pub fn new(device: DeviceId, kind: EventKind) -> Self {
        Self { device, kind, received_at: Instant::now() }
    }

    pub fn at(device: DeviceId, kind: EventKind, received_at: Instant) -> Self {
        Self { device, kind, received_at }
    }
}

/// Severity attached to outbound diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Info,
    Warning,
    Critical,
}

impl DiagnosticLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticLevel::Info => "info",
            DiagnosticLevel::Warning => "warning",
            DiagnosticLevel::Critical => "critical",
        }
    }
}

/// What a diagnostic is about
///
/// Used as the `kind` field of diagnostic payloads and as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    MotionCounts,
    MalformedZoneStatus,
    Tamper,
    LowBattery,
    SupervisionFailure,
    StuckOccupancy,
    SilentDevice,
    PollConfig,
    SessionUnavailable,
}

impl DiagnosticKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticKind::MotionCounts => "motion_counts",
            DiagnosticKind::MalformedZoneStatus => "malformed_zone_status",
            DiagnosticKind::Tamper => "tamper",
            DiagnosticKind::LowBattery => "low_battery",
            DiagnosticKind::SupervisionFailure => "supervision_failure",
            DiagnosticKind::StuckOccupancy => "stuck_occupancy",
            DiagnosticKind::SilentDevice => "silent_device",
            DiagnosticKind::PollConfig => "poll_config",
            DiagnosticKind::SessionUnavailable => "session_unavailable",
        }
    }
}

/// Battery voltage → percentage conversion limits (volts)
pub const BATTERY_MIN_VOLTS: f64 = 1.9;
pub const BATTERY_MAX_VOLTS: f64 = 3.0;

/// Convert a battery voltage to a 0–100 percentage, clamped at both ends
pub fn battery_percentage(volts: f64) -> u8 {
    if !volts.is_finite() {
        return 0;
    }
    let pct = (volts - BATTERY_MIN_VOLTS) / (BATTERY_MAX_VOLTS - BATTERY_MIN_VOLTS) * 100.0;
    pct.round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_percentage_bounds() {
        assert_eq!(battery_percentage(1.9), 0);
        assert_eq!(battery_percentage(3.0), 100);
        assert_eq!(battery_percentage(1.5), 0);
        assert_eq!(battery_percentage(3.3), 100);
        assert_eq!(battery_percentage(2.45), 50);
        assert_eq!(battery_percentage(f64::NAN), 0);
    }

    #[test]
    fn test_raw_zone_status_from_json() {
        assert_eq!(RawZoneStatus::from_json(&serde_json::json!(1)), RawZoneStatus::Integer(1));
        assert!(matches!(
            RawZoneStatus::from_json(&serde_json::json!("0x01")),
            RawZoneStatus::Unparseable(_)
        ));
        assert!(matches!(
            RawZoneStatus::from_json(&serde_json::json!(1.5)),
            RawZoneStatus::Unparseable(_)
        ));
    }

    #[test]
    fn test_device_id_display() {
        let id = DeviceId::new("hallway_motion");
        assert_eq!(id.to_string(), "hallway_motion");
        assert_eq!(id, DeviceId::from("hallway_motion"));
    }
}
