//! IAS zone status decoding
//!
//! The sensor reports a 16-bit zone status bitmap with every zone status
//! change notification. Only four bits matter to the shim:
//! - bit 0 (alarm 1): motion
//! - bit 2: tamper
//! - bit 3: battery low
//! - bit 6 (trouble): supervision / reporting failure
//!
//! All other bits are reserved or irrelevant and ignored.

use crate::domain::types::RawZoneStatus;

const BIT_MOTION: u16 = 1 << 0;
const BIT_TAMPER: u16 = 1 << 2;
const BIT_LOW_BATTERY: u16 = 1 << 3;
const BIT_SUPERVISION_FAILURE: u16 = 1 << 6;

/// Decoded zone status flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneStatus {
    pub motion: bool,
    pub tamper: bool,
    pub low_battery: bool,
    pub supervision_failure: bool,
    /// The bitmap as reported (0 when the report was malformed)
    pub raw: u16,
}

impl ZoneStatus {
    pub fn from_bits(raw: u16) -> Self {
        Self {
            motion: raw & BIT_MOTION != 0,
            tamper: raw & BIT_TAMPER != 0,
            low_battery: raw & BIT_LOW_BATTERY != 0,
            supervision_failure: raw & BIT_SUPERVISION_FAILURE != 0,
            raw,
        }
    }
}

/// Result of decoding one report
#[derive(Debug, Clone, PartialEq)]
pub enum ZoneStatusDecode {
    Valid(ZoneStatus),
    /// Undecodable input; carries the reason for the anomaly log line
    Malformed(String),
}

impl ZoneStatusDecode {
    /// Flags to act on: malformed reports read as all-flags-false
    pub fn status(&self) -> ZoneStatus {
        match self {
            ZoneStatusDecode::Valid(status) => *status,
            ZoneStatusDecode::Malformed(_) => ZoneStatus::default(),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, ZoneStatusDecode::Malformed(_))
    }
}

/// Decode a raw zone status value
pub fn decode(raw: &RawZoneStatus) -> ZoneStatusDecode {
    match raw {
        RawZoneStatus::Integer(value) => match u16::try_from(*value) {
            Ok(bits) => ZoneStatusDecode::Valid(ZoneStatus::from_bits(bits)),
            Err(_) => ZoneStatusDecode::Malformed(format!("value {value} outside 16-bit range")),
        },
        RawZoneStatus::Unparseable(text) => {
            ZoneStatusDecode::Malformed(format!("not an integer: {text}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_motion_only() {
        let status = decode(&RawZoneStatus::Integer(0x0001)).status();
        assert!(status.motion);
        assert!(!status.tamper);
        assert!(!status.low_battery);
        assert!(!status.supervision_failure);
    }

    #[test]
    fn test_decode_clear() {
        let decoded = decode(&RawZoneStatus::Integer(0));
        assert_eq!(decoded, ZoneStatusDecode::Valid(ZoneStatus::default()));
    }

    #[test]
    fn test_decode_all_flags() {
        let status = decode(&RawZoneStatus::Integer(0x004D)).status();
        assert!(status.motion);
        assert!(status.tamper);
        assert!(status.low_battery);
        assert!(status.supervision_failure);
        assert_eq!(status.raw, 0x004D);
    }

    #[test]
    fn test_reserved_bits_ignored() {
        // alarm 2, supervision reports, restore reports, AC, test, battery defect
        let status = decode(&RawZoneStatus::Integer(0x03B2)).status();
        assert!(!status.motion);
        assert!(!status.tamper);
        assert!(!status.low_battery);
        assert!(!status.supervision_failure);
    }

    #[test]
    fn test_out_of_range_is_malformed() {
        assert!(decode(&RawZoneStatus::Integer(-1)).is_malformed());
        assert!(decode(&RawZoneStatus::Integer(0x1_0001)).is_malformed());
        // Malformed reports never carry motion
        assert!(!decode(&RawZoneStatus::Integer(0x1_0001)).status().motion);
    }

    #[test]
    fn test_unparseable_is_malformed() {
        let decoded = decode(&RawZoneStatus::Unparseable("\"motion\"".to_string()));
        assert!(decoded.is_malformed());
        assert_eq!(decoded.status(), ZoneStatus::default());
    }
}
