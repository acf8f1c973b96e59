//! Domain models - core sensor types
//!
//! This module contains the canonical data types used throughout the system:
//! - `SensorEvent` - typed inbound event for one device
//! - `DeviceId` - device identity
//! - `ZoneStatus` - decoded IAS zone status flags

pub mod types;
pub mod zone_status;

pub use types::{DeviceId, EventKind, SensorEvent};
pub use zone_status::ZoneStatus;
