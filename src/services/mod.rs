//! Services - occupancy inference and session management
//!
//! This module contains the core logic:
//! - `occupancy` - Occupancy state machine (motion, clears, timeouts)
//! - `startup_guard` - One-shot forced clear after session start
//! - `health` - Latched stuck / silent device checks
//! - `poll_control` - Check-in interval push
//! - `session` - Per-device actor tying the above together
//! - `manager` - Session table and event routing
//! - `sink` - Outbound signal trait and test recorder

pub mod health;
pub mod manager;
pub mod occupancy;
pub mod poll_control;
pub mod session;
pub mod sink;
pub mod startup_guard;

// Re-export commonly used types
pub use manager::SessionManager;
pub use occupancy::{Occupancy, OccupancyMachine};
pub use session::{DeviceSession, SessionInput, SessionSnapshot};
pub use sink::{LogSink, RecordingSink, SignalSink};
