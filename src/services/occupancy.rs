//! Occupancy state machine
//!
//! Derives a trustworthy occupancy signal from a sensor whose hardware clear
//! reports are unreliable. Time is always passed in, so the machine itself
//! owns no timers: the armed clear timer and the startup guard are deadlines
//! that the session task sleeps on.
//!
//! Key behaviors:
//! - Accepted motion sets Occupied and (re)arms the clear deadline
//! - The clear deadline always wins: Occupied never outlives
//!   `motion_timeout` after the last accepted motion
//! - A hardware clear while Clear, or at least `stuck_motion_threshold`
//!   after the last motion, is a stuck sensor resetting and counts as motion
//! - A hardware clear sooner than that is a normal fast cycle and is ignored
//! - Counters only grow; a new machine is the only way to reset them

use crate::infra::config::Timings;
use crate::services::startup_guard::StartupGuard;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Clear,
    Occupied,
}

impl Occupancy {
    #[inline]
    pub fn is_occupied(self) -> bool {
        self == Occupancy::Occupied
    }
}

/// Result of accepting a motion signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionAccepted {
    /// Clear → Occupied happened (the sink needs an update)
    pub became_occupied: bool,
    /// This motion cancelled the pending startup guard
    pub guard_cancelled: bool,
    /// When the freshly armed clear timer fires
    pub clear_at: Instant,
}

/// How a hardware clear report was classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearDisposition {
    /// Clear while already Clear: the sensor was stuck and is resetting
    ResetWhileClear,
    /// Clear arrived at or after the stuck threshold
    StuckReset { elapsed: Option<Duration> },
    /// Normal fast motion → clear cycle; the timer governs
    FastCycle { elapsed: Duration },
}

impl ClearDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClearDisposition::ResetWhileClear => "reset_while_clear",
            ClearDisposition::StuckReset { .. } => "stuck_reset",
            ClearDisposition::FastCycle { .. } => "fast_cycle",
        }
    }
}

/// Result of a hardware clear report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearHandled {
    pub disposition: ClearDisposition,
    /// Set when the clear was reclassified as motion
    pub motion: Option<MotionAccepted>,
}

/// Point-in-time view of the machine, for health checks and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccupancySnapshot {
    pub occupancy: Occupancy,
    pub last_motion_at: Option<Instant>,
    pub clear_at: Option<Instant>,
    pub motion_event_count: u64,
    pub clear_event_count: u64,
    pub startup_guard_active: bool,
}

pub struct OccupancyMachine {
    state: Occupancy,
    last_motion_at: Option<Instant>,
    /// The single armed clear timer, if any
    clear_at: Option<Instant>,
    motion_event_count: u64,
    clear_event_count: u64,
    guard: StartupGuard,
    motion_timeout: Duration,
    stuck_motion_threshold: Duration,
}

impl OccupancyMachine {
    /// Create a machine for a new session
    ///
    /// `restored` is the occupancy the host claims the device had. It is
    /// honored only until the startup guard fires.
    pub fn new(now: Instant, timings: &Timings, restored: Option<bool>) -> Self {
        let state = match restored {
            Some(true) => Occupancy::Occupied,
            _ => Occupancy::Clear,
        };
        Self {
            state,
            last_motion_at: None,
            clear_at: None,
            motion_event_count: 0,
            clear_event_count: 0,
            guard: StartupGuard::arm(now, timings.startup_guard_delay),
            motion_timeout: timings.motion_timeout,
            stuck_motion_threshold: timings.stuck_motion_threshold,
        }
    }

    /// Accept a motion signal at `now`
    ///
    /// Replaces any armed clear timer; there is never more than one.
    pub fn accept_motion(&mut self, now: Instant) -> MotionAccepted {
        let became_occupied = !self.state.is_occupied();
        self.state = Occupancy::Occupied;
        self.last_motion_at = Some(now);
        self.motion_event_count += 1;

        let clear_at = now + self.motion_timeout;
        self.clear_at = Some(clear_at);

        let guard_cancelled = self.guard.cancel();

        MotionAccepted { became_occupied, guard_cancelled, clear_at }
    }

    /// Handle a hardware clear report at `now`
    ///
    /// The threshold is inclusive: a clear exactly `stuck_motion_threshold`
    /// after motion is a stuck reset. A reclassified clear counts as both a
    /// clear and a motion event.
    pub fn hardware_clear(&mut self, now: Instant) -> ClearHandled {
        self.clear_event_count += 1;

        let disposition = if !self.state.is_occupied() {
            ClearDisposition::ResetWhileClear
        } else {
            match self.last_motion_at {
                Some(last) => {
                    let elapsed = now.saturating_duration_since(last);
                    if elapsed >= self.stuck_motion_threshold {
                        ClearDisposition::StuckReset { elapsed: Some(elapsed) }
                    } else {
                        ClearDisposition::FastCycle { elapsed }
                    }
                }
                // Occupied only by restored state: no motion to measure from
                None => ClearDisposition::StuckReset { elapsed: None },
            }
        };

        let motion = match disposition {
            ClearDisposition::FastCycle { .. } => None,
            _ => Some(self.accept_motion(now)),
        };

        ClearHandled { disposition, motion }
    }

    /// Fire the clear timer if it is due
    ///
    /// Returns true when the timer fired; occupancy is then Clear
    /// unconditionally.
    pub fn fire_clear_timer(&mut self, now: Instant) -> bool {
        match self.clear_at {
            Some(deadline) if deadline <= now => {
                self.clear_at = None;
                self.state = Occupancy::Clear;
                true
            }
            _ => false,
        }
    }

    /// Fire the startup guard if it is due
    ///
    /// Returns true when the guard fired; occupancy is then forced Clear.
    pub fn fire_startup_guard(&mut self, now: Instant) -> bool {
        if !self.guard.fire(now) {
            return false;
        }
        self.state = Occupancy::Clear;
        true
    }

    #[inline]
    pub fn occupancy(&self) -> Occupancy {
        self.state
    }

    #[inline]
    pub fn clear_deadline(&self) -> Option<Instant> {
        self.clear_at
    }

    #[inline]
    pub fn startup_deadline(&self) -> Option<Instant> {
        self.guard.deadline()
    }

    #[inline]
    pub fn last_motion_at(&self) -> Option<Instant> {
        self.last_motion_at
    }

    #[inline]
    pub fn motion_event_count(&self) -> u64 {
        self.motion_event_count
    }

    #[inline]
    pub fn clear_event_count(&self) -> u64 {
        self.clear_event_count
    }

    #[inline]
    pub fn motion_timeout(&self) -> Duration {
        self.motion_timeout
    }

    pub fn snapshot(&self) -> OccupancySnapshot {
        OccupancySnapshot {
            occupancy: self.state,
            last_motion_at: self.last_motion_at,
            clear_at: self.clear_at,
            motion_event_count: self.motion_event_count,
            clear_event_count: self.clear_event_count,
            startup_guard_active: self.guard.is_active(),
        }
    }
}
