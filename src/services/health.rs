//! Periodic health checks for one device session
//!
//! Runs on its own tick, independent of event arrival. Only ever produces
//! diagnostics; occupancy is never touched from here.
//!
//! Each condition is latched: a warning is raised once when the condition
//! starts and re-armed only after it has cleared.

use std::time::Duration;
use tokio::time::Instant;

/// Edge of a latched health condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEdge {
    /// Condition started, with the elapsed time that triggered it
    Raised(Duration),
    /// Condition cleared after having been raised
    Recovered,
}

/// Outcome of one health evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthCheck {
    pub stuck: Option<HealthEdge>,
    pub silent: Option<HealthEdge>,
}

impl HealthCheck {
    pub fn is_empty(&self) -> bool {
        self.stuck.is_none() && self.silent.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Latch {
    raised: bool,
}

impl Latch {
    /// Feed the current condition; returns the edge, if any
    fn update(&mut self, active: Option<Duration>) -> Option<HealthEdge> {
        match (active, self.raised) {
            (Some(elapsed), false) => {
                self.raised = true;
                Some(HealthEdge::Raised(elapsed))
            }
            (None, true) => {
                self.raised = false;
                Some(HealthEdge::Recovered)
            }
            _ => None,
        }
    }
}

pub struct HealthMonitor {
    stuck_threshold: Duration,
    silent_threshold: Duration,
    stuck: Latch,
    silent: Latch,
}

impl HealthMonitor {
    pub fn new(stuck_threshold: Duration, silent_threshold: Duration) -> Self {
        Self { stuck_threshold, silent_threshold, stuck: Latch::default(), silent: Latch::default() }
    }

    /// Evaluate both conditions at `now`
    ///
    /// Stuck: occupied and no accepted motion for `stuck_threshold`.
    /// Silent: nothing received from the device for `silent_threshold`.
    pub fn evaluate(
        &mut self,
        occupied: bool,
        last_motion_at: Option<Instant>,
        last_comm_at: Instant,
        now: Instant,
    ) -> HealthCheck {
        let stuck_for = match (occupied, last_motion_at) {
            (true, Some(last)) => {
                let elapsed = now.saturating_duration_since(last);
                (elapsed >= self.stuck_threshold).then_some(elapsed)
            }
            _ => None,
        };

        let silent_for = {
            let elapsed = now.saturating_duration_since(last_comm_at);
            (elapsed >= self.silent_threshold).then_some(elapsed)
        };

        HealthCheck { stuck: self.stuck.update(stuck_for), silent: self.silent.update(silent_for) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_monitor() -> HealthMonitor {
        HealthMonitor::new(Duration::from_secs(1800), Duration::from_secs(3600))
    }

    #[test]
    fn test_healthy_device_raises_nothing() {
        let start = Instant::now();
        let mut monitor = create_monitor();

        let check = monitor.evaluate(true, Some(start), start, start + Duration::from_secs(300));
        assert!(check.is_empty());
    }

    #[test]
    fn test_stuck_warning_latched_once() {
        let start = Instant::now();
        let mut monitor = create_monitor();
        let comm = start + Duration::from_secs(1900);

        let first = monitor.evaluate(true, Some(start), comm, start + Duration::from_secs(1800));
        assert_eq!(first.stuck, Some(HealthEdge::Raised(Duration::from_secs(1800))));

        let second = monitor.evaluate(true, Some(start), comm, start + Duration::from_secs(2100));
        assert_eq!(second.stuck, None);

        // Clear ends the condition window
        let recovered = monitor.evaluate(false, Some(start), comm, start + Duration::from_secs(2400));
        assert_eq!(recovered.stuck, Some(HealthEdge::Recovered));

        // A new window can raise again
        let later = start + Duration::from_secs(5000);
        let again = monitor.evaluate(true, Some(start), later, later);
        assert!(matches!(again.stuck, Some(HealthEdge::Raised(_))));
    }

    #[test]
    fn test_silent_warning_and_recovery() {
        let start = Instant::now();
        let mut monitor = create_monitor();

        let silent = monitor.evaluate(false, None, start, start + Duration::from_secs(3600));
        assert_eq!(silent.silent, Some(HealthEdge::Raised(Duration::from_secs(3600))));
        assert_eq!(silent.stuck, None);

        let still = monitor.evaluate(false, None, start, start + Duration::from_secs(7200));
        assert!(still.is_empty());

        let heard = start + Duration::from_secs(7300);
        let recovered = monitor.evaluate(false, None, heard, heard);
        assert_eq!(recovered.silent, Some(HealthEdge::Recovered));
    }

    #[test]
    fn test_clear_device_never_stuck() {
        let start = Instant::now();
        let mut monitor = create_monitor();
        let now = start + Duration::from_secs(4000);

        let check = monitor.evaluate(false, Some(start), now, now);
        assert!(check.is_empty());
    }
}
