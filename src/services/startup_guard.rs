//! One-shot startup reconciliation guard
//!
//! Armed when a session starts. Unless real motion is accepted first, it
//! fires once after the configured delay and the session forces occupancy
//! to clear, discarding whatever state the host restored.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct StartupGuard {
    deadline: Option<Instant>,
}

impl StartupGuard {
    pub fn arm(now: Instant, delay: Duration) -> Self {
        Self { deadline: Some(now + delay) }
    }

    /// True until the guard has fired or been cancelled; never re-activates
    #[inline]
    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel on real motion. Returns true if a pending guard was cancelled.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    /// Fire if due. Returns true exactly once per guard.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once_after_delay() {
        let start = Instant::now();
        let mut guard = StartupGuard::arm(start, Duration::from_secs(5));
        assert!(guard.is_active());

        assert!(!guard.fire(start + Duration::from_secs(4)));
        assert!(guard.is_active());

        assert!(guard.fire(start + Duration::from_secs(5)));
        assert!(!guard.is_active());
        assert!(!guard.fire(start + Duration::from_secs(6)));
    }

    #[test]
    fn test_cancel_prevents_fire() {
        let start = Instant::now();
        let mut guard = StartupGuard::arm(start, Duration::from_secs(5));

        assert!(guard.cancel());
        assert!(!guard.is_active());
        assert!(!guard.cancel());
        assert!(!guard.fire(start + Duration::from_secs(10)));
        assert_eq!(guard.deadline(), None);
    }
}
