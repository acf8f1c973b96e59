//! Check-in interval push to the device's poll control facility
//!
//! Pushed when a session starts and on every reconfigure request. A failed
//! push is logged and counted; nothing retries it until the next reconfigure.

use crate::domain::types::{DeviceId, DiagnosticKind, DiagnosticLevel};
use crate::infra::metrics::Metrics;
use crate::services::sink::SignalSink;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPush {
    Applied,
    Failed,
}

#[derive(Debug)]
pub struct PollControl {
    checkin_interval_qs: u32,
    /// Interval the device last acknowledged, if any
    applied: Option<u32>,
    failures: u64,
}

impl PollControl {
    pub fn new(checkin_interval_qs: u32) -> Self {
        Self { checkin_interval_qs, applied: None, failures: 0 }
    }

    #[inline]
    pub fn applied(&self) -> Option<u32> {
        self.applied
    }

    #[inline]
    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn push(&mut self, sink: &dyn SignalSink, device: &DeviceId, metrics: &Metrics) -> PollPush {
        let qs = self.checkin_interval_qs;
        match sink.configure_poll_interval(device, qs) {
            Ok(()) => {
                self.applied = Some(qs);
                metrics.record_poll_config(true);
                info!(device = %device, checkin_interval_qs = %qs, "poll_config_applied");
                PollPush::Applied
            }
            Err(e) => {
                self.failures += 1;
                metrics.record_poll_config(false);
                warn!(
                    device = %device,
                    checkin_interval_qs = %qs,
                    failures = %self.failures,
                    error = %e,
                    "poll_config_failed"
                );
                sink.log_diagnostic(
                    device,
                    DiagnosticLevel::Warning,
                    DiagnosticKind::PollConfig,
                    &format!("failed to configure check-in interval: {e}"),
                );
                PollPush::Failed
            }
        }
    }
}
