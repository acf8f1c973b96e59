//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Counter updates are lock-free. `report()` resets interval counters via
//! atomic swap; `snapshot()` reads without resetting.
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical counters
//! only; do NOT use them for coordination or logic decisions.

use crate::domain::types::{DeviceId, DiagnosticKind};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Last published state of one device, for per-device gauges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceGauge {
    pub occupied: bool,
    pub motion_events: u64,
    pub clear_events: u64,
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics, except the
/// per-device gauge table which is written once per transition.
pub struct Metrics {
    /// Total events processed (monotonic)
    events_total: AtomicU64,
    /// Events since last report (reset on report)
    events_since_report: AtomicU64,
    /// Sum of latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Event handling latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Zone status reports decoded (monotonic)
    zone_status_reports: AtomicU64,
    /// Zone status reports that failed to decode (monotonic)
    malformed_reports: AtomicU64,
    /// Motion accepted, including reclassified clears (monotonic)
    motion_accepted_total: AtomicU64,
    /// Hardware clears received (monotonic)
    clears_total: AtomicU64,
    /// Hardware clears reinterpreted as motion (monotonic)
    clears_reclassified_total: AtomicU64,
    /// Hardware clears ignored as fast cycles (monotonic)
    clears_ignored_total: AtomicU64,
    /// Clear timers that fired (monotonic)
    clear_timers_fired: AtomicU64,
    /// Startup guards that forced a clear (monotonic)
    startup_clears_forced: AtomicU64,
    /// Startup guards cancelled by real motion (monotonic)
    startup_guards_cancelled: AtomicU64,
    /// Check-ins received (monotonic)
    check_ins_total: AtomicU64,
    /// Warnings by kind (monotonic)
    tamper_warnings: AtomicU64,
    low_battery_warnings: AtomicU64,
    supervision_warnings: AtomicU64,
    stuck_warnings: AtomicU64,
    silent_warnings: AtomicU64,
    /// Poll interval pushes (monotonic)
    poll_configs_sent: AtomicU64,
    poll_configs_failed: AtomicU64,
    /// Events dropped because the ingress channel was full (monotonic)
    ingress_events_dropped: AtomicU64,
    /// Events dropped because a session queue was full (monotonic)
    session_events_dropped: AtomicU64,
    /// Outbound signals the egress channel could not take (monotonic)
    egress_signals_dropped: AtomicU64,
    /// Sessions found unreachable and recreated (monotonic)
    sessions_lost: AtomicU64,
    /// Sessions started / ended (monotonic)
    sessions_started: AtomicU64,
    sessions_ended: AtomicU64,
    /// Current event queue depth (updated by sampler)
    event_queue_depth: AtomicU64,
    /// Per-device gauges keyed by device name
    devices: parking_lot::RwLock<FxHashMap<String, DeviceGauge>>,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_total: AtomicU64::new(0),
            events_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            zone_status_reports: AtomicU64::new(0),
            malformed_reports: AtomicU64::new(0),
            motion_accepted_total: AtomicU64::new(0),
            clears_total: AtomicU64::new(0),
            clears_reclassified_total: AtomicU64::new(0),
            clears_ignored_total: AtomicU64::new(0),
            clear_timers_fired: AtomicU64::new(0),
            startup_clears_forced: AtomicU64::new(0),
            startup_guards_cancelled: AtomicU64::new(0),
            check_ins_total: AtomicU64::new(0),
            tamper_warnings: AtomicU64::new(0),
            low_battery_warnings: AtomicU64::new(0),
            supervision_warnings: AtomicU64::new(0),
            stuck_warnings: AtomicU64::new(0),
            silent_warnings: AtomicU64::new(0),
            poll_configs_sent: AtomicU64::new(0),
            poll_configs_failed: AtomicU64::new(0),
            ingress_events_dropped: AtomicU64::new(0),
            session_events_dropped: AtomicU64::new(0),
            egress_signals_dropped: AtomicU64::new(0),
            sessions_lost: AtomicU64::new(0),
            sessions_started: AtomicU64::new(0),
            sessions_ended: AtomicU64::new(0),
            event_queue_depth: AtomicU64::new(0),
            devices: parking_lot::RwLock::new(FxHashMap::default()),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record an event was handled with given latency (lock-free)
    #[inline]
    pub fn record_event_processed(&self, latency_us: u64) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        self.events_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_zone_status(&self, malformed: bool) {
        self.zone_status_reports.fetch_add(1, Ordering::Relaxed);
        if malformed {
            self.malformed_reports.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_motion_accepted(&self) {
        self.motion_accepted_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a hardware clear and whether it was reinterpreted as motion
    #[inline]
    pub fn record_clear(&self, reclassified: bool) {
        self.clears_total.fetch_add(1, Ordering::Relaxed);
        if reclassified {
            self.clears_reclassified_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.clears_ignored_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_clear_timer_fired(&self) {
        self.clear_timers_fired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_startup_clear_forced(&self) {
        self.startup_clears_forced.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_startup_guard_cancelled(&self) {
        self.startup_guards_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_check_in(&self) {
        self.check_ins_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a warning raised for a device (lock-free)
    #[inline]
    pub fn record_warning(&self, kind: DiagnosticKind) {
        let counter = match kind {
            DiagnosticKind::Tamper => &self.tamper_warnings,
            DiagnosticKind::LowBattery => &self.low_battery_warnings,
            DiagnosticKind::SupervisionFailure => &self.supervision_warnings,
            DiagnosticKind::StuckOccupancy => &self.stuck_warnings,
            DiagnosticKind::SilentDevice => &self.silent_warnings,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_poll_config(&self, ok: bool) {
        if ok {
            self.poll_configs_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.poll_configs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_ingress_event_dropped(&self) {
        self.ingress_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_event_dropped(&self) {
        self.session_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_egress_signal_dropped(&self) {
        self.egress_signals_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_session_lost(&self) {
        self.sessions_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_started(&self, device: &DeviceId) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.devices.write().insert(device.as_str().to_string(), DeviceGauge::default());
    }

    pub fn record_session_ended(&self, device: &DeviceId) {
        self.sessions_ended.fetch_add(1, Ordering::Relaxed);
        self.devices.write().remove(device.as_str());
    }

    /// Update the per-device gauge after a state change
    pub fn set_device_gauge(&self, device: &DeviceId, gauge: DeviceGauge) {
        let mut devices = self.devices.write();
        match devices.get_mut(device.as_str()) {
            Some(entry) => *entry = gauge,
            None => {
                devices.insert(device.as_str().to_string(), gauge);
            }
        }
    }

    /// Snapshot of per-device gauges, sorted by device name
    pub fn device_gauges(&self) -> Vec<(String, DeviceGauge)> {
        let mut gauges: Vec<(String, DeviceGauge)> =
            self.devices.read().iter().map(|(name, gauge)| (name.clone(), *gauge)).collect();
        gauges.sort_by(|a, b| a.0.cmp(&b.0));
        gauges
    }

    /// Set current event queue depth (called by sampler)
    #[inline]
    pub fn set_event_queue_depth(&self, depth: u64) {
        self.event_queue_depth.store(depth, Ordering::Relaxed);
    }

    #[inline]
    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn motion_accepted_total(&self) -> u64 {
        self.motion_accepted_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn clear_timers_fired(&self) -> u64 {
        self.clear_timers_fired.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn malformed_reports(&self) -> u64 {
        self.malformed_reports.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn poll_configs_failed(&self) -> u64 {
        self.poll_configs_failed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn egress_signals_dropped(&self) -> u64 {
        self.egress_signals_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sessions_lost(&self) -> u64 {
        self.sessions_lost.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        self.summarize(true)
    }

    /// Same as [`Metrics::report`] but leaves every counter in place, for scrapes
    pub fn snapshot(&self) -> MetricsSummary {
        self.summarize(false)
    }

    fn summarize(&self, reset: bool) -> MetricsSummary {
        let take = |atomic: &AtomicU64| {
            if reset {
                atomic.swap(0, Ordering::Relaxed)
            } else {
                atomic.load(Ordering::Relaxed)
            }
        };
        let events_count = take(&self.events_since_report);
        let latency_sum = take(&self.latency_sum_us);
        let max_latency = take(&self.latency_max_us);
        let lat_buckets = if reset {
            swap_buckets(&self.latency_buckets)
        } else {
            std::array::from_fn(|i| self.latency_buckets[i].load(Ordering::Relaxed))
        };

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            if reset {
                *last = Instant::now();
            }
            elapsed
        };

        let events_per_sec = if elapsed.as_secs_f64() > 0.0 {
            events_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if events_count > 0 { latency_sum / events_count } else { 0 };

        let (active_sessions, occupied_sessions) = {
            let devices = self.devices.read();
            (devices.len(), devices.values().filter(|g| g.occupied).count())
        };

        MetricsSummary {
            events_total: self.events_total.load(Ordering::Relaxed),
            events_per_sec,
            avg_process_latency_us: avg_latency,
            max_process_latency_us: max_latency,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            lat_buckets,
            active_sessions,
            occupied_sessions,
            zone_status_reports: self.zone_status_reports.load(Ordering::Relaxed),
            malformed_reports: self.malformed_reports.load(Ordering::Relaxed),
            motion_accepted_total: self.motion_accepted_total.load(Ordering::Relaxed),
            clears_total: self.clears_total.load(Ordering::Relaxed),
            clears_reclassified_total: self.clears_reclassified_total.load(Ordering::Relaxed),
            clears_ignored_total: self.clears_ignored_total.load(Ordering::Relaxed),
            clear_timers_fired: self.clear_timers_fired.load(Ordering::Relaxed),
            startup_clears_forced: self.startup_clears_forced.load(Ordering::Relaxed),
            startup_guards_cancelled: self.startup_guards_cancelled.load(Ordering::Relaxed),
            check_ins_total: self.check_ins_total.load(Ordering::Relaxed),
            tamper_warnings: self.tamper_warnings.load(Ordering::Relaxed),
            low_battery_warnings: self.low_battery_warnings.load(Ordering::Relaxed),
            supervision_warnings: self.supervision_warnings.load(Ordering::Relaxed),
            stuck_warnings: self.stuck_warnings.load(Ordering::Relaxed),
            silent_warnings: self.silent_warnings.load(Ordering::Relaxed),
            poll_configs_sent: self.poll_configs_sent.load(Ordering::Relaxed),
            poll_configs_failed: self.poll_configs_failed.load(Ordering::Relaxed),
            ingress_events_dropped: self.ingress_events_dropped.load(Ordering::Relaxed),
            session_events_dropped: self.session_events_dropped.load(Ordering::Relaxed),
            egress_signals_dropped: self.egress_signals_dropped.load(Ordering::Relaxed),
            sessions_lost: self.sessions_lost.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_ended: self.sessions_ended.load(Ordering::Relaxed),
            event_queue_depth: self.event_queue_depth.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for egress)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub events_total: u64,
    pub events_per_sec: f64,
    pub avg_process_latency_us: u64,
    pub max_process_latency_us: u64,
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p99_us: u64,
    pub active_sessions: usize,
    pub occupied_sessions: usize,
    pub zone_status_reports: u64,
    pub malformed_reports: u64,
    pub motion_accepted_total: u64,
    pub clears_total: u64,
    pub clears_reclassified_total: u64,
    pub clears_ignored_total: u64,
    pub clear_timers_fired: u64,
    pub startup_clears_forced: u64,
    pub startup_guards_cancelled: u64,
    pub check_ins_total: u64,
    pub tamper_warnings: u64,
    pub low_battery_warnings: u64,
    pub supervision_warnings: u64,
    pub stuck_warnings: u64,
    pub silent_warnings: u64,
    pub poll_configs_sent: u64,
    pub poll_configs_failed: u64,
    pub ingress_events_dropped: u64,
    pub session_events_dropped: u64,
    pub egress_signals_dropped: u64,
    pub sessions_lost: u64,
    pub sessions_started: u64,
    pub sessions_ended: u64,
    pub event_queue_depth: u64,
}

impl MetricsSummary {
    /// Log the summary as a single structured line
    pub fn log(&self) {
        info!(
            events_total = %self.events_total,
            events_per_sec = %format!("{:.2}", self.events_per_sec),
            avg_latency_us = %self.avg_process_latency_us,
            max_latency_us = %self.max_process_latency_us,
            lat_p99_us = %self.lat_p99_us,
            sessions = %self.active_sessions,
            occupied = %self.occupied_sessions,
            motion_accepted = %self.motion_accepted_total,
            clears = %self.clears_total,
            clears_reclassified = %self.clears_reclassified_total,
            clears_ignored = %self.clears_ignored_total,
            timers_fired = %self.clear_timers_fired,
            startup_clears = %self.startup_clears_forced,
            malformed = %self.malformed_reports,
            dropped = %(self.ingress_events_dropped + self.session_events_dropped),
            egress_dropped = %self.egress_signals_dropped,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(50), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(60000), 10);
    }

    #[test]
    fn test_report_resets_periodic_counters_only() {
        let metrics = Metrics::new();
        metrics.record_event_processed(150);
        metrics.record_event_processed(90);
        metrics.record_motion_accepted();

        let first = metrics.report();
        assert_eq!(first.events_total, 2);
        assert_eq!(first.max_process_latency_us, 150);
        assert_eq!(first.avg_process_latency_us, 120);
        assert_eq!(first.lat_buckets[0], 1);
        assert_eq!(first.lat_buckets[1], 1);

        let second = metrics.report();
        assert_eq!(second.events_total, 2);
        assert_eq!(second.max_process_latency_us, 0);
        assert_eq!(second.motion_accepted_total, 1);
    }

    #[test]
    fn test_snapshot_does_not_reset() {
        let metrics = Metrics::new();
        metrics.record_event_processed(150);

        assert_eq!(metrics.snapshot().lat_buckets[1], 1);
        assert_eq!(metrics.snapshot().lat_buckets[1], 1);
        assert_eq!(metrics.report().lat_buckets[1], 1);
        assert_eq!(metrics.snapshot().lat_buckets[1], 0);
    }

    #[test]
    fn test_clear_classification_counters() {
        let metrics = Metrics::new();
        metrics.record_clear(true);
        metrics.record_clear(false);
        metrics.record_clear(false);

        let summary = metrics.report();
        assert_eq!(summary.clears_total, 3);
        assert_eq!(summary.clears_reclassified_total, 1);
        assert_eq!(summary.clears_ignored_total, 2);
    }

    #[test]
    fn test_device_gauges_follow_sessions() {
        let metrics = Metrics::new();
        let hall = DeviceId::new("hall");
        let attic = DeviceId::new("attic");
        metrics.record_session_started(&hall);
        metrics.record_session_started(&attic);
        metrics.set_device_gauge(
            &hall,
            DeviceGauge { occupied: true, motion_events: 1, clear_events: 0 },
        );

        let summary = metrics.report();
        assert_eq!(summary.active_sessions, 2);
        assert_eq!(summary.occupied_sessions, 1);

        let gauges = metrics.device_gauges();
        assert_eq!(gauges[0].0, "attic");
        assert!(gauges[1].1.occupied);

        metrics.record_session_ended(&hall);
        assert_eq!(metrics.device_gauges().len(), 1);
    }

    #[test]
    fn test_warning_counters_by_kind() {
        let metrics = Metrics::new();
        metrics.record_warning(DiagnosticKind::Tamper);
        metrics.record_warning(DiagnosticKind::SilentDevice);
        metrics.record_warning(DiagnosticKind::MotionCounts);

        let summary = metrics.report();
        assert_eq!(summary.tamper_warnings, 1);
        assert_eq!(summary.silent_warnings, 1);
        assert_eq!(summary.stuck_warnings, 0);
    }
}
