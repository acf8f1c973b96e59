//! Typed channel for MQTT egress messages
//!
//! Provides a non-blocking way to send derived signals to the MQTT publisher.
//! Uses bounded mpsc channels to prevent unbounded memory growth. Occupancy
//! never gets lost to a full channel: the latest value per device is kept
//! aside and delivered once the queue drains.

use crate::domain::types::{epoch_ms, DeviceId, DiagnosticKind, DiagnosticLevel};
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_NUM_BUCKETS};
use crate::services::sink::SignalSink;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Messages that can be sent to the MQTT publisher
#[derive(Debug)]
pub enum EgressMessage {
    /// Derived occupancy (retained)
    Occupancy(OccupancyPayload),
    /// Raw hardware motion passthrough
    Motion(MotionPayload),
    Battery(BatteryPayload),
    Diagnostic(DiagnosticPayload),
    /// Check-in interval for the device's poll control cluster
    PollConfig(PollConfigPayload),
    /// Periodic metrics snapshot
    Metrics(MetricsPayload),
}

impl EgressMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            EgressMessage::Occupancy(_) => "occupancy",
            EgressMessage::Motion(_) => "motion",
            EgressMessage::Battery(_) => "battery",
            EgressMessage::Diagnostic(_) => "diagnostic",
            EgressMessage::PollConfig(_) => "poll_config",
            EgressMessage::Metrics(_) => "metrics",
        }
    }

    /// Device the message is about, if any
    pub fn device(&self) -> Option<&str> {
        match self {
            EgressMessage::Occupancy(p) => Some(&p.device),
            EgressMessage::Motion(p) => Some(&p.device),
            EgressMessage::Battery(p) => Some(&p.device),
            EgressMessage::Diagnostic(p) => Some(&p.device),
            EgressMessage::PollConfig(p) => Some(&p.device),
            EgressMessage::Metrics(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OccupancyPayload {
    pub site: String,
    pub device: String,
    pub occupied: bool,
    /// Timestamp (epoch ms)
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MotionPayload {
    pub site: String,
    pub device: String,
    pub motion: bool,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatteryPayload {
    pub site: String,
    pub device: String,
    pub percent: u8,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticPayload {
    pub site: String,
    pub device: String,
    pub level: DiagnosticLevel,
    pub kind: DiagnosticKind,
    pub message: String,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollConfigPayload {
    pub site: String,
    pub device: String,
    /// Check-in interval in quarter seconds
    pub checkin_interval_qs: u32,
    pub ts: u64,
}

/// Payload for metrics snapshot
#[derive(Debug, Serialize)]
pub struct MetricsPayload {
    /// Site identifier
    pub site: String,
    /// Timestamp (epoch ms)
    pub ts: u64,
    /// Total events processed
    pub events_total: u64,
    /// Events per second
    pub events_per_sec: f64,
    /// Average processing latency (microseconds)
    pub avg_latency_us: u64,
    /// Max processing latency (microseconds)
    pub max_latency_us: u64,
    /// Event handling latency histogram buckets (Prometheus-style exponential)
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; METRICS_NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p99_us: u64,
    pub sessions: usize,
    pub occupied: usize,
    pub motion_accepted: u64,
    pub clears: u64,
    pub clears_reclassified: u64,
    pub clears_ignored: u64,
    pub clear_timers_fired: u64,
    pub startup_clears_forced: u64,
    pub malformed_reports: u64,
    pub warnings: u64,
    pub poll_configs_failed: u64,
    pub events_dropped: u64,
    pub sessions_lost: u64,
    /// Current event queue depth (snapshot)
    pub event_queue_depth: u64,
}

impl MetricsPayload {
    pub fn from_summary(summary: &MetricsSummary, site: String) -> Self {
        Self {
            site,
            ts: epoch_ms(),
            events_total: summary.events_total,
            events_per_sec: summary.events_per_sec,
            avg_latency_us: summary.avg_process_latency_us,
            max_latency_us: summary.max_process_latency_us,
            lat_buckets: summary.lat_buckets,
            lat_p50_us: summary.lat_p50_us,
            lat_p99_us: summary.lat_p99_us,
            sessions: summary.active_sessions,
            occupied: summary.occupied_sessions,
            motion_accepted: summary.motion_accepted_total,
            clears: summary.clears_total,
            clears_reclassified: summary.clears_reclassified_total,
            clears_ignored: summary.clears_ignored_total,
            clear_timers_fired: summary.clear_timers_fired,
            startup_clears_forced: summary.startup_clears_forced,
            malformed_reports: summary.malformed_reports,
            warnings: summary.tamper_warnings
                + summary.low_battery_warnings
                + summary.supervision_warnings
                + summary.stuck_warnings
                + summary.silent_warnings,
            poll_configs_failed: summary.poll_configs_failed,
            events_dropped: summary.ingress_events_dropped + summary.session_events_dropped,
            sessions_lost: summary.sessions_lost,
            event_queue_depth: summary.event_queue_depth,
        }
    }
}

/// Minimum spacing between "egress full" warnings
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Latest occupancy per device that did not fit into the channel
///
/// Shared by sender and receiver. An entry is replaced by every newer
/// occupancy for the device and removed once a newer one is queued, so the
/// receiver only ever hands out the last transition.
type PendingOccupancy = Arc<Mutex<FxHashMap<String, OccupancyPayload>>>;

/// Sender handle for egress messages
///
/// Clone this to share across multiple producers. Non-blocking: when the
/// channel is full, occupancy is parked for the receiver and every other
/// signal is dropped, counted and warned about.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    site_id: String,
    pending: PendingOccupancy,
    metrics: Arc<Metrics>,
    last_drop_warn: Arc<Mutex<Option<Instant>>>,
}

impl EgressSender {
    /// Send a metrics snapshot
    pub fn send_metrics(&self, summary: &MetricsSummary) {
        let payload = MetricsPayload::from_summary(summary, self.site_id.clone());
        self.send(EgressMessage::Metrics(payload));
    }

    fn send(&self, msg: EgressMessage) {
        if let Err(e) = self.tx.try_send(msg) {
            let msg = match e {
                TrySendError::Full(msg) | TrySendError::Closed(msg) => msg,
            };
            self.record_drop(&msg);
        }
    }

    /// Queue an occupancy update, parking it when the channel is full
    fn send_occupancy(&self, payload: OccupancyPayload) {
        let mut pending = self.pending.lock();
        let device = payload.device.clone();
        match self.tx.try_send(EgressMessage::Occupancy(payload)) {
            Ok(()) => {
                pending.remove(&device);
            }
            Err(TrySendError::Full(EgressMessage::Occupancy(payload))) => {
                pending.insert(device.clone(), payload);
                drop(pending);
                self.warn_full(&device, "occupancy_parked");
            }
            Err(TrySendError::Full(msg)) | Err(TrySendError::Closed(msg)) => {
                drop(pending);
                self.record_drop(&msg);
            }
        }
    }

    fn record_drop(&self, msg: &EgressMessage) {
        self.metrics.record_egress_signal_dropped();
        self.warn_full(msg.device().unwrap_or("-"), msg.kind());
    }

    fn warn_full(&self, device: &str, what: &str) {
        let mut last = self.last_drop_warn.lock();
        if last.map_or(true, |t| t.elapsed() >= DROP_WARN_INTERVAL) {
            warn!(device = %device, signal = %what, "mqtt_egress_backpressure");
            *last = Some(Instant::now());
        }
    }
}

/// Receiving end of the egress channel
///
/// Yields queued messages in order and parked occupancy once the queue has
/// drained.
pub struct EgressReceiver {
    rx: mpsc::Receiver<EgressMessage>,
    pending: PendingOccupancy,
}

impl EgressReceiver {
    /// Next message without waiting
    pub fn try_recv(&mut self) -> Option<EgressMessage> {
        match self.rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(_) => self.take_pending(),
        }
    }

    /// Next message; `None` once every sender is gone and nothing is parked
    ///
    /// Cancel safe: the only await point is the channel receive.
    pub async fn recv(&mut self) -> Option<EgressMessage> {
        if let Some(msg) = self.try_recv() {
            return Some(msg);
        }
        // Occupancy is parked only while the channel is full, so a parked
        // entry always has a queued message behind it to wake us
        self.rx.recv().await
    }

    fn take_pending(&self) -> Option<EgressMessage> {
        let mut pending = self.pending.lock();
        let device = pending.keys().next().cloned()?;
        pending.remove(&device).map(EgressMessage::Occupancy)
    }
}

impl SignalSink for EgressSender {
    fn set_occupancy(&self, device: &DeviceId, occupied: bool) {
        self.send_occupancy(OccupancyPayload {
            site: self.site_id.clone(),
            device: device.to_string(),
            occupied,
            ts: epoch_ms(),
        });
    }

    fn set_motion_zone_state(&self, device: &DeviceId, motion: bool) {
        self.send(EgressMessage::Motion(MotionPayload {
            site: self.site_id.clone(),
            device: device.to_string(),
            motion,
            ts: epoch_ms(),
        }));
    }

    fn set_battery_percentage(&self, device: &DeviceId, percent: u8) {
        self.send(EgressMessage::Battery(BatteryPayload {
            site: self.site_id.clone(),
            device: device.to_string(),
            percent,
            ts: epoch_ms(),
        }));
    }

    fn log_diagnostic(
        &self,
        device: &DeviceId,
        level: DiagnosticLevel,
        kind: DiagnosticKind,
        message: &str,
    ) {
        self.send(EgressMessage::Diagnostic(DiagnosticPayload {
            site: self.site_id.clone(),
            device: device.to_string(),
            level,
            kind,
            message: message.to_string(),
            ts: epoch_ms(),
        }));
    }

    /// Unlike the other signals a poll config push reports back: a full or
    /// closed channel is a failed push.
    fn configure_poll_interval(
        &self,
        device: &DeviceId,
        quarter_seconds: u32,
    ) -> anyhow::Result<()> {
        let msg = EgressMessage::PollConfig(PollConfigPayload {
            site: self.site_id.clone(),
            device: device.to_string(),
            checkin_interval_qs: quarter_seconds,
            ts: epoch_ms(),
        });
        self.tx.try_send(msg).map_err(|e| {
            self.metrics.record_egress_signal_dropped();
            anyhow::anyhow!("egress unavailable: {e}")
        })
    }
}

/// Create a new egress channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
/// Buffer size determines how many messages can be queued.
pub fn create_egress_channel(
    buffer_size: usize,
    site_id: String,
    metrics: Arc<Metrics>,
) -> (EgressSender, EgressReceiver) {
    let (tx, rx) = mpsc::channel(buffer_size);
    let pending: PendingOccupancy = Arc::new(Mutex::new(FxHashMap::default()));
    let sender = EgressSender {
        tx,
        site_id,
        pending: pending.clone(),
        metrics,
        last_drop_warn: Arc::new(Mutex::new(None)),
    };
    (sender, EgressReceiver { rx, pending })
}
