//! Session table and event routing
//!
//! The SessionManager owns one task per device and routes inbound events to
//! them through bounded channels. Lifecycle events (start, end) are handled
//! here; everything else is forwarded with a non-blocking send.

use crate::domain::types::{DeviceId, DiagnosticKind, DiagnosticLevel, EventKind, SensorEvent};
use crate::infra::config::Timings;
use crate::infra::metrics::Metrics;
use crate::services::session::{DeviceSession, SessionInput, SessionSnapshot};
use crate::services::sink::SignalSink;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Per-session queue size; events beyond this are dropped
pub const SESSION_QUEUE_CAPACITY: usize = 64;

/// Minimum spacing between "queue full" warnings
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(1);

struct SessionHandle {
    tx: mpsc::Sender<SessionInput>,
    task: JoinHandle<()>,
}

pub struct SessionManager {
    sessions: FxHashMap<DeviceId, SessionHandle>,
    timings: Timings,
    sink: Arc<dyn SignalSink>,
    metrics: Arc<Metrics>,
    queue_capacity: usize,
    last_drop_warn: Option<std::time::Instant>,
}

impl SessionManager {
    pub fn new(timings: Timings, sink: Arc<dyn SignalSink>, metrics: Arc<Metrics>) -> Self {
        Self {
            sessions: FxHashMap::default(),
            timings,
            sink,
            metrics,
            queue_capacity: SESSION_QUEUE_CAPACITY,
            last_drop_warn: None,
        }
    }

    /// Override the per-session queue size
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_session(&self, device: &DeviceId) -> bool {
        self.sessions.contains_key(device)
    }

    /// Start sessions for devices known from configuration
    ///
    /// A service start is a new hub session: restored state is unknown and
    /// the startup guard will force a clear.
    pub fn start_configured(&mut self, names: &[String]) {
        let now = Instant::now();
        for name in names {
            let device = DeviceId::new(name);
            if !self.has_session(&device) {
                self.spawn_session(device, None, now);
            }
        }
        info!(devices = %self.sessions.len(), "configured_sessions_started");
    }

    /// Consume events until the channel closes or shutdown is signalled
    pub async fn run(
        &mut self,
        mut event_rx: mpsc::Receiver<SensorEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("session_manager_started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("session_manager_shutdown");
                        break;
                    }
                }
                event = event_rx.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => {
                        info!("event_channel_closed");
                        break;
                    }
                },
            }
        }
        self.shutdown().await;
    }

    /// Route one event, handling session lifecycle
    pub async fn dispatch(&mut self, event: SensorEvent) {
        match event.kind {
            EventKind::SessionStart { restored_occupancy } => {
                if self.end_session(&event.device).await {
                    info!(device = %event.device, "session_repaired");
                }
                self.spawn_session(event.device, restored_occupancy, event.received_at);
            }
            EventKind::SessionEnd => {
                if !self.end_session(&event.device).await {
                    debug!(device = %event.device, "session_end_unknown_device");
                }
            }
            _ => self.route(event),
        }
    }

    fn route(&mut self, event: SensorEvent) {
        if !self.has_session(&event.device) {
            info!(device = %event.device, kind = %event.kind.as_str(), "session_implicit_start");
            self.spawn_session(event.device.clone(), None, event.received_at);
        }
        let Some(handle) = self.sessions.get(&event.device) else {
            return;
        };

        match handle.tx.try_send(SessionInput::Event(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(SessionInput::Event(event))) => {
                self.metrics.record_session_event_dropped();
                let due = self.last_drop_warn.map_or(true, |t| t.elapsed() >= DROP_WARN_INTERVAL);
                if due {
                    warn!(device = %event.device, kind = %event.kind.as_str(), "session_event_dropped");
                    self.last_drop_warn = Some(std::time::Instant::now());
                }
            }
            Err(TrySendError::Closed(SessionInput::Event(event))) => {
                self.recover_lost_session(event);
            }
            Err(_) => {}
        }
    }

    /// The session task is gone: report it, recreate it and redeliver
    fn recover_lost_session(&mut self, event: SensorEvent) {
        let device = event.device.clone();
        error!(device = %device, "session_unavailable");
        self.metrics.record_session_lost();
        self.sink.log_diagnostic(
            &device,
            DiagnosticLevel::Critical,
            DiagnosticKind::SessionUnavailable,
            "session task unreachable, recreating",
        );

        if let Some(lost) = self.sessions.remove(&device) {
            lost.task.abort();
        }
        self.spawn_session(device.clone(), None, event.received_at);
        if let Some(handle) = self.sessions.get(&device) {
            if handle.tx.try_send(SessionInput::Event(event)).is_err() {
                self.metrics.record_session_event_dropped();
            }
        }
    }

    fn spawn_session(&mut self, device: DeviceId, restored: Option<bool>, now: Instant) {
        self.metrics.record_session_started(&device);
        let session = DeviceSession::start(
            device.clone(),
            &self.timings,
            restored,
            self.sink.clone(),
            self.metrics.clone(),
            now,
        );
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let task = tokio::spawn(session.run(rx));
        self.sessions.insert(device, SessionHandle { tx, task });
    }

    /// End a session and wait for its task; false if there was none
    pub async fn end_session(&mut self, device: &DeviceId) -> bool {
        let Some(SessionHandle { tx, task }) = self.sessions.remove(device) else {
            return false;
        };
        drop(tx);
        if let Err(e) = task.await {
            warn!(device = %device, error = %e, "session_task_failed");
        }
        true
    }

    /// End every session, cancelling all pending timers
    pub async fn shutdown(&mut self) {
        let devices: Vec<DeviceId> = self.sessions.keys().cloned().collect();
        for device in &devices {
            self.end_session(device).await;
        }
        info!(sessions = %devices.len(), "all_sessions_ended");
    }

    /// Ask a session for its current state
    pub async fn snapshot(&self, device: &DeviceId) -> Option<SessionSnapshot> {
        let handle = self.sessions.get(device)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        handle.tx.send(SessionInput::Snapshot(reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }

    /// Abort a session task without ending it, as if it had died
    #[cfg(test)]
    async fn kill_session(&mut self, device: &DeviceId) {
        if let Some(handle) = self.sessions.get_mut(device) {
            handle.task.abort();
            let _ = (&mut handle.task).await;
        }
    }
}
