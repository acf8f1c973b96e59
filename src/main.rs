//! Motion shim - occupancy inference for a stuck-prone motion sensor
//!
//! Derives a trustworthy occupancy signal from raw sensor reports with a
//! software-enforced timeout and stuck-sensor recovery.
//!
//! Module structure:
//! - `domain/` - Core types (DeviceId, SensorEvent, ZoneStatus)
//! - `io/` - External interfaces (MQTT ingress/egress, Prometheus)
//! - `services/` - Occupancy engine (state machine, sessions, manager)
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use motion_shim::infra::{Config, LogFormat, Metrics};
use motion_shim::io::{create_egress_channel, MqttPublisher};
use motion_shim::services::{LogSink, SessionManager, SignalSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Ingress event queue size (bounded for backpressure)
const EVENT_QUEUE_CAPACITY: usize = 1000;

/// Egress message queue size
const EGRESS_QUEUE_CAPACITY: usize = 1000;

/// Motion shim - virtual occupancy for unreliable motion sensors
#[derive(Parser, Debug)]
#[command(name = "motion-shim", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,
}

/// Initialize structured logging
///
/// RUST_LOG wins when set; otherwise the level comes from `[logging] level`.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    match config.log_format() {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config_path = args.config;

    // Logging depends on config, so a load failure is reported after init
    let (config, load_error) = match Config::from_file(&config_path) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    init_logging(&config);

    info!(version = %env!("CARGO_PKG_VERSION"), git = %env!("GIT_HASH"), "motion-shim starting");
    if let Some(e) = load_error {
        warn!(config_file = %config_path, error = %format!("{e:#}"), "config_load_failed_using_defaults");
    }

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        report_filter = %config.mqtt_report_filter(),
        motion_timeout_s = %config.motion_timeout_secs(),
        stuck_motion_threshold_s = %config.stuck_motion_threshold_secs(),
        startup_guard_s = %config.startup_guard_delay_secs(),
        health_interval_s = %config.health_interval_secs(),
        checkin_interval_qs = %config.checkin_interval_qs(),
        devices = ?config.device_names(),
        prometheus_port = %config.prometheus_port(),
        egress = %config.egress_enabled(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // Egress stops after sessions have flushed their final signals
    let (egress_shutdown_tx, egress_shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());

    // Create MQTT egress channel and publisher (if enabled)
    let (sink, egress) = if config.egress_enabled() {
        let (egress_sender, egress_rx) = create_egress_channel(
            EGRESS_QUEUE_CAPACITY,
            config.site_id().to_string(),
            metrics.clone(),
        );

        let publisher = MqttPublisher::new(&config, egress_rx);
        let publisher_task = tokio::spawn(publisher.run(egress_shutdown_rx));

        // Start metrics egress publisher (separate from logging)
        let metrics_egress = egress_sender.clone();
        let metrics_for_egress = metrics.clone();
        let egress_interval = config.egress_metrics_interval_secs();
        let mut metrics_egress_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(egress_interval));
            loop {
                tokio::select! {
                    _ = interval.tick() => metrics_egress.send_metrics(&metrics_for_egress.snapshot()),
                    _ = metrics_egress_shutdown.changed() => break,
                }
            }
        });

        let sink: Arc<dyn SignalSink> = Arc::new(egress_sender);
        (sink, Some(publisher_task))
    } else {
        info!("mqtt_egress_disabled");
        let sink: Arc<dyn SignalSink> = Arc::new(LogSink);
        (sink, None)
    };

    // Create event channel (bounded for backpressure)
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

    // Start MQTT ingress
    let mqtt_config = config.clone();
    let mqtt_tx = event_tx.clone();
    let mqtt_metrics = metrics.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) =
            motion_shim::io::mqtt::start_mqtt_client(&mqtt_config, mqtt_tx, mqtt_metrics, mqtt_shutdown)
                .await
        {
            tracing::error!(error = %format!("{e:#}"), "mqtt_client_error");
        }
    });

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = motion_shim::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %format!("{e:#}"), "prometheus_server_error");
            }
        });
    }

    // Start metrics reporter and queue depth sampler
    let reporter_metrics = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    let sampler_tx = event_tx;
    let mut reporter_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut report = tokio::time::interval(Duration::from_secs(metrics_interval));
        let mut sample = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = report.tick() => reporter_metrics.report().log(),
                _ = sample.tick() => {
                    let depth = sampler_tx.max_capacity() - sampler_tx.capacity();
                    reporter_metrics.set_event_queue_depth(depth as u64);
                }
                _ = reporter_shutdown.changed() => break,
            }
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Run sessions until shutdown; ends every session on the way out
    let mut manager = SessionManager::new(config.timings(), sink, metrics.clone());
    manager.start_configured(config.device_names());
    manager.run(event_rx, shutdown_rx).await;
    drop(manager);

    let _ = egress_shutdown_tx.send(true);
    if let Some(task) = egress {
        if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
            warn!("mqtt_egress_drain_timeout");
        }
    }

    metrics.report().log();
    info!("motion-shim shutdown complete");
    Ok(())
}
