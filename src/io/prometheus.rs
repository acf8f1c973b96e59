//! Prometheus metrics HTTP endpoint
//!
//! Exposes shim metrics in Prometheus text format at /metrics and a liveness
//! probe at /health. Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use anyhow::Context;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_event_metrics(&mut output, site_id, &summary);
    write_occupancy_metrics(&mut output, site_id, &summary);
    write_warning_metrics(&mut output, site_id, &summary);
    write_session_metrics(&mut output, site_id, &summary);
    write_device_metrics(&mut output, site_id, metrics);

    output
}

fn write_event_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "motion_shim_events_total",
        "Total events processed by sessions",
        MetricType::Counter,
        site,
        summary.events_total,
    );
    write_histogram(
        output,
        "motion_shim_event_latency_us",
        "Event handling latency in microseconds",
        site,
        &summary.lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.avg_process_latency_us,
    );
    write_metric(
        output,
        "motion_shim_zone_status_reports_total",
        "Zone status reports received",
        MetricType::Counter,
        site,
        summary.zone_status_reports,
    );
    write_metric(
        output,
        "motion_shim_malformed_reports_total",
        "Zone status reports that failed to decode",
        MetricType::Counter,
        site,
        summary.malformed_reports,
    );
    write_metric(
        output,
        "motion_shim_check_ins_total",
        "Poll control check-ins received",
        MetricType::Counter,
        site,
        summary.check_ins_total,
    );
    write_metric(
        output,
        "motion_shim_ingress_dropped_total",
        "Events dropped because the ingress queue was full",
        MetricType::Counter,
        site,
        summary.ingress_events_dropped,
    );
    write_metric(
        output,
        "motion_shim_session_dropped_total",
        "Events dropped because a session queue was full",
        MetricType::Counter,
        site,
        summary.session_events_dropped,
    );
    write_metric(
        output,
        "motion_shim_egress_signals_dropped_total",
        "Outbound signals the egress channel could not take",
        MetricType::Counter,
        site,
        summary.egress_signals_dropped,
    );
    write_metric(
        output,
        "motion_shim_event_queue_depth",
        "Current ingress queue depth",
        MetricType::Gauge,
        site,
        summary.event_queue_depth,
    );
}

fn write_occupancy_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "motion_shim_motion_accepted_total",
        "Motion accepted, including reclassified clears",
        MetricType::Counter,
        site,
        summary.motion_accepted_total,
    );
    write_metric(
        output,
        "motion_shim_clears_total",
        "Hardware clear reports",
        MetricType::Counter,
        site,
        summary.clears_total,
    );
    write_metric(
        output,
        "motion_shim_clears_reclassified_total",
        "Hardware clears treated as motion (stuck sensor reset)",
        MetricType::Counter,
        site,
        summary.clears_reclassified_total,
    );
    write_metric(
        output,
        "motion_shim_clears_ignored_total",
        "Hardware clears ignored as fast cycles",
        MetricType::Counter,
        site,
        summary.clears_ignored_total,
    );
    write_metric(
        output,
        "motion_shim_clear_timers_fired_total",
        "Occupancy cleared by the motion timeout",
        MetricType::Counter,
        site,
        summary.clear_timers_fired,
    );
    write_metric(
        output,
        "motion_shim_startup_clears_total",
        "Occupancy forced clear by the startup guard",
        MetricType::Counter,
        site,
        summary.startup_clears_forced,
    );
    write_metric(
        output,
        "motion_shim_startup_guards_cancelled_total",
        "Startup guards cancelled by real motion",
        MetricType::Counter,
        site,
        summary.startup_guards_cancelled,
    );
    write_metric(
        output,
        "motion_shim_occupied_devices",
        "Devices currently occupied",
        MetricType::Gauge,
        site,
        summary.occupied_sessions as u64,
    );
}

fn write_warning_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let name = "motion_shim_warnings_total";
    let _ = writeln!(output, "# HELP {name} Device warnings raised by kind");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (kind, val) in [
        ("tamper", summary.tamper_warnings),
        ("low_battery", summary.low_battery_warnings),
        ("supervision_failure", summary.supervision_warnings),
        ("stuck_occupancy", summary.stuck_warnings),
        ("silent_device", summary.silent_warnings),
    ] {
        let _ = writeln!(output, "{name}{{site=\"{site}\",kind=\"{kind}\"}} {val}");
    }

    write_metric(
        output,
        "motion_shim_poll_configs_sent_total",
        "Check-in interval pushes acknowledged",
        MetricType::Counter,
        site,
        summary.poll_configs_sent,
    );
    write_metric(
        output,
        "motion_shim_poll_configs_failed_total",
        "Check-in interval pushes that failed",
        MetricType::Counter,
        site,
        summary.poll_configs_failed,
    );
}

fn write_session_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "motion_shim_sessions",
        "Active device sessions",
        MetricType::Gauge,
        site,
        summary.active_sessions as u64,
    );
    write_metric(
        output,
        "motion_shim_sessions_started_total",
        "Device sessions started",
        MetricType::Counter,
        site,
        summary.sessions_started,
    );
    write_metric(
        output,
        "motion_shim_sessions_ended_total",
        "Device sessions ended",
        MetricType::Counter,
        site,
        summary.sessions_ended,
    );
    write_metric(
        output,
        "motion_shim_sessions_lost_total",
        "Session tasks found unreachable and recreated",
        MetricType::Counter,
        site,
        summary.sessions_lost,
    );
}

fn write_device_metrics(output: &mut String, site: &str, metrics: &Metrics) {
    let gauges = metrics.device_gauges();
    if gauges.is_empty() {
        return;
    }

    let _ = writeln!(output, "# HELP motion_shim_device_occupied Derived occupancy per device");
    let _ = writeln!(output, "# TYPE motion_shim_device_occupied gauge");
    for (device, gauge) in &gauges {
        let _ = writeln!(
            output,
            "motion_shim_device_occupied{{site=\"{site}\",device=\"{device}\"}} {}",
            u8::from(gauge.occupied)
        );
    }

    let _ = writeln!(output, "# HELP motion_shim_device_motion_events Motion events this session");
    let _ = writeln!(output, "# TYPE motion_shim_device_motion_events gauge");
    for (device, gauge) in &gauges {
        let _ = writeln!(
            output,
            "motion_shim_device_motion_events{{site=\"{site}\",device=\"{device}\"}} {}",
            gauge.motion_events
        );
    }

    let _ = writeln!(output, "# HELP motion_shim_device_clear_events Clear events this session");
    let _ = writeln!(output, "# TYPE motion_shim_device_clear_events gauge");
    for (device, gauge) in &gauges {
        let _ = writeln!(
            output,
            "motion_shim_device_clear_events{{site=\"{site}\",device=\"{device}\"}} {}",
            gauge.clear_events
        );
    }
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics, &site_id),
        ),
        (&Method::GET, "/health") => text_response(StatusCode::OK, "text/plain", "ok".to_string()),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener =
        TcpListener::bind(addr).await.with_context(|| format!("binding metrics port {port}"))?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{DeviceId, DiagnosticKind};
    use crate::infra::metrics::DeviceGauge;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        let hall = DeviceId::new("hall");

        metrics.record_event_processed(150);
        metrics.record_event_processed(250);
        metrics.record_clear(true);
        metrics.record_warning(DiagnosticKind::Tamper);
        metrics.record_session_started(&hall);
        metrics.set_device_gauge(&hall, DeviceGauge { occupied: true, motion_events: 3, clear_events: 1 });

        let output = format_prometheus_metrics(&metrics, "home");

        assert!(output.contains("motion_shim_events_total{site=\"home\"} 2"));
        assert!(output.contains("motion_shim_event_latency_us_bucket{site=\"home\",le=\"+Inf\"} 2"));
        assert!(output.contains("motion_shim_clears_reclassified_total{site=\"home\"} 1"));
        assert!(output.contains("motion_shim_warnings_total{site=\"home\",kind=\"tamper\"} 1"));
        assert!(output.contains("motion_shim_device_occupied{site=\"home\",device=\"hall\"} 1"));
        assert!(output.contains("motion_shim_device_motion_events{site=\"home\",device=\"hall\"} 3"));

        // Scrapes never reset the histogram
        let again = format_prometheus_metrics(&metrics, "home");
        assert!(again.contains("motion_shim_event_latency_us_count{site=\"home\"} 2"));
    }
}
