//! MQTT client for receiving sensor reports
//!
//! The radio stack publishes one JSON report per message on
//! `{base_topic}/{device}/report`, tagged by `type`:
//!
//! ```json
//! {"type": "zone_status", "zone_status": 1, "time": "2026-10-19T08:00:00Z"}
//! {"type": "check_in"}
//! {"type": "attribute", "battery_voltage": 2.9}
//! {"type": "session_start", "restored_occupancy": true}
//! {"type": "session_end"}
//! {"type": "reconfigure"}
//! ```

use crate::domain::types::{epoch_ms, DeviceId, EventKind, RawZoneStatus, SensorEvent};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use anyhow::Context;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireReport {
    ZoneStatus {
        zone_status: serde_json::Value,
    },
    CheckIn,
    Attribute {
        #[serde(default)]
        battery_voltage: Option<f64>,
    },
    SessionStart {
        #[serde(default)]
        restored_occupancy: Option<bool>,
    },
    SessionEnd,
    Reconfigure,
}

/// Extract the device name from `{base_topic}/{device}/report`
pub fn device_from_topic<'a>(topic: &'a str, base_topic: &str) -> Option<&'a str> {
    let device = topic.strip_prefix(base_topic)?.strip_prefix('/')?.strip_suffix("/report")?;
    if device.is_empty() || device.contains('/') {
        return None;
    }
    Some(device)
}

/// Parse an RFC 3339 timestamp to epoch milliseconds
fn parse_time_ms(s: &str) -> Option<u64> {
    OffsetDateTime::parse(s, &Rfc3339)
        .ok()
        .map(|dt| (dt.unix_timestamp_nanos() / 1_000_000) as u64)
}

/// Parse one report into a typed event
///
/// Returns None (with a debug log) for anything that is not a usable report.
/// A zone status that is present but not a valid integer still yields an
/// event: deciding it is malformed is the session's job.
pub fn parse_report(
    topic: &str,
    json_str: &str,
    base_topic: &str,
    received_at: Instant,
) -> Option<SensorEvent> {
    let Some(device) = device_from_topic(topic, base_topic) else {
        debug!(topic = %topic, "report_topic_ignored");
        return None;
    };

    let value: serde_json::Value = match serde_json::from_str(json_str) {
        Ok(v) => v,
        Err(e) => {
            debug!(device = %device, error = %e, "report_parse_failed");
            return None;
        }
    };
    let report = match WireReport::deserialize(&value) {
        Ok(r) => r,
        Err(e) => {
            debug!(device = %device, error = %e, "report_unknown_type");
            return None;
        }
    };

    if let Some(sent_ms) = value.get("time").and_then(|t| t.as_str()).and_then(parse_time_ms) {
        debug!(device = %device, age_ms = %epoch_ms().saturating_sub(sent_ms), "report_age");
    }

    let kind = match report {
        WireReport::ZoneStatus { zone_status } => {
            EventKind::ZoneStatus(RawZoneStatus::from_json(&zone_status))
        }
        WireReport::CheckIn => EventKind::CheckIn,
        WireReport::Attribute { battery_voltage: Some(volts) } => EventKind::BatteryVoltage(volts),
        WireReport::Attribute { battery_voltage: None } => {
            debug!(device = %device, "attribute_report_ignored");
            return None;
        }
        WireReport::SessionStart { restored_occupancy } => EventKind::SessionStart { restored_occupancy },
        WireReport::SessionEnd => EventKind::SessionEnd,
        WireReport::Reconfigure => EventKind::Reconfigure,
    };

    Some(SensorEvent::at(DeviceId::new(device), kind, received_at))
}

/// Start the MQTT client and send parsed events to the channel
///
/// Events are sent via try_send to avoid blocking the MQTT eventloop.
/// Dropped events are counted in metrics and logged (rate-limited).
pub async fn start_mqtt_client(
    config: &Config,
    event_tx: mpsc::Sender<SensorEvent>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let client_id = format!("motion-shim-{}", config.site_id());
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    // Set credentials if configured
    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let filter = config.mqtt_report_filter();
    let base_topic = config.mqtt_base_topic().to_string();
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client
        .subscribe(filter.as_str(), QoS::AtLeastOnce)
        .await
        .with_context(|| format!("subscribing to {filter}"))?;

    info!(topic = %filter, host = %config.mqtt_host(), port = %config.mqtt_port(), "mqtt_subscribed");

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn: Option<std::time::Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let received_at = Instant::now();
                        let json_str = match std::str::from_utf8(&publish.payload) {
                            Ok(s) => s,
                            Err(e) => {
                                warn!(topic = %publish.topic, error = %e, "invalid_utf8_payload");
                                continue;
                            }
                        };
                        let Some(event) = parse_report(&publish.topic, json_str, &base_topic, received_at) else {
                            continue;
                        };
                        debug!(device = %event.device, kind = %event.kind.as_str(), "report_received");

                        match event_tx.try_send(event) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                metrics.record_ingress_event_dropped();
                                let due = last_drop_warn
                                    .map_or(true, |t| t.elapsed() > Duration::from_secs(1));
                                if due {
                                    warn!("mqtt_event_dropped: channel full");
                                    last_drop_warn = Some(std::time::Instant::now());
                                }
                            }
                            Err(TrySendError::Closed(_)) => {
                                warn!("event_channel_closed");
                                return Ok(());
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                        // Clean sessions lose subscriptions on reconnect
                        if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                            warn!(error = %e, "mqtt_resubscribe_failed");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "motion-shim";

    fn parse(topic: &str, json: &str) -> Option<SensorEvent> {
        parse_report(topic, json, BASE, Instant::now())
    }

    #[test]
    fn test_device_from_topic() {
        assert_eq!(device_from_topic("motion-shim/hall/report", BASE), Some("hall"));
        assert_eq!(device_from_topic("motion-shim/hall/occupancy", BASE), None);
        assert_eq!(device_from_topic("motion-shim//report", BASE), None);
        assert_eq!(device_from_topic("other/hall/report", BASE), None);
        assert_eq!(device_from_topic("motion-shim/a/b/report", BASE), None);
    }

    #[test]
    fn test_parse_zone_status() {
        let event = parse(
            "motion-shim/hall/report",
            r#"{"type": "zone_status", "zone_status": 1, "time": "2026-10-19T08:00:00.000+00:00"}"#,
        )
        .unwrap();
        assert_eq!(event.device, DeviceId::new("hall"));
        assert_eq!(event.kind, EventKind::ZoneStatus(RawZoneStatus::Integer(1)));
    }

    #[test]
    fn test_parse_non_integer_zone_status_is_kept() {
        let event =
            parse("motion-shim/hall/report", r#"{"type": "zone_status", "zone_status": "0x01"}"#)
                .unwrap();
        assert!(matches!(event.kind, EventKind::ZoneStatus(RawZoneStatus::Unparseable(_))));
    }

    #[test]
    fn test_parse_lifecycle_reports() {
        let start = parse(
            "motion-shim/hall/report",
            r#"{"type": "session_start", "restored_occupancy": true}"#,
        )
        .unwrap();
        assert_eq!(start.kind, EventKind::SessionStart { restored_occupancy: Some(true) });

        let bare = parse("motion-shim/hall/report", r#"{"type": "session_start"}"#).unwrap();
        assert_eq!(bare.kind, EventKind::SessionStart { restored_occupancy: None });

        let end = parse("motion-shim/hall/report", r#"{"type": "session_end"}"#).unwrap();
        assert_eq!(end.kind, EventKind::SessionEnd);

        let reconfigure = parse("motion-shim/hall/report", r#"{"type": "reconfigure"}"#).unwrap();
        assert_eq!(reconfigure.kind, EventKind::Reconfigure);
    }

    #[test]
    fn test_parse_attribute_reports() {
        let battery =
            parse("motion-shim/hall/report", r#"{"type": "attribute", "battery_voltage": 2.9}"#)
                .unwrap();
        assert_eq!(battery.kind, EventKind::BatteryVoltage(2.9));

        assert!(parse("motion-shim/hall/report", r#"{"type": "attribute"}"#).is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("motion-shim/hall/report", "not json").is_none());
        assert!(parse("motion-shim/hall/report", r#"{"type": "firmware_update"}"#).is_none());
        assert!(parse("motion-shim/hall/report", r#"{"zone_status": 1}"#).is_none());
    }

    #[test]
    fn test_parse_time_ms() {
        assert_eq!(parse_time_ms("1970-01-01T00:00:01Z"), Some(1000));
        assert_eq!(parse_time_ms("yesterday"), None);
    }
}
