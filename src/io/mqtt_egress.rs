//! MQTT publisher for derived signals
//!
//! Publishes per-device topics under the configured base topic:
//! - {base}/{device}/occupancy - Derived occupancy (QoS 1, retained)
//! - {base}/{device}/motion - Raw hardware motion passthrough (QoS 0)
//! - {base}/{device}/battery - Battery percentage (QoS 0, retained)
//! - {base}/{device}/diagnostic - Warnings and info diagnostics (QoS 1)
//! - {base}/{device}/set - Poll control check-in interval (QoS 1)
//! - {base}/metrics - Periodic metrics snapshots (QoS 0)

use crate::infra::config::Config;
use crate::io::egress_channel::{EgressMessage, EgressReceiver};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Topic, QoS and retain flag for one message
pub fn route(base_topic: &str, msg: &EgressMessage) -> (String, QoS, bool) {
    let device_topic = |leaf: &str| match msg.device() {
        Some(device) => format!("{base_topic}/{device}/{leaf}"),
        None => format!("{base_topic}/{leaf}"),
    };
    match msg {
        EgressMessage::Occupancy(_) => (device_topic("occupancy"), QoS::AtLeastOnce, true),
        EgressMessage::Motion(_) => (device_topic("motion"), QoS::AtMostOnce, false),
        EgressMessage::Battery(_) => (device_topic("battery"), QoS::AtMostOnce, true),
        EgressMessage::Diagnostic(_) => (device_topic("diagnostic"), QoS::AtLeastOnce, false),
        EgressMessage::PollConfig(_) => (device_topic("set"), QoS::AtLeastOnce, false),
        EgressMessage::Metrics(_) => (format!("{base_topic}/metrics"), QoS::AtMostOnce, false),
    }
}

fn to_json(msg: &EgressMessage) -> serde_json::Result<String> {
    match msg {
        EgressMessage::Occupancy(p) => serde_json::to_string(p),
        EgressMessage::Motion(p) => serde_json::to_string(p),
        EgressMessage::Battery(p) => serde_json::to_string(p),
        EgressMessage::Diagnostic(p) => serde_json::to_string(p),
        EgressMessage::PollConfig(p) => serde_json::to_string(p),
        EgressMessage::Metrics(p) => serde_json::to_string(p),
    }
}

/// MQTT publisher actor
///
/// Receives messages from the egress channel and publishes to MQTT topics.
pub struct MqttPublisher {
    client: AsyncClient,
    rx: EgressReceiver,
    base_topic: String,
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    ///
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config, rx: EgressReceiver) -> Self {
        let client_id = format!("motion-shim-egress-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        // Set credentials if configured
        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        // Spawn the eventloop handler
        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client, rx, base_topic: config.mqtt_base_topic().to_string() }
    }

    /// Run the publisher loop
    ///
    /// Runs until shutdown signal is received, then drains what is queued.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(base_topic = %self.base_topic, "mqtt_egress_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        while let Some(msg) = self.rx.try_recv() {
                            self.publish_message(msg).await;
                        }
                        return;
                    }
                }
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.publish_message(msg).await,
                    None => return,
                },
            }
        }
    }

    async fn publish_message(&self, msg: EgressMessage) {
        let (topic, qos, retain) = route(&self.base_topic, &msg);
        let json = match to_json(&msg) {
            Ok(json) => json,
            Err(e) => {
                warn!(topic = %topic, error = %e, "mqtt_egress_serialize_failed");
                return;
            }
        };
        if let Err(e) = self.client.publish(&topic, qos, retain, json.into_bytes()).await {
            debug!(topic = %topic, error = %e, "mqtt_egress_publish_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::DeviceId;
    use crate::infra::metrics::Metrics;
    use crate::io::egress_channel::create_egress_channel;
    use crate::services::sink::SignalSink;
    use std::sync::Arc;

    #[test]
    fn test_routes_device_topics() {
        let (sender, mut rx) = create_egress_channel(8, "home".to_string(), Arc::new(Metrics::new()));
        let device = DeviceId::new("hall");
        sender.set_occupancy(&device, true);
        sender.set_motion_zone_state(&device, true);
        sender.configure_poll_interval(&device, 3600).unwrap();

        let occupancy = rx.try_recv().unwrap();
        assert_eq!(
            route("motion-shim", &occupancy),
            ("motion-shim/hall/occupancy".to_string(), QoS::AtLeastOnce, true)
        );
        let motion = rx.try_recv().unwrap();
        assert_eq!(route("motion-shim", &motion).0, "motion-shim/hall/motion");
        let poll = rx.try_recv().unwrap();
        assert_eq!(route("motion-shim", &poll).0, "motion-shim/hall/set");
        assert!(to_json(&poll).unwrap().contains("\"checkin_interval_qs\":3600"));
    }
}
