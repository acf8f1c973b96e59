//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `mqtt` - MQTT client for receiving sensor reports
//! - `mqtt_egress` - MQTT publisher for derived signals
//! - `egress_channel` - Typed channel for MQTT egress messages
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod egress_channel;
pub mod mqtt;
pub mod mqtt_egress;
pub mod prometheus;

// Re-export commonly used types
pub use egress_channel::{create_egress_channel, EgressMessage, EgressReceiver, EgressSender};
pub use mqtt_egress::MqttPublisher;
