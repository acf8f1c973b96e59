//! Motion sensor simulator - scripted report injection over MQTT
//!
//! Publishes the reports a real sensor would produce on
//! `{base_topic}/{device}/report` and logs the occupancy the shim derives.
//!
//! Usage:
//!   cargo run --bin motion-sim -- --list
//!   cargo run --bin motion-sim -- --scenario stuck_sensor --device hall
//!   cargo run --bin motion-sim -- --scenario fast_cycle --speed 10

use clap::Parser;
use motion_shim::infra::Config;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

// ============================================================================
// CLI Args
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "motion-sim")]
#[command(about = "Scripted motion sensor reports for manual testing")]
struct Args {
    /// Config file path (broker and base topic)
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Device name to simulate
    #[arg(short, long, default_value = "sim_motion")]
    device: String,

    /// Scenario to run
    #[arg(short, long, default_value = "fast_cycle")]
    scenario: String,

    /// Divide every wait by this factor
    #[arg(long, default_value = "1")]
    speed: u32,

    /// List scenarios and exit
    #[arg(long)]
    list: bool,
}

// ============================================================================
// Scenarios
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Step {
    /// Zone status bitmap (bit 0 motion, 2 tamper, 3 low battery, 6 trouble)
    Zone(u16),
    /// Zone status the shim must treat as malformed
    BadZone,
    CheckIn,
    Battery(f64),
    Start { restored: Option<bool> },
    End,
    Reconfigure,
    /// Wait in seconds
    Wait(u64),
}

struct Scenario {
    name: &'static str,
    description: &'static str,
    steps: &'static [Step],
}

const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "fast_cycle",
        description: "Normal motion with a quick hardware clear; timer clears at 120 s",
        steps: &[
            Step::Start { restored: None },
            Step::Wait(1),
            Step::Zone(0x0001),
            Step::Wait(3),
            Step::Zone(0x0000),
            Step::Wait(125),
        ],
    },
    Scenario {
        name: "stuck_sensor",
        description: "Sensor stuck in motion, then clears late (reset counts as motion)",
        steps: &[
            Step::Start { restored: None },
            Step::Wait(1),
            Step::Zone(0x0001),
            Step::Wait(45),
            Step::Zone(0x0000),
            Step::Wait(125),
            Step::Zone(0x0000),
            Step::Wait(125),
        ],
    },
    Scenario {
        name: "restored_occupied",
        description: "Hub restores occupied state; startup guard forces clear after 5 s",
        steps: &[Step::Start { restored: Some(true) }, Step::Wait(8)],
    },
    Scenario {
        name: "tamper",
        description: "Tamper and low battery flags raised and cleared",
        steps: &[
            Step::Start { restored: None },
            Step::Wait(1),
            Step::Zone(0x0005),
            Step::Wait(2),
            Step::Zone(0x000D),
            Step::Wait(2),
            Step::Zone(0x0000),
            Step::Wait(2),
            Step::Battery(2.1),
        ],
    },
    Scenario {
        name: "noisy",
        description: "Malformed reports, check-ins and a reconfigure, then removal",
        steps: &[
            Step::Start { restored: None },
            Step::Wait(1),
            Step::BadZone,
            Step::CheckIn,
            Step::Reconfigure,
            Step::Wait(2),
            Step::End,
        ],
    },
];

fn get_scenario(name: &str) -> Option<&'static Scenario> {
    SCENARIOS.iter().find(|s| s.name == name)
}

fn report_payload(step: Step) -> Option<serde_json::Value> {
    let payload = match step {
        Step::Zone(bits) => json!({ "type": "zone_status", "zone_status": bits }),
        Step::BadZone => json!({ "type": "zone_status", "zone_status": "0xZZ" }),
        Step::CheckIn => json!({ "type": "check_in" }),
        Step::Battery(volts) => json!({ "type": "attribute", "battery_voltage": volts }),
        Step::Start { restored } => json!({ "type": "session_start", "restored_occupancy": restored }),
        Step::End => json!({ "type": "session_end" }),
        Step::Reconfigure => json!({ "type": "reconfigure" }),
        Step::Wait(_) => return None,
    };
    Some(payload)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();

    if args.list {
        for scenario in SCENARIOS {
            println!("{:<20} {}", scenario.name, scenario.description);
        }
        return Ok(());
    }

    let Some(scenario) = get_scenario(&args.scenario) else {
        anyhow::bail!("unknown scenario '{}' (try --list)", args.scenario);
    };

    let config = Config::load_from_path(&args.config);
    let base = config.mqtt_base_topic().to_string();
    let report_topic = format!("{base}/{}/report", args.device);
    let watch_filter = format!("{base}/{}/+", args.device);

    let mut mqttoptions =
        MqttOptions::new(format!("motion-sim-{}", std::process::id()), config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(watch_filter.as_str(), QoS::AtMostOnce).await?;

    // Print what the shim publishes back
    let report_suffix = "/report";
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic.ends_with(report_suffix) {
                        continue;
                    }
                    let body = String::from_utf8_lossy(&publish.payload);
                    info!(topic = %publish.topic, payload = %body, "shim_output");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt_error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    info!(scenario = %scenario.name, device = %args.device, topic = %report_topic, "scenario_started");
    let started = Instant::now();
    let speed = u64::from(args.speed.max(1));

    for (i, step) in scenario.steps.iter().enumerate() {
        if let Step::Wait(secs) = step {
            tokio::time::sleep(Duration::from_millis(secs * 1000 / speed)).await;
            continue;
        }
        let Some(payload) = report_payload(*step) else {
            continue;
        };
        client
            .publish(report_topic.as_str(), QoS::AtLeastOnce, false, payload.to_string())
            .await?;
        info!(
            step = %i,
            t_ms = %started.elapsed().as_millis(),
            report = %payload,
            "report_sent"
        );
    }

    // Let the last outputs arrive
    tokio::time::sleep(Duration::from_secs(1)).await;
    info!(elapsed_ms = %started.elapsed().as_millis(), "scenario_complete");
    Ok(())
}
