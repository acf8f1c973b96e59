//! Configuration loading from TOML files
//!
//! The binary picks the file path (`--config`, then `CONFIG_FILE`, then
//! `config/dev.toml`); this module only loads and validates it.

use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Hub identifier included in metrics payloads
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "hub".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Topic prefix; reports arrive on `{base_topic}/{device}/report`
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_base_topic() -> String {
    "motion-shim".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OccupancyConfig {
    #[serde(default = "default_motion_timeout_secs")]
    pub motion_timeout_secs: u64,
    /// A hardware clear arriving this long after motion is a stuck-sensor reset
    #[serde(default = "default_stuck_motion_threshold_secs")]
    pub stuck_motion_threshold_secs: u64,
    #[serde(default = "default_startup_guard_delay_secs")]
    pub startup_guard_delay_secs: u64,
}

impl Default for OccupancyConfig {
    fn default() -> Self {
        Self {
            motion_timeout_secs: default_motion_timeout_secs(),
            stuck_motion_threshold_secs: default_stuck_motion_threshold_secs(),
            startup_guard_delay_secs: default_startup_guard_delay_secs(),
        }
    }
}

fn default_motion_timeout_secs() -> u64 {
    120
}

fn default_stuck_motion_threshold_secs() -> u64 {
    30
}

fn default_startup_guard_delay_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_stuck_warning_threshold_secs")]
    pub stuck_warning_threshold_secs: u64,
    #[serde(default = "default_silent_device_threshold_secs")]
    pub silent_device_threshold_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            stuck_warning_threshold_secs: default_stuck_warning_threshold_secs(),
            silent_device_threshold_secs: default_silent_device_threshold_secs(),
        }
    }
}

fn default_health_interval_secs() -> u64 {
    300
}

fn default_stuck_warning_threshold_secs() -> u64 {
    1800
}

fn default_silent_device_threshold_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    /// Check-in interval in quarter-seconds (3600 = 15 minutes)
    #[serde(default = "default_checkin_interval_qs")]
    pub checkin_interval_qs: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self { checkin_interval_qs: default_checkin_interval_qs() }
    }
}

fn default_checkin_interval_qs() -> u32 {
    3600
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DevicesConfig {
    /// Sensors whose sessions start together with the service
    #[serde(default)]
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 60, prometheus_port: default_prometheus_port() }
    }
}

fn default_prometheus_port() -> u16 {
    9464
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    /// Publish signals to MQTT; when false they are only logged
    #[serde(default = "default_egress_enabled")]
    pub enabled: bool,
    /// Interval for publishing metrics snapshots (seconds)
    #[serde(default = "default_metrics_publish_interval")]
    pub metrics_publish_interval_secs: u64,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            enabled: default_egress_enabled(),
            metrics_publish_interval_secs: default_metrics_publish_interval(),
        }
    }
}

fn default_egress_enabled() -> bool {
    true
}

fn default_metrics_publish_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub occupancy: OccupancyConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub devices: DevicesConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub egress: EgressConfig,
}

/// Timing parameters for one device session
///
/// Startup constants: sessions copy these when they are created and never
/// see later changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timings {
    pub motion_timeout: Duration,
    pub stuck_motion_threshold: Duration,
    pub startup_guard_delay: Duration,
    pub health_interval: Duration,
    pub stuck_warning_threshold: Duration,
    pub silent_device_threshold: Duration,
    pub checkin_interval_qs: u32,
}

impl Default for Timings {
    fn default() -> Self {
        Config::default().timings()
    }
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    log_level: String,
    log_format: LogFormat,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_base_topic: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    motion_timeout_secs: u64,
    stuck_motion_threshold_secs: u64,
    startup_guard_delay_secs: u64,
    health_interval_secs: u64,
    stuck_warning_threshold_secs: u64,
    silent_device_threshold_secs: u64,
    checkin_interval_qs: u32,
    device_names: Vec<String>,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    egress_enabled: bool,
    egress_metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_base_topic: default_base_topic(),
            mqtt_username: None,
            mqtt_password: None,
            motion_timeout_secs: default_motion_timeout_secs(),
            stuck_motion_threshold_secs: default_stuck_motion_threshold_secs(),
            startup_guard_delay_secs: default_startup_guard_delay_secs(),
            health_interval_secs: default_health_interval_secs(),
            stuck_warning_threshold_secs: default_stuck_warning_threshold_secs(),
            silent_device_threshold_secs: default_silent_device_threshold_secs(),
            checkin_interval_qs: default_checkin_interval_qs(),
            device_names: Vec::new(),
            metrics_interval_secs: 60,
            prometheus_port: default_prometheus_port(),
            egress_enabled: default_egress_enabled(),
            egress_metrics_interval_secs: default_metrics_publish_interval(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self {
            site_id: toml_config.site.id,
            log_level: toml_config.logging.level,
            log_format: toml_config.logging.format,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_base_topic: toml_config.mqtt.base_topic.trim_end_matches('/').to_string(),
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            motion_timeout_secs: toml_config.occupancy.motion_timeout_secs,
            stuck_motion_threshold_secs: toml_config.occupancy.stuck_motion_threshold_secs,
            startup_guard_delay_secs: toml_config.occupancy.startup_guard_delay_secs,
            health_interval_secs: toml_config.health.interval_secs,
            stuck_warning_threshold_secs: toml_config.health.stuck_warning_threshold_secs,
            silent_device_threshold_secs: toml_config.health.silent_device_threshold_secs,
            checkin_interval_qs: toml_config.poll.checkin_interval_qs,
            device_names: toml_config.devices.names,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            egress_enabled: toml_config.egress.enabled,
            egress_metrics_interval_secs: toml_config.egress.metrics_publish_interval_secs,
            config_file: path.display().to_string(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Reject timing combinations that would make the engine misbehave
    fn validate(&self) -> anyhow::Result<()> {
        if self.motion_timeout_secs == 0 {
            anyhow::bail!("occupancy.motion_timeout_secs must be greater than zero");
        }
        if self.health_interval_secs == 0 {
            anyhow::bail!("health.interval_secs must be greater than zero");
        }
        if self.metrics_interval_secs == 0 {
            anyhow::bail!("metrics.interval_secs must be greater than zero");
        }
        if self.egress_metrics_interval_secs == 0 {
            anyhow::bail!("egress.metrics_publish_interval_secs must be greater than zero");
        }
        Ok(())
    }

    /// Session timing parameters derived from the occupancy, health and poll sections
    pub fn timings(&self) -> Timings {
        Timings {
            motion_timeout: Duration::from_secs(self.motion_timeout_secs),
            stuck_motion_threshold: Duration::from_secs(self.stuck_motion_threshold_secs),
            startup_guard_delay: Duration::from_secs(self.startup_guard_delay_secs),
            health_interval: Duration::from_secs(self.health_interval_secs),
            stuck_warning_threshold: Duration::from_secs(self.stuck_warning_threshold_secs),
            silent_device_threshold: Duration::from_secs(self.silent_device_threshold_secs),
            checkin_interval_qs: self.checkin_interval_qs,
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_base_topic(&self) -> &str {
        &self.mqtt_base_topic
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    /// Subscription filter for device reports
    pub fn mqtt_report_filter(&self) -> String {
        format!("{}/+/report", self.mqtt_base_topic)
    }

    pub fn motion_timeout_secs(&self) -> u64 {
        self.motion_timeout_secs
    }

    pub fn stuck_motion_threshold_secs(&self) -> u64 {
        self.stuck_motion_threshold_secs
    }

    pub fn startup_guard_delay_secs(&self) -> u64 {
        self.startup_guard_delay_secs
    }

    pub fn health_interval_secs(&self) -> u64 {
        self.health_interval_secs
    }

    pub fn checkin_interval_qs(&self) -> u32 {
        self.checkin_interval_qs
    }

    pub fn device_names(&self) -> &[String] {
        &self.device_names
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn egress_enabled(&self) -> bool {
        self.egress_enabled
    }

    pub fn egress_metrics_interval_secs(&self) -> u64 {
        self.egress_metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to shorten the motion timeout
    #[cfg(test)]
    pub fn with_motion_timeout_secs(mut self, secs: u64) -> Self {
        self.motion_timeout_secs = secs;
        self
    }
}
