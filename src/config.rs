//! Device configuration.
//!
//! What used to be compile-time switches on the board is a value selected
//! once at start-up, so a single binary can run either firmware variant.

use crate::hal::{MacAddress, Millis, SensorPin};
use heapless::{String, Vec};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;

pub const MAX_SENSORS: usize = 16;
pub const MAX_NAME_LEN: usize = 16;
pub const MAX_PATH_LEN: usize = 32;

pub type SensorName = String<MAX_NAME_LEN>;
pub type RoutePath = String<MAX_PATH_LEN>;

const READING_UPDATE_INTERVAL_MS: Millis = 60 * 1000;
const READING_PUBLISH_INTERVAL_MS: Millis = 3 * 1000;
const REBOOT_TIMEOUT_MS: Millis = 15 * 60 * 1000;
const PIR_HOLD_TIME_MS: Millis = 60 * 1000;
const WATCHDOG_TIMEOUT_MS: Millis = 8 * 1000;
const DHCP_RETRY_DELAY_MS: Millis = 10 * 1000;
const RESPONSE_GRACE_MS: Millis = 1;
const READ_POLL_INTERVAL_MS: Millis = 1;

const TELEMETRY_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 80);
const TELEMETRY_PORT: u16 = 1880;
const HTTP_PORT: u16 = 80;
const DEFAULT_MAC: MacAddress = [0x82, 0xc3, 0x34, 0x53, 0xe9, 0xd1];
const DEFAULT_PINS: [SensorPin; 8] = [2, 3, 4, 5, 6, 7, 8, 9];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sensor bank is empty")]
    EmptySensorBank,
    #[error("`{0}` exceeds the fixed capacity")]
    CapacityExceeded(&'static str),
    #[error("the metrics route requires presence detection")]
    MetricsWithoutPresence,
    #[error("route path `{0}` must start with '/'")]
    InvalidPath(std::string::String),
    #[error("telemetry publish interval must be positive")]
    ZeroPublishInterval,
    #[error("name `{0}` contains a control character")]
    ControlCharacter(std::string::String),
}

/// How the measurement routes guarantee values from a finished conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreshnessPolicy {
    /// Reuse the background round, sleeping only for whatever is left of
    /// its conversion delay.
    AwaitCurrentRound,
    /// Start a brand new round for every request and sleep the full delay.
    ConvertPerRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub pin: SensorPin,
    pub name: SensorName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub enable_presence: bool,
    pub enable_metrics_route: bool,
    /// Log raw request and response bytes.
    pub echo_raw_bytes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Window in which every sensor is published once.
    pub publish_interval_ms: Millis,
    pub group: Ipv4Addr,
    pub port: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            publish_interval_ms: READING_PUBLISH_INTERVAL_MS,
            group: TELEMETRY_GROUP,
            port: TELEMETRY_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub server_name: SensorName,
    pub mac: MacAddress,
    pub http_port: u16,
    pub sensors: Vec<SensorSpec, MAX_SENSORS>,
    pub measurements_path: RoutePath,
    pub features: FeatureFlags,
    pub freshness: FreshnessPolicy,
    /// Background conversion rounds; `None` leaves conversions to requests.
    pub reading_update_interval_ms: Option<Millis>,
    pub telemetry: Option<TelemetryConfig>,
    /// Liveness policy; `None` disables it.
    pub reboot_timeout_ms: Option<Millis>,
    pub presence_hold_ms: Millis,
    pub watchdog_timeout_ms: Millis,
    pub dhcp_retry_delay_ms: Millis,
    pub response_grace_ms: Millis,
    pub read_poll_interval_ms: Millis,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::primary()
    }
}

impl DeviceConfig {
    /// The telemetry-publishing build: background rounds, `/temperature.json`.
    pub fn primary() -> Self {
        Self {
            server_name: bounded("celsius"),
            mac: DEFAULT_MAC,
            http_port: HTTP_PORT,
            sensors: default_sensors(),
            measurements_path: bounded("/temperature.json"),
            features: FeatureFlags {
                enable_presence: false,
                enable_metrics_route: false,
                echo_raw_bytes: false,
            },
            freshness: FreshnessPolicy::AwaitCurrentRound,
            reading_update_interval_ms: Some(READING_UPDATE_INTERVAL_MS),
            telemetry: Some(TelemetryConfig::default()),
            reboot_timeout_ms: None,
            presence_hold_ms: PIR_HOLD_TIME_MS,
            watchdog_timeout_ms: WATCHDOG_TIMEOUT_MS,
            dhcp_retry_delay_ms: DHCP_RETRY_DELAY_MS,
            response_grace_ms: RESPONSE_GRACE_MS,
            read_poll_interval_ms: READ_POLL_INTERVAL_MS,
        }
    }

    /// The PIR build: presence, Prometheus route, conversion per request.
    pub fn presence() -> Self {
        Self {
            server_name: bounded("Celsius"),
            measurements_path: bounded("/measurements.json"),
            features: FeatureFlags {
                enable_presence: true,
                enable_metrics_route: true,
                echo_raw_bytes: true,
            },
            freshness: FreshnessPolicy::ConvertPerRequest,
            reading_update_interval_ms: None,
            telemetry: None,
            reboot_timeout_ms: Some(REBOOT_TIMEOUT_MS),
            ..Self::primary()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the keys present in `json` on top of `self`.
    pub fn overlay(self, json: &str) -> Result<Self, ConfigError> {
        let mut base = serde_json::to_value(&self)?;
        let patch: serde_json::Value = serde_json::from_str(json)?;
        merge(&mut base, patch);
        let config: Self = serde_json::from_value(base)?;
        config.validate()?;
        Ok(config)
    }

    pub fn overlay_file(self, path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        self.overlay(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sensors.is_empty() {
            return Err(ConfigError::EmptySensorBank);
        }
        if self.features.enable_metrics_route && !self.features.enable_presence {
            return Err(ConfigError::MetricsWithoutPresence);
        }
        if !self.measurements_path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.measurements_path.as_str().into()));
        }
        if matches!(self.telemetry, Some(t) if t.publish_interval_ms == 0) {
            return Err(ConfigError::ZeroPublishInterval);
        }
        check_name(&self.server_name)?;
        for spec in &self.sensors {
            check_name(&spec.name)?;
        }
        Ok(())
    }

    /// Rename sensors in bank order, keeping pins.
    pub fn with_sensor_names(mut self, names: &[&str]) -> Result<Self, ConfigError> {
        for (spec, name) in self.sensors.iter_mut().zip(names) {
            check_name(name)?;
            spec.name = try_bounded(name, "sensor name")?;
        }
        Ok(self)
    }

    pub fn with_sensors(mut self, sensors: &[(SensorPin, &str)]) -> Result<Self, ConfigError> {
        self.sensors.clear();
        for &(pin, name) in sensors {
            check_name(name)?;
            let spec = SensorSpec { pin, name: try_bounded(name, "sensor name")? };
            self.sensors
                .push(spec)
                .map_err(|_| ConfigError::CapacityExceeded("sensors"))?;
        }
        Ok(self)
    }

    pub fn with_measurements_path(mut self, path: &str) -> Result<Self, ConfigError> {
        self.measurements_path = try_bounded(path, "measurements path")?;
        Ok(self)
    }
}

// Names reach JSON keys, Prometheus labels and telemetry topics verbatim.
fn check_name(name: &str) -> Result<(), ConfigError> {
    if name.chars().any(char::is_control) {
        return Err(ConfigError::ControlCharacter(name.escape_debug().to_string()));
    }
    Ok(())
}

fn default_sensors() -> Vec<SensorSpec, MAX_SENSORS> {
    let mut sensors = Vec::new();
    for (index, pin) in DEFAULT_PINS.iter().enumerate() {
        let mut name = SensorName::new();
        let _ = core::fmt::Write::write_fmt(&mut name, format_args!("{}", index + 1));
        let _ = sensors.push(SensorSpec { pin: *pin, name });
    }
    sensors
}

fn try_bounded<const N: usize>(s: &str, what: &'static str) -> Result<String<N>, ConfigError> {
    let mut out = String::new();
    out.push_str(s).map_err(|()| ConfigError::CapacityExceeded(what))?;
    Ok(out)
}

// Only for literals known to fit.
fn bounded<const N: usize>(s: &str) -> String<N> {
    let mut out = String::new();
    let _ = out.push_str(s);
    out
}

fn merge(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                merge(base.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (base, patch) => *base = patch,
    }
}
