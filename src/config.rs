//! Configuration management for CoilPulse

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ControlError;
use crate::input;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Modbus device holding the coils
    #[serde(default)]
    pub device: DeviceConfig,
    /// Manual pulse settings
    #[serde(default)]
    pub panel: PanelConfig,
    /// Default automation sequence
    #[serde(default)]
    pub sequence: SequenceConfig,
    /// HTTP control surface
    #[serde(default)]
    pub server: ServerConfig,
    /// MQTT event mirror
    #[serde(default)]
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device type: "tcp", "rtu" or "simulated"
    #[serde(default)]
    pub device_type: DeviceType,
    /// Connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Coil addresses, one per panel button, in display order
    #[serde(default = "default_coils")]
    pub coils: Vec<u16>,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Tcp,
    Rtu,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectionConfig {
    Tcp(TcpConnection),
    Rtu(RtuConnection),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConnection {
    /// Host address
    pub host: String,
    /// Port (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    /// Modbus unit ID
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtuConnection {
    /// Serial port path (e.g., /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits
    pub data_bits: u8,
    /// Stop bits
    pub stop_bits: u8,
    /// Parity: "none", "even", "odd"
    pub parity: String,
    /// Modbus unit ID
    pub unit_id: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// Default manual press duration in seconds
    pub pulse_duration_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// 1-based button ids, pulsed in order
    pub steps: Vec<usize>,
    /// How long each coil stays flipped, in seconds
    pub press_duration_secs: f64,
    /// Pause after each step, in seconds
    pub wait_duration_secs: f64,
    /// Restart from the first step after the last
    #[serde(rename = "loop")]
    pub looping: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP API host
    pub host: String,
    /// HTTP API port
    pub port: u16,
    /// Enable metrics endpoint
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Publish controller events to the broker
    pub enabled: bool,
    /// MQTT broker host
    pub host: String,
    /// MQTT broker port
    pub port: u16,
    /// Client ID
    pub client_id: String,
    /// Topic prefix
    pub topic_prefix: String,
    /// QoS level (0, 1, or 2)
    pub qos: u8,
    /// Username (optional)
    pub username: Option<String>,
    /// Password (optional)
    pub password: Option<String>,
}

fn default_coils() -> Vec<u16> {
    vec![8192, 8193, 8194, 8195]
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::Tcp,
            connection: ConnectionConfig::default(),
            coils: default_coils(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig::Tcp(TcpConnection {
            host: "10.3.200.10".to_string(),
            port: default_modbus_port(),
            unit_id: default_unit_id(),
        })
    }
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            pulse_duration_secs: 60.0,
        }
    }
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            steps: vec![1, 2, 3, 4],
            press_duration_secs: 2.0,
            wait_duration_secs: 1.0,
            looping: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            metrics_enabled: true,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 1883,
            client_id: "coilpulse".to_string(),
            topic_prefix: "coilpulse".to_string(),
            qos: 1,
            username: None,
            password: None,
        }
    }
}

impl DeviceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Parse configuration from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).with_context(|| "Failed to parse config")
    }

    /// Check cross-field constraints before anything touches the device
    pub fn validate(&self) -> Result<(), ControlError> {
        input::validate_addresses(&self.device.coils)?;

        if self.device.timeout_ms == 0 {
            return Err(ControlError::validation("device timeout must be positive"));
        }

        match (&self.device.device_type, &self.device.connection) {
            (DeviceType::Tcp, ConnectionConfig::Tcp(tcp)) => {
                if tcp.host.trim().is_empty() {
                    return Err(ControlError::validation("device host is empty"));
                }
                if tcp.port == 0 {
                    return Err(ControlError::validation("device port must be positive"));
                }
            }
            (DeviceType::Rtu, ConnectionConfig::Rtu(rtu)) => {
                if rtu.port.trim().is_empty() {
                    return Err(ControlError::validation("serial port path is empty"));
                }
            }
            (DeviceType::Simulated, _) => {}
            (device_type, _) => {
                return Err(ControlError::validation(format!(
                    "connection settings do not match device type {:?}",
                    device_type
                )));
            }
        }

        input::press_duration(self.panel.pulse_duration_secs)?;
        input::press_duration(self.sequence.press_duration_secs)?;
        input::wait_duration(self.sequence.wait_duration_secs)?;
        input::validate_sequence(&self.sequence.steps, self.device.coils.len())?;

        Ok(())
    }
}

/// Load configuration from file (plus `COILPULSE__` environment overrides) or use defaults
pub fn load_config() -> Result<Config> {
    let config_path =
        std::env::var("COILPULSE_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());

    load_config_from(&config_path)
}

/// Load configuration from the given path, layering environment overrides on top
pub fn load_config_from(config_path: &str) -> Result<Config> {
    load_layered(config_path, environment())
}

/// `COILPULSE__SECTION__KEY` overrides; coil and step lists are comma separated
fn environment() -> ::config::Environment {
    ::config::Environment::with_prefix("COILPULSE")
        .prefix_separator("__")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("device.coils")
        .with_list_parse_key("sequence.steps")
        .try_parsing(true)
}

fn load_layered(config_path: &str, env: ::config::Environment) -> Result<Config> {
    let mut builder = ::config::Config::builder();

    if Path::new(config_path).exists() {
        builder = builder.add_source(::config::File::from(Path::new(config_path)));
    } else {
        tracing::warn!("Config file {} not found, using defaults", config_path);
    }

    let settings = builder
        .add_source(env)
        .build()
        .with_context(|| format!("Failed to read config file: {}", config_path))?;

    let config: Config = settings
        .try_deserialize()
        .with_context(|| "Failed to parse config file")?;

    Ok(config)
}
