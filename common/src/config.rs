use std::{io::ErrorKind, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub server_host: String,
    pub server_port: u16,
    pub device_token: String,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub root_ca_path: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            server_host: "127.0.0.1".to_string(),
            server_port: 1883,
            device_token: String::new(),
            encrypted: false,
            root_ca_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub network_poll_ms: u64,
    /// `None` waits for the access point forever.
    pub network_wait_limit: Option<u32>,
    pub connect_timeout_ms: u64,
    pub loop_idle_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            network_poll_ms: 500,
            network_wait_limit: None,
            connect_timeout_ms: 5_000,
            loop_idle_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportLimits {
    pub max_send_bytes: usize,
    pub max_receive_bytes: usize,
    pub max_rpc_subscriptions: usize,
    pub inbound_queue: usize,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self {
            max_send_bytes: 128,
            max_receive_bytes: 128,
            max_rpc_subscriptions: 8,
            inbound_queue: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmThresholds {
    pub temp_high_c: f32,
    pub temp_low_c: f32,
    pub humidity_high: f32,
    pub humidity_low: f32,
    pub voc_high: u16,
    pub lux_low: f32,
    pub battery_low_v: f32,
}

impl Default for AlarmThresholds {
    fn default() -> Self {
        Self {
            temp_high_c: 20.0,
            temp_low_c: 0.0,
            humidity_high: 70.0,
            humidity_low: 20.0,
            voc_high: 50,
            lux_low: 50.0,
            battery_low_v: 3.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub sample_interval_ms: u64,
    pub voc_stabilization_ms: u64,
    #[serde(default)]
    pub thresholds: AlarmThresholds,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 2_000,
            voc_stabilization_ms: 80_000,
            thresholds: AlarmThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub network: NetworkConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub transport: TransportLimits,
    #[serde(default)]
    pub sensor: SensorConfig,
}

impl RuntimeConfig {
    /// Reads a JSON config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read(path) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("MQTT_HOST") {
            self.network.server_host = host;
        }
        if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
            self.network.server_port = port;
        }
        if let Some(token) = lookup("DEVICE_TOKEN") {
            self.network.device_token = token;
        }
        if let Some(ca_path) = lookup("MQTT_CA_PATH") {
            self.network.root_ca_path = Some(ca_path);
            self.network.encrypted = true;
        }
    }

    /// Defaults overlaid with the values baked in at build time.
    #[cfg(feature = "esp32")]
    pub fn from_build_env() -> Self {
        let mut config = Self::default();
        if let Some(ssid) = option_env!("WIFI_SSID") {
            config.network.wifi_ssid = ssid.to_string();
        }
        if let Some(pass) = option_env!("WIFI_PASS") {
            config.network.wifi_pass = pass.to_string();
        }
        if option_env!("MQTT_TLS").is_some_and(|value| value == "1") {
            config.network.encrypted = true;
        }
        config.apply_overrides(|key| {
            match key {
                "MQTT_HOST" => option_env!("MQTT_HOST"),
                "MQTT_PORT" => option_env!("MQTT_PORT"),
                "DEVICE_TOKEN" => option_env!("DEVICE_TOKEN"),
                _ => None,
            }
            .map(str::to_string)
        });
        config
    }

    pub fn sanitize(&mut self) {
        self.link.network_poll_ms = self.link.network_poll_ms.clamp(10, 60_000);
        self.link.connect_timeout_ms = self.link.connect_timeout_ms.clamp(100, 60_000);
        self.link.loop_idle_ms = self.link.loop_idle_ms.min(1_000);

        self.transport.max_send_bytes = self.transport.max_send_bytes.max(32);
        self.transport.max_receive_bytes = self.transport.max_receive_bytes.max(32);
        self.transport.inbound_queue = self.transport.inbound_queue.max(1);

        self.sensor.sample_interval_ms = self.sensor.sample_interval_ms.max(100);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.server_host.trim().is_empty() {
            return Err(ConfigError::Invalid("server host cannot be empty"));
        }
        if self.network.server_port == 0 {
            return Err(ConfigError::Invalid("server port must be between 1 and 65535"));
        }
        if self.network.device_token.is_empty() {
            return Err(ConfigError::Invalid("device token cannot be empty"));
        }
        if self.network.encrypted
            && self.network.root_ca_path.is_none()
            && cfg!(not(feature = "esp32"))
        {
            return Err(ConfigError::Invalid("encrypted link needs a root CA path"));
        }
        Ok(())
    }
}
