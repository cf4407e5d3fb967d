use serde::{Deserialize, Serialize};

use crate::topics::{DEFAULT_PRIMARY_TOPIC, DEFAULT_SERIAL_TOPIC};

pub const DEFAULT_SERIAL_BUFFER_LIMIT: usize = 256;
pub const DEFAULT_SERIAL_BAUD: u32 = 115_200;
pub const DEFAULT_PULSE_MS: u64 = 150;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_CLIENT_ID: &str = "esp_client";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub wifi_ssid: String,
    #[serde(default)]
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub client_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "broker.emqx.io".to_string(),
            mqtt_port: 1883,
            client_id: "mah1ro_esp32".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub primary: String,
    pub serial: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            primary: DEFAULT_PRIMARY_TOPIC.to_string(),
            serial: DEFAULT_SERIAL_TOPIC.to_string(),
        }
    }
}

impl TopicConfig {
    /// True when serial payloads need a second publish on the primary topic.
    pub fn mirrors_serial(&self) -> bool {
        self.serial != self.primary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinConfig {
    pub status_led: u8,
    pub activity_led: u8,
    /// `None` disables the hold-to-reprovision button.
    #[serde(default = "default_reset_button")]
    pub reset_button: Option<u8>,
}

fn default_reset_button() -> Option<u8> {
    Some(14)
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            status_led: 2,
            activity_led: 5,
            reset_button: default_reset_button(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    pub heartbeat_interval_ms: u64,
    pub activity_pulse_ms: u64,
    pub fault_pulse_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            activity_pulse_ms: DEFAULT_PULSE_MS,
            fault_pulse_ms: DEFAULT_PULSE_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub buffer_limit: usize,
    pub baud: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            buffer_limit: DEFAULT_SERIAL_BUFFER_LIMIT,
            baud: DEFAULT_SERIAL_BAUD,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalConfig {
    #[serde(default)]
    pub maintenance_phone: Option<String>,
    #[serde(default)]
    pub user_manual_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    #[serde(default)]
    pub pins: PinConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub portal: PortalConfig,
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        if self.serial.buffer_limit == 0 {
            self.serial.buffer_limit = DEFAULT_SERIAL_BUFFER_LIMIT;
        }
        if self.serial.baud == 0 {
            self.serial.baud = DEFAULT_SERIAL_BAUD;
        }
        if self.timing.activity_pulse_ms == 0 {
            self.timing.activity_pulse_ms = DEFAULT_PULSE_MS;
        }
        if self.timing.fault_pulse_ms == 0 {
            self.timing.fault_pulse_ms = DEFAULT_PULSE_MS;
        }
        if self.timing.heartbeat_interval_ms == 0 {
            self.timing.heartbeat_interval_ms = DEFAULT_HEARTBEAT_INTERVAL_MS;
        }
        if self.network.client_id.trim().is_empty() {
            self.network.client_id = DEFAULT_CLIENT_ID.to_string();
        }
    }

    /// Fills empty default credentials from build-time `WIFI_SSID`/`WIFI_PASS`.
    pub fn apply_build_defaults(&mut self) {
        if self.network.wifi_ssid.is_empty() {
            if let Some(ssid) = option_env!("WIFI_SSID") {
                self.network.wifi_ssid = ssid.to_string();
            }
        }
        if self.network.wifi_pass.is_empty() {
            if let Some(pass) = option_env!("WIFI_PASS") {
                self.network.wifi_pass = pass.to_string();
            }
        }
    }
}
