//! Seams to the hardware and network stacks the bridge runs on.
//!
//! Everything here is polled from the single control loop. Implementations
//! must not block except where noted.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::types::{PortalRequest, PortalResponse, WifiMode};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("wifi failure: {0}")]
    Wifi(String),
    #[error("http server failure: {0}")]
    Http(String),
    #[error("dns responder failure: {0}")]
    Dns(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// EEPROM-style byte storage: reads and writes hit a RAM image until `commit`.
pub trait Storage {
    fn begin(&mut self, size: usize) -> Result<(), PlatformError>;
    fn read(&self, addr: usize) -> u8;
    fn write(&mut self, addr: usize, value: u8);
    fn commit(&mut self) -> Result<(), PlatformError>;
}

pub trait WifiDriver {
    fn set_mode(&mut self, mode: WifiMode) -> Result<(), PlatformError>;
    fn begin_station(&mut self, ssid: &str, password: Option<&str>) -> Result<(), PlatformError>;
    fn disconnect_station(&mut self);
    fn is_connected(&self) -> bool;
    fn start_access_point(&mut self, ssid: &str) -> Result<(), PlatformError>;
    fn stop_access_point(&mut self);
    fn access_point_ip(&self) -> Ipv4Addr;
    fn local_ip(&self) -> Option<Ipv4Addr>;
    fn rssi(&self) -> Option<i8>;
}

pub trait MqttClient {
    fn set_server(&mut self, host: &str, port: u16);
    /// One connection attempt; may block for the duration of that attempt.
    fn connect(&mut self, client_id: &str) -> bool;
    fn is_connected(&self) -> bool;
    /// Reason code of the last failed connect, for logging.
    fn state(&self) -> i32;
    fn subscribe(&mut self, topic: &str) -> bool;
    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool;
    /// Services keepalive and hands every received message to `on_message`.
    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8]));
}

pub trait HttpServer {
    fn start(&mut self) -> Result<(), PlatformError>;
    fn stop(&mut self);
    /// Answers every request waiting right now, then returns.
    fn handle_client(&mut self, handler: &mut dyn FnMut(&PortalRequest) -> PortalResponse);
}

pub trait DnsResponder {
    fn start(&mut self, port: u16, answer: Ipv4Addr) -> Result<(), PlatformError>;
    fn process_next_request(&mut self);
    fn stop(&mut self);
}

pub trait IndicatorPin {
    fn set_asserted(&mut self, asserted: bool);
}

pub trait ResetInput {
    fn is_pressed(&mut self) -> bool;
}

pub trait SerialPort {
    fn begin(&mut self, baud: u32);
    fn read_byte(&mut self) -> Option<u8>;
}

pub trait Clock {
    fn now_ms(&self) -> u64;
    fn delay_ms(&mut self, ms: u64);
}

pub trait SystemControl {
    fn restart(&mut self);
    fn device_id(&self) -> String;
}

pub trait Platform {
    type Wifi: WifiDriver;
    type Mqtt: MqttClient;
    type Http: HttpServer;
    type Dns: DnsResponder;
    type Storage: Storage;
    type Indicator: IndicatorPin;
    type Button: ResetInput;
    type Serial: SerialPort;
    type Clock: Clock;
    type System: SystemControl;
}

pub struct Parts<P: Platform> {
    pub wifi: P::Wifi,
    pub mqtt: P::Mqtt,
    pub http: P::Http,
    pub dns: P::Dns,
    pub storage: P::Storage,
    pub status_led: P::Indicator,
    pub activity_led: P::Indicator,
    pub reset_button: Option<P::Button>,
    pub serial: P::Serial,
    pub clock: P::Clock,
    pub system: P::System,
}
