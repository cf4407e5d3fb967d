pub const DEFAULT_PRIMARY_TOPIC: &str = "esp32/test/mah1ro";
pub const DEFAULT_SERIAL_TOPIC: &str = "esp32/test/mah1ro/serial";

pub const GREETING_PAYLOAD: &str = "Hello from ESP32!";
pub const HEARTBEAT_PREFIX: &str = "ESP heartbeat: ";

pub const MAX_INBOUND_PAYLOAD_BYTES: usize = 512;
