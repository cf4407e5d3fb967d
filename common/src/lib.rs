pub mod config;
pub mod controller;
pub mod credentials;
pub mod dns;
pub mod hal;
pub mod leds;
pub mod mqtt;
pub mod portal;
pub mod serial_bridge;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{DeviceConfig, NetworkConfig, PinConfig, PortalConfig, TopicConfig};
pub use controller::DeviceController;
pub use credentials::CredentialStore;
pub use hal::{Parts, Platform, PlatformError};
pub use leds::LedSubsystem;
pub use mqtt::MqttLayer;
pub use portal::{ProvisioningManager, SubmitError};
pub use serial_bridge::{ForwardOutcome, LinkState, Publisher, SerialForwarder};
pub use topics::*;
pub use types::{ActiveNetwork, PortalRequest, PortalResponse, StoredCredentials, WifiMode};
