use log::{info, warn};

use crate::{
    config::{NetworkConfig, TopicConfig},
    hal::MqttClient,
    serial_bridge::Publisher,
    topics::{GREETING_PAYLOAD, HEARTBEAT_PREFIX},
};

pub const MQTT_RETRY_INTERVAL_MS: u64 = 2_000;

/// Broker session bookkeeping on top of a bare client: throttled reconnects,
/// subscriptions, greeting and heartbeat.
pub struct MqttLayer<M: MqttClient> {
    client: M,
    host: String,
    port: u16,
    client_id: String,
    topics: TopicConfig,
    heartbeat_interval_ms: u64,
    last_heartbeat_ms: u64,
    last_retry_ms: Option<u64>,
}

impl<M: MqttClient> MqttLayer<M> {
    pub fn new(
        client: M,
        network: &NetworkConfig,
        topics: &TopicConfig,
        heartbeat_interval_ms: u64,
    ) -> Self {
        Self {
            client,
            host: network.mqtt_host.clone(),
            port: network.mqtt_port,
            client_id: network.client_id.clone(),
            topics: topics.clone(),
            heartbeat_interval_ms,
            last_heartbeat_ms: 0,
            last_retry_ms: None,
        }
    }

    pub fn begin(&mut self) {
        self.client.set_server(&self.host, self.port);
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Never more than one connect attempt per retry interval.
    pub fn ensure_connected(&mut self, now_ms: u64) -> bool {
        if self.client.is_connected() {
            return true;
        }

        if let Some(last) = self.last_retry_ms {
            if now_ms.saturating_sub(last) < MQTT_RETRY_INTERVAL_MS {
                return false;
            }
        }

        info!("mqtt disconnected, retrying");
        self.last_retry_ms = Some(now_ms);
        if self.try_connect() {
            self.last_heartbeat_ms = now_ms;
            return true;
        }
        false
    }

    fn try_connect(&mut self) -> bool {
        if !self.client.connect(&self.client_id) {
            warn!(
                "mqtt connect to {}:{} failed, rc={}",
                self.host,
                self.port,
                self.client.state()
            );
            return false;
        }

        info!("mqtt connected as `{}`", self.client_id);
        if !self.topics.primary.is_empty() {
            if self.client.subscribe(&self.topics.primary) {
                info!("subscribed to `{}`", self.topics.primary);
            }
            if self
                .client
                .publish(&self.topics.primary, GREETING_PAYLOAD.as_bytes())
            {
                info!("published greeting on `{}`", self.topics.primary);
            }
        }
        if !self.topics.serial.is_empty()
            && self.topics.mirrors_serial()
            && self.client.subscribe(&self.topics.serial)
        {
            info!("subscribed to serial topic `{}`", self.topics.serial);
        }
        true
    }

    pub fn service(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) {
        self.client.poll(on_message);
    }

    /// True when a heartbeat went out on this call.
    pub fn handle_heartbeat(&mut self, now_ms: u64, enabled: bool) -> bool {
        if !enabled || !self.client.is_connected() || self.topics.primary.is_empty() {
            return false;
        }
        if now_ms.saturating_sub(self.last_heartbeat_ms) < self.heartbeat_interval_ms {
            return false;
        }

        let message = format!("{HEARTBEAT_PREFIX}{}", now_ms / 1000);
        if self
            .client
            .publish(&self.topics.primary, message.as_bytes())
        {
            info!("published: {message}");
            self.last_heartbeat_ms = now_ms;
            return true;
        }
        warn!("heartbeat publish failed");
        false
    }

    pub fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        if topic.is_empty() {
            return false;
        }
        self.client.publish(topic, payload)
    }
}

impl<M: MqttClient> Publisher for MqttLayer<M> {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        MqttLayer::publish(self, topic, payload)
    }
}
