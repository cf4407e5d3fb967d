use log::{info, warn};

use crate::{
    config::TopicConfig,
    hal::{IndicatorPin, SerialPort},
    leds::LedSubsystem,
};

pub trait Publisher {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkState {
    pub wifi_connected: bool,
    pub mqtt_connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Empty,
    WifiDown,
    MqttDown,
    Published { serial_ok: bool, primary_ok: bool },
}

impl ForwardOutcome {
    pub fn delivered(self) -> bool {
        matches!(
            self,
            Self::Published { serial_ok, primary_ok } if serial_ok || primary_ok
        )
    }
}

/// Line-buffered serial to MQTT bridge. `\n`, `\r` and the escapes `\n`,
/// `\N`, `\r`, `\R` end a line; other escapes are kept verbatim. Bytes past
/// the limit are dropped.
pub struct SerialForwarder {
    buffer: Vec<u8>,
    escape_pending: bool,
    limit: usize,
}

impl SerialForwarder {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(limit),
            escape_pending: false,
            limit,
        }
    }

    /// Feeds one byte; returns true when the byte completed a line.
    pub fn push_byte(&mut self, byte: u8) -> bool {
        if self.escape_pending {
            self.escape_pending = false;
            if matches!(byte, b'n' | b'N' | b'r' | b'R') {
                return true;
            }
            self.append(b'\\');
            self.append(byte);
            return false;
        }

        match byte {
            b'\\' => {
                self.escape_pending = true;
                false
            }
            b'\r' | b'\n' => true,
            _ => {
                self.append(byte);
                false
            }
        }
    }

    fn append(&mut self, byte: u8) {
        if self.buffer.len() < self.limit {
            self.buffer.push(byte);
        }
    }

    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn process<S, P, O>(
        &mut self,
        now_ms: u64,
        serial: &mut S,
        link: LinkState,
        topics: &TopicConfig,
        publisher: &mut P,
        leds: &mut LedSubsystem<O>,
    ) where
        S: SerialPort,
        P: Publisher,
        O: IndicatorPin,
    {
        while let Some(byte) = serial.read_byte() {
            if self.push_byte(byte) {
                self.flush(now_ms, link, topics, publisher, leds);
            }
        }
    }

    pub fn flush<P: Publisher, O: IndicatorPin>(
        &mut self,
        now_ms: u64,
        link: LinkState,
        topics: &TopicConfig,
        publisher: &mut P,
        leds: &mut LedSubsystem<O>,
    ) -> ForwardOutcome {
        if self.buffer.is_empty() {
            self.escape_pending = false;
            return ForwardOutcome::Empty;
        }

        let outcome = if !link.wifi_connected {
            warn!("serial forward skipped: wifi not connected");
            ForwardOutcome::WifiDown
        } else if !link.mqtt_connected {
            warn!("serial forward skipped: mqtt not connected");
            ForwardOutcome::MqttDown
        } else {
            let serial_ok = publisher.publish(&topics.serial, &self.buffer);
            let primary_ok = if topics.mirrors_serial() {
                publisher.publish(&topics.primary, &self.buffer)
            } else {
                serial_ok
            };
            ForwardOutcome::Published {
                serial_ok,
                primary_ok,
            }
        };

        match outcome {
            ForwardOutcome::Published {
                serial_ok,
                primary_ok,
            } if serial_ok || primary_ok => {
                if !serial_ok {
                    warn!("serial topic publish failed, mirrored via primary topic");
                }
                info!("forwarded serial: {}", String::from_utf8_lossy(&self.buffer));
                leds.request_user_pulse(now_ms);
            }
            ForwardOutcome::Published { .. } => {
                warn!("serial forward failed: mqtt publish error");
                leds.request_err_pulse(now_ms);
            }
            _ => leds.request_err_pulse(now_ms),
        }

        self.buffer.clear();
        self.escape_pending = false;
        outcome
    }
}
