use log::{debug, info, warn};

use crate::{
    config::DeviceConfig,
    credentials::CredentialStore,
    hal::{Clock, Parts, Platform, ResetInput, SerialPort, SystemControl, WifiDriver},
    leds::LedSubsystem,
    mqtt::{MqttLayer, MQTT_RETRY_INTERVAL_MS},
    portal::ProvisioningManager,
    serial_bridge::{LinkState, SerialForwarder},
    topics::MAX_INBOUND_PAYLOAD_BYTES,
    types::{ActiveNetwork, ControlCommand, StoredCredentials, WifiMode},
};

pub const WIFI_RETRY_INTERVAL_MS: u64 = 2_000;
pub const WIFI_CONNECT_TIMEOUT_MS: u64 = 20_000;
pub const WIFI_POLL_INTERVAL_MS: u64 = 500;
pub const WIFI_SETTLE_MS: u64 = 100;
pub const RESET_HOLD_MS: u64 = 10_000;
pub const PROVISIONING_RECHECK_MS: u64 = 1_000;
pub const LOOP_DELAY_MS: u64 = 10;
const RESTART_DELAY_MS: u64 = 100;

#[derive(Debug, Default)]
struct ResetHold {
    pressed_at_ms: Option<u64>,
    fired: bool,
}

/// Owns every subsystem and runs them from one cooperative loop:
/// `begin` once, then `tick` forever.
pub struct DeviceController<P: Platform> {
    config: DeviceConfig,
    wifi: P::Wifi,
    mqtt: MqttLayer<P::Mqtt>,
    store: CredentialStore<P::Storage>,
    portal: ProvisioningManager<P::Http, P::Dns>,
    leds: LedSubsystem<P::Indicator>,
    forwarder: SerialForwarder,
    serial: P::Serial,
    reset_button: Option<P::Button>,
    clock: P::Clock,
    system: P::System,
    device_id: String,
    credentials: StoredCredentials,
    network: ActiveNetwork,
    heartbeat_enabled: bool,
    wifi_ready: bool,
    last_wifi_retry_ms: u64,
    join_started_ms: Option<u64>,
    last_provisioning_check_ms: u64,
    reset_hold: ResetHold,
}

impl<P: Platform> DeviceController<P> {
    pub fn new(mut config: DeviceConfig, parts: Parts<P>) -> Self {
        config.sanitize();

        let leds = LedSubsystem::new(
            parts.activity_led,
            parts.status_led,
            config.timing.activity_pulse_ms,
            config.timing.fault_pulse_ms,
        );
        let mqtt = MqttLayer::new(
            parts.mqtt,
            &config.network,
            &config.topics,
            config.timing.heartbeat_interval_ms,
        );
        let portal = ProvisioningManager::new(parts.http, parts.dns, config.portal.clone());
        let device_id = parts.system.device_id();

        Self {
            forwarder: SerialForwarder::new(config.serial.buffer_limit),
            wifi: parts.wifi,
            mqtt,
            store: CredentialStore::new(parts.storage),
            portal,
            leds,
            serial: parts.serial,
            reset_button: parts.reset_button,
            clock: parts.clock,
            system: parts.system,
            device_id,
            credentials: StoredCredentials::invalid(),
            network: ActiveNetwork::default(),
            heartbeat_enabled: true,
            wifi_ready: false,
            last_wifi_retry_ms: 0,
            join_started_ms: None,
            last_provisioning_check_ms: 0,
            reset_hold: ResetHold::default(),
            config,
        }
    }

    pub fn begin(&mut self) {
        self.serial.begin(self.config.serial.baud);
        self.leds.begin();
        self.initialize_credentials();
        self.mqtt.begin();

        if !self.credentials.is_valid() || !self.connect_wifi() {
            let now = self.clock.now_ms();
            self.start_provisioning(now);
        }

        let now = self.clock.now_ms();
        self.last_wifi_retry_ms = now;
        self.last_provisioning_check_ms = now;
        let ready = self.wifi.is_connected() && self.mqtt.is_connected();
        self.leds.tick(now, ready);
    }

    pub fn tick(&mut self) {
        let now = self.clock.now_ms();

        if self.handle_reset_button(now) {
            return;
        }
        self.handle_provisioning(now);

        let provisioning = self.portal.is_provisioning();
        if !provisioning && self.credentials.is_valid() {
            self.ensure_wifi_connected(now);
        }

        // The station may still be associated while the portal runs; it does
        // not count as connected then.
        let wifi_connected =
            !provisioning && self.credentials.is_valid() && self.wifi.is_connected();
        let mut mqtt_connected = false;

        if wifi_connected {
            mqtt_connected = self.mqtt.ensure_connected(now);
            if mqtt_connected {
                let primary = &self.config.topics.primary;
                let heartbeat_enabled = &mut self.heartbeat_enabled;
                self.mqtt.service(&mut |topic, payload| {
                    apply_control_message(primary, topic, payload, heartbeat_enabled)
                });
                if self.mqtt.handle_heartbeat(now, self.heartbeat_enabled) {
                    self.leds.request_user_pulse(now);
                }
            }
        }

        let link = LinkState {
            wifi_connected,
            mqtt_connected,
        };
        self.forwarder.process(
            now,
            &mut self.serial,
            link,
            &self.config.topics,
            &mut self.mqtt,
            &mut self.leds,
        );
        self.leds.tick(now, wifi_connected && mqtt_connected);
        self.clock.delay_ms(LOOP_DELAY_MS);
    }

    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat_enabled
    }

    pub fn is_provisioning(&self) -> bool {
        self.portal.is_provisioning()
    }

    pub fn is_blinking(&self) -> bool {
        self.leds.is_blinking()
    }

    pub fn is_wifi_ready(&self) -> bool {
        self.wifi_ready
    }

    pub fn credentials(&self) -> &StoredCredentials {
        &self.credentials
    }

    pub fn active_network(&self) -> &ActiveNetwork {
        &self.network
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn initialize_credentials(&mut self) {
        if let Some(stored) = self.store.load() {
            info!("credentials loaded from storage");
            self.apply_credentials(stored);
            return;
        }

        let defaults = &self.config.network;
        if !defaults.wifi_ssid.is_empty() {
            info!("using default credentials from configuration");
            let creds = StoredCredentials::new(&defaults.wifi_ssid, &defaults.wifi_pass);
            self.apply_credentials(creds);
            return;
        }

        info!("no credentials available");
        self.clear_credentials();
    }

    fn apply_credentials(&mut self, creds: StoredCredentials) {
        self.network = ActiveNetwork::from_credentials(&creds);
        self.credentials = creds;
        self.wifi_ready = false;
        self.join_started_ms = None;
        if let Some(ssid) = &self.network.ssid {
            info!("active SSID: {ssid}");
        }
    }

    fn clear_credentials(&mut self) {
        self.network = ActiveNetwork::default();
        self.credentials = StoredCredentials::invalid();
    }

    fn forget_credentials(&mut self) {
        if let Err(err) = self.store.clear() {
            warn!("failed to clear stored credentials: {err}");
        }
        self.clear_credentials();
    }

    fn join_station(&mut self) -> bool {
        let Some(ssid) = self.network.ssid.as_deref() else {
            return false;
        };
        if let Err(err) = self.wifi.set_mode(WifiMode::Station) {
            warn!("failed to switch to station mode: {err}");
            return false;
        }
        self.wifi.disconnect_station();
        self.clock.delay_ms(WIFI_SETTLE_MS);
        if let Err(err) = self
            .wifi
            .begin_station(ssid, self.network.password.as_deref())
        {
            warn!("failed to start joining `{ssid}`: {err}");
            return false;
        }
        let now = self.clock.now_ms();
        self.last_wifi_retry_ms = now;
        self.join_started_ms = Some(now);
        true
    }

    /// Blocking join used at start-up and on portal handoff: waits up to the
    /// connect timeout for the link, then for the broker.
    fn connect_wifi(&mut self) -> bool {
        if !self.credentials.is_valid() {
            return false;
        }

        self.wifi.stop_access_point();
        if !self.join_station() {
            self.wifi_ready = false;
            return false;
        }

        info!("connecting to wifi");
        let started = self.clock.now_ms();
        while !self.wifi.is_connected()
            && self.clock.now_ms().saturating_sub(started) < WIFI_CONNECT_TIMEOUT_MS
        {
            self.clock.delay_ms(WIFI_POLL_INTERVAL_MS);
        }

        if !self.wifi.is_connected() {
            warn!("wifi connection failed");
            self.wifi_ready = false;
            return false;
        }

        info!(
            "wifi connected, ip={:?} rssi={:?}",
            self.wifi.local_ip(),
            self.wifi.rssi()
        );
        self.wifi_ready = true;
        self.join_started_ms = None;

        let mqtt_started = self.clock.now_ms();
        while !self.mqtt.ensure_connected(self.clock.now_ms()) {
            if self.clock.now_ms().saturating_sub(mqtt_started) >= WIFI_CONNECT_TIMEOUT_MS {
                warn!("mqtt still unavailable, continuing with periodic retries");
                break;
            }
            self.clock.delay_ms(MQTT_RETRY_INTERVAL_MS);
        }

        let now = self.clock.now_ms();
        self.leds.set_err_blinking(false, now);
        true
    }

    fn ensure_wifi_connected(&mut self, now: u64) {
        if !self.credentials.is_valid() || self.network.ssid.is_none() {
            return;
        }
        if self.wifi.is_connected() {
            self.wifi_ready = true;
            self.join_started_ms = None;
            return;
        }
        if now.saturating_sub(self.last_wifi_retry_ms) < WIFI_RETRY_INTERVAL_MS {
            return;
        }

        self.wifi_ready = false;
        self.last_wifi_retry_ms = now;
        // A join in flight gets the full connect timeout before it is restarted.
        if let Some(started) = self.join_started_ms {
            if now.saturating_sub(started) < WIFI_CONNECT_TIMEOUT_MS {
                debug!("wifi join in progress");
                return;
            }
        }

        info!("wifi disconnected, retrying");
        self.join_station();
    }

    fn start_provisioning(&mut self, now: u64) {
        self.leds.set_err_blinking(true, now);
        if !self.portal.is_provisioning() {
            if let Err(err) = self.portal.begin(&mut self.wifi) {
                warn!("failed to start provisioning: {err}");
            }
        }
        self.last_provisioning_check_ms = now;
    }

    fn stop_provisioning(&mut self, now: u64) {
        self.portal.stop(&mut self.wifi);
        self.leds.set_err_blinking(false, now);
    }

    fn handle_provisioning(&mut self, now: u64) {
        if self.portal.is_provisioning() {
            self.portal
                .service(&mut self.wifi, &mut self.store, &self.device_id);
            self.last_provisioning_check_ms = now;
        } else if !self.credentials.is_valid()
            && now.saturating_sub(self.last_provisioning_check_ms) > PROVISIONING_RECHECK_MS
        {
            self.start_provisioning(now);
        }

        if !self.portal.has_new_credentials() {
            return;
        }
        let creds = self.portal.consume_credentials();
        if !creds.is_valid() {
            return;
        }

        info!("credentials received, attempting connection");
        self.apply_credentials(creds);
        let connected = self.connect_wifi();
        let now = self.clock.now_ms();
        if connected {
            self.stop_provisioning(now);
        } else {
            warn!("connection with new credentials failed, re-entering provisioning");
            self.forget_credentials();
            self.start_provisioning(now);
        }
    }

    /// True when a completed hold restarted the device.
    fn handle_reset_button(&mut self, now: u64) -> bool {
        let Some(button) = self.reset_button.as_mut() else {
            return false;
        };

        if !button.is_pressed() {
            self.reset_hold = ResetHold::default();
            return false;
        }

        let pressed_at = *self.reset_hold.pressed_at_ms.get_or_insert(now);
        if self.reset_hold.fired || now.saturating_sub(pressed_at) < RESET_HOLD_MS {
            return false;
        }

        info!("reset hold detected, clearing credentials");
        self.reset_hold.fired = true;
        self.forget_credentials();
        self.start_provisioning(now);
        self.clock.delay_ms(RESTART_DELAY_MS);
        self.system.restart();
        true
    }
}

/// Applies `{"cmd":"heartbeat","enable":bool}` received on the primary topic.
/// Anything else is logged and dropped.
fn apply_control_message(primary: &str, topic: &str, payload: &[u8], heartbeat: &mut bool) {
    if payload.len() > MAX_INBOUND_PAYLOAD_BYTES {
        warn!(
            "dropping {} byte message on `{topic}` (limit {MAX_INBOUND_PAYLOAD_BYTES})",
            payload.len()
        );
        return;
    }
    info!(
        "message arrived [{topic}]: {}",
        String::from_utf8_lossy(payload)
    );
    if topic != primary {
        return;
    }

    match serde_json::from_slice::<ControlCommand>(payload) {
        Ok(command) if command.cmd == "heartbeat" => {
            *heartbeat = command.enable;
            info!(
                "heartbeat switched {}",
                if command.enable { "on" } else { "off" }
            );
        }
        Ok(command) => debug!("ignoring unknown command `{}`", command.cmd),
        Err(err) => debug!("ignoring malformed control message: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{test_parts, Handles, TestPlatform},
        topics::GREETING_PAYLOAD,
        types::PortalRequest,
    };
    use pretty_assertions::assert_eq;

    const PRIMARY: &str = "esp32/test/mah1ro";
    const SERIAL: &str = "esp32/test/mah1ro/serial";

    fn controller(
        config: DeviceConfig,
        setup: impl FnOnce(&Handles),
    ) -> (DeviceController<TestPlatform>, Handles) {
        let (parts, handles) = test_parts();
        setup(&handles);
        let mut controller = DeviceController::new(config, parts);
        controller.begin();
        (controller, handles)
    }

    fn seeded(handles: &Handles, ssid: &str, password: &str) {
        CredentialStore::new(handles.storage.clone())
            .save(&StoredCredentials::new(ssid, password))
            .unwrap();
    }

    fn stored(handles: &Handles) -> Option<StoredCredentials> {
        CredentialStore::new(handles.storage.clone()).load()
    }

    fn connected() -> (DeviceController<TestPlatform>, Handles) {
        controller(DeviceConfig::default(), |h| {
            seeded(h, "home", "secret");
            h.wifi.reachable("home", Some("secret"), 1_000);
        })
    }

    fn tick_at(controller: &mut DeviceController<TestPlatform>, handles: &Handles, now: u64) {
        handles.clock.set(now);
        controller.tick();
    }

    #[test]
    fn begin_joins_stored_network_and_greets() {
        let (mut controller, handles) = connected();

        assert!(!controller.is_provisioning());
        assert!(!controller.is_blinking());
        assert!(controller.is_wifi_ready());
        assert_eq!(handles.wifi.joins(), vec!["home".to_string()]);
        assert_eq!(handles.wifi.ap_starts(), 0);
        assert_eq!(handles.serial.baud(), Some(115_200));
        assert_eq!(handles.mqtt.published_on(PRIMARY), vec![GREETING_PAYLOAD]);
        assert_eq!(
            handles.mqtt.subscriptions(),
            vec![PRIMARY.to_string(), SERIAL.to_string()]
        );

        controller.tick();
        assert!(handles.status_led.level());
    }

    #[test]
    fn begin_without_credentials_enters_provisioning() {
        let (mut controller, handles) = controller(DeviceConfig::default(), |_| {});

        assert!(controller.is_provisioning());
        assert!(controller.is_blinking());
        assert!(!controller.credentials().is_valid());
        assert_eq!(handles.wifi.ap_ssid().as_deref(), Some("esp-sta"));
        assert!(handles.wifi.joins().is_empty());

        controller.tick();
        assert_eq!(handles.dns.processed(), 1);
        assert_eq!(handles.mqtt.connect_attempts(), 0);
    }

    #[test]
    fn configured_defaults_are_used_when_store_is_empty() {
        let mut config = DeviceConfig::default();
        config.network.wifi_ssid = "office".to_string();
        config.network.wifi_pass = String::new();
        let (controller, handles) = controller(config, |h| {
            h.wifi.reachable("office", None, 0);
        });

        assert!(!controller.is_provisioning());
        assert_eq!(controller.active_network().ssid.as_deref(), Some("office"));
        assert_eq!(controller.active_network().password, None);
        assert_eq!(stored(&handles), None);
    }

    #[test]
    fn stored_credentials_win_over_defaults() {
        let mut config = DeviceConfig::default();
        config.network.wifi_ssid = "office".to_string();
        let (controller, handles) = controller(config, |h| {
            seeded(h, "home", "secret");
            h.wifi.reachable("home", Some("secret"), 0);
            h.wifi.reachable("office", None, 0);
        });

        assert_eq!(controller.credentials().ssid(), "home");
        assert_eq!(handles.wifi.joins(), vec!["home".to_string()]);
    }

    #[test]
    fn unreachable_network_falls_back_to_portal_after_timeout() {
        let (controller, handles) = controller(DeviceConfig::default(), |h| {
            seeded(h, "home", "secret");
        });

        assert!(controller.is_provisioning());
        assert!(controller.is_blinking());
        assert!(handles.clock.now_ms() >= WIFI_CONNECT_TIMEOUT_MS);
        // Startup failure keeps the stored record; only a failed handoff clears it.
        assert!(stored(&handles).is_some());
    }

    #[test]
    fn portal_handoff_success_stops_provisioning() {
        let (mut controller, handles) = controller(DeviceConfig::default(), |h| {
            h.wifi.reachable("home", Some("secret"), 500);
        });
        handles.http.request(PortalRequest::post_form(
            "/submit",
            &[("ssid", "home"), ("password", "secret")],
        ));

        controller.tick();

        assert!(!controller.is_provisioning());
        assert!(!controller.is_blinking());
        assert!(controller.credentials().is_valid());
        assert_eq!(controller.credentials().ssid(), "home");
        assert_eq!(stored(&handles), Some(StoredCredentials::new("home", "secret")));
        assert_eq!(handles.wifi.ap_ssid(), None);
        assert_eq!(handles.mqtt.published_on(PRIMARY), vec![GREETING_PAYLOAD]);
        assert!(handles.status_led.level());
    }

    #[test]
    fn portal_handoff_failure_clears_and_reprovisions() {
        let (mut controller, handles) = controller(DeviceConfig::default(), |_| {});
        handles.http.request(PortalRequest::post_form(
            "/submit",
            &[("ssid", "typo"), ("password", "secret")],
        ));

        controller.tick();

        assert!(controller.is_provisioning());
        assert!(controller.is_blinking());
        assert!(!controller.credentials().is_valid());
        assert_eq!(controller.active_network(), &ActiveNetwork::default());
        assert_eq!(stored(&handles), None);
        assert_eq!(handles.wifi.ap_starts(), 2);
        assert_eq!(handles.wifi.joins(), vec!["typo".to_string()]);
    }

    #[test]
    fn reset_released_before_threshold_does_nothing() {
        let (mut controller, handles) = connected();
        let start = handles.clock.now_ms() + 1_000;

        handles.button.press();
        tick_at(&mut controller, &handles, start);
        tick_at(&mut controller, &handles, start + 9_999);
        handles.button.release();
        tick_at(&mut controller, &handles, start + 10_500);

        assert_eq!(handles.system.restarts(), 0);
        assert!(stored(&handles).is_some());
        assert!(controller.credentials().is_valid());
        assert!(!controller.is_provisioning());
    }

    #[test]
    fn reset_hold_fires_once_per_press() {
        let (mut controller, handles) = connected();
        let start = handles.clock.now_ms() + 1_000;

        handles.button.press();
        tick_at(&mut controller, &handles, start);
        tick_at(&mut controller, &handles, start + 10_000);

        assert_eq!(handles.system.restarts(), 1);
        assert_eq!(stored(&handles), None);
        assert!(!controller.credentials().is_valid());
        assert!(controller.is_provisioning());
        assert!(controller.is_blinking());

        tick_at(&mut controller, &handles, start + 25_000);
        tick_at(&mut controller, &handles, start + 40_000);
        assert_eq!(handles.system.restarts(), 1);

        handles.button.release();
        tick_at(&mut controller, &handles, start + 41_000);
        handles.button.press();
        tick_at(&mut controller, &handles, start + 42_000);
        tick_at(&mut controller, &handles, start + 52_000);
        assert_eq!(handles.system.restarts(), 2);
    }

    #[test]
    fn heartbeat_is_published_and_pulses_activity() {
        let (mut controller, handles) = connected();
        let connected_at = handles.clock.now_ms();

        tick_at(&mut controller, &handles, connected_at + 5_000);

        let beats = handles.mqtt.published_on(PRIMARY);
        assert_eq!(beats.len(), 2);
        assert!(beats[1].starts_with("ESP heartbeat: "));
        assert!(handles.activity_led.level());
    }

    #[test]
    fn control_message_toggles_heartbeat() {
        let (mut controller, handles) = connected();
        let connected_at = handles.clock.now_ms();

        handles
            .mqtt
            .deliver(PRIMARY, br#"{"cmd":"heartbeat","enable":false}"#);
        tick_at(&mut controller, &handles, connected_at + 6_000);

        assert!(!controller.heartbeat_enabled());
        assert_eq!(handles.mqtt.published_on(PRIMARY).len(), 1);

        handles
            .mqtt
            .deliver(PRIMARY, br#"{"cmd":"heartbeat","enable":true}"#);
        tick_at(&mut controller, &handles, connected_at + 6_100);
        assert!(controller.heartbeat_enabled());
        assert_eq!(handles.mqtt.published_on(PRIMARY).len(), 2);
    }

    #[test]
    fn unrecognized_control_messages_are_ignored() {
        let mut enabled = true;

        apply_control_message(PRIMARY, PRIMARY, b"not json", &mut enabled);
        apply_control_message(PRIMARY, PRIMARY, br#"{"cmd":"reboot"}"#, &mut enabled);
        apply_control_message(
            PRIMARY,
            SERIAL,
            br#"{"cmd":"heartbeat","enable":false}"#,
            &mut enabled,
        );
        assert!(enabled);

        let mut oversized = br#"{"cmd":"heartbeat","enable":false}"#.to_vec();
        oversized.resize(MAX_INBOUND_PAYLOAD_BYTES + 1, b' ');
        apply_control_message(PRIMARY, PRIMARY, &oversized, &mut enabled);
        assert!(enabled);

        apply_control_message(PRIMARY, PRIMARY, br#"{"cmd":"heartbeat"}"#, &mut enabled);
        assert!(!enabled);
    }

    #[test]
    fn serial_lines_are_forwarded_when_connected() {
        let (mut controller, handles) = connected();
        handles.serial.feed(b"temp=21\n");

        controller.tick();

        assert_eq!(handles.mqtt.published_on(SERIAL), vec!["temp=21"]);
        assert_eq!(handles.mqtt.published_on(PRIMARY).last().unwrap(), "temp=21");
        assert!(handles.activity_led.level());
    }

    #[test]
    fn serial_lines_are_dropped_while_provisioning() {
        let (mut controller, handles) = controller(DeviceConfig::default(), |_| {});
        handles.serial.feed(b"hello\r");

        controller.tick();

        assert!(handles.mqtt.published().is_empty());
        assert!(handles.status_led.level());
        assert!(!handles.activity_led.level());
    }

    #[test]
    fn stalled_join_is_restarted_after_connect_timeout() {
        let (mut controller, handles) = connected();
        handles.wifi.forget("home");
        handles.wifi.lose_link();
        let joins_before = handles.wifi.joins().len();

        handles.clock.set(50_000);
        while handles.clock.now_ms() < 69_000 {
            controller.tick();
        }
        assert_eq!(handles.wifi.joins().len() - joins_before, 1);
        assert!(!controller.is_wifi_ready());
        assert!(!handles.status_led.level());

        while handles.clock.now_ms() < 75_000 {
            controller.tick();
        }
        assert_eq!(handles.wifi.joins().len() - joins_before, 2);
    }

    #[test]
    fn slow_join_is_left_to_finish() {
        let (mut controller, handles) = connected();
        handles.wifi.reachable("home", Some("secret"), 2_500);
        handles.wifi.lose_link();
        let joins_before = handles.wifi.joins().len();

        tick_at(&mut controller, &handles, 50_000);
        assert!(!controller.is_wifi_ready());
        while handles.clock.now_ms() < 60_000 && !controller.is_wifi_ready() {
            controller.tick();
        }

        assert!(controller.is_wifi_ready());
        assert_eq!(handles.wifi.joins().len() - joins_before, 1);
        assert!(handles.clock.now_ms() < 53_000);

        controller.tick();
        assert!(handles.status_led.level());
    }
}
