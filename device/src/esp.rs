use core::convert::TryInto;
use std::{
    collections::VecDeque,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        mpsc, Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    gpio::{AnyIOPin, AnyOutputPin, Input, Output, PinDriver, Pull},
    uart::{config::Config as UartConfig, UartDriver},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mqtt::client::{EspMqttClient, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::EspError,
    wifi::EspWifi,
};
use log::{info, warn};

use bridge_common::{
    hal::{
        Clock, HttpServer, IndicatorPin, MqttClient, Platform, PlatformError, ResetInput,
        SerialPort, Storage, SystemControl, WifiDriver,
    },
    types::{HttpMethod, PortalRequest, PortalResponse, WifiMode},
    DeviceConfig, DeviceController, Parts,
};

use crate::captive_dns::UdpCaptiveDns;

const NVS_NAMESPACE: &str = "bridge";
const NVS_CONFIG_KEY: &str = "config";
const NVS_CREDENTIALS_KEY: &str = "creds";

const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_MQTT_PAYLOAD_BYTES: usize = 1024;
const MAX_HTTP_BODY: usize = 1024;
const PORTAL_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

// UART0 pins on the classic ESP32 dev boards.
const UART_TX_GPIO: i32 = 1;
const UART_RX_GPIO: i32 = 3;

const MQTT_STATE_CONNECTED: i32 = 0;
const MQTT_STATE_CONNECTION_TIMEOUT: i32 = -4;
const MQTT_STATE_CONNECT_FAILED: i32 = -2;
const MQTT_STATE_DISCONNECTED: i32 = -1;

struct EspPlatform;

impl Platform for EspPlatform {
    type Wifi = EspWifiDriver;
    type Mqtt = EspMqtt;
    type Http = EspPortal;
    type Dns = UdpCaptiveDns;
    type Storage = NvsStorage;
    type Indicator = GpioIndicator;
    type Button = GpioResetInput;
    type Serial = UartSerial;
    type Clock = EspClock;
    type System = EspSystem;
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut config = load_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load config from NVS: {err:#}");
        DeviceConfig::default()
    });
    config.apply_build_defaults();

    info!(
        "NVS config loaded: mqtt=`{}:{}`, topics=`{}`/`{}`",
        config.network.mqtt_host,
        config.network.mqtt_port,
        config.topics.primary,
        config.topics.serial,
    );

    let Peripherals { modem, uart0, .. } = Peripherals::take()?;
    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition.clone()))?;

    let serial = {
        // SAFETY: UART0 pins are not handed out anywhere else.
        let (tx, rx) = unsafe { (AnyIOPin::new(UART_TX_GPIO), AnyIOPin::new(UART_RX_GPIO)) };
        UartDriver::new(
            uart0,
            tx,
            rx,
            Option::<AnyIOPin>::None,
            Option::<AnyIOPin>::None,
            &UartConfig::default().baudrate(Hertz(config.serial.baud)),
        )?
    };

    let parts = Parts::<EspPlatform> {
        wifi: EspWifiDriver::new(wifi),
        mqtt: EspMqtt::default(),
        http: EspPortal::default(),
        dns: UdpCaptiveDns::new(None),
        storage: NvsStorage::new(nvs_partition),
        status_led: GpioIndicator::init(config.pins.status_led)?,
        activity_led: GpioIndicator::init(config.pins.activity_led)?,
        reset_button: match config.pins.reset_button {
            Some(pin) => Some(GpioResetInput::init(pin)?),
            None => None,
        },
        serial: UartSerial { uart: serial },
        clock: EspClock,
        system: EspSystem,
    };

    let mut controller = DeviceController::new(config, parts);
    controller.begin();
    loop {
        controller.tick();
    }
}

fn load_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<DeviceConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 2048];

    match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
        Some(value) => Ok(serde_json::from_str::<DeviceConfig>(value)?),
        None => Ok(DeviceConfig::default()),
    }
}

fn storage_error(err: EspError) -> PlatformError {
    PlatformError::Storage(err.to_string())
}

fn wifi_error(err: EspError) -> PlatformError {
    PlatformError::Wifi(err.to_string())
}

/// Credential image held in RAM and written to NVS as one blob on commit.
struct NvsStorage {
    partition: EspDefaultNvsPartition,
    nvs: Option<EspNvs<esp_idf_svc::nvs::NvsDefault>>,
    image: Vec<u8>,
}

impl NvsStorage {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            nvs: None,
            image: Vec::new(),
        }
    }
}

impl Storage for NvsStorage {
    fn begin(&mut self, size: usize) -> Result<(), PlatformError> {
        let nvs =
            EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(storage_error)?;
        let mut image = vec![0_u8; size];
        let stored_len = nvs
            .get_raw(NVS_CREDENTIALS_KEY, &mut image)
            .map_err(storage_error)?
            .map(<[u8]>::len);
        if let Some(len) = stored_len {
            image.truncate(len);
        }
        image.resize(size, 0);

        self.image = image;
        self.nvs = Some(nvs);
        Ok(())
    }

    fn read(&self, addr: usize) -> u8 {
        self.image.get(addr).copied().unwrap_or(0)
    }

    fn write(&mut self, addr: usize, value: u8) {
        if let Some(slot) = self.image.get_mut(addr) {
            *slot = value;
        }
    }

    fn commit(&mut self) -> Result<(), PlatformError> {
        let nvs = self
            .nvs
            .as_mut()
            .ok_or_else(|| PlatformError::Storage("storage not started".into()))?;
        nvs.set_raw(NVS_CREDENTIALS_KEY, &self.image)
            .map_err(storage_error)?;
        Ok(())
    }
}

struct EspWifiDriver {
    wifi: EspWifi<'static>,
    mode: WifiMode,
    client: ClientConfiguration,
    access_point: Option<AccessPointConfiguration>,
}

impl EspWifiDriver {
    fn new(wifi: EspWifi<'static>) -> Self {
        Self {
            wifi,
            mode: WifiMode::Station,
            client: ClientConfiguration::default(),
            access_point: None,
        }
    }

    fn apply(&mut self) -> Result<(), PlatformError> {
        let conf = match (self.mode, &self.access_point) {
            (WifiMode::AccessPointStation, Some(ap)) => {
                Configuration::Mixed(self.client.clone(), ap.clone())
            }
            _ => Configuration::Client(self.client.clone()),
        };
        self.wifi.set_configuration(&conf).map_err(wifi_error)?;
        if !self.wifi.is_started().map_err(wifi_error)? {
            self.wifi.start().map_err(wifi_error)?;
        }
        Ok(())
    }
}

impl WifiDriver for EspWifiDriver {
    fn set_mode(&mut self, mode: WifiMode) -> Result<(), PlatformError> {
        self.mode = mode;
        self.apply()
    }

    fn begin_station(&mut self, ssid: &str, password: Option<&str>) -> Result<(), PlatformError> {
        let password = password.unwrap_or_default();
        self.client = ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| PlatformError::Wifi("wifi ssid too long".into()))?,
            password: password
                .try_into()
                .map_err(|_| PlatformError::Wifi("wifi password too long".into()))?,
            auth_method: if password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPAWPA2Personal
            },
            ..Default::default()
        };
        self.apply()?;
        self.wifi.connect().map_err(wifi_error)
    }

    fn disconnect_station(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            warn!("wifi disconnect failed: {err}");
        }
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.sta_netif().is_up().unwrap_or(false)
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), PlatformError> {
        self.access_point = Some(AccessPointConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| PlatformError::Wifi("access point ssid too long".into()))?,
            auth_method: AuthMethod::None,
            channel: 1,
            ..Default::default()
        });
        self.mode = WifiMode::AccessPointStation;
        self.apply()?;
        info!("provisioning AP `{ssid}` started at {}", self.access_point_ip());
        Ok(())
    }

    fn stop_access_point(&mut self) {
        if self.access_point.take().is_some() {
            if let Err(err) = self.apply() {
                warn!("failed to drop access point: {err}");
            }
        }
    }

    fn access_point_ip(&self) -> Ipv4Addr {
        self.wifi
            .ap_netif()
            .get_ip_info()
            .map(|info| info.ip)
            .unwrap_or(Ipv4Addr::new(192, 168, 4, 1))
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        if !self.is_connected() {
            return None;
        }
        self.wifi.sta_netif().get_ip_info().ok().map(|info| info.ip)
    }

    fn rssi(&self) -> Option<i8> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then_some(ap_info.rssi)
    }
}

/// ESP-IDF MQTT client; a fresh client per connect attempt, events fed
/// through a shared queue drained by `poll`.
#[derive(Default)]
struct EspMqtt {
    url: String,
    client: Option<EspMqttClient<'static>>,
    connected: Arc<AtomicBool>,
    state: Arc<AtomicI32>,
    inbound: Arc<Mutex<VecDeque<(String, Vec<u8>)>>>,
}

impl MqttClient for EspMqtt {
    fn set_server(&mut self, host: &str, port: u16) {
        self.url = format!("mqtt://{host}:{port}");
    }

    fn connect(&mut self, client_id: &str) -> bool {
        self.client = None;
        self.connected.store(false, Ordering::Relaxed);
        self.state
            .store(MQTT_STATE_DISCONNECTED, Ordering::Relaxed);

        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            ..Default::default()
        };

        let connected = self.connected.clone();
        let state = self.state.clone();
        let inbound = self.inbound.clone();
        let client = EspMqttClient::new_cb(self.url.as_str(), &conf, move |event| {
            match event.payload() {
                EventPayload::Connected(_) => {
                    state.store(MQTT_STATE_CONNECTED, Ordering::Relaxed);
                    connected.store(true, Ordering::Relaxed);
                }
                EventPayload::Disconnected => {
                    state.store(MQTT_STATE_DISCONNECTED, Ordering::Relaxed);
                    connected.store(false, Ordering::Relaxed);
                }
                EventPayload::Error(err) => {
                    warn!("mqtt event error: {err:?}");
                    if !connected.load(Ordering::Relaxed) {
                        state.store(MQTT_STATE_CONNECT_FAILED, Ordering::Relaxed);
                    }
                }
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    details,
                    ..
                } => {
                    if !matches!(details, Details::Complete) {
                        return;
                    }
                    if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                        warn!(
                            "dropping oversized MQTT payload on topic {} ({} bytes)",
                            topic,
                            data.len()
                        );
                        return;
                    }
                    if let Ok(mut queue) = inbound.lock() {
                        queue.push_back((topic.to_string(), data.to_vec()));
                    }
                }
                _ => {}
            }
        });

        let client = match client {
            Ok(client) => client,
            Err(err) => {
                warn!("mqtt client setup failed: {err}");
                self.state
                    .store(MQTT_STATE_CONNECT_FAILED, Ordering::Relaxed);
                return false;
            }
        };

        let deadline = Instant::now() + MQTT_CONNECT_TIMEOUT;
        while Instant::now() < deadline {
            if self.connected.load(Ordering::Relaxed) {
                self.client = Some(client);
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }

        if self.state.load(Ordering::Relaxed) == MQTT_STATE_DISCONNECTED {
            self.state
                .store(MQTT_STATE_CONNECTION_TIMEOUT, Ordering::Relaxed);
        }
        false
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Relaxed)
    }

    fn state(&self) -> i32 {
        self.state.load(Ordering::Relaxed)
    }

    fn subscribe(&mut self, topic: &str) -> bool {
        let Some(client) = self.client.as_mut() else {
            return false;
        };
        match client.subscribe(topic, QoS::AtMostOnce) {
            Ok(_) => true,
            Err(err) => {
                warn!("mqtt subscribe `{topic}` failed: {err}");
                false
            }
        }
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        if !self.connected.load(Ordering::Relaxed) {
            return false;
        }
        let Some(client) = self.client.as_mut() else {
            return false;
        };
        match client.enqueue(topic, QoS::AtMostOnce, false, payload) {
            Ok(_) => true,
            Err(err) => {
                warn!("mqtt publish `{topic}` failed: {err}");
                false
            }
        }
    }

    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) {
        let pending: Vec<_> = match self.inbound.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => return,
        };
        for (topic, payload) in pending {
            on_message(&topic, &payload);
        }
    }
}

type PendingRequest = (PortalRequest, mpsc::Sender<PortalResponse>);

/// The httpd task parks each request on a channel and blocks until the
/// control loop answers it in `handle_client`.
#[derive(Default)]
struct EspPortal {
    server: Option<EspHttpServer<'static>>,
    requests: Option<mpsc::Receiver<PendingRequest>>,
}

impl HttpServer for EspPortal {
    fn start(&mut self) -> Result<(), PlatformError> {
        let conf = HttpConfiguration {
            stack_size: 10 * 1024,
            uri_match_wildcard: true,
            ..Default::default()
        };
        let mut server =
            EspHttpServer::new(&conf).map_err(|err| PlatformError::Http(err.to_string()))?;

        let (tx, rx) = mpsc::channel::<PendingRequest>();
        for (method, portal_method) in [(Method::Get, HttpMethod::Get), (Method::Post, HttpMethod::Post)] {
            let requests = tx.clone();
            server
                .fn_handler::<anyhow::Error, _>("/*", method, move |mut req| {
                    let body = read_request_body(&mut req)?;
                    let request = PortalRequest::from_raw(
                        portal_method,
                        req.uri(),
                        &String::from_utf8_lossy(&body),
                    );

                    let (reply_tx, reply_rx) = mpsc::channel();
                    requests
                        .send((request, reply_tx))
                        .map_err(|_| anyhow!("portal stopped"))?;
                    let response = reply_rx
                        .recv_timeout(PORTAL_REPLY_TIMEOUT)
                        .unwrap_or_else(|_| PortalResponse::text(503, "portal busy"));

                    req.into_response(
                        response.status,
                        None,
                        &[("Content-Type", response.content_type)],
                    )?
                    .write_all(response.body.as_bytes())?;
                    Ok(())
                })
                .map_err(|err| PlatformError::Http(err.to_string()))?;
        }

        self.server = Some(server);
        self.requests = Some(rx);
        Ok(())
    }

    fn stop(&mut self) {
        self.requests = None;
        self.server = None;
    }

    fn handle_client(&mut self, handler: &mut dyn FnMut(&PortalRequest) -> PortalResponse) {
        let Some(requests) = self.requests.as_ref() else {
            return;
        };
        while let Ok((request, reply)) = requests.try_recv() {
            let _ = reply.send(handler(&request));
        }
    }
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

struct UartSerial {
    uart: UartDriver<'static>,
}

impl SerialPort for UartSerial {
    fn begin(&mut self, baud: u32) {
        if let Err(err) = self.uart.change_baudrate(Hertz(baud)) {
            warn!("failed to set UART baud {baud}: {err}");
        }
    }

    fn read_byte(&mut self) -> Option<u8> {
        let mut byte = [0_u8; 1];
        match self.uart.read(&mut byte, esp_idf_hal::delay::NON_BLOCK) {
            Ok(1) => Some(byte[0]),
            _ => None,
        }
    }
}

/// Active-low LED: asserted drives the pin low.
struct GpioIndicator {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    gpio: u8,
}

impl GpioIndicator {
    fn init(gpio: u8) -> anyhow::Result<Self> {
        let mut pin = unsafe { PinDriver::output(AnyOutputPin::new(i32::from(gpio))) }?;
        pin.set_high()?;
        Ok(Self { pin, gpio })
    }
}

impl IndicatorPin for GpioIndicator {
    fn set_asserted(&mut self, asserted: bool) {
        let result = if asserted {
            self.pin.set_low()
        } else {
            self.pin.set_high()
        };
        if let Err(err) = result {
            warn!("failed to drive LED on GPIO{}: {err}", self.gpio);
        }
    }
}

/// Pulled-up button, pressed when the line reads low.
struct GpioResetInput {
    pin: PinDriver<'static, AnyIOPin, Input>,
}

impl GpioResetInput {
    fn init(gpio: u8) -> anyhow::Result<Self> {
        let mut pin = unsafe { PinDriver::input(AnyIOPin::new(i32::from(gpio))) }?;
        pin.set_pull(Pull::Up)?;
        Ok(Self { pin })
    }
}

impl ResetInput for GpioResetInput {
    fn is_pressed(&mut self) -> bool {
        self.pin.is_low()
    }
}

struct EspClock;

impl Clock for EspClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn delay_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

struct EspSystem;

impl SystemControl for EspSystem {
    fn restart(&mut self) {
        unsafe { esp_idf_svc::sys::esp_restart() };
    }

    /// Factory MAC as 12 lowercase hex digits.
    fn device_id(&self) -> String {
        let mut mac = [0_u8; 6];
        let rc = unsafe { esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr()) };
        if rc != esp_idf_svc::sys::ESP_OK {
            warn!("failed to read factory MAC: esp_err_t={rc}");
        }
        mac.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
