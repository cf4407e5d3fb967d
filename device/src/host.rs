use std::{
    collections::{HashMap, HashSet},
    io::{ErrorKind, Read},
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    process::Command,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        mpsc, Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{rejection::FormRejection, Form, State},
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::{
    net::TcpListener,
    runtime::Handle,
    sync::{mpsc as async_mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use bridge_common::{
    hal::{
        Clock, HttpServer, IndicatorPin, MqttClient, Platform, PlatformError, ResetInput,
        SerialPort, Storage, SystemControl, WifiDriver,
    },
    types::{HttpMethod, PortalRequest, PortalResponse, WifiMode},
    DeviceConfig, DeviceController, Parts,
};

use crate::captive_dns::UdpCaptiveDns;

const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(15);
const PORTAL_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

// PubSubClient-style state codes, reported in connect failure logs.
const MQTT_STATE_CONNECTED: i32 = 0;
const MQTT_STATE_CONNECTION_TIMEOUT: i32 = -4;
const MQTT_STATE_CONNECT_FAILED: i32 = -2;
const MQTT_STATE_DISCONNECTED: i32 = -1;

struct HostPlatform;

impl Platform for HostPlatform {
    type Wifi = SimWifi;
    type Mqtt = RumqttClient;
    type Http = AxumPortal;
    type Dns = UdpCaptiveDns;
    type Storage = FileStorage;
    type Indicator = LoggedPin;
    type Button = EnvResetInput;
    type Serial = StdinSerial;
    type Clock = HostClock;
    type System = HostSystem;
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("BRIDGE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.bridge"));
    let config_path = std::env::var("BRIDGE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.join("config.json"));

    let mut config = load_config(&config_path).await.unwrap_or_else(|err| {
        warn!("failed to load {}: {err:#}", config_path.display());
        DeviceConfig::default()
    });
    config.apply_build_defaults();
    if let Ok(host) = std::env::var("MQTT_HOST") {
        config.network.mqtt_host = host;
    }
    config.network.mqtt_port = env_or("MQTT_PORT", config.network.mqtt_port);

    info!(
        "config loaded: mqtt=`{}:{}`, topics=`{}`/`{}`",
        config.network.mqtt_host,
        config.network.mqtt_port,
        config.topics.primary,
        config.topics.serial,
    );

    let runtime = Handle::current();
    let reset_flag = std::env::var("BRIDGE_RESET_FLAG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.join("reset.hold"));
    let parts = Parts::<HostPlatform> {
        wifi: SimWifi::from_env(),
        mqtt: RumqttClient::new(runtime.clone()),
        http: AxumPortal::new(runtime, env_or("PORTAL_HTTP_PORT", 8080)),
        dns: UdpCaptiveDns::new(Some(env_or("CAPTIVE_DNS_PORT", 15353))),
        storage: FileStorage::new(data_dir.join("credentials.bin")),
        status_led: LoggedPin::new("status", config.pins.status_led),
        activity_led: LoggedPin::new("activity", config.pins.activity_led),
        reset_button: config
            .pins
            .reset_button
            .map(|_| EnvResetInput::new(reset_flag)),
        serial: StdinSerial::default(),
        clock: HostClock,
        system: HostSystem::from_env(),
    };

    let running = Arc::new(AtomicBool::new(true));
    let control = {
        let running = running.clone();
        tokio::task::spawn_blocking(move || {
            let mut controller = DeviceController::new(config, parts);
            controller.begin();
            while running.load(Ordering::Relaxed) {
                controller.tick();
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    running.store(false, Ordering::Relaxed);
    control.await.context("control loop panicked")?;
    Ok(())
}

async fn load_config(path: &Path) -> anyhow::Result<DeviceConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(serde_json::from_slice::<DeviceConfig>(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(DeviceConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

/// Station joins succeed for any SSID not listed in
/// `BRIDGE_UNREACHABLE_SSIDS`.
struct SimWifi {
    station: Option<String>,
    access_point: Option<String>,
    unreachable: HashSet<String>,
    portal_ip: Ipv4Addr,
}

impl SimWifi {
    fn from_env() -> Self {
        let unreachable = std::env::var("BRIDGE_UNREACHABLE_SSIDS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|ssid| !ssid.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            station: None,
            access_point: None,
            unreachable,
            portal_ip: env_or("BRIDGE_PORTAL_IP", Ipv4Addr::LOCALHOST),
        }
    }
}

impl WifiDriver for SimWifi {
    fn set_mode(&mut self, mode: WifiMode) -> Result<(), PlatformError> {
        debug!("wifi mode {mode:?}");
        Ok(())
    }

    fn begin_station(&mut self, ssid: &str, password: Option<&str>) -> Result<(), PlatformError> {
        info!(
            "joining `{ssid}` ({})",
            if password.is_some() { "secured" } else { "open" }
        );
        self.station = Some(ssid.to_string());
        Ok(())
    }

    fn disconnect_station(&mut self) {
        self.station = None;
    }

    fn is_connected(&self) -> bool {
        self.station
            .as_ref()
            .is_some_and(|ssid| !self.unreachable.contains(ssid))
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), PlatformError> {
        info!("simulated access point `{ssid}` up at {}", self.portal_ip);
        self.access_point = Some(ssid.to_string());
        Ok(())
    }

    fn stop_access_point(&mut self) {
        if let Some(ssid) = self.access_point.take() {
            info!("simulated access point `{ssid}` down");
        }
    }

    fn access_point_ip(&self) -> Ipv4Addr {
        self.portal_ip
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        self.is_connected().then_some(Ipv4Addr::LOCALHOST)
    }

    fn rssi(&self) -> Option<i8> {
        self.is_connected().then_some(-45)
    }
}

/// One rumqttc event loop per connect attempt. The loop exits on the first
/// error so reconnect pacing stays with the caller.
struct RumqttClient {
    runtime: Handle,
    host: String,
    port: u16,
    client: Option<AsyncClient>,
    event_task: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
    state: Arc<AtomicI32>,
    inbound_tx: mpsc::Sender<(String, Vec<u8>)>,
    inbound_rx: mpsc::Receiver<(String, Vec<u8>)>,
}

impl RumqttClient {
    fn new(runtime: Handle) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel();
        Self {
            runtime,
            host: String::new(),
            port: 0,
            client: None,
            event_task: None,
            connected: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicI32::new(MQTT_STATE_DISCONNECTED)),
            inbound_tx,
            inbound_rx,
        }
    }

    fn teardown(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        self.client = None;
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl MqttClient for RumqttClient {
    fn set_server(&mut self, host: &str, port: u16) {
        self.host = host.to_string();
        self.port = port;
    }

    fn connect(&mut self, client_id: &str) -> bool {
        self.teardown();

        let mut options = MqttOptions::new(client_id, self.host.as_str(), self.port);
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let connected = self.connected.clone();
        let state = self.state.clone();
        let inbound = self.inbound_tx.clone();
        let task = self.runtime.spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(message))) => {
                        if inbound
                            .send((message.topic, message.payload.to_vec()))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        state.store(MQTT_STATE_CONNECTED, Ordering::Relaxed);
                        connected.store(true, Ordering::Relaxed);
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => {
                        state.store(MQTT_STATE_DISCONNECTED, Ordering::Relaxed);
                        connected.store(false, Ordering::Relaxed);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("mqtt poll error: {err}");
                        let code = if connected.swap(false, Ordering::Relaxed) {
                            MQTT_STATE_DISCONNECTED
                        } else {
                            MQTT_STATE_CONNECT_FAILED
                        };
                        state.store(code, Ordering::Relaxed);
                        break;
                    }
                }
            }
        });

        let deadline = Instant::now() + MQTT_CONNECT_TIMEOUT;
        while Instant::now() < deadline && !task.is_finished() {
            if self.connected.load(Ordering::Relaxed) {
                self.client = Some(client);
                self.event_task = Some(task);
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }

        if !task.is_finished() {
            self.state
                .store(MQTT_STATE_CONNECTION_TIMEOUT, Ordering::Relaxed);
        }
        task.abort();
        false
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
            && self
                .event_task
                .as_ref()
                .is_some_and(|task| !task.is_finished())
    }

    fn state(&self) -> i32 {
        self.state.load(Ordering::Relaxed)
    }

    fn subscribe(&mut self, topic: &str) -> bool {
        let Some(client) = self.client.as_ref() else {
            return false;
        };
        match client.try_subscribe(topic, QoS::AtMostOnce) {
            Ok(()) => true,
            Err(err) => {
                warn!("mqtt subscribe `{topic}` failed: {err}");
                false
            }
        }
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(client) = self.client.as_ref() else {
            return false;
        };
        match client.try_publish(topic, QoS::AtMostOnce, false, payload.to_vec()) {
            Ok(()) => true,
            Err(err) => {
                warn!("mqtt publish `{topic}` failed: {err}");
                false
            }
        }
    }

    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) {
        while let Ok((topic, payload)) = self.inbound_rx.try_recv() {
            on_message(&topic, &payload);
        }
    }
}

type PendingRequest = (PortalRequest, oneshot::Sender<PortalResponse>);

/// Axum server on the tokio runtime. Every request is parked on a channel
/// until the control loop answers it from `handle_client`.
struct AxumPortal {
    runtime: Handle,
    port: u16,
    requests: Option<async_mpsc::UnboundedReceiver<PendingRequest>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl AxumPortal {
    fn new(runtime: Handle, port: u16) -> Self {
        Self {
            runtime,
            port,
            requests: None,
            shutdown: None,
        }
    }
}

impl HttpServer for AxumPortal {
    fn start(&mut self) -> Result<(), PlatformError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = self
            .runtime
            .block_on(TcpListener::bind(addr))
            .map_err(|err| PlatformError::Http(format!("failed to bind portal at {addr}: {err}")))?;

        let (tx, rx) = async_mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = Router::new().fallback(forward_request).with_state(tx);
        self.runtime.spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = server.await {
                warn!("portal server error: {err}");
            }
        });

        info!("portal listening on http://{addr}");
        self.requests = Some(rx);
        self.shutdown = Some(shutdown_tx);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.requests = None;
    }

    fn handle_client(&mut self, handler: &mut dyn FnMut(&PortalRequest) -> PortalResponse) {
        let Some(requests) = self.requests.as_mut() else {
            return;
        };
        while let Ok((request, reply)) = requests.try_recv() {
            let _ = reply.send(handler(&request));
        }
    }
}

async fn forward_request(
    State(requests): State<async_mpsc::UnboundedSender<PendingRequest>>,
    method: Method,
    uri: Uri,
    form: Result<Form<HashMap<String, String>>, FormRejection>,
) -> Response {
    let method = match method {
        Method::GET => HttpMethod::Get,
        Method::POST => HttpMethod::Post,
        _ => HttpMethod::Other,
    };
    let request = PortalRequest {
        method,
        path: uri.path().to_string(),
        form: form.map(|Form(fields)| fields).unwrap_or_default(),
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    if requests.send((request, reply_tx)).is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "portal stopped").into_response();
    }
    match tokio::time::timeout(PORTAL_REPLY_TIMEOUT, reply_rx).await {
        Ok(Ok(response)) => {
            let status =
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                [(header::CONTENT_TYPE, response.content_type)],
                response.body,
            )
                .into_response()
        }
        _ => (StatusCode::SERVICE_UNAVAILABLE, "portal busy").into_response(),
    }
}

/// Credential record kept as a raw byte image on disk.
struct FileStorage {
    path: PathBuf,
    image: Vec<u8>,
}

impl FileStorage {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            image: Vec::new(),
        }
    }
}

impl Storage for FileStorage {
    fn begin(&mut self, size: usize) -> Result<(), PlatformError> {
        self.image = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        self.image.resize(size, 0);
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
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, &self.image)?;
        Ok(())
    }
}

struct LoggedPin {
    name: &'static str,
    gpio: u8,
}

impl LoggedPin {
    fn new(name: &'static str, gpio: u8) -> Self {
        Self { name, gpio }
    }
}

impl IndicatorPin for LoggedPin {
    fn set_asserted(&mut self, asserted: bool) {
        debug!(
            "{} indicator (GPIO{}) {}",
            self.name,
            self.gpio,
            if asserted { "on" } else { "off" }
        );
    }
}

/// Reads as pressed while the flag file exists.
struct EnvResetInput {
    flag: PathBuf,
}

impl EnvResetInput {
    fn new(flag: PathBuf) -> Self {
        Self { flag }
    }
}

impl ResetInput for EnvResetInput {
    fn is_pressed(&mut self) -> bool {
        self.flag.exists()
    }
}

#[derive(Default)]
struct StdinSerial {
    bytes: Option<mpsc::Receiver<u8>>,
}

impl SerialPort for StdinSerial {
    fn begin(&mut self, baud: u32) {
        if self.bytes.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("serial-rx".into())
            .spawn(move || {
                for byte in std::io::stdin().lock().bytes() {
                    let Ok(byte) = byte else {
                        break;
                    };
                    if tx.send(byte).is_err() {
                        break;
                    }
                }
            });
        match spawned {
            Ok(_) => {
                info!("serial bridge reading stdin ({baud} baud simulated)");
                self.bytes = Some(rx);
            }
            Err(err) => warn!("failed to spawn stdin reader: {err}"),
        }
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.bytes.as_ref()?.try_recv().ok()
    }
}

struct HostClock;

impl Clock for HostClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn delay_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

struct HostSystem {
    device_id: String,
}

impl HostSystem {
    fn from_env() -> Self {
        let device_id = std::env::var("BRIDGE_DEVICE_ID")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "host-sim".to_string());
        Self { device_id }
    }
}

impl SystemControl for HostSystem {
    /// Re-executes the current binary with the same arguments, then exits.
    fn restart(&mut self) {
        warn!("restart requested");
        match std::env::current_exe() {
            Ok(exe) => {
                if let Err(err) = Command::new(exe).args(std::env::args().skip(1)).spawn() {
                    warn!("failed to relaunch: {err}");
                }
            }
            Err(err) => warn!("cannot locate current executable: {err}"),
        }
        std::process::exit(0);
    }

    fn device_id(&self) -> String {
        self.device_id.clone()
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
