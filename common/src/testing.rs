//! In-memory collaborators for unit tests. Every fake is a cheap handle over
//! shared state so a test can keep a clone after handing one to the code
//! under test.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet, VecDeque},
    net::Ipv4Addr,
    rc::Rc,
};

use crate::{
    hal::{
        Clock, DnsResponder, HttpServer, IndicatorPin, MqttClient, Parts, Platform,
        PlatformError, ResetInput, SerialPort, Storage, SystemControl, WifiDriver,
    },
    serial_bridge::Publisher,
    types::{PortalRequest, PortalResponse, WifiMode},
};

#[derive(Debug, Clone, Default)]
pub struct FakeClock(Rc<Cell<u64>>);

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, now_ms: u64) {
        self.0.set(now_ms);
    }

    pub fn advance(&self, ms: u64) {
        self.0.set(self.0.get() + ms);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.0.get()
    }

    fn delay_ms(&mut self, ms: u64) {
        self.advance(ms);
    }
}

#[derive(Default)]
struct StorageState {
    image: Vec<u8>,
    committed: Vec<u8>,
    begin_calls: usize,
    fail_commits: bool,
}

#[derive(Clone, Default)]
pub struct MemoryStorage(Rc<RefCell<StorageState>>);

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self) -> Vec<u8> {
        self.0.borrow().committed.clone()
    }

    /// Replaces both the working image and the committed bytes.
    pub fn preload(&self, bytes: &[u8]) {
        let mut state = self.0.borrow_mut();
        let mut image = bytes.to_vec();
        image.resize(image.len().max(crate::credentials::RECORD_SIZE), 0);
        state.image = image.clone();
        state.committed = image;
    }

    pub fn begin_calls(&self) -> usize {
        self.0.borrow().begin_calls
    }

    pub fn fail_commits(&self, fail: bool) {
        self.0.borrow_mut().fail_commits = fail;
    }
}

impl Storage for MemoryStorage {
    fn begin(&mut self, size: usize) -> Result<(), PlatformError> {
        let mut state = self.0.borrow_mut();
        state.begin_calls += 1;
        if state.image.len() < size {
            state.image.resize(size, 0);
        }
        Ok(())
    }

    fn read(&self, addr: usize) -> u8 {
        self.0.borrow().image.get(addr).copied().unwrap_or(0)
    }

    fn write(&mut self, addr: usize, value: u8) {
        if let Some(slot) = self.0.borrow_mut().image.get_mut(addr) {
            *slot = value;
        }
    }

    fn commit(&mut self) -> Result<(), PlatformError> {
        let mut state = self.0.borrow_mut();
        if state.fail_commits {
            return Err(PlatformError::Storage("commit refused".to_string()));
        }
        state.committed = state.image.clone();
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingPin(Rc<RefCell<Vec<bool>>>);

impl RecordingPin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> bool {
        self.0.borrow().last().copied().unwrap_or(false)
    }

    pub fn writes(&self) -> usize {
        self.0.borrow().len()
    }
}

impl IndicatorPin for RecordingPin {
    fn set_asserted(&mut self, asserted: bool) {
        self.0.borrow_mut().push(asserted);
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    sent: Vec<(String, Vec<u8>)>,
    failing: HashSet<String>,
}

impl RecordingPublisher {
    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.clone()
    }

    pub fn fail_topic(&mut self, topic: &str) {
        self.failing.insert(topic.to_string());
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        if self.failing.contains(topic) {
            return false;
        }
        self.sent.push((topic.to_string(), payload.to_vec()));
        true
    }
}

#[derive(Default)]
struct SerialState {
    pending: VecDeque<u8>,
    baud: Option<u32>,
}

#[derive(Clone, Default)]
pub struct ScriptedSerial(Rc<RefCell<SerialState>>);

impl ScriptedSerial {
    pub fn new(input: &[u8]) -> Self {
        let serial = Self::default();
        serial.feed(input);
        serial
    }

    pub fn feed(&self, input: &[u8]) {
        self.0.borrow_mut().pending.extend(input.iter().copied());
    }

    pub fn baud(&self) -> Option<u32> {
        self.0.borrow().baud
    }
}

impl SerialPort for ScriptedSerial {
    fn begin(&mut self, baud: u32) {
        self.0.borrow_mut().baud = Some(baud);
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.0.borrow_mut().pending.pop_front()
    }
}

#[derive(Default)]
struct WifiState {
    mode: Option<WifiMode>,
    reachable: HashMap<String, (Option<String>, u64)>,
    target: Option<(String, Option<String>)>,
    joined_at_ms: u64,
    link_lost: bool,
    joins: Vec<String>,
    ap_ssid: Option<String>,
    ap_starts: usize,
}

/// Station joins succeed for networks registered with [`FakeWifi::reachable`]
/// once the configured association delay has passed on the shared clock.
#[derive(Clone)]
pub struct FakeWifi {
    state: Rc<RefCell<WifiState>>,
    clock: FakeClock,
}

impl FakeWifi {
    pub fn new(clock: FakeClock) -> Self {
        Self {
            state: Rc::default(),
            clock,
        }
    }

    pub fn reachable(&self, ssid: &str, password: Option<&str>, delay_ms: u64) {
        self.state.borrow_mut().reachable.insert(
            ssid.to_string(),
            (password.map(str::to_string), delay_ms),
        );
    }

    pub fn forget(&self, ssid: &str) {
        self.state.borrow_mut().reachable.remove(ssid);
    }

    pub fn lose_link(&self) {
        self.state.borrow_mut().link_lost = true;
    }

    pub fn mode(&self) -> Option<WifiMode> {
        self.state.borrow().mode
    }

    pub fn joins(&self) -> Vec<String> {
        self.state.borrow().joins.clone()
    }

    pub fn ap_ssid(&self) -> Option<String> {
        self.state.borrow().ap_ssid.clone()
    }

    pub fn ap_starts(&self) -> usize {
        self.state.borrow().ap_starts
    }
}

impl WifiDriver for FakeWifi {
    fn set_mode(&mut self, mode: WifiMode) -> Result<(), PlatformError> {
        let mut state = self.state.borrow_mut();
        state.mode = Some(mode);
        Ok(())
    }

    fn begin_station(&mut self, ssid: &str, password: Option<&str>) -> Result<(), PlatformError> {
        let mut state = self.state.borrow_mut();
        state.target = Some((ssid.to_string(), password.map(str::to_string)));
        state.joined_at_ms = self.clock.now_ms();
        state.link_lost = false;
        state.joins.push(ssid.to_string());
        Ok(())
    }

    fn disconnect_station(&mut self) {
        self.state.borrow_mut().target = None;
    }

    fn is_connected(&self) -> bool {
        let state = self.state.borrow();
        if state.link_lost {
            return false;
        }
        let Some((ssid, password)) = &state.target else {
            return false;
        };
        match state.reachable.get(ssid) {
            Some((expected, delay_ms)) => {
                expected == password
                    && self.clock.now_ms().saturating_sub(state.joined_at_ms) >= *delay_ms
            }
            None => false,
        }
    }

    fn start_access_point(&mut self, ssid: &str) -> Result<(), PlatformError> {
        let mut state = self.state.borrow_mut();
        state.ap_ssid = Some(ssid.to_string());
        state.ap_starts += 1;
        Ok(())
    }

    fn stop_access_point(&mut self) {
        self.state.borrow_mut().ap_ssid = None;
    }

    fn access_point_ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 4, 1)
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        self.is_connected().then_some(Ipv4Addr::new(10, 0, 0, 42))
    }

    fn rssi(&self) -> Option<i8> {
        self.is_connected().then_some(-52)
    }
}

#[derive(Default)]
struct MqttState {
    server: Option<(String, u16)>,
    connected: bool,
    refuse: bool,
    fail_publish: bool,
    attempts: usize,
    subscriptions: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
    inbound: VecDeque<(String, Vec<u8>)>,
}

#[derive(Clone, Default)]
pub struct FakeMqtt(Rc<RefCell<MqttState>>);

impl FakeMqtt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server(&self) -> Option<(String, u16)> {
        self.0.borrow().server.clone()
    }

    pub fn refuse_connects(&self, refuse: bool) {
        self.0.borrow_mut().refuse = refuse;
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.0.borrow_mut().fail_publish = fail;
    }

    pub fn drop_connection(&self) {
        self.0.borrow_mut().connected = false;
    }

    pub fn connect_attempts(&self) -> usize {
        self.0.borrow().attempts
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.0.borrow().subscriptions.clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.0.borrow().published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<String> {
        self.0
            .borrow()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| String::from_utf8_lossy(payload).into_owned())
            .collect()
    }

    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        self.0
            .borrow_mut()
            .inbound
            .push_back((topic.to_string(), payload.to_vec()));
    }
}

impl MqttClient for FakeMqtt {
    fn set_server(&mut self, host: &str, port: u16) {
        self.0.borrow_mut().server = Some((host.to_string(), port));
    }

    fn connect(&mut self, _client_id: &str) -> bool {
        let mut state = self.0.borrow_mut();
        state.attempts += 1;
        state.connected = !state.refuse;
        state.connected
    }

    fn is_connected(&self) -> bool {
        self.0.borrow().connected
    }

    fn state(&self) -> i32 {
        if self.0.borrow().connected {
            0
        } else {
            -2
        }
    }

    fn subscribe(&mut self, topic: &str) -> bool {
        let mut state = self.0.borrow_mut();
        if !state.connected {
            return false;
        }
        state.subscriptions.push(topic.to_string());
        true
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        let mut state = self.0.borrow_mut();
        if !state.connected || state.fail_publish {
            return false;
        }
        state.published.push((topic.to_string(), payload.to_vec()));
        true
    }

    fn poll(&mut self, on_message: &mut dyn FnMut(&str, &[u8])) {
        let inbound: Vec<_> = self.0.borrow_mut().inbound.drain(..).collect();
        for (topic, payload) in inbound {
            on_message(&topic, &payload);
        }
    }
}

#[derive(Default)]
struct HttpState {
    running: bool,
    starts: usize,
    fail_starts: bool,
    queued: VecDeque<PortalRequest>,
    responses: Vec<PortalResponse>,
}

#[derive(Clone, Default)]
pub struct FakeHttp(Rc<RefCell<HttpState>>);

impl FakeHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, request: PortalRequest) {
        self.0.borrow_mut().queued.push_back(request);
    }

    pub fn responses(&self) -> Vec<PortalResponse> {
        self.0.borrow().responses.clone()
    }

    pub fn running(&self) -> bool {
        self.0.borrow().running
    }

    pub fn starts(&self) -> usize {
        self.0.borrow().starts
    }

    pub fn fail_starts(&self, fail: bool) {
        self.0.borrow_mut().fail_starts = fail;
    }
}

impl HttpServer for FakeHttp {
    fn start(&mut self) -> Result<(), PlatformError> {
        let mut state = self.0.borrow_mut();
        if state.fail_starts {
            return Err(PlatformError::Http("port in use".into()));
        }
        state.running = true;
        state.starts += 1;
        Ok(())
    }

    fn stop(&mut self) {
        self.0.borrow_mut().running = false;
    }

    fn handle_client(&mut self, handler: &mut dyn FnMut(&PortalRequest) -> PortalResponse) {
        if !self.0.borrow().running {
            return;
        }
        // Handlers may stop the server, so nothing stays borrowed across calls.
        loop {
            let Some(request) = self.0.borrow_mut().queued.pop_front() else {
                break;
            };
            let response = handler(&request);
            self.0.borrow_mut().responses.push(response);
        }
    }
}

#[derive(Default)]
struct DnsState {
    answering: Option<(u16, Ipv4Addr)>,
    processed: usize,
    fail_starts: bool,
}

#[derive(Clone, Default)]
pub struct FakeDns(Rc<RefCell<DnsState>>);

impl FakeDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answering(&self) -> Option<(u16, Ipv4Addr)> {
        self.0.borrow().answering
    }

    pub fn processed(&self) -> usize {
        self.0.borrow().processed
    }

    pub fn fail_starts(&self, fail: bool) {
        self.0.borrow_mut().fail_starts = fail;
    }
}

impl DnsResponder for FakeDns {
    fn start(&mut self, port: u16, answer: Ipv4Addr) -> Result<(), PlatformError> {
        let mut state = self.0.borrow_mut();
        if state.fail_starts {
            return Err(PlatformError::Dns("address in use".into()));
        }
        state.answering = Some((port, answer));
        Ok(())
    }

    fn process_next_request(&mut self) {
        let mut state = self.0.borrow_mut();
        if state.answering.is_some() {
            state.processed += 1;
        }
    }

    fn stop(&mut self) {
        self.0.borrow_mut().answering = None;
    }
}

#[derive(Clone, Default)]
pub struct FakeButton(Rc<Cell<bool>>);

impl FakeButton {
    pub fn press(&self) {
        self.0.set(true);
    }

    pub fn release(&self) {
        self.0.set(false);
    }
}

impl ResetInput for FakeButton {
    fn is_pressed(&mut self) -> bool {
        self.0.get()
    }
}

#[derive(Clone, Default)]
pub struct FakeSystem(Rc<Cell<usize>>);

impl FakeSystem {
    pub fn restarts(&self) -> usize {
        self.0.get()
    }
}

impl SystemControl for FakeSystem {
    fn restart(&mut self) {
        self.0.set(self.0.get() + 1);
    }

    fn device_id(&self) -> String {
        "a1b2c3d4e5f6".to_string()
    }
}

pub struct TestPlatform;

impl Platform for TestPlatform {
    type Wifi = FakeWifi;
    type Mqtt = FakeMqtt;
    type Http = FakeHttp;
    type Dns = FakeDns;
    type Storage = MemoryStorage;
    type Indicator = RecordingPin;
    type Button = FakeButton;
    type Serial = ScriptedSerial;
    type Clock = FakeClock;
    type System = FakeSystem;
}

/// Test-side clones of every collaborator handed to a controller.
#[derive(Clone)]
pub struct Handles {
    pub wifi: FakeWifi,
    pub mqtt: FakeMqtt,
    pub http: FakeHttp,
    pub dns: FakeDns,
    pub storage: MemoryStorage,
    pub status_led: RecordingPin,
    pub activity_led: RecordingPin,
    pub button: FakeButton,
    pub serial: ScriptedSerial,
    pub clock: FakeClock,
    pub system: FakeSystem,
}

pub fn test_parts() -> (Parts<TestPlatform>, Handles) {
    let clock = FakeClock::new();
    let handles = Handles {
        wifi: FakeWifi::new(clock.clone()),
        mqtt: FakeMqtt::new(),
        http: FakeHttp::new(),
        dns: FakeDns::new(),
        storage: MemoryStorage::new(),
        status_led: RecordingPin::new(),
        activity_led: RecordingPin::new(),
        button: FakeButton::default(),
        serial: ScriptedSerial::default(),
        clock,
        system: FakeSystem::default(),
    };
    let parts = Parts {
        wifi: handles.wifi.clone(),
        mqtt: handles.mqtt.clone(),
        http: handles.http.clone(),
        dns: handles.dns.clone(),
        storage: handles.storage.clone(),
        status_led: handles.status_led.clone(),
        activity_led: handles.activity_led.clone(),
        reset_button: Some(handles.button.clone()),
        serial: handles.serial.clone(),
        clock: handles.clock.clone(),
        system: handles.system.clone(),
    };
    (parts, handles)
}
