//! Scripted hardware for driving the device without a board.

#![allow(dead_code)]

use celsius::config::DeviceConfig;
use celsius::fault::RestartRecorder;
use celsius::hal::{
    Clock, Connection, DatagramSink, LeaseEvent, LinkStatus, Listener, MacAddress, Millis,
    NetworkLink, PresenceInput, SensorBus, SensorPin,
};
use celsius::liveness::SoftwareWatchdog;
use celsius::scheduler::{Peripherals, Platform, RunLoop};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

// A request that never finishes would hang the test instead of failing it.
const MAX_IDLE_POLLS: u32 = 100_000;

/// Formatted log output collected in memory.
#[derive(Debug, Clone, Default)]
pub struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl CapturedLog {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLog {
    type Writer = CapturedLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run `f` with the raw wire echo routed into a string.
pub fn capture_wire_log(f: impl FnOnce()) -> String {
    let log = CapturedLog::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(log.clone())
        .with_ansi(false)
        .with_env_filter("celsius::wire=debug")
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    log.text()
}

/// Time only moves when the device delays or the test says so.
///
/// `auto_advance_ms` moves time forward on every read, for tests that run
/// the loop unattended.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Millis>,
    auto_advance_ms: Millis,
    pub delays: Vec<Millis>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticking(auto_advance_ms: Millis) -> Self {
        Self {
            auto_advance_ms,
            ..Self::default()
        }
    }

    pub fn set(&self, now: Millis) {
        self.now.set(now);
    }

    pub fn advance(&self, ms: Millis) {
        self.now.set(self.now.get() + ms);
    }

    pub fn peek(&self) -> Millis {
        self.now.get()
    }

    pub fn total_delay(&self) -> Millis {
        self.delays.iter().sum()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        let now = self.now.get();
        self.now.set(now + self.auto_advance_ms);
        now
    }

    fn delay_ms(&mut self, ms: Millis) {
        self.delays.push(ms);
        self.advance(ms);
    }
}

/// Probe values by pin; pins without a value read as disconnected.
#[derive(Debug, Default)]
pub struct ScriptedBus {
    pub values: HashMap<SensorPin, f32>,
    pub requests: Vec<SensorPin>,
    pub reads: u32,
}

impl ScriptedBus {
    pub fn with_values(values: &[(SensorPin, f32)]) -> Self {
        Self {
            values: values.iter().copied().collect(),
            ..Self::default()
        }
    }
}

impl SensorBus for ScriptedBus {
    fn request_temperature(&mut self, pin: SensorPin) {
        self.requests.push(pin);
    }

    fn read(&mut self, pin: SensorPin) -> Option<f32> {
        self.reads += 1;
        self.values.get(&pin).copied()
    }
}

/// Lease events are consumed one per maintenance call; `Nothing` after.
#[derive(Debug)]
pub struct ScriptedLink {
    pub address: Option<Ipv4Addr>,
    pub status: LinkStatus,
    pub events: VecDeque<LeaseEvent>,
    pub maintain_calls: u32,
    pub begin_calls: Vec<MacAddress>,
}

impl Default for ScriptedLink {
    fn default() -> Self {
        Self {
            address: Some(Ipv4Addr::new(192, 168, 1, 50)),
            status: LinkStatus::Up,
            events: VecDeque::new(),
            maintain_calls: 0,
            begin_calls: Vec::new(),
        }
    }
}

impl NetworkLink for ScriptedLink {
    fn begin(&mut self, mac: &MacAddress) -> Option<Ipv4Addr> {
        self.begin_calls.push(*mac);
        self.address
    }

    fn maintain(&mut self) -> LeaseEvent {
        self.maintain_calls += 1;
        self.events.pop_front().unwrap_or(LeaseEvent::Nothing)
    }

    fn link_status(&self) -> LinkStatus {
        self.status
    }

    fn local_ip(&self) -> Ipv4Addr {
        self.address.unwrap_or(Ipv4Addr::UNSPECIFIED)
    }
}

/// What the device did to one connection, readable after it is dropped.
#[derive(Debug, Default)]
pub struct ConnectionLog {
    pub written: Vec<u8>,
    pub flushed: bool,
    pub stopped: bool,
    pub idle_polls: u32,
}

impl ConnectionLog {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.written).into_owned()
    }

    pub fn status_line(&self) -> String {
        self.text().lines().next().unwrap_or_default().to_string()
    }

    pub fn body(&self) -> String {
        let text = self.text();
        text.split_once("\r\n\r\n").map(|(_, body)| body.to_string()).unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct ScriptedConnection {
    input: VecDeque<u8>,
    stall_polls: u32,
    close_when_drained: bool,
    stopped: bool,
    log: Rc<RefCell<ConnectionLog>>,
}

impl ScriptedConnection {
    /// A client that sends `request` and then waits for the answer.
    pub fn request(request: &str) -> (Self, Rc<RefCell<ConnectionLog>>) {
        let log = Rc::new(RefCell::new(ConnectionLog::default()));
        let conn = Self {
            input: request.bytes().collect(),
            stall_polls: 0,
            close_when_drained: false,
            stopped: false,
            log: Rc::clone(&log),
        };
        (conn, log)
    }

    /// A client that sends `request` and hangs up.
    pub fn hang_up_after(request: &str) -> (Self, Rc<RefCell<ConnectionLog>>) {
        let (mut conn, log) = Self::request(request);
        conn.close_when_drained = true;
        (conn, log)
    }

    /// Make the first `polls` reads report no data yet.
    pub fn stalling(mut self, polls: u32) -> Self {
        self.stall_polls = polls;
        self
    }
}

impl Connection for ScriptedConnection {
    type Error = &'static str;

    fn connected(&mut self) -> bool {
        !self.stopped && (!self.close_when_drained || !self.input.is_empty())
    }

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        if self.stall_polls > 0 {
            self.stall_polls -= 1;
            return Err(nb::Error::WouldBlock);
        }
        match self.input.pop_front() {
            Some(byte) => Ok(byte),
            None => {
                let mut log = self.log.borrow_mut();
                log.idle_polls += 1;
                assert!(log.idle_polls < MAX_IDLE_POLLS, "device kept reading an idle client");
                Err(nb::Error::WouldBlock)
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        if self.stopped {
            return Err("write after stop");
        }
        self.log.borrow_mut().written.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.log.borrow_mut().flushed = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.log.borrow_mut().stopped = true;
    }
}

#[derive(Debug, Default)]
pub struct ScriptedListener {
    pub pending: VecDeque<ScriptedConnection>,
    pub accept_calls: u32,
}

impl ScriptedListener {
    /// Queue a waiting client and return its log.
    pub fn push_request(&mut self, request: &str) -> Rc<RefCell<ConnectionLog>> {
        let (conn, log) = ScriptedConnection::request(request);
        self.pending.push_back(conn);
        log
    }
}

impl Listener for ScriptedListener {
    type Connection = ScriptedConnection;

    fn accept(&mut self) -> Option<Self::Connection> {
        self.accept_calls += 1;
        self.pending.pop_front()
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    pub sent: Vec<(SocketAddrV4, Vec<u8>)>,
    pub fail: bool,
}

impl DatagramSink for RecordingSink {
    type Error = &'static str;

    fn send_to(&mut self, destination: SocketAddrV4, payload: &[u8]) -> Result<(), Self::Error> {
        if self.fail {
            return Err("network unreachable");
        }
        self.sent.push((destination, payload.to_vec()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ScriptedPresence {
    pub active: bool,
}

impl PresenceInput for ScriptedPresence {
    fn is_active(&mut self) -> bool {
        self.active
    }
}

pub struct TestPlatform;

impl Platform for TestPlatform {
    type Clock = ManualClock;
    type Watchdog = SoftwareWatchdog;
    type Restart = RestartRecorder;
    type Bus = ScriptedBus;
    type Link = ScriptedLink;
    type Listener = ScriptedListener;
    type Telemetry = RecordingSink;
    type Presence = ScriptedPresence;
}

pub fn peripherals(clock: ManualClock, bus: ScriptedBus, link: ScriptedLink) -> Peripherals<TestPlatform> {
    Peripherals {
        clock,
        watchdog: SoftwareWatchdog::default(),
        restart: RestartRecorder::new(),
        bus,
        link,
        listener: ScriptedListener::default(),
        telemetry: Some(RecordingSink::default()),
        presence: Some(ScriptedPresence::default()),
    }
}

pub fn device(config: DeviceConfig, bus: ScriptedBus) -> RunLoop<TestPlatform> {
    RunLoop::new(config, peripherals(ManualClock::new(), bus, ScriptedLink::default()))
}

/// Every primary-preset pin reads `celsius`.
pub fn uniform_bus(config: &DeviceConfig, celsius: f32) -> ScriptedBus {
    let values: Vec<(SensorPin, f32)> = config.sensors.iter().map(|s| (s.pin, celsius)).collect();
    ScriptedBus::with_values(&values)
}
