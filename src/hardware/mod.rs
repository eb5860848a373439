//! Serial link to the relay/sensor controller
//!
//! One background thread owns the transport. Callers queue a request tagged
//! with a correlation id and block on a reply channel up to their timeout.
//! A request that is still queued when its caller gave up is dropped without
//! being written, so a late relay command can never switch hardware behind a
//! caller's back.

pub mod discovery;
pub mod sim;
pub mod transport;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{AnalogChannelConfig, SerialConfig};
use crate::error::ControlError;
use crate::protocol::{self, Command};
use crate::types::{NUM_ANALOG, NUM_DIGITAL, NUM_RELAYS};
use discovery::{PortCache, probe_controller, sort_by_likelihood};
use transport::{Connector, SerialConnector, Transport};

/// Extra time a caller waits beyond the command timeout for the worker's reply
const REPLY_GRACE: Duration = Duration::from_millis(500);
const IDLE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub baud: u32,
    pub command_timeout: Duration,
    pub ready_timeout: Duration,
    /// Tried before the cache and the scan
    pub fixed_port: Option<String>,
    pub cache: Option<PortCache>,
}

impl LinkSettings {
    pub fn from_config(config: &SerialConfig) -> Self {
        let cache = match &config.port_cache {
            Some(path) => Some(PortCache::new(path.clone())),
            None => PortCache::default_location(),
        };
        Self {
            baud: config.baud,
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            ready_timeout: Duration::from_millis(config.ready_timeout_ms),
            fixed_port: config.port.clone(),
            cache,
        }
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self::from_config(&SerialConfig::default())
    }
}

type Reply = (u64, Result<String, ControlError>);

/// Which line completes a request
#[derive(Debug, Clone, Copy)]
enum Expect {
    Prefixes(&'static [&'static str]),
    /// First non-empty line that is not an unsolicited announcement
    AnyAnswer,
}

impl Expect {
    fn accepts(&self, line: &str) -> bool {
        match self {
            Expect::Prefixes(prefixes) => protocol::matches_expected(line, prefixes),
            Expect::AnyAnswer => protocol::is_answer(line),
        }
    }
}

struct Request {
    id: u64,
    line: String,
    expected: Expect,
    deadline: Instant,
    reply: Sender<Reply>,
}

struct IoWorker {
    tx: Sender<Request>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl IoWorker {
    fn spawn(transport: Box<dyn Transport>, halt: Arc<RwLock<Option<String>>>) -> Self {
        let (tx, rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let handle = thread::spawn(move || run_io(transport, rx, shutdown_clone, halt));
        Self {
            tx,
            shutdown,
            handle: Some(handle),
        }
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Serial I/O thread panicked");
            }
        }
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_io(
    mut transport: Box<dyn Transport>,
    rx: Receiver<Request>,
    shutdown: Arc<AtomicBool>,
    halt: Arc<RwLock<Option<String>>>,
) {
    info!("Serial I/O thread started on {}", transport.port_name());
    while !shutdown.load(Ordering::Relaxed) {
        match rx.recv_timeout(IDLE_POLL) {
            Ok(request) => {
                if Instant::now() >= request.deadline {
                    debug!("[{}] dropped stale '{}'", request.id, request.line);
                    continue;
                }
                let result = exchange(transport.as_mut(), &request, &halt);
                let _ = request.reply.send((request.id, result));
            }
            Err(RecvTimeoutError::Timeout) => match transport.read_line() {
                Ok(Some(line)) => handle_unsolicited(&line, &halt),
                Ok(None) => {}
                Err(e) => debug!("Idle read failed: {}", e),
            },
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("Serial I/O thread stopped");
}

fn handle_unsolicited(line: &str, halt: &RwLock<Option<String>>) {
    if protocol::is_hazard(line) {
        error!("Controller reported safety halt: {}", line);
        *halt.write() = Some(line.to_string());
    } else if line.contains(protocol::READY_TOKEN) {
        warn!("Controller announced ready mid-session, it may have reset");
    } else if !line.is_empty() {
        debug!("Unsolicited line: '{}'", line);
    }
}

fn exchange(
    transport: &mut dyn Transport,
    request: &Request,
    halt: &RwLock<Option<String>>,
) -> Result<String, ControlError> {
    debug!("[{}] -> {}", request.id, request.line);
    transport.write_line(&request.line)?;
    while Instant::now() < request.deadline {
        match transport.read_line()? {
            Some(line) if protocol::is_hazard(&line) => {
                *halt.write() = Some(line.clone());
                return Err(ControlError::SafetyHalt(line));
            }
            Some(line) if request.expected.accepts(&line) => {
                debug!("[{}] <- {}", request.id, line);
                return Ok(line);
            }
            Some(line) => handle_unsolicited(&line, halt),
            None => {}
        }
    }
    Err(ControlError::HardwareTimeout(request.line.clone()))
}

/// Connection to the relay controller
pub struct HardwareLink {
    connector: Box<dyn Connector>,
    settings: LinkSettings,
    state: RwLock<ConnectionState>,
    port: RwLock<Option<String>>,
    worker: Mutex<Option<IoWorker>>,
    next_id: AtomicU64,
    halt: Arc<RwLock<Option<String>>>,
    relay_cache: RwLock<[bool; NUM_RELAYS]>,
}

impl HardwareLink {
    pub fn new(connector: Box<dyn Connector>, settings: LinkSettings) -> Self {
        Self {
            connector,
            settings,
            state: RwLock::new(ConnectionState::Disconnected),
            port: RwLock::new(None),
            worker: Mutex::new(None),
            next_id: AtomicU64::new(1),
            halt: Arc::new(RwLock::new(None)),
            relay_cache: RwLock::new([false; NUM_RELAYS]),
        }
    }

    /// Link over the system's serial ports
    pub fn serial(settings: LinkSettings) -> Self {
        let connector = SerialConnector {
            baud: settings.baud,
            read_timeout: Duration::from_millis(50),
        };
        Self::new(Box::new(connector), settings)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn port_name(&self) -> Option<String> {
        self.port.read().clone()
    }

    pub fn command_timeout(&self) -> Duration {
        self.settings.command_timeout
    }

    /// Hazard line latched by the controller, if any. While latched, commands
    /// that switch something on are refused. A successful `connect` clears it.
    pub fn safety_halt(&self) -> Option<String> {
        self.halt.read().clone()
    }

    /// Operator reset of the latched hazard
    pub fn clear_safety_halt(&self) -> Option<String> {
        let cleared = self.halt.write().take();
        if let Some(line) = &cleared {
            info!("Safety halt '{}' cleared by operator", line);
        }
        cleared
    }

    fn refuse_while_halted(&self, command: Option<Command>) -> Result<(), ControlError> {
        match (command, self.safety_halt()) {
            (Some(command), Some(line)) if command.energizes() => {
                warn!("{} refused, controller halted: {}", command.to_wire(), line);
                Err(ControlError::SafetyHalt(line))
            }
            _ => Ok(()),
        }
    }

    /// Open `port`, verify the firmware answers and start the I/O thread
    pub fn connect(&self, port: &str) -> Result<(), ControlError> {
        self.disconnect();
        *self.state.write() = ConnectionState::Connecting;
        info!("Connecting to relay controller on {}", port);

        let result = self.connector.open(port).and_then(|mut transport| {
            let ok = probe_controller(
                transport.as_mut(),
                self.settings.ready_timeout,
                self.settings.command_timeout,
            )?;
            if ok {
                Ok(transport)
            } else {
                Err(ControlError::NoDevice(format!("{} did not answer STATUS", port)))
            }
        });

        match result {
            Ok(transport) => {
                if let Some(line) = self.halt.write().take() {
                    info!("Controller answered again, cleared safety halt '{}'", line);
                }
                *self.worker.lock() = Some(IoWorker::spawn(transport, self.halt.clone()));
                *self.port.write() = Some(port.to_string());
                *self.state.write() = ConnectionState::Connected;
                if let Some(cache) = &self.settings.cache {
                    if let Err(e) = cache.save(port) {
                        warn!("Could not cache port {}: {}", port, e);
                    }
                }
                info!("Connected to relay controller on {}", port);
                Ok(())
            }
            Err(e) => {
                *self.state.write() = ConnectionState::Disconnected;
                if let ControlError::SafetyHalt(line) = &e {
                    *self.halt.write() = Some(line.clone());
                }
                Err(e)
            }
        }
    }

    /// Connect to the configured port, then the cached one, then scan.
    /// A safety halt on any port ends the search.
    pub fn auto_connect(&self) -> Result<String, ControlError> {
        if self.is_connected() {
            if let Some(port) = self.port_name() {
                return Ok(port);
            }
        }

        let mut tried = Vec::new();
        let preferred = [
            self.settings.fixed_port.clone(),
            self.settings.cache.as_ref().and_then(|c| c.load()),
        ];
        for port in preferred.into_iter().flatten() {
            if tried.contains(&port) {
                continue;
            }
            match self.connect(&port) {
                Ok(()) => return Ok(port),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!("Preferred port {} failed: {}", port, e),
            }
            tried.push(port);
        }

        for candidate in sort_by_likelihood(self.connector.candidates()) {
            if tried.contains(&candidate.name) {
                continue;
            }
            debug!("Trying {} (score {})", candidate.name, candidate.score());
            match self.connect(&candidate.name) {
                Ok(()) => return Ok(candidate.name),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!("{} is not the controller: {}", candidate.name, e),
            }
            tried.push(candidate.name);
        }

        Err(ControlError::NoDevice(format!(
            "no relay controller among {} port(s)",
            tried.len()
        )))
    }

    pub fn disconnect(&self) {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop();
            info!("Disconnected from relay controller");
        }
        *self.state.write() = ConnectionState::Disconnected;
    }

    /// Send one command and wait for the line that completes it
    pub fn send_command(&self, command: Command) -> Result<String, ControlError> {
        self.refuse_while_halted(Some(command))?;
        self.request(
            command.to_wire(),
            Expect::Prefixes(command.expected_prefixes()),
            self.settings.command_timeout,
        )
    }

    /// Send an arbitrary line and return the first answer, or `TIMEOUT`
    pub fn send_raw(&self, line: &str, timeout: Duration) -> Result<String, ControlError> {
        let line = line.trim();
        self.refuse_while_halted(protocol::parse_command(line))?;
        match self.request(line.to_string(), Expect::AnyAnswer, timeout) {
            Err(ControlError::HardwareTimeout(_)) => Ok(protocol::TIMEOUT.to_string()),
            other => other,
        }
    }

    fn request(
        &self,
        line: String,
        expected: Expect,
        timeout: Duration,
    ) -> Result<String, ControlError> {
        let tx = match self.worker.lock().as_ref() {
            Some(worker) => worker.tx.clone(),
            None => return Err(ControlError::NotConnected),
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = bounded(1);
        let request = Request {
            id,
            line: line.clone(),
            expected,
            deadline: Instant::now() + timeout,
            reply: reply_tx,
        };
        tx.send(request).map_err(|_| ControlError::NotConnected)?;

        let wait_until = Instant::now() + timeout + REPLY_GRACE;
        loop {
            let remaining = wait_until.saturating_duration_since(Instant::now());
            match reply_rx.recv_timeout(remaining) {
                Ok((reply_id, result)) if reply_id == id => return result,
                Ok((reply_id, _)) => warn!("Discarding reply {} while waiting for {}", reply_id, id),
                Err(_) => return Err(ControlError::HardwareTimeout(line)),
            }
        }
    }

    /// Switch one relay. `true` only when the controller answered `OK`.
    pub fn set_relay(&self, index: u8, on: bool) -> bool {
        let command = match Command::relay(index, on) {
            Ok(c) => c,
            Err(e) => {
                error!("{}", e);
                return false;
            }
        };
        match self.send_command(command) {
            Ok(response) if response == protocol::OK => {
                self.relay_cache.write()[index as usize - 1] = on;
                true
            }
            Ok(response) => {
                warn!("{} answered '{}'", command.to_wire(), response);
                false
            }
            Err(e) => {
                warn!("{} failed: {}", command.to_wire(), e);
                false
            }
        }
    }

    pub fn all_off(&self) -> bool {
        match self.send_command(Command::AllOff) {
            Ok(response) if response == protocol::OK => {
                *self.relay_cache.write() = [false; NUM_RELAYS];
                true
            }
            Ok(response) => {
                warn!("ALL_OFF answered '{}'", response);
                false
            }
            Err(e) => {
                warn!("ALL_OFF failed: {}", e);
                false
            }
        }
    }

    /// Last relay states confirmed by `OK` or `STATUS`, index 0 is relay 1
    pub fn cached_relay_states(&self) -> [bool; NUM_RELAYS] {
        *self.relay_cache.read()
    }

    pub fn relay_states(&self) -> Result<Vec<bool>, ControlError> {
        let line = self.send_command(Command::Status)?;
        let states = protocol::parse_status(&line)?;
        self.relay_cache.write().copy_from_slice(&states);
        Ok(states)
    }

    pub fn digital_inputs(&self) -> Result<[bool; NUM_DIGITAL], ControlError> {
        protocol::parse_digital(&self.send_command(Command::DigitalInputs)?)
    }

    pub fn analog_raw(&self) -> Result<[u16; NUM_ANALOG], ControlError> {
        protocol::parse_analog_raw(&self.send_command(Command::AnalogInputs)?)
    }

    pub fn analog_voltages(&self) -> Result<[f64; NUM_ANALOG], ControlError> {
        Ok(self.analog_raw()?.map(protocol::raw_to_volts))
    }

    /// Analog voltages with each channel's configured scale and offset applied
    pub fn analog_inputs(
        &self,
        channels: &[AnalogChannelConfig],
    ) -> Result<[f64; NUM_ANALOG], ControlError> {
        let mut volts = self.analog_voltages()?;
        for (value, channel) in volts.iter_mut().zip(channels) {
            *value = channel.apply(*value);
        }
        Ok(volts)
    }
}

impl Drop for HardwareLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}
