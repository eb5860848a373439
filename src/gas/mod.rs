//! Mass-flow-controller channels behind a single control thread
//!
//! Reads come from a cache refreshed by the control thread. Commands are
//! queued with a uuid and executed one at a time; callers wait for their
//! result up to the configured command timeout.

pub mod sim;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::{GasChannelConfig, GasConfig, GasLimitsConfig};
use crate::error::ControlError;

const LOOP_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MfcReading {
    pub timestamp: DateTime<Utc>,
    pub pressure: f64,
    pub temperature: f64,
    pub volumetric_flow: f64,
    pub mass_flow: f64,
    pub setpoint: f64,
    pub gas: String,
}

/// Vendor boundary for one family of flow controllers
pub trait MfcDriver: Send {
    fn connect(&mut self, channel: &GasChannelConfig) -> Result<(), ControlError>;
    fn disconnect(&mut self, channel: &str);
    fn read(&mut self, channel: &str) -> Result<MfcReading, ControlError>;
    fn set_flow_rate(&mut self, channel: &str, sccm: f64) -> Result<(), ControlError>;
    fn set_gas(&mut self, channel: &str, gas: &str) -> Result<(), ControlError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Disconnected,
    Connected,
    Error,
    /// Too many consecutive errors. Needs `reset_channel_errors`.
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelState {
    pub config: GasChannelConfig,
    pub reading: Option<MfcReading>,
    pub last_error: Option<String>,
    pub status: ChannelStatus,
    pub consecutive_errors: u32,
}

#[derive(Debug)]
enum GasCommand {
    SetFlow { channel: String, sccm: f64 },
    SetGas { channel: String, gas: String },
    StopAll,
}

struct QueuedCommand {
    id: Uuid,
    command: GasCommand,
    reply: Sender<(Uuid, Result<(), ControlError>)>,
}

type Channels = Arc<RwLock<BTreeMap<String, ChannelState>>>;

/// Check a request against the flow limits.
/// `current` holds the other channels' setpoints and gas types.
pub fn check_flow_limits(
    limits: &GasLimitsConfig,
    channel: &GasChannelConfig,
    sccm: f64,
    current: &[(String, String, f64)],
) -> Result<(), String> {
    if sccm > limits.max_individual_flow {
        return Err(format!(
            "Flow rate {} exceeds maximum individual limit {}",
            sccm, limits.max_individual_flow
        ));
    }

    let others: f64 = current
        .iter()
        .filter(|(name, _, _)| *name != channel.name)
        .map(|(_, _, flow)| flow)
        .sum();
    let total = others + sccm;
    if total > limits.max_total_flow {
        return Err(format!(
            "Total flow {:.1} would exceed maximum limit {}",
            total, limits.max_total_flow
        ));
    }

    let is_oxygen = |gas: &str| matches!(gas.to_uppercase().as_str(), "O2" | "OXYGEN");
    if is_oxygen(&channel.gas_type) && sccm > 0.0 {
        let oxygen_others: f64 = current
            .iter()
            .filter(|(name, gas, _)| *name != channel.name && is_oxygen(gas))
            .map(|(_, _, flow)| flow)
            .sum();
        let percentage = (sccm + oxygen_others) / total * 100.0;
        if percentage > limits.max_oxygen_percentage {
            return Err(format!(
                "O2 percentage {:.1}% exceeds maximum {}%",
                percentage, limits.max_oxygen_percentage
            ));
        }
    }
    Ok(())
}

/// Gas flow controller owning a control thread
pub struct GasFlowController {
    config: GasConfig,
    channels: Channels,
    setpoints: Arc<RwLock<HashMap<String, f64>>>,
    saved_setpoints: Mutex<HashMap<String, f64>>,
    fast_reads: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    tx: Sender<QueuedCommand>,
    control_thread: Mutex<Option<JoinHandle<()>>>,
}

impl GasFlowController {
    /// Spawn the control thread and connect every enabled channel
    pub fn start(config: GasConfig, driver: Box<dyn MfcDriver>) -> Self {
        let channels: Channels = Arc::new(RwLock::new(
            config
                .channels
                .iter()
                .map(|c| {
                    (
                        c.name.clone(),
                        ChannelState {
                            config: c.clone(),
                            reading: None,
                            last_error: None,
                            status: ChannelStatus::Disconnected,
                            consecutive_errors: 0,
                        },
                    )
                })
                .collect(),
        ));
        let setpoints = Arc::new(RwLock::new(HashMap::new()));
        let fast_reads = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = unbounded();

        let worker = ControlLoop {
            driver,
            config: config.clone(),
            channels: channels.clone(),
            setpoints: setpoints.clone(),
            fast_reads: fast_reads.clone(),
            running: running.clone(),
        };
        let handle = thread::spawn(move || worker.run(rx));

        Self {
            config,
            channels,
            setpoints,
            saved_setpoints: Mutex::new(HashMap::new()),
            fast_reads,
            running,
            tx,
            control_thread: Mutex::new(Some(handle)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.control_thread.lock().take() {
            if handle.join().is_err() {
                error!("Gas control thread panicked");
            }
        }
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }

    pub fn channel_state(&self, channel: &str) -> Option<ChannelState> {
        self.channels.read().get(channel).cloned()
    }

    pub fn get_reading(&self, channel: &str) -> Option<MfcReading> {
        self.channels
            .read()
            .get(channel)
            .and_then(|c| c.reading.clone())
    }

    pub fn get_all_readings(&self) -> BTreeMap<String, MfcReading> {
        self.channels
            .read()
            .iter()
            .filter_map(|(name, c)| c.reading.clone().map(|r| (name.clone(), r)))
            .collect()
    }

    /// Sum of the latest mass flow readings
    pub fn total_flow(&self) -> f64 {
        self.get_all_readings().values().map(|r| r.mass_flow).sum()
    }

    pub fn setpoint(&self, channel: &str) -> f64 {
        self.setpoints.read().get(channel).copied().unwrap_or(0.0)
    }

    /// Poll every `sputter_read_interval_ms` instead of `read_interval_ms`
    pub fn set_fast_reads(&self, fast: bool) {
        self.fast_reads.store(fast, Ordering::Relaxed);
    }

    /// Set a channel's flow. Requests outside `0..=max_flow` or the flow
    /// limits are refused without touching hardware.
    pub fn set_flow_rate(&self, channel: &str, sccm: f64) -> bool {
        let (config, status) = match self.channels.read().get(channel) {
            Some(state) => (state.config.clone(), state.status),
            None => {
                warn!("Unknown gas channel '{}'", channel);
                return false;
            }
        };
        if !config.enabled || status == ChannelStatus::Disabled {
            warn!("Gas channel {} is disabled", channel);
            return false;
        }
        if !sccm.is_finite() || sccm < 0.0 || sccm > config.max_flow {
            warn!(
                "Refusing {} sccm on {} (allowed 0..={})",
                sccm, channel, config.max_flow
            );
            return false;
        }

        let current: Vec<(String, String, f64)> = {
            let setpoints = self.setpoints.read();
            self.channels
                .read()
                .values()
                .map(|c| {
                    let flow = setpoints.get(&c.config.name).copied().unwrap_or(0.0);
                    (c.config.name.clone(), c.config.gas_type.clone(), flow)
                })
                .collect()
        };
        if let Err(reason) = check_flow_limits(&self.config.limits, &config, sccm, &current) {
            warn!("Refusing {} sccm on {}: {}", sccm, channel, reason);
            return false;
        }

        self.execute(GasCommand::SetFlow {
            channel: channel.to_string(),
            sccm,
        })
    }

    pub fn set_gas(&self, channel: &str, gas: &str) -> bool {
        if !self.channels.read().contains_key(channel) {
            return false;
        }
        self.execute(GasCommand::SetGas {
            channel: channel.to_string(),
            gas: gas.to_string(),
        })
    }

    pub fn stop_flow(&self, channel: &str) -> bool {
        self.set_flow_rate(channel, 0.0)
    }

    /// Zero every connected channel
    pub fn stop_all_flows(&self) -> bool {
        self.execute(GasCommand::StopAll)
    }

    /// Re-enable a channel disabled by repeated errors
    pub fn reset_channel_errors(&self, channel: &str) -> bool {
        let mut channels = self.channels.write();
        match channels.get_mut(channel) {
            Some(state) => {
                state.consecutive_errors = 0;
                state.last_error = None;
                if state.status == ChannelStatus::Disabled {
                    state.status = ChannelStatus::Error;
                }
                info!("Error count reset for gas channel {}", channel);
                true
            }
            None => false,
        }
    }

    /// Remember the current setpoints, e.g. before a reconnect
    pub fn save_setpoints(&self) -> HashMap<String, f64> {
        let current = self.setpoints.read().clone();
        *self.saved_setpoints.lock() = current.clone();
        current
    }

    pub fn saved_setpoints(&self) -> HashMap<String, f64> {
        self.saved_setpoints.lock().clone()
    }

    /// Re-apply saved setpoints. Returns `false` if any channel refused.
    pub fn restore_setpoints(&self) -> bool {
        let saved = self.saved_setpoints();
        let mut ok = true;
        for (channel, sccm) in saved {
            if !self.set_flow_rate(&channel, sccm) {
                warn!("Could not restore {} sccm on {}", sccm, channel);
                ok = false;
            }
        }
        ok
    }

    fn execute(&self, command: GasCommand) -> bool {
        if !self.is_running() {
            warn!("Gas controller is not running, dropping {:?}", command);
            return false;
        }
        let id = Uuid::new_v4();
        let (reply_tx, reply_rx) = bounded(1);
        debug!("Queueing gas command {} {:?}", id, command);
        if self
            .tx
            .send(QueuedCommand {
                id,
                command,
                reply: reply_tx,
            })
            .is_err()
        {
            return false;
        }

        match reply_rx.recv_timeout(Duration::from_millis(self.config.command_timeout_ms)) {
            Ok((reply_id, Ok(()))) if reply_id == id => true,
            Ok((_, Ok(()))) => {
                warn!("Gas command {} got a mismatched reply", id);
                false
            }
            Ok((_, Err(e))) => {
                warn!("Gas command {} failed: {}", id, e);
                false
            }
            Err(_) => {
                warn!("Gas command {} timed out", id);
                false
            }
        }
    }
}

impl Drop for GasFlowController {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ControlLoop {
    driver: Box<dyn MfcDriver>,
    config: GasConfig,
    channels: Channels,
    setpoints: Arc<RwLock<HashMap<String, f64>>>,
    fast_reads: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl ControlLoop {
    fn run(mut self, rx: Receiver<QueuedCommand>) {
        info!("Gas flow control loop started");
        let configs: Vec<GasChannelConfig> = self.config.channels.clone();
        for channel in configs.iter().filter(|c| c.enabled) {
            self.connect(channel);
        }

        let mut last_read = Instant::now();
        let mut last_reconnect = Instant::now();
        while self.running.load(Ordering::Relaxed) {
            match rx.recv_timeout(LOOP_TICK) {
                Ok(queued) => {
                    let result = self.handle(queued.command);
                    let _ = queued.reply.send((queued.id, result));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let interval = if self.fast_reads.load(Ordering::Relaxed) {
                self.config.sputter_read_interval_ms
            } else {
                self.config.read_interval_ms
            };
            if last_read.elapsed() >= Duration::from_millis(interval) {
                self.read_all();
                last_read = Instant::now();
            }

            if self.config.auto_reconnect
                && last_reconnect.elapsed() >= Duration::from_millis(self.config.reconnect_interval_ms)
            {
                self.reconnect_failed();
                last_reconnect = Instant::now();
            }
        }

        for name in self.channel_names_with(|_| true) {
            self.driver.disconnect(&name);
        }
        info!("Gas flow control loop ended");
    }

    fn channel_names_with(&self, filter: impl Fn(&ChannelState) -> bool) -> Vec<String> {
        self.channels
            .read()
            .iter()
            .filter(|(_, c)| filter(c))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn connect(&mut self, channel: &GasChannelConfig) {
        let result = self
            .driver
            .connect(channel)
            .and_then(|_| self.driver.set_gas(&channel.name, &channel.gas_type));
        let mut channels = self.channels.write();
        if let Some(state) = channels.get_mut(&channel.name) {
            match result {
                Ok(()) => {
                    info!("Gas channel {} connected", channel.name);
                    state.status = ChannelStatus::Connected;
                    state.last_error = None;
                }
                Err(e) => {
                    error!("Gas channel {} failed to connect: {}", channel.name, e);
                    state.status = ChannelStatus::Error;
                    state.last_error = Some(e.to_string());
                }
            }
        }
    }

    fn handle(&mut self, command: GasCommand) -> Result<(), ControlError> {
        match command {
            GasCommand::SetFlow { channel, sccm } => {
                self.ensure_connected(&channel)?;
                self.driver.set_flow_rate(&channel, sccm)?;
                self.setpoints.write().insert(channel.clone(), sccm);
                info!("Set {} flow rate to {} sccm", channel, sccm);
                Ok(())
            }
            GasCommand::SetGas { channel, gas } => {
                self.ensure_connected(&channel)?;
                self.driver.set_gas(&channel, &gas)
            }
            GasCommand::StopAll => {
                let mut failures = Vec::new();
                for name in self.channel_names_with(|c| c.status == ChannelStatus::Connected) {
                    match self.driver.set_flow_rate(&name, 0.0) {
                        Ok(()) => {
                            self.setpoints.write().insert(name, 0.0);
                        }
                        Err(e) => failures.push(format!("{}: {}", name, e)),
                    }
                }
                if failures.is_empty() {
                    info!("All gas flows stopped");
                    Ok(())
                } else {
                    Err(ControlError::Gas(failures.join("; ")))
                }
            }
        }
    }

    fn ensure_connected(&self, channel: &str) -> Result<(), ControlError> {
        match self.channels.read().get(channel).map(|c| c.status) {
            Some(ChannelStatus::Connected) => Ok(()),
            Some(status) => Err(ControlError::Gas(format!("{} is {:?}", channel, status))),
            None => Err(ControlError::Gas(format!("unknown channel {}", channel))),
        }
    }

    fn read_all(&mut self) {
        let readable = |c: &ChannelState| {
            matches!(c.status, ChannelStatus::Connected | ChannelStatus::Error)
        };
        for name in self.channel_names_with(readable) {
            let result = self.driver.read(&name);
            let mut channels = self.channels.write();
            let Some(state) = channels.get_mut(&name) else {
                continue;
            };
            match result {
                Ok(reading) => {
                    state.reading = Some(reading);
                    state.consecutive_errors = 0;
                    state.last_error = None;
                    state.status = ChannelStatus::Connected;
                }
                Err(e) => {
                    state.consecutive_errors += 1;
                    state.last_error = Some(e.to_string());
                    if state.consecutive_errors >= self.config.max_consecutive_errors {
                        error!(
                            "Gas channel {} disabled after {} consecutive errors",
                            name, state.consecutive_errors
                        );
                        state.status = ChannelStatus::Disabled;
                    } else {
                        warn!("Error reading gas channel {}: {}", name, e);
                        state.status = ChannelStatus::Error;
                    }
                }
            }
        }
    }

    /// Reconnect channels in `Error` and restore their gas and setpoint
    fn reconnect_failed(&mut self) {
        for name in self.channel_names_with(|c| c.status == ChannelStatus::Error && c.config.enabled) {
            let Some(config) = self.channels.read().get(&name).map(|c| c.config.clone()) else {
                continue;
            };
            info!("Attempting to reconnect gas channel {}", name);
            self.driver.disconnect(&name);
            self.connect(&config);
            if self.ensure_connected(&name).is_ok() {
                let setpoint = self.setpoints.read().get(&name).copied().unwrap_or(0.0);
                if let Err(e) = self.driver.set_flow_rate(&name, setpoint) {
                    warn!("Could not restore {} sccm on {}: {}", setpoint, name, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sim::SimMfcDriver;
    use super::*;

    fn channel(name: &str, gas: &str, max_flow: f64) -> GasChannelConfig {
        GasChannelConfig {
            name: name.to_string(),
            unit_id: "A".to_string(),
            max_flow,
            gas_type: gas.to_string(),
            enabled: true,
        }
    }

    fn config() -> GasConfig {
        GasConfig {
            enabled: true,
            channels: vec![channel("Ar", "Ar", 100.0), channel("O2", "O2", 20.0)],
            read_interval_ms: 20,
            sputter_read_interval_ms: 10,
            command_timeout_ms: 1000,
            reconnect_interval_ms: 50,
            ..GasConfig::default()
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(3) {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn out_of_range_requests_never_reach_hardware() {
        let driver = SimMfcDriver::new();
        let controller = GasFlowController::start(config(), Box::new(driver.clone()));
        assert!(wait_for(|| controller.channel_state("Ar").unwrap().status == ChannelStatus::Connected));

        assert!(!controller.set_flow_rate("Ar", 150.0));
        assert!(!controller.set_flow_rate("Ar", -1.0));
        assert!(!controller.set_flow_rate("N2", 5.0));
        assert!(driver.flow_commands().is_empty());

        assert!(controller.set_flow_rate("Ar", 40.0));
        assert_eq!(driver.flow_commands(), vec![("Ar".to_string(), 40.0)]);
        assert_eq!(controller.setpoint("Ar"), 40.0);
    }

    #[test]
    fn oxygen_fraction_is_limited() {
        let limits = GasLimitsConfig::default();
        let o2 = channel("O2", "O2", 20.0);
        let current = vec![
            ("Ar".to_string(), "Ar".to_string(), 10.0),
            ("O2".to_string(), "O2".to_string(), 0.0),
        ];
        assert!(check_flow_limits(&limits, &o2, 10.0, &current).is_ok());
        assert!(check_flow_limits(&limits, &o2, 15.0, &current).is_err());
        assert!(check_flow_limits(&limits, &o2, 0.0, &[]).is_ok());
    }

    #[test]
    fn total_flow_limit() {
        let limits = GasLimitsConfig {
            max_total_flow: 50.0,
            ..GasLimitsConfig::default()
        };
        let ar = channel("Ar", "Ar", 100.0);
        let current = vec![("N2".to_string(), "N2".to_string(), 30.0)];
        assert!(check_flow_limits(&limits, &ar, 20.0, &current).is_ok());
        assert!(check_flow_limits(&limits, &ar, 25.0, &current).is_err());
    }

    #[test]
    fn repeated_read_errors_disable_channel_until_reset() {
        let driver = SimMfcDriver::new();
        let controller = GasFlowController::start(
            GasConfig {
                auto_reconnect: false,
                ..config()
            },
            Box::new(driver.clone()),
        );
        assert!(wait_for(|| controller.get_reading("Ar").is_some()));

        driver.fail_reads("Ar", true);
        assert!(wait_for(|| controller.channel_state("Ar").unwrap().status == ChannelStatus::Disabled));
        assert!(!controller.set_flow_rate("Ar", 10.0));

        driver.fail_reads("Ar", false);
        assert!(controller.reset_channel_errors("Ar"));
        assert_eq!(controller.channel_state("Ar").unwrap().consecutive_errors, 0);
    }

    #[test]
    fn stop_all_and_restore_setpoints() {
        let driver = SimMfcDriver::new();
        let controller = GasFlowController::start(config(), Box::new(driver.clone()));
        assert!(wait_for(|| controller.channel_state("O2").unwrap().status == ChannelStatus::Connected));
        assert!(controller.set_flow_rate("Ar", 30.0));
        controller.save_setpoints();

        assert!(controller.stop_all_flows());
        assert_eq!(controller.setpoint("Ar"), 0.0);

        assert!(controller.restore_setpoints());
        assert_eq!(controller.setpoint("Ar"), 30.0);
        assert!(wait_for(|| controller.total_flow() > 29.0));
    }
}
