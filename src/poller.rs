//! Background input polling
//!
//! Reads relay status, digital and analog inputs into the safety coordinator
//! and re-determines the system status. Three failed polls in a row take the
//! link down and run the reconnection sequence.

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{AnalogChannelConfig, PollingConfig};
use crate::error::ControlError;
use crate::gas::GasFlowController;
use crate::hardware::HardwareLink;
use crate::safety::SafetyCoordinator;
use crate::types::{
    NUM_ANALOG, NUM_DIGITAL, RelayMap, SnapshotUpdate, analog, relays, turbo_spin_percent,
};
use crate::utils::CancellationToken;

const SPIN_AVERAGE_SAMPLES: usize = 3;
/// Latched until an operator runs a procedure out of it
const ERROR_STATE: &str = "error";

/// Moving average of the turbo spin for display
#[derive(Debug, Clone, Default)]
pub struct SpinAverage {
    samples: VecDeque<f64>,
}

impl SpinAverage {
    pub fn push(&mut self, percent: f64) -> f64 {
        if self.samples.len() == SPIN_AVERAGE_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(percent);
        self.value()
    }

    pub fn value(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }
    }
}

/// Everything one poll needs. Also usable without the thread.
pub struct PollCycle {
    link: Arc<HardwareLink>,
    safety: Arc<SafetyCoordinator>,
    relays: RelayMap,
    analog_channels: Vec<AnalogChannelConfig>,
    gas: Option<Arc<GasFlowController>>,
    settings: PollingConfig,
    failures: Arc<AtomicU32>,
    spin: Arc<Mutex<SpinAverage>>,
}

impl PollCycle {
    pub fn new(
        link: Arc<HardwareLink>,
        safety: Arc<SafetyCoordinator>,
        relays: RelayMap,
        analog_channels: Vec<AnalogChannelConfig>,
        settings: PollingConfig,
    ) -> Self {
        Self {
            link,
            safety,
            relays,
            analog_channels,
            gas: None,
            settings,
            failures: Arc::new(AtomicU32::new(0)),
            spin: Arc::new(Mutex::new(SpinAverage::default())),
        }
    }

    pub fn with_gas(mut self, gas: Arc<GasFlowController>) -> Self {
        self.gas = Some(gas);
        self
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Read everything once. Returns `true` if every read succeeded.
    pub fn poll_once(&self) -> bool {
        self.poll(true)
    }

    /// One poll; relay status is only read when `read_status` is set
    pub fn poll(&self, read_status: bool) -> bool {
        let mut ok = true;

        let status = if read_status {
            Some(self.link.relay_states())
        } else {
            None
        };
        match status {
            None => {}
            Some(Ok(states)) => {
                let mut named = self.relays.states_from_status(&states);
                // The ion gauge relay only pulses, its state follows the analog proxy
                named.remove(relays::ION_GAUGE);
                self.safety.update_system_state(SnapshotUpdate {
                    relay_states: Some(named),
                    ..Default::default()
                });
            }
            Some(Err(e)) => {
                debug!("STATUS read failed: {}", e);
                ok = false;
            }
        }

        match self.link.digital_inputs() {
            Ok(inputs) => self.safety.update_system_state(SnapshotUpdate::digital(inputs)),
            Err(e) => {
                debug!("Digital read failed: {}", e);
                self.safety
                    .update_system_state(SnapshotUpdate::digital([false; NUM_DIGITAL]));
                ok = false;
            }
        }

        match self.link.analog_inputs(&self.analog_channels) {
            Ok(volts) => {
                self.safety.update_system_state(SnapshotUpdate::analog(volts));
                self.spin
                    .lock()
                    .push(turbo_spin_percent(volts[analog::TURBO_SPIN]));
            }
            Err(e) => {
                debug!("Analog read failed: {}", e);
                self.safety
                    .update_system_state(SnapshotUpdate::analog([0.0; NUM_ANALOG]));
                ok = false;
            }
        }

        let ion_gauge = self.safety.ion_gauge_on();
        if self.safety.relay_state(relays::ION_GAUGE) != ion_gauge {
            self.safety.set_relay_state(relays::ION_GAUGE, ion_gauge);
        }

        if self.safety.system_status() != ERROR_STATE {
            self.safety.refresh_system_status();
        }

        if ok {
            self.failures.store(0, Ordering::Relaxed);
        } else {
            let count = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "Input poll failed ({}/{})",
                count, self.settings.max_consecutive_failures
            );
        }
        ok
    }

    pub fn needs_reconnect(&self) -> bool {
        self.consecutive_failures() >= self.settings.max_consecutive_failures
    }

    /// Disconnect and retry `auto_connect` with growing backoff. Gas
    /// setpoints are restored only after a `STATUS` probe succeeds.
    pub fn reconnect(&self, cancel: &CancellationToken) -> Result<(), ControlError> {
        warn!("Lost contact with the relay controller, reconnecting");
        if let Some(gas) = &self.gas {
            gas.save_setpoints();
        }
        self.link.disconnect();

        let base = Duration::from_millis(self.settings.reconnect_backoff_ms);
        let attempts = self.settings.reconnect_attempts;
        let mut last_error = ControlError::NotConnected;
        for attempt in 1..=attempts {
            if !cancel.sleep(base * attempt) {
                return Err(ControlError::NotConnected);
            }
            info!("Reconnect attempt {}/{}", attempt, attempts);
            match self.link.auto_connect().and_then(|_| self.link.relay_states()) {
                Ok(_) => {
                    info!("Reconnected to the relay controller");
                    self.failures.store(0, Ordering::Relaxed);
                    if let Some(gas) = &self.gas {
                        if !gas.restore_setpoints() {
                            warn!("Some gas setpoints could not be restored");
                        }
                    }
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    error!("Reconnect aborted: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    last_error = e;
                }
            }
        }
        error!("Could not reconnect after {} attempts", attempts);
        Err(last_error)
    }
}

/// Runs a [`PollCycle`] on its own thread
pub struct InputPoller {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    failures: Arc<AtomicU32>,
    spin: Arc<Mutex<SpinAverage>>,
    link_lost: Arc<AtomicBool>,
}

impl InputPoller {
    pub fn start(cycle: PollCycle) -> Self {
        let cancel = CancellationToken::new();
        let failures = cycle.failures.clone();
        let spin = cycle.spin.clone();
        let link_lost = Arc::new(AtomicBool::new(false));
        let token = cancel.clone();
        let lost = link_lost.clone();
        let interval = Duration::from_millis(cycle.settings.input_interval_ms);
        let status_interval = Duration::from_millis(cycle.settings.status_interval_ms);

        let handle = thread::spawn(move || {
            info!("Input poller started");
            let mut last_status: Option<Instant> = None;
            while !token.is_cancelled() {
                if cycle.link.is_connected() {
                    let status_due = last_status.is_none_or(|t| t.elapsed() >= status_interval);
                    if status_due {
                        last_status = Some(Instant::now());
                    }
                    cycle.poll(status_due);
                }
                if cycle.needs_reconnect() {
                    match cycle.reconnect(&token) {
                        Ok(()) => lost.store(false, Ordering::Relaxed),
                        Err(e) => {
                            error!("Relay controller unreachable: {}", e);
                            lost.store(true, Ordering::Relaxed);
                            break;
                        }
                    }
                }
                if !token.sleep(interval) {
                    break;
                }
            }
            info!("Input poller stopped");
        });

        Self {
            cancel,
            handle: Some(handle),
            failures,
            spin,
            link_lost,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Averaged turbo spin in percent
    pub fn turbo_spin_percent(&self) -> f64 {
        self.spin.lock().value()
    }

    /// Reconnection gave up
    pub fn link_lost(&self) -> bool {
        self.link_lost.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Input poller thread panicked");
            }
        }
    }
}

impl Drop for InputPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::hardware::LinkSettings;
    use crate::hardware::sim::{SIM_PORT, SimController};
    use crate::types::digital;

    fn cycle(settings: PollingConfig) -> (SimController, PollCycle) {
        let config = AppConfig::bundled().unwrap();
        let map = config.relay_map().unwrap();
        let sim = SimController::new(map.clone());
        let link = Arc::new(HardwareLink::new(
            Box::new(sim.connector()),
            LinkSettings {
                command_timeout: Duration::from_millis(100),
                ready_timeout: Duration::from_millis(100),
                fixed_port: Some(SIM_PORT.to_string()),
                cache: None,
                ..LinkSettings::default()
            },
        ));
        link.connect(SIM_PORT).unwrap();
        let safety = Arc::new(SafetyCoordinator::new(&config));
        let cycle = PollCycle::new(link, safety, map, config.analog_channels.clone(), settings);
        (sim, cycle)
    }

    #[test]
    fn spin_average_keeps_three_samples() {
        let mut avg = SpinAverage::default();
        assert_eq!(avg.value(), 0.0);
        avg.push(30.0);
        avg.push(60.0);
        assert_eq!(avg.push(90.0), 60.0);
        assert_eq!(avg.push(0.0), 50.0);
    }

    #[test]
    fn poll_merges_inputs_and_status() {
        let (sim, cycle) = cycle(PollingConfig::default());
        sim.force_relay(relays::PUMP_SCROLL, true);
        assert!(cycle.poll_once());

        let snapshot = cycle.safety.snapshot();
        assert!(snapshot.relay(relays::PUMP_SCROLL));
        assert!(snapshot.digital_inputs[digital::DOOR_CLOSED]);
        assert!(snapshot.analog_inputs[analog::CHAMBER_PRESSURE] > 4.8);
        // Scroll on, everything else off
        assert_eq!(snapshot.system_status, "default");
    }

    #[test]
    fn ion_gauge_state_follows_the_analog_proxy() {
        let (sim, cycle) = cycle(PollingConfig::default());
        sim.set_ion_gauge(true);
        cycle.poll_once();
        assert!(cycle.safety.relay_state(relays::ION_GAUGE));
        sim.set_ion_gauge(false);
        cycle.poll_once();
        assert!(!cycle.safety.relay_state(relays::ION_GAUGE));
    }

    #[test]
    fn failed_reads_fall_back_to_unsafe_defaults() {
        let (sim, cycle) = cycle(PollingConfig::default());
        assert!(cycle.poll_once());
        sim.set_silent(true);
        for _ in 0..3 {
            assert!(!cycle.poll_once());
        }
        let snapshot = cycle.safety.snapshot();
        assert_eq!(snapshot.digital_inputs, [false; NUM_DIGITAL]);
        assert_eq!(snapshot.analog_inputs, [0.0; NUM_ANALOG]);
        assert!(cycle.needs_reconnect());
    }

    #[test]
    fn error_status_is_not_overwritten() {
        let (_sim, cycle) = cycle(PollingConfig::default());
        cycle.safety.set_system_status("error");
        cycle.poll_once();
        assert_eq!(cycle.safety.system_status(), "error");
    }

    #[test]
    fn reconnect_restores_contact() {
        let settings = PollingConfig {
            reconnect_backoff_ms: 10,
            ..PollingConfig::default()
        };
        let (sim, cycle) = cycle(settings);
        sim.set_silent(true);
        for _ in 0..3 {
            cycle.poll_once();
        }
        sim.set_silent(false);
        cycle.reconnect(&CancellationToken::new()).unwrap();
        assert!(cycle.link.is_connected());
        assert_eq!(cycle.consecutive_failures(), 0);
        assert!(cycle.poll_once());
    }

    #[test]
    fn reconnect_gives_up_when_unreachable() {
        let settings = PollingConfig {
            reconnect_backoff_ms: 1,
            ..PollingConfig::default()
        };
        let (sim, cycle) = cycle(settings);
        sim.set_unreachable(true);
        assert!(cycle.reconnect(&CancellationToken::new()).is_err());
        assert!(!cycle.link.is_connected());
    }
}
