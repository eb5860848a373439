//! Automated chamber procedures.
//!
//! Every procedure is a fixed sequence of three kinds of step: relay commands
//! gated by the safety coordinator, bounded waits on the analog inputs and
//! physical settling delays. Waits and delays observe the run's
//! [`CancellationToken`] so a cancelled procedure returns within one poll
//! interval.

mod load_lock;
mod pump;
mod shutdown;
mod sputter;
mod steps;
mod vent;

use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::config::{AnalogChannelConfig, AppConfig};
use crate::gas::GasFlowController;
use crate::hardware::HardwareLink;
use crate::logger::{EventKind, ProcedureEventLog};
use crate::safety::SafetyCoordinator;
use crate::types::{ProcedureId, RelayMap};
use crate::utils::CancellationToken;

/// Operator prompt a procedure hands back instead of finishing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserConfirmation {
    pub procedure: ProcedureId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ProcedureOutcome {
    Success,
    Failure(String),
    Cancelled,
    AwaitingUserConfirmation(UserConfirmation),
}

impl ProcedureOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcedureOutcome::Success)
    }
}

/// Result of [`ProcedureEngine::wait_for_analog_condition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Met,
    Timeout,
    Cancelled,
    /// Five reads in a row failed
    ReadFailure,
}

/// Why a procedure step sequence stopped early
#[derive(Debug, Clone, PartialEq)]
enum Stop {
    Cancelled,
    Failed(String),
}

impl Stop {
    fn failed(message: impl Into<String>) -> Self {
        Stop::Failed(message.into())
    }
}

impl From<Stop> for ProcedureOutcome {
    fn from(stop: Stop) -> Self {
        match stop {
            Stop::Cancelled => ProcedureOutcome::Cancelled,
            Stop::Failed(message) => ProcedureOutcome::Failure(message),
        }
    }
}

fn finish(result: Result<(), Stop>) -> ProcedureOutcome {
    match result {
        Ok(()) => ProcedureOutcome::Success,
        Err(stop) => stop.into(),
    }
}

/// Delays and timeouts of every procedure. The defaults are the physical
/// values the chamber needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureTimings {
    pub poll_interval: Duration,
    pub slow_poll_interval: Duration,
    pub relay_gap: Duration,
    pub mains_off_settle: Duration,
    pub ion_gauge_pulse: Duration,
    pub ion_gauge_settle: Duration,
    pub turbo_off_settle: Duration,
    pub turbo_coast_timeout: Duration,
    pub default_settle: Duration,
    pub all_off_settle: Duration,
    pub standby_settle: Duration,
    pub turbo_stop_settle: Duration,
    pub gate_close_settle: Duration,
    pub backing_close_settle: Duration,
    pub scroll_spinup: Duration,
    pub pressure_drop_timeout: Duration,
    pub rough_vacuum_timeout: Duration,
    pub backing_settle: Duration,
    pub medium_vacuum_timeout: Duration,
    pub turbo_start_delay: Duration,
    pub turbo_spinup_timeout: Duration,
    pub spin_down_timeout: Duration,
    pub brake_pulse: Duration,
    pub brake_rest: Duration,
    pub vent_settle: Duration,
    pub atmosphere_timeout: Duration,
    pub door_timeout: Duration,
    pub loadlock_atmosphere_timeout: Duration,
    pub loadlock_vent_hold: Duration,
    pub loadlock_rough_timeout: Duration,
    pub spin_control_interval: Duration,
    pub sputter_max: Duration,
}

impl Default for ProcedureTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            slow_poll_interval: Duration::from_secs(2),
            relay_gap: Duration::from_millis(500),
            mains_off_settle: Duration::from_millis(500),
            ion_gauge_pulse: Duration::from_secs(1),
            ion_gauge_settle: Duration::from_secs(1),
            turbo_off_settle: Duration::from_secs(1),
            turbo_coast_timeout: Duration::from_secs(120),
            default_settle: Duration::from_secs(1),
            all_off_settle: Duration::from_secs(1),
            standby_settle: Duration::from_secs(3),
            turbo_stop_settle: Duration::from_secs(4),
            gate_close_settle: Duration::from_secs(5),
            backing_close_settle: Duration::from_secs(4),
            scroll_spinup: Duration::from_secs(15),
            pressure_drop_timeout: Duration::from_secs(20),
            rough_vacuum_timeout: Duration::from_secs(1500),
            backing_settle: Duration::from_secs(5),
            medium_vacuum_timeout: Duration::from_secs(1500),
            turbo_start_delay: Duration::from_secs(10),
            turbo_spinup_timeout: Duration::from_secs(300),
            spin_down_timeout: Duration::from_secs(300),
            brake_pulse: Duration::from_millis(150),
            brake_rest: Duration::from_secs(1),
            vent_settle: Duration::from_secs(5),
            atmosphere_timeout: Duration::from_secs(3600),
            door_timeout: Duration::from_secs(600),
            loadlock_atmosphere_timeout: Duration::from_secs(20),
            loadlock_vent_hold: Duration::from_secs(3),
            loadlock_rough_timeout: Duration::from_secs(300),
            spin_control_interval: Duration::from_secs(2),
            sputter_max: Duration::from_secs(14400),
        }
    }
}

impl ProcedureTimings {
    /// Every duration multiplied by `factor`. For the simulator and tests only.
    pub fn scaled(factor: f64) -> Self {
        let d = Self::default();
        let s = |duration: Duration| duration.mul_f64(factor);
        Self {
            poll_interval: s(d.poll_interval),
            slow_poll_interval: s(d.slow_poll_interval),
            relay_gap: s(d.relay_gap),
            mains_off_settle: s(d.mains_off_settle),
            ion_gauge_pulse: s(d.ion_gauge_pulse),
            ion_gauge_settle: s(d.ion_gauge_settle),
            turbo_off_settle: s(d.turbo_off_settle),
            turbo_coast_timeout: s(d.turbo_coast_timeout),
            default_settle: s(d.default_settle),
            all_off_settle: s(d.all_off_settle),
            standby_settle: s(d.standby_settle),
            turbo_stop_settle: s(d.turbo_stop_settle),
            gate_close_settle: s(d.gate_close_settle),
            backing_close_settle: s(d.backing_close_settle),
            scroll_spinup: s(d.scroll_spinup),
            pressure_drop_timeout: s(d.pressure_drop_timeout),
            rough_vacuum_timeout: s(d.rough_vacuum_timeout),
            backing_settle: s(d.backing_settle),
            medium_vacuum_timeout: s(d.medium_vacuum_timeout),
            turbo_start_delay: s(d.turbo_start_delay),
            turbo_spinup_timeout: s(d.turbo_spinup_timeout),
            spin_down_timeout: s(d.spin_down_timeout),
            brake_pulse: s(d.brake_pulse),
            brake_rest: s(d.brake_rest),
            vent_settle: s(d.vent_settle),
            atmosphere_timeout: s(d.atmosphere_timeout),
            door_timeout: s(d.door_timeout),
            loadlock_atmosphere_timeout: s(d.loadlock_atmosphere_timeout),
            loadlock_vent_hold: s(d.loadlock_vent_hold),
            loadlock_rough_timeout: s(d.loadlock_rough_timeout),
            spin_control_interval: s(d.spin_control_interval),
            sputter_max: s(d.sputter_max),
        }
    }
}

/// Runs procedures against one chamber
pub struct ProcedureEngine {
    link: Arc<HardwareLink>,
    safety: Arc<SafetyCoordinator>,
    relays: RelayMap,
    analog_channels: Vec<AnalogChannelConfig>,
    gas: Option<Arc<GasFlowController>>,
    sputter_flows: HashMap<String, f64>,
    timings: ProcedureTimings,
    events: Option<Arc<ProcedureEventLog>>,
    sputter_teardown_pending: AtomicBool,
}

impl ProcedureEngine {
    pub fn new(
        link: Arc<HardwareLink>,
        safety: Arc<SafetyCoordinator>,
        relays: RelayMap,
        config: &AppConfig,
    ) -> Self {
        Self {
            link,
            safety,
            relays,
            analog_channels: config.analog_channels.clone(),
            gas: None,
            sputter_flows: config.gas.sputter_flows.clone(),
            timings: ProcedureTimings::default(),
            events: None,
            sputter_teardown_pending: AtomicBool::new(false),
        }
    }

    pub fn with_timings(mut self, timings: ProcedureTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_gas(mut self, gas: Arc<GasFlowController>) -> Self {
        self.gas = Some(gas);
        self
    }

    pub fn with_event_log(mut self, events: Arc<ProcedureEventLog>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn link(&self) -> &Arc<HardwareLink> {
        &self.link
    }

    pub fn safety(&self) -> &Arc<SafetyCoordinator> {
        &self.safety
    }

    pub fn relays(&self) -> &RelayMap {
        &self.relays
    }

    pub fn gas(&self) -> Option<&Arc<GasFlowController>> {
        self.gas.as_ref()
    }

    pub fn timings(&self) -> &ProcedureTimings {
        &self.timings
    }

    pub fn events(&self) -> Option<&Arc<ProcedureEventLog>> {
        self.events.as_ref()
    }

    pub fn analog_channels(&self) -> &[AnalogChannelConfig] {
        &self.analog_channels
    }

    /// Run `procedure` to completion on the calling thread
    pub fn run(&self, procedure: ProcedureId, cancel: &CancellationToken) -> ProcedureOutcome {
        match procedure {
            ProcedureId::Pump => self.pump_procedure(cancel),
            ProcedureId::Vent => self.vent_procedure(false, cancel),
            ProcedureId::VentLoadLock => self.vent_loadlock_procedure(false, cancel),
            ProcedureId::LoadUnload => self.load_unload_procedure(cancel),
            ProcedureId::Sputter => self.sputter_procedure(cancel),
            ProcedureId::GoToStandby => self.go_to_standby(cancel),
            ProcedureId::GoToDefault => {
                if self.go_to_default_state() {
                    ProcedureOutcome::Success
                } else {
                    ProcedureOutcome::Failure("Return to the default state failed".to_string())
                }
            }
            ProcedureId::Abort => self.abort_and_go_default(),
        }
    }

    /// Progress line for the operator and the event log
    fn report(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        let procedure = self.safety.snapshot().current_procedure;
        match procedure {
            Some(p) => info!("[{}] {}", p, message),
            None => info!("{}", message),
        }
        if let Some(events) = &self.events {
            events.record(procedure, EventKind::Step, message);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::hardware::LinkSettings;
    use crate::hardware::sim::{SIM_PORT, SimController};
    use crate::types::{SnapshotUpdate, relays};

    pub struct Rig {
        pub sim: SimController,
        pub engine: Arc<ProcedureEngine>,
    }

    impl Rig {
        pub fn safety(&self) -> &SafetyCoordinator {
            &self.engine.safety
        }

        /// Mark relays on in both the simulator and the tracked state
        pub fn energize(&self, names: &[&str]) {
            for name in names {
                self.sim.force_relay(name, true);
                self.safety().set_relay_state(name, true);
            }
        }

        pub fn sync_inputs(&self) {
            self.engine.refresh_inputs().unwrap();
        }
    }

    pub fn settings() -> LinkSettings {
        LinkSettings {
            command_timeout: Duration::from_millis(500),
            ready_timeout: Duration::from_millis(200),
            fixed_port: None,
            cache: None,
            ..LinkSettings::default()
        }
    }

    /// Connected engine on the bundled configuration with timings scaled by `scale`
    pub fn rig_with(scale: f64, sim: Option<SimController>) -> Rig {
        let config = AppConfig::bundled().unwrap();
        let map = config.relay_map().unwrap();
        let sim = sim.unwrap_or_else(|| SimController::new(map.clone()));
        let link = Arc::new(HardwareLink::new(Box::new(sim.connector()), settings()));
        link.connect(SIM_PORT).unwrap();
        let safety = Arc::new(SafetyCoordinator::new(&config));
        let engine = ProcedureEngine::new(link, safety, map, &config)
            .with_timings(ProcedureTimings::scaled(scale));
        Rig {
            sim,
            engine: Arc::new(engine),
        }
    }

    /// Chamber under high vacuum with the turbo at speed
    pub fn high_vacuum_rig(scale: f64) -> Rig {
        let rig = rig_with(scale, None);
        rig.energize(&[
            relays::PUMP_SCROLL,
            relays::PUMP_TURBO,
            relays::VALVE_TURBO_GATE,
            relays::VALVE_BACKING,
        ]);
        rig.sim.set_analog_volts(0, 4.9);
        rig.sim.set_analog_volts(1, 0.5);
        rig.sim.set_analog_volts(3, 3.7);
        rig.sync_inputs();
        rig.safety().update_system_state(SnapshotUpdate::status("high_vacuum"));
        rig
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaled_timings_shrink_everything() {
        let fast = ProcedureTimings::scaled(0.01);
        let physical = ProcedureTimings::default();
        assert_eq!(fast.scroll_spinup, Duration::from_millis(150));
        assert_eq!(fast.sputter_max, Duration::from_secs(144));
        assert_eq!(physical.brake_pulse, Duration::from_millis(150));
        assert_eq!(physical.atmosphere_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn stop_maps_to_outcome() {
        assert_eq!(finish(Ok(())), ProcedureOutcome::Success);
        assert_eq!(finish(Err(Stop::Cancelled)), ProcedureOutcome::Cancelled);
        assert_eq!(
            finish(Err(Stop::failed("valve stuck"))),
            ProcedureOutcome::Failure("valve stuck".to_string())
        );
    }
}
