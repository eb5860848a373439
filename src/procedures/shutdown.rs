use log::{error, info, warn};
use std::thread;

use super::{ProcedureEngine, ProcedureOutcome, Stop, WaitResult};
use crate::error::ControlError;
use crate::types::{analog, relays};
use crate::utils::CancellationToken;

const DEFAULT_STATE: &str = "default";
const STANDBY_STATE: &str = "standby";
/// Turbo below 90% spin
const TURBO_COASTED_VOLTS: f64 = 4.11;

impl ProcedureEngine {
    /// Bring the chamber to the default configuration: mains off, turbo
    /// stopped, every valve closed, scroll pump running.
    ///
    /// Not cancellable. Individual close failures are logged and skipped. The
    /// sequence also runs while the controller is halted, since it only
    /// switches things off, but the result is then a failure. If the sequence
    /// itself breaks, mains and turbo are switched off, then everything else,
    /// and only the scroll pump is restarted.
    pub fn go_to_default_state(&self) -> bool {
        if self.safety.system_status() == DEFAULT_STATE {
            info!("Already in the default state");
            return true;
        }
        self.report("Returning to the default state");

        match self.default_sequence() {
            Ok(()) => {
                self.report("Default state reached");
                true
            }
            Err(e) => {
                error!("Return to default failed: {}", e);
                self.emergency_off();
                false
            }
        }
    }

    fn emergency_off(&self) {
        for name in [relays::MAINS_POWER, relays::PUMP_TURBO] {
            if !self.force_off(name) {
                error!("{} did not switch off", name);
            }
        }
        if self.link.all_off() {
            for (name, _) in self.relays.iter() {
                self.safety.set_relay_state(name, false);
            }
        } else {
            error!("ALL_OFF was not acknowledged");
        }
        thread::sleep(self.timings.all_off_settle);
        if let Some(line) = self.link.safety_halt() {
            warn!("Scroll pump left off, controller halted: {}", line);
            return;
        }
        if let Some(index) = self.relays.index(relays::PUMP_SCROLL) {
            if self.link.set_relay(index, true) {
                self.safety.set_relay_state(relays::PUMP_SCROLL, true);
            } else {
                error!("Scroll pump did not restart after ALL_OFF");
            }
        }
    }

    fn default_sequence(&self) -> Result<(), ControlError> {
        self.ensure_link()?;
        self.refresh_inputs()?;
        let t = &self.timings;

        // The tracked mains state can be stale, so an OFF command always goes out.
        self.safety.set_relay_state(relays::MAINS_POWER, true);
        if !self.force_off(relays::MAINS_POWER) {
            return Err(ControlError::Protocol("mains power did not switch off".to_string()));
        }
        thread::sleep(t.mains_off_settle);

        if self.safety.ion_gauge_on() && !self.set_relay_safe(relays::ION_GAUGE, false) {
            warn!("Ion gauge did not switch off");
        }

        if self.safety.relay_state(relays::PUMP_TURBO) {
            if !self.set_relay_safe(relays::PUMP_TURBO, false) {
                warn!("Turbo pump did not acknowledge OFF");
            }
            thread::sleep(t.turbo_off_settle);
            let coasted = self.wait_for_analog_condition(
                |v| v[analog::TURBO_SPIN] <= TURBO_COASTED_VOLTS,
                t.turbo_coast_timeout,
                t.poll_interval,
                &CancellationToken::new(),
            );
            if coasted != WaitResult::Met {
                warn!("Turbo still above 90% spin after {:?}, closing valves anyway", t.turbo_coast_timeout);
            }
        }

        for name in relays::DEFAULT_CLOSE_ORDER {
            if !self.set_relay_safe(name, false) {
                warn!("Could not close {}", name);
            }
            thread::sleep(t.relay_gap);
        }

        if !self.set_relay_safe(relays::PUMP_SCROLL, true) {
            warn!("Scroll pump did not start");
        }

        let others: Vec<String> = self
            .relays
            .iter()
            .map(|(name, _)| name.to_string())
            .filter(|name| {
                name != relays::PUMP_SCROLL && !relays::DEFAULT_CLOSE_ORDER.contains(&name.as_str())
            })
            .collect();
        for name in others {
            if !self.set_relay_safe(&name, false) {
                warn!("Could not switch {} off", name);
            }
        }

        thread::sleep(t.default_settle);
        match self.link.safety_halt() {
            Some(line) => Err(ControlError::SafetyHalt(line)),
            None => Ok(()),
        }
    }

    /// Default state, then the scroll pump off as well
    pub fn go_to_standby(&self, cancel: &CancellationToken) -> ProcedureOutcome {
        let status = self.safety.system_status();
        if status == STANDBY_STATE {
            info!("Already in standby");
            return ProcedureOutcome::Success;
        }
        if status != DEFAULT_STATE && !self.go_to_default_state() {
            return ProcedureOutcome::Failure(
                "Could not reach the default state before standby".to_string(),
            );
        }
        self.report("Stopping the scroll pump");
        if !self.set_relay_safe(relays::PUMP_SCROLL, false) {
            return ProcedureOutcome::Failure("Scroll pump did not switch off".to_string());
        }
        match self.pause(self.timings.standby_settle, cancel) {
            Ok(()) => ProcedureOutcome::Success,
            Err(stop) => stop.into(),
        }
    }

    /// Isolate the turbo from the chamber: ion gauge off, turbo off, turbo
    /// gate and backing valve closed.
    pub(super) fn turbo_protection(&self, cancel: &CancellationToken) -> Result<(), Stop> {
        let t = &self.timings;
        self.report("Turbo protection");
        if self.safety.ion_gauge_on() && !self.set_relay_safe(relays::ION_GAUGE, false) {
            return Err(Stop::failed("Ion gauge did not switch off"));
        }
        if self.safety.relay_state(relays::PUMP_TURBO) {
            self.switch(relays::PUMP_TURBO, false)?;
            self.pause(t.turbo_stop_settle, cancel)?;
        }
        self.switch(relays::VALVE_TURBO_GATE, false)?;
        self.pause(t.gate_close_settle, cancel)?;
        self.switch(relays::VALVE_BACKING, false)?;
        self.pause(t.backing_close_settle, cancel)?;
        Ok(())
    }

    /// Tear down a running sputter if its teardown has not happened yet,
    /// then return to default.
    pub fn abort_and_go_default(&self) -> ProcedureOutcome {
        if self.safety.is_sputter_procedure_active() {
            self.sputter_teardown();
        }
        if self.go_to_default_state() {
            ProcedureOutcome::Success
        } else {
            ProcedureOutcome::Failure("Return to the default state after abort failed".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{high_vacuum_rig, rig_with};
    use super::*;

    fn position(commands: &[(String, bool)], name: &str, on: bool) -> usize {
        commands
            .iter()
            .position(|(n, o)| n == name && *o == on)
            .unwrap_or_else(|| panic!("{} {} never sent: {:?}", name, on, commands))
    }

    #[test]
    fn default_orders_mains_turbo_then_valves() {
        let rig = high_vacuum_rig(0.001);
        rig.energize(&[relays::MAINS_POWER, relays::VALVE_LOADLOCK_VENT]);
        rig.sim.clear_log();

        assert!(rig.engine.go_to_default_state());

        let commands = rig.sim.relay_commands();
        let mains = position(&commands, relays::MAINS_POWER, false);
        let turbo = position(&commands, relays::PUMP_TURBO, false);
        let gate = position(&commands, relays::VALVE_TURBO_GATE, false);
        let backing = position(&commands, relays::VALVE_BACKING, false);
        let ll_vent = position(&commands, relays::VALVE_LOADLOCK_VENT, false);
        assert_eq!(mains, 0);
        assert!(mains < turbo);
        assert!(turbo < gate && gate < backing && backing < ll_vent);

        assert!(rig.sim.relay_by_name(relays::PUMP_SCROLL));
        for name in [
            relays::MAINS_POWER,
            relays::PUMP_TURBO,
            relays::VALVE_TURBO_GATE,
            relays::VALVE_BACKING,
            relays::VALVE_LOADLOCK_VENT,
        ] {
            assert!(!rig.sim.relay_by_name(name), "{} still on", name);
            assert!(!rig.safety().relay_state(name));
        }
    }

    #[test]
    fn default_sends_mains_off_even_when_tracked_off() {
        let rig = rig_with(0.001, None);
        rig.safety().set_system_status("vented");
        rig.sim.force_relay(relays::MAINS_POWER, true);
        rig.sim.clear_log();

        assert!(rig.engine.go_to_default_state());
        assert_eq!(
            rig.sim.relay_commands().first(),
            Some(&(relays::MAINS_POWER.to_string(), false))
        );
        assert!(!rig.sim.relay_by_name(relays::MAINS_POWER));
    }

    #[test]
    fn already_default_does_nothing() {
        let rig = rig_with(0.001, None);
        rig.sim.clear_log();
        assert!(rig.engine.go_to_default_state());
        assert!(rig.sim.command_log().is_empty());
    }

    fn latch_hazard(rig: &super::super::testing::Rig, line: &str) {
        rig.sim.inject_line(line);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while rig.engine.link().safety_halt().is_none() {
            assert!(std::time::Instant::now() < deadline, "hazard never latched");
            thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    #[test]
    fn default_after_hazard_and_reconnect_keeps_order() {
        let rig = high_vacuum_rig(0.001);
        rig.energize(&[relays::MAINS_POWER]);
        latch_hazard(&rig, "CRITICAL_SAFETY_ERROR");
        rig.engine.link().connect(crate::hardware::sim::SIM_PORT).unwrap();
        rig.sim.clear_log();

        assert!(rig.engine.go_to_default_state());

        let commands = rig.sim.relay_commands();
        assert_eq!(position(&commands, relays::MAINS_POWER, false), 0);
        assert!(
            position(&commands, relays::PUMP_TURBO, false)
                < position(&commands, relays::VALVE_TURBO_GATE, false)
        );
        assert!(!rig.sim.command_log().iter().any(|c| c == "ALL_OFF"));
        assert!(rig.sim.relay_by_name(relays::PUMP_SCROLL));
        assert!(rig.engine.link().safety_halt().is_none());
    }

    #[test]
    fn default_while_halted_switches_off_in_order() {
        let rig = high_vacuum_rig(0.001);
        rig.energize(&[relays::MAINS_POWER]);
        latch_hazard(&rig, "ARDUINO_SAFETY_HALT");
        rig.sim.clear_log();

        assert!(!rig.engine.go_to_default_state());

        let commands = rig.sim.relay_commands();
        assert_eq!(position(&commands, relays::MAINS_POWER, false), 0);
        let turbo = rig.engine.relays.index(relays::PUMP_TURBO).unwrap();
        let turbo_off_wire = crate::protocol::Command::relay(turbo, false).unwrap().to_wire();
        let log = rig.sim.command_log();
        let turbo_off = log.iter().position(|c| *c == turbo_off_wire).unwrap();
        let all_off = log.iter().position(|c| c == "ALL_OFF").unwrap();
        assert!(turbo_off < all_off);
        assert!(!log.iter().any(|c| c.ends_with("_ON")));
        for name in [relays::MAINS_POWER, relays::PUMP_TURBO, relays::VALVE_TURBO_GATE] {
            assert!(!rig.sim.relay_by_name(name), "{} still on", name);
        }
    }

    #[test]
    fn broken_link_falls_back_to_scroll_only() {
        let rig = high_vacuum_rig(0.001);
        rig.engine.link().disconnect();
        assert!(!rig.engine.go_to_default_state());
    }

    #[test]
    fn standby_stops_scroll_pump() {
        let rig = rig_with(0.001, None);
        rig.energize(&[relays::PUMP_SCROLL]);
        let outcome = rig.engine.go_to_standby(&CancellationToken::new());
        assert_eq!(outcome, ProcedureOutcome::Success);
        assert!(!rig.sim.relay_by_name(relays::PUMP_SCROLL));
    }

    #[test]
    fn turbo_protection_isolates_turbo() {
        let rig = high_vacuum_rig(0.001);
        rig.sim.clear_log();
        rig.engine.turbo_protection(&CancellationToken::new()).unwrap();
        let commands = rig.sim.relay_commands();
        assert_eq!(
            commands,
            vec![
                (relays::PUMP_TURBO.to_string(), false),
                (relays::VALVE_TURBO_GATE.to_string(), false),
                (relays::VALVE_BACKING.to_string(), false),
            ]
        );
        assert!(rig.sim.relay_by_name(relays::PUMP_SCROLL));
    }
}
