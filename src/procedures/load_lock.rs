use log::{error, warn};

use super::{ProcedureEngine, ProcedureOutcome, Stop, UserConfirmation, WaitResult};
use crate::types::{ProcedureId, analog, digital, relays};
use crate::utils::CancellationToken;

const ERROR_STATE: &str = "error";
const HIGH_VACUUM_STATE: &str = "high_vacuum";

impl ProcedureEngine {
    /// Pump the load-lock, open its gate and hand over to the operator.
    ///
    /// Returns [`ProcedureOutcome::AwaitingUserConfirmation`] with the gate
    /// open; the transfer finishes in [`Self::complete_load_unload`].
    pub fn load_unload_procedure(&self, cancel: &CancellationToken) -> ProcedureOutcome {
        match self.load_unload_sequence(cancel) {
            Ok(()) => ProcedureOutcome::AwaitingUserConfirmation(UserConfirmation {
                procedure: ProcedureId::LoadUnload,
                message: "Load-lock gate is open. Transfer the sample, return the arm to its home position, then confirm."
                    .to_string(),
            }),
            Err(stop) => stop.into(),
        }
    }

    fn load_unload_sequence(&self, cancel: &CancellationToken) -> Result<(), Stop> {
        let t = &self.timings;
        let medium = self.safety.threshold_or("chamber_medium_vacuum", 2.0);
        let rough = self.safety.threshold_or("loadlock_rough_vacuum", 1.6);

        self.turbo_protection(cancel)?;
        self.refresh_inputs()
            .map_err(|e| Stop::failed(format!("Could not read inputs: {}", e)))?;

        let volts = self.safety.snapshot().analog_inputs;
        if volts[analog::CHAMBER_PRESSURE] > medium {
            return Err(Stop::failed(format!(
                "Chamber at {:.2} V is above medium vacuum, load/unload aborted",
                volts[analog::CHAMBER_PRESSURE]
            )));
        }

        if volts[analog::LOADLOCK_PRESSURE] >= rough {
            self.report("Pumping the load-lock");
            self.switch(relays::PUMP_SCROLL, true)?;
            self.switch(relays::VALVE_ROUGH, false)?;
            self.switch(relays::VALVE_LOADLOCK_VENT, false)?;
            self.switch(relays::VALVE_LOADLOCK_ROUGH, true)?;
            let pumped = self.wait_for_analog_condition(
                |v| v[analog::LOADLOCK_PRESSURE] < rough,
                t.loadlock_rough_timeout,
                t.poll_interval,
                cancel,
            );
            match pumped {
                WaitResult::Met => {}
                WaitResult::Cancelled => {
                    self.force_off(relays::VALVE_LOADLOCK_ROUGH);
                    return Err(Stop::Cancelled);
                }
                WaitResult::Timeout | WaitResult::ReadFailure => {
                    if !self.force_off(relays::VALVE_LOADLOCK_ROUGH) {
                        error!("Load-lock rough valve did not close");
                    }
                    return Err(Stop::failed(format!(
                        "Load-lock did not reach rough vacuum within {:?}",
                        t.loadlock_rough_timeout
                    )));
                }
            }
            self.switch(relays::VALVE_LOADLOCK_ROUGH, false)?;
        }

        let volts = self
            .refresh_analog()
            .map_err(|e| Stop::failed(format!("Could not read pressures: {}", e)))?;
        if volts[analog::LOADLOCK_PRESSURE] >= rough || volts[analog::CHAMBER_PRESSURE] >= medium {
            return Err(Stop::failed(format!(
                "Pressures not ready for transfer (load-lock {:.2} V, chamber {:.2} V)",
                volts[analog::LOADLOCK_PRESSURE],
                volts[analog::CHAMBER_PRESSURE]
            )));
        }

        self.report("Opening load-lock gate");
        self.switch(relays::VALVE_LOADLOCK_GATE, true)?;
        if !self.set_relay_safe(relays::LIGHT_BULB, true) {
            warn!("Chamber light did not switch on");
        }
        Ok(())
    }

    /// Operator confirmed the transfer. The gate only closes with the arm home.
    pub fn complete_load_unload(&self) -> ProcedureOutcome {
        let arm_home = match self.refresh_inputs() {
            Ok(()) => self.safety.snapshot().digital_inputs[digital::ARM_HOME],
            Err(e) => {
                error!("Could not read the arm position: {}", e);
                false
            }
        };
        if !arm_home {
            error!("Transfer arm is not home, load-lock gate stays open");
            self.safety.set_system_status(ERROR_STATE);
            return ProcedureOutcome::Failure(
                "Transfer arm is not in its home position. The load-lock gate was left open; retract the arm and inspect the system manually"
                    .to_string(),
            );
        }

        self.report("Closing load-lock gate");
        if !self.set_relay_safe(relays::VALVE_LOADLOCK_GATE, false) {
            self.safety.set_system_status(ERROR_STATE);
            return ProcedureOutcome::Failure("Load-lock gate did not close".to_string());
        }
        if !self.set_relay_safe(relays::LIGHT_BULB, false) {
            warn!("Chamber light did not switch off");
        }
        self.safety.set_system_status(HIGH_VACUUM_STATE);
        ProcedureOutcome::Success
    }

    /// Operator dismissed the transfer dialog
    pub fn cancel_load_unload(&self) {
        if !self.set_relay_safe(relays::LIGHT_BULB, false) {
            warn!("Chamber light did not switch off");
        }
        warn!("Load/unload cancelled with the load-lock gate open, verify the arm position manually");
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::high_vacuum_rig;
    use super::*;

    #[test]
    fn opens_gate_and_waits_for_operator() {
        let rig = high_vacuum_rig(0.001);
        rig.sim.set_analog_volts(analog::LOADLOCK_PRESSURE, 1.0);
        let outcome = rig.engine.load_unload_procedure(&CancellationToken::new());
        assert!(matches!(outcome, ProcedureOutcome::AwaitingUserConfirmation(_)));
        assert!(rig.sim.relay_by_name(relays::VALVE_LOADLOCK_GATE));
        assert!(rig.sim.relay_by_name(relays::LIGHT_BULB));
        assert!(!rig.sim.relay_by_name(relays::VALVE_TURBO_GATE));
    }

    #[test]
    fn loadlock_that_never_pumps_fails() {
        let rig = high_vacuum_rig(0.001);
        let outcome = rig.engine.load_unload_procedure(&CancellationToken::new());
        assert!(matches!(outcome, ProcedureOutcome::Failure(_)));
        assert!(!rig.sim.relay_by_name(relays::VALVE_LOADLOCK_ROUGH));
        assert!(!rig.sim.relay_by_name(relays::VALVE_LOADLOCK_GATE));
    }

    #[test]
    fn completion_with_arm_out_refuses_and_sets_error() {
        let rig = high_vacuum_rig(0.001);
        rig.sim.set_analog_volts(analog::LOADLOCK_PRESSURE, 1.0);
        let outcome = rig.engine.load_unload_procedure(&CancellationToken::new());
        assert!(matches!(outcome, ProcedureOutcome::AwaitingUserConfirmation(_)));

        rig.sim.set_digital(digital::ARM_HOME, false);
        rig.sim.clear_log();
        let outcome = rig.engine.complete_load_unload();
        assert!(matches!(outcome, ProcedureOutcome::Failure(_)));
        assert_eq!(rig.safety().system_status(), "error");
        assert!(
            !rig.sim
                .relay_commands()
                .iter()
                .any(|(name, _)| name == relays::VALVE_LOADLOCK_GATE)
        );
        assert!(rig.sim.relay_by_name(relays::VALVE_LOADLOCK_GATE));
    }

    #[test]
    fn completion_with_arm_home_closes_gate() {
        let rig = high_vacuum_rig(0.001);
        rig.sim.set_analog_volts(analog::LOADLOCK_PRESSURE, 1.0);
        rig.engine.load_unload_procedure(&CancellationToken::new());

        assert_eq!(rig.engine.complete_load_unload(), ProcedureOutcome::Success);
        assert!(!rig.sim.relay_by_name(relays::VALVE_LOADLOCK_GATE));
        assert!(!rig.sim.relay_by_name(relays::LIGHT_BULB));
        assert_eq!(rig.safety().system_status(), "high_vacuum");
    }
}
