use log::{error, info};

use super::{ProcedureEngine, ProcedureOutcome, Stop, WaitResult, finish};
use crate::types::{analog, relays};
use crate::utils::CancellationToken;

/// Drop that counts as "pressure is falling" when pumping from atmosphere
const PRESSURE_DROP_VOLTS: f64 = 0.02;
/// Roughing continues this far below medium vacuum before switching to backing
const ROUGH_MARGIN_VOLTS: f64 = 0.5;
/// About 80% turbo spin
const TURBO_AT_SPEED_VOLTS: f64 = 3.5;

impl ProcedureEngine {
    /// Pump the chamber from default (or atmosphere) to high vacuum
    pub fn pump_procedure(&self, cancel: &CancellationToken) -> ProcedureOutcome {
        finish(self.pump_sequence(cancel))
    }

    fn pump_sequence(&self, cancel: &CancellationToken) -> Result<(), Stop> {
        let t = &self.timings;
        let medium = self.safety.threshold_or("chamber_medium_vacuum", 2.0);
        let atmospheric = self.safety.threshold_or("chamber_atmospheric", 4.5);
        let high_vacuum = self.safety.threshold_or("chamber_high_vacuum", 0.7);

        if !self.go_to_default_state() {
            return Err(Stop::failed("Failed to return to the default state before pumping"));
        }

        self.report("Starting scroll pump");
        self.switch(relays::PUMP_SCROLL, true)?;
        self.pause(t.scroll_spinup, cancel)?;

        self.report("Opening rough valve");
        self.switch(relays::VALVE_ROUGH, true)?;

        // A door left ajar shows up as a chamber that never starts to fall.
        match self.refresh_analog().map(|v| v[analog::CHAMBER_PRESSURE]) {
            Ok(baseline) if baseline > atmospheric => {
                self.report(format!(
                    "Pumping from atmosphere ({:.2} V), checking that pressure starts to drop",
                    baseline
                ));
                let dropped = self.wait_for_analog_condition(
                    |v| v[analog::CHAMBER_PRESSURE] < baseline - PRESSURE_DROP_VOLTS,
                    t.pressure_drop_timeout,
                    t.poll_interval,
                    cancel,
                );
                match dropped {
                    WaitResult::Met => info!("Chamber pressure is dropping"),
                    WaitResult::Cancelled => return Err(Stop::Cancelled),
                    WaitResult::Timeout | WaitResult::ReadFailure => {
                        if !self.set_relay_safe(relays::VALVE_ROUGH, false) {
                            error!("Rough valve did not close");
                        }
                        return Err(Stop::failed(format!(
                            "Chamber pressure did not begin to drop within {:?}. Rough valve closed; check the door and vent valve",
                            t.pressure_drop_timeout
                        )));
                    }
                }
            }
            Ok(baseline) => info!("Chamber at {:.2} V, skipping the drop check", baseline),
            Err(e) => info!("No baseline reading ({}), skipping the drop check", e),
        }

        self.await_analog(
            "rough vacuum",
            |v| v[analog::CHAMBER_PRESSURE] < medium - ROUGH_MARGIN_VOLTS,
            t.rough_vacuum_timeout,
            t.poll_interval,
            cancel,
        )?;

        self.report("Switching from rough valve to backing valve");
        self.switch(relays::VALVE_ROUGH, false)?;
        self.switch(relays::VALVE_BACKING, true)?;
        self.pause(t.backing_settle, cancel)?;

        self.report("Opening turbo gate valve");
        self.switch(relays::VALVE_TURBO_GATE, true)?;
        self.await_analog(
            "medium vacuum",
            |v| v[analog::CHAMBER_PRESSURE] < medium,
            t.medium_vacuum_timeout,
            t.poll_interval,
            cancel,
        )?;
        self.pause(t.turbo_start_delay, cancel)?;

        self.report("Starting turbo pump");
        self.switch(relays::PUMP_TURBO, true)?;
        self.await_analog(
            "turbo at speed",
            |v| v[analog::TURBO_SPIN] >= TURBO_AT_SPEED_VOLTS,
            t.turbo_spinup_timeout,
            t.poll_interval,
            cancel,
        )?;

        let chamber = self
            .refresh_analog()
            .map(|v| v[analog::CHAMBER_PRESSURE])
            .map_err(|e| Stop::failed(format!("Could not read chamber pressure: {}", e)))?;
        if chamber < high_vacuum {
            self.report("Switching on ion gauge");
            if !self.set_relay_safe(relays::ION_GAUGE, true) {
                return Err(Stop::failed("Ion gauge did not switch on"));
            }
        }
        self.report("Pump-down complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::rig_with;
    use super::*;
    use crate::config::AppConfig;
    use crate::hardware::sim::SimController;

    #[test]
    fn no_pressure_drop_closes_rough_valve_and_fails() {
        let rig = rig_with(0.001, None);
        rig.energize(&[relays::PUMP_SCROLL]);
        rig.sim.set_analog_volts(analog::CHAMBER_PRESSURE, 4.8);

        let outcome = rig.engine.pump_procedure(&CancellationToken::new());
        match outcome {
            ProcedureOutcome::Failure(message) => {
                assert!(message.contains("pressure did not begin to drop"), "{}", message)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!rig.sim.relay_by_name(relays::VALVE_ROUGH));
        assert!(!rig.safety().relay_state(relays::VALVE_ROUGH));
        assert!(
            rig.sim
                .relay_commands()
                .contains(&(relays::VALVE_ROUGH.to_string(), true))
        );
    }

    #[test]
    fn pumps_down_against_the_plant_model() {
        let config = AppConfig::bundled().unwrap();
        let sim = SimController::new(config.relay_map().unwrap()).with_plant(1000.0);
        let rig = rig_with(0.003, Some(sim));
        rig.energize(&[relays::PUMP_SCROLL]);
        // The ion gauge may only start while pumping
        rig.safety().set_system_status("pumping");

        let outcome = rig.engine.pump_procedure(&CancellationToken::new());
        assert_eq!(outcome, ProcedureOutcome::Success);
        for name in [relays::PUMP_TURBO, relays::VALVE_TURBO_GATE, relays::VALVE_BACKING] {
            assert!(rig.sim.relay_by_name(name), "{} not on", name);
            assert!(rig.safety().relay_state(name));
        }
        assert!(!rig.sim.relay_by_name(relays::VALVE_ROUGH));
        assert!(rig.sim.analog_volts(analog::TURBO_SPIN) >= TURBO_AT_SPEED_VOLTS);
    }

    #[test]
    fn cancelled_during_spinup() {
        let rig = rig_with(1.0, None);
        rig.energize(&[relays::PUMP_SCROLL]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(rig.engine.pump_procedure(&cancel), ProcedureOutcome::Cancelled);
        assert!(!rig.sim.relay_by_name(relays::VALVE_ROUGH));
    }
}
