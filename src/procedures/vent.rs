use log::{error, info, warn};
use std::thread;
use std::time::Instant;

use super::{ProcedureEngine, ProcedureOutcome, Stop, WaitResult, finish};
use crate::types::{SnapshotUpdate, analog, digital, relays};
use crate::utils::CancellationToken;

/// Turbo below 65% spin, slow enough for vent pulses
const SPIN_BRAKE_START_VOLTS: f64 = 3.05;
/// Turbo below 20% spin
const SPIN_STOPPED_VOLTS: f64 = 1.3;
const BRAKE_CYCLES: usize = 20;
/// Cycles followed by a rest before the next pulse
const RESTED_BRAKE_CYCLES: usize = 7;
const BRAKE_REST_STEPS: usize = 9;
const LOADLOCK_ATMOSPHERE_VOLTS: f64 = 2.7;

impl ProcedureEngine {
    /// Spin the turbo down, brake it with short vent pulses, then vent the
    /// chamber until the operator opens the door.
    ///
    /// The vent valve is closed on every way out.
    pub fn vent_procedure(&self, go_default_first: bool, cancel: &CancellationToken) -> ProcedureOutcome {
        let result = self.vent_sequence(go_default_first, cancel);
        if result.is_err() && !self.force_off(relays::VALVE_VENT) {
            error!("Vent valve did not close, close it manually");
        }
        finish(result)
    }

    fn vent_sequence(&self, go_default_first: bool, cancel: &CancellationToken) -> Result<(), Stop> {
        let t = &self.timings;
        let atmospheric = self.safety.threshold_or("chamber_atmospheric", 4.5);

        if go_default_first && !self.go_to_default_state() {
            return Err(Stop::failed("Failed to return to the default state before venting"));
        }
        if let Err(e) = self.refresh_inputs() {
            warn!("Could not refresh inputs before venting: {}", e);
        }

        if !self.set_relay_safe(relays::ION_GAUGE, false) {
            return Err(Stop::failed("Ion gauge did not switch off"));
        }
        if self.safety.relay_state(relays::PUMP_TURBO) {
            self.report("Stopping turbo pump");
            self.switch(relays::PUMP_TURBO, false)?;
        }

        self.await_analog(
            "turbo below 65% spin",
            |v| v[analog::TURBO_SPIN] <= SPIN_BRAKE_START_VOLTS,
            t.spin_down_timeout,
            t.poll_interval,
            cancel,
        )?;
        self.brake_turbo(cancel)?;
        self.await_analog(
            "turbo below 20% spin",
            |v| v[analog::TURBO_SPIN] <= SPIN_STOPPED_VOLTS,
            t.spin_down_timeout,
            t.poll_interval,
            cancel,
        )?;

        self.report("Closing turbo gate and backing valve");
        self.switch(relays::VALVE_TURBO_GATE, false)?;
        self.switch(relays::VALVE_BACKING, false)?;
        self.pause(t.vent_settle, cancel)?;

        self.report("Opening vent valve");
        self.switch(relays::VALVE_VENT, true)?;
        self.await_analog(
            "chamber at atmosphere",
            |v| v[analog::CHAMBER_PRESSURE] > atmospheric,
            t.atmosphere_timeout,
            t.slow_poll_interval,
            cancel,
        )?;

        self.report("Chamber at atmosphere, waiting for the door to open");
        let door_opened = self.wait_for_door_open(cancel)?;
        if !self.force_off(relays::VALVE_VENT) {
            error!("Vent valve did not close after venting");
        }
        if !door_opened {
            return Err(Stop::failed(format!(
                "Door did not open within {:?}. Vent valve closed",
                t.door_timeout
            )));
        }
        self.report("Vent complete");
        Ok(())
    }

    /// Short vent pulses slow the turbo rotor. Stops early once it is below 20%.
    fn brake_turbo(&self, cancel: &CancellationToken) -> Result<(), Stop> {
        self.report("Braking turbo with vent pulses");
        for cycle in 0..BRAKE_CYCLES {
            if cancel.is_cancelled() {
                return Err(Stop::Cancelled);
            }
            self.switch(relays::VALVE_VENT, true)?;
            thread::sleep(self.timings.brake_pulse);
            self.switch(relays::VALVE_VENT, false)?;

            if cycle < RESTED_BRAKE_CYCLES {
                for _ in 0..BRAKE_REST_STEPS {
                    self.pause(self.timings.brake_rest, cancel)?;
                }
            }

            match self.refresh_analog() {
                Ok(v) if v[analog::TURBO_SPIN] < SPIN_STOPPED_VOLTS => {
                    info!("Turbo below 20% after {} brake cycles", cycle + 1);
                    break;
                }
                Ok(_) => {}
                Err(e) => warn!("Spin read failed during braking: {}", e),
            }
        }
        Ok(())
    }

    /// `Ok(true)` once the door input reports open, `Ok(false)` after the timeout
    fn wait_for_door_open(&self, cancel: &CancellationToken) -> Result<bool, Stop> {
        let start = Instant::now();
        while start.elapsed() < self.timings.door_timeout {
            match self.link.digital_inputs() {
                Ok(inputs) => {
                    self.safety.update_system_state(SnapshotUpdate::digital(inputs));
                    if !inputs[digital::DOOR_CLOSED] {
                        return Ok(true);
                    }
                }
                Err(e) => warn!("Door read failed: {}", e),
            }
            self.pause(self.timings.poll_interval, cancel)?;
        }
        Ok(false)
    }

    /// Vent the load-lock to atmosphere
    pub fn vent_loadlock_procedure(
        &self,
        go_default_first: bool,
        cancel: &CancellationToken,
    ) -> ProcedureOutcome {
        finish(self.vent_loadlock_sequence(go_default_first, cancel))
    }

    fn vent_loadlock_sequence(&self, go_default_first: bool, cancel: &CancellationToken) -> Result<(), Stop> {
        let t = &self.timings;
        if go_default_first {
            if !self.go_to_default_state() {
                return Err(Stop::failed(
                    "Failed to return to the default state before venting the load-lock",
                ));
            }
        } else {
            self.turbo_protection(cancel)?;
        }

        self.report("Opening load-lock vent valve");
        self.switch(relays::VALVE_LOADLOCK_VENT, true)?;
        let reached = self.wait_for_analog_condition(
            |v| v[analog::LOADLOCK_PRESSURE] > LOADLOCK_ATMOSPHERE_VOLTS,
            t.loadlock_atmosphere_timeout,
            t.poll_interval,
            cancel,
        );
        match reached {
            WaitResult::Met => {
                if let Err(Stop::Cancelled) = self.pause(t.loadlock_vent_hold, cancel) {
                    self.force_off(relays::VALVE_LOADLOCK_VENT);
                    return Err(Stop::Cancelled);
                }
            }
            WaitResult::Cancelled => {
                self.force_off(relays::VALVE_LOADLOCK_VENT);
                return Err(Stop::Cancelled);
            }
            WaitResult::Timeout | WaitResult::ReadFailure => {
                warn!("Load-lock did not read atmosphere within {:?}", t.loadlock_atmosphere_timeout);
            }
        }
        self.switch(relays::VALVE_LOADLOCK_VENT, false)?;
        self.report("Load-lock vented");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{high_vacuum_rig, rig_with};
    use super::*;
    use crate::config::AppConfig;
    use crate::hardware::sim::SimController;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn cancel_during_spin_down_is_prompt_and_closes_vent() {
        let rig = high_vacuum_rig(1.0);
        let cancel = CancellationToken::new();
        let engine = Arc::clone(&rig.engine);
        let token = cancel.clone();
        let worker = thread::spawn(move || {
            let start = Instant::now();
            (engine.vent_procedure(false, &token), start.elapsed())
        });
        thread::sleep(Duration::from_millis(300));
        cancel.cancel();
        let (outcome, elapsed) = worker.join().unwrap();
        assert_eq!(outcome, ProcedureOutcome::Cancelled);
        assert!(elapsed < Duration::from_millis(1500), "took {:?}", elapsed);
        assert!(!rig.sim.relay_by_name(relays::VALVE_VENT));
        assert!(!rig.sim.relay_by_name(relays::PUMP_TURBO));
    }

    #[test]
    fn vents_until_door_opens() {
        let config = AppConfig::bundled().unwrap();
        let sim = SimController::new(config.relay_map().unwrap()).with_plant(1000.0);
        let rig = rig_with(0.003, Some(sim));
        rig.energize(&[
            relays::PUMP_SCROLL,
            relays::VALVE_TURBO_GATE,
            relays::VALVE_BACKING,
        ]);
        rig.sim.set_analog_volts(analog::CHAMBER_PRESSURE, 1.0);
        rig.sim.set_analog_volts(analog::TURBO_SPIN, 2.0);

        let outcome = rig.engine.vent_procedure(false, &CancellationToken::new());
        assert_eq!(outcome, ProcedureOutcome::Success);
        assert!(!rig.sim.relay_by_name(relays::VALVE_VENT));
        assert!(!rig.sim.relay_by_name(relays::VALVE_TURBO_GATE));
        assert!(!rig.sim.relay_by_name(relays::VALVE_BACKING));
        assert!(rig.sim.analog_volts(analog::CHAMBER_PRESSURE) > 4.5);
    }

    #[test]
    fn loadlock_vent_closes_after_timeout() {
        let rig = rig_with(0.001, None);
        rig.energize(&[relays::PUMP_SCROLL]);
        rig.sim.set_analog_volts(analog::LOADLOCK_PRESSURE, 1.0);
        let outcome = rig.engine.vent_loadlock_procedure(false, &CancellationToken::new());
        assert_eq!(outcome, ProcedureOutcome::Success);
        assert!(!rig.sim.relay_by_name(relays::VALVE_LOADLOCK_VENT));
        assert!(
            rig.sim
                .relay_commands()
                .contains(&(relays::VALVE_LOADLOCK_VENT.to_string(), true))
        );
    }
}
