use log::{error, info, warn};
use std::sync::atomic::Ordering;
use std::time::Instant;

use super::{ProcedureEngine, ProcedureOutcome, Stop};
use crate::types::{analog, relays, turbo_spin_voltage};
use crate::utils::CancellationToken;

const STANDBY_SPIN_PERCENT: f64 = 60.0;
const SPIN_HYSTERESIS_VOLTS: f64 = 0.05;
const MAX_READ_FAILURES: u32 = 5;

impl ProcedureEngine {
    /// Power the sputter supplies and hold the turbo at standby spin until
    /// cancelled or the time limit runs out.
    ///
    /// Cancelling is the normal way to end a sputter run and counts as
    /// success. The teardown runs exactly once, however the run ends.
    pub fn sputter_procedure(&self, cancel: &CancellationToken) -> ProcedureOutcome {
        if let Err(e) = self.refresh_inputs() {
            warn!("Could not refresh inputs before sputtering: {}", e);
        }
        if !self.set_relay_safe(relays::ION_GAUGE, false) {
            return ProcedureOutcome::Failure("Ion gauge did not switch off".to_string());
        }

        self.safety.set_sputter_procedure_active(true);
        self.sputter_teardown_pending.store(true, Ordering::SeqCst);

        self.report("Switching on mains power");
        if !self.set_relay_safe(relays::MAINS_POWER, true) {
            self.sputter_teardown_pending.store(false, Ordering::SeqCst);
            self.safety.set_sputter_procedure_active(false);
            return ProcedureOutcome::Failure("Mains power did not switch on".to_string());
        }
        self.apply_sputter_flows();

        let result = self.turbo_standby_spin_control(cancel);
        self.sputter_teardown();

        match result {
            Ok(()) | Err(Stop::Cancelled) => ProcedureOutcome::Success,
            Err(Stop::Failed(message)) => ProcedureOutcome::Failure(message),
        }
    }

    fn apply_sputter_flows(&self) {
        let Some(gas) = &self.gas else {
            return;
        };
        gas.set_fast_reads(true);
        for (channel, sccm) in &self.sputter_flows {
            if gas.set_flow_rate(channel, *sccm) {
                self.report(format!("{} flow set to {:.1} sccm", channel, sccm));
            } else {
                warn!("Could not set {} flow to {:.1} sccm", channel, sccm);
            }
        }
    }

    /// Bang-bang control of the turbo around 60% spin. The turbo starts and
    /// ends switched off.
    fn turbo_standby_spin_control(&self, cancel: &CancellationToken) -> Result<(), Stop> {
        let t = &self.timings;
        let target = turbo_spin_voltage(STANDBY_SPIN_PERCENT);
        self.report(format!("Holding turbo at {:.0}% spin ({:.2} V)", STANDBY_SPIN_PERCENT, target));
        if self.safety.relay_state(relays::PUMP_TURBO) {
            self.switch(relays::PUMP_TURBO, false)?;
        }

        let start = Instant::now();
        let mut failures = 0;
        let result = loop {
            if start.elapsed() >= t.sputter_max {
                info!("Sputter time limit of {:?} reached", t.sputter_max);
                break Ok(());
            }
            if cancel.is_cancelled() {
                break Err(Stop::Cancelled);
            }

            match self.refresh_analog() {
                Ok(volts) => {
                    failures = 0;
                    let spin = volts[analog::TURBO_SPIN];
                    let turbo_on = self.safety.relay_state(relays::PUMP_TURBO);
                    if spin < target - SPIN_HYSTERESIS_VOLTS && !turbo_on {
                        if !self.set_relay_safe(relays::PUMP_TURBO, true) {
                            warn!("Turbo did not start at {:.2} V spin", spin);
                        }
                    } else if spin > target + SPIN_HYSTERESIS_VOLTS
                        && turbo_on
                        && !self.set_relay_safe(relays::PUMP_TURBO, false)
                    {
                        warn!("Turbo did not stop at {:.2} V spin", spin);
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!("Spin read failed ({}/{}): {}", failures, MAX_READ_FAILURES, e);
                    if failures >= MAX_READ_FAILURES {
                        break Err(Stop::failed("Lost the analog inputs during sputtering"));
                    }
                }
            }

            if !cancel.sleep(t.spin_control_interval) {
                break Err(Stop::Cancelled);
            }
        };

        if self.safety.relay_state(relays::PUMP_TURBO) && !self.force_off(relays::PUMP_TURBO) {
            error!("Turbo pump did not switch off after sputtering");
        }
        result
    }

    /// Mains off, gas valves closed, flows stopped. Runs at most once per sputter run.
    pub fn sputter_teardown(&self) {
        if !self.sputter_teardown_pending.swap(false, Ordering::SeqCst) {
            return;
        }
        self.report("Sputter teardown");
        if !self.force_off(relays::MAINS_POWER) {
            error!("Mains power did not switch off, switch it off manually");
        }
        for valve in relays::GAS_VALVES {
            if self.safety.relay_state(valve) && !self.force_off(valve) {
                error!("{} did not close", valve);
            }
        }
        if let Some(gas) = &self.gas {
            if !gas.stop_all_flows() {
                warn!("Not every gas flow confirmed stop");
            }
            gas.set_fast_reads(false);
        }
        self.safety.set_sputter_procedure_active(false);
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::high_vacuum_rig;
    use super::*;
    use crate::config::AppConfig;
    use crate::gas::GasFlowController;
    use crate::gas::sim::SimMfcDriver;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn mains_off_count(commands: &[(String, bool)]) -> usize {
        commands
            .iter()
            .filter(|(name, on)| name == relays::MAINS_POWER && !on)
            .count()
    }

    #[test]
    fn cancelled_sputter_tears_down_once() {
        let rig = high_vacuum_rig(0.001);
        let cancel = CancellationToken::new();
        let engine = Arc::clone(&rig.engine);
        let token = cancel.clone();
        let worker = thread::spawn(move || engine.sputter_procedure(&token));

        thread::sleep(Duration::from_millis(50));
        assert!(rig.sim.relay_by_name(relays::MAINS_POWER));
        assert!(rig.safety().is_sputter_procedure_active());
        cancel.cancel();

        assert_eq!(worker.join().unwrap(), ProcedureOutcome::Success);
        assert!(!rig.sim.relay_by_name(relays::MAINS_POWER));
        assert!(!rig.sim.relay_by_name(relays::PUMP_TURBO));
        assert!(!rig.safety().is_sputter_procedure_active());

        // A later abort must not tear down a second time
        rig.engine.sputter_teardown();
        assert_eq!(mains_off_count(&rig.sim.relay_commands()), 1);
    }

    #[test]
    fn turbo_switches_on_below_standby_band() {
        let rig = high_vacuum_rig(0.001);
        rig.sim.set_analog_volts(analog::TURBO_SPIN, 3.7);
        let cancel = CancellationToken::new();
        let engine = Arc::clone(&rig.engine);
        let token = cancel.clone();
        let worker = thread::spawn(move || engine.sputter_procedure(&token));

        // Turbo starts off, spin falls below 2.85 V, controller restarts it
        thread::sleep(Duration::from_millis(30));
        rig.sim.set_analog_volts(analog::TURBO_SPIN, 2.5);
        thread::sleep(Duration::from_millis(100));
        assert!(rig.sim.relay_by_name(relays::PUMP_TURBO));

        cancel.cancel();
        assert_eq!(worker.join().unwrap(), ProcedureOutcome::Success);
        assert!(!rig.sim.relay_by_name(relays::PUMP_TURBO));
    }

    #[test]
    fn mains_refusal_clears_the_flag() {
        let rig = high_vacuum_rig(0.001);
        rig.sim.fail_relay_by_name(relays::MAINS_POWER);
        let outcome = rig.engine.sputter_procedure(&CancellationToken::new());
        assert!(matches!(outcome, ProcedureOutcome::Failure(_)));
        assert!(!rig.safety().is_sputter_procedure_active());
    }

    #[test]
    fn teardown_stops_gas_flows() {
        let mut config = AppConfig::bundled().unwrap();
        config.gas.read_interval_ms = 10;
        config.gas.sputter_read_interval_ms = 10;
        let driver = SimMfcDriver::new();
        let gas = Arc::new(GasFlowController::start(config.gas.clone(), Box::new(driver.clone())));
        let rig = high_vacuum_rig(0.001);
        let engine = ProcedureEngine::new(
            Arc::clone(rig.engine.link()),
            Arc::clone(rig.engine.safety()),
            rig.engine.relays().clone(),
            &config,
        )
        .with_timings(rig.engine.timings().clone())
        .with_gas(Arc::clone(&gas));

        thread::sleep(Duration::from_millis(50));
        assert!(gas.set_flow_rate("Ar", 20.0));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(engine.sputter_procedure(&cancel), ProcedureOutcome::Success);
        assert_eq!(driver.setpoint("Ar"), 0.0);
        gas.stop();
    }
}
