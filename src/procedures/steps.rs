use log::{debug, error, warn};
use std::thread;
use std::time::Duration;

use super::{ProcedureEngine, Stop, WaitResult};
use crate::error::ControlError;
use crate::types::{NUM_ANALOG, SnapshotUpdate, relays};
use crate::utils::{CancellationToken, PollError, poll_until_cancellable};

const MAX_READ_FAILURES: u32 = 5;

fn on_off(on: bool) -> &'static str {
    if on { "ON" } else { "OFF" }
}

impl ProcedureEngine {
    /// Switch a relay the way a procedure may.
    ///
    /// No command goes out when the tracked state already matches. The
    /// tracked state only changes once the controller answered `OK`.
    pub fn set_relay_safe(&self, name: &str, on: bool) -> bool {
        if name == relays::ION_GAUGE {
            return self.toggle_ion_gauge(on);
        }
        let Some(index) = self.relays.index(name) else {
            error!("No relay mapped for '{}'", name);
            return false;
        };
        if self.safety.relay_state(name) == on {
            debug!("{} already {}", name, on_off(on));
            return true;
        }

        let check = self.safety.check_button_safety(name, true);
        if !check.allowed {
            warn!("Safety refused {} {}: {}", name, on_off(on), check.message);
            return false;
        }

        if self.link.set_relay(index, on) {
            self.safety.set_relay_state(name, on);
            debug!("{} {}", name, on_off(on));
            true
        } else {
            error!("Controller did not confirm {} {}", name, on_off(on));
            false
        }
    }

    /// The ion gauge controller toggles on a pulse, so its real state comes
    /// from the analog proxy rather than the relay.
    fn toggle_ion_gauge(&self, on: bool) -> bool {
        let Some(index) = self.relays.index(relays::ION_GAUGE) else {
            error!("No relay mapped for the ion gauge");
            return false;
        };
        if self.safety.ion_gauge_on() == on {
            self.safety.set_relay_state(relays::ION_GAUGE, on);
            return true;
        }

        let check = self.safety.check_button_safety(relays::ION_GAUGE, true);
        if !check.allowed {
            warn!("Safety refused ion gauge {}: {}", on_off(on), check.message);
            return false;
        }

        if !self.link.set_relay(index, true) {
            error!("Ion gauge pulse was not confirmed");
            return false;
        }
        self.safety.set_relay_state(relays::ION_GAUGE, on);
        thread::sleep(self.timings.ion_gauge_pulse);
        if !self.link.set_relay(index, false) {
            warn!("Ion gauge relay did not release after the pulse");
        }

        thread::sleep(self.timings.ion_gauge_settle);
        if let Err(e) = self.refresh_analog() {
            warn!("Could not read back the ion gauge: {}", e);
        }
        true
    }

    /// Switch off through the safety check, falling back to a direct command
    pub(super) fn force_off(&self, name: &str) -> bool {
        if self.set_relay_safe(name, false) {
            return true;
        }
        let Some(index) = self.relays.index(name) else {
            return false;
        };
        warn!("Switching {} off directly", name);
        if self.link.set_relay(index, false) {
            self.safety.set_relay_state(name, false);
            true
        } else {
            false
        }
    }

    pub(super) fn read_analog(&self) -> Result<[f64; NUM_ANALOG], ControlError> {
        self.link.analog_inputs(&self.analog_channels)
    }

    pub(super) fn refresh_analog(&self) -> Result<[f64; NUM_ANALOG], ControlError> {
        let volts = self.read_analog()?;
        self.safety.update_system_state(SnapshotUpdate::analog(volts));
        Ok(volts)
    }

    /// Read analog and digital inputs into the snapshot
    pub fn refresh_inputs(&self) -> Result<(), ControlError> {
        self.refresh_analog()?;
        let digital = self.link.digital_inputs()?;
        self.safety.update_system_state(SnapshotUpdate::digital(digital));
        Ok(())
    }

    pub(super) fn ensure_link(&self) -> Result<(), ControlError> {
        if !self.link.is_connected() {
            return Err(ControlError::NotConnected);
        }
        Ok(())
    }

    /// Poll the analog inputs until `condition` holds. Every reading is
    /// merged into the snapshot.
    pub fn wait_for_analog_condition(
        &self,
        condition: impl Fn(&[f64; NUM_ANALOG]) -> bool,
        max_wait: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> WaitResult {
        let mut failures = 0;
        let result = poll_until_cancellable(
            || match self.refresh_analog() {
                Ok(volts) => {
                    failures = 0;
                    Ok(condition(&volts))
                }
                Err(e) => {
                    failures += 1;
                    warn!("Analog read failed ({}/{}): {}", failures, MAX_READ_FAILURES, e);
                    if failures >= MAX_READ_FAILURES { Err(e) } else { Ok(false) }
                }
            },
            max_wait,
            poll_interval,
            cancel,
        );
        match result {
            Ok(()) => WaitResult::Met,
            Err(PollError::Timeout) => WaitResult::Timeout,
            Err(PollError::Cancelled) => WaitResult::Cancelled,
            Err(PollError::ConditionError(_)) => WaitResult::ReadFailure,
        }
    }

    /// [`Self::wait_for_analog_condition`] where anything but `Met` stops the procedure
    pub(super) fn await_analog(
        &self,
        what: &str,
        condition: impl Fn(&[f64; NUM_ANALOG]) -> bool,
        max_wait: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), Stop> {
        self.report(format!("Waiting for {}", what));
        match self.wait_for_analog_condition(condition, max_wait, poll_interval, cancel) {
            WaitResult::Met => Ok(()),
            WaitResult::Cancelled => Err(Stop::Cancelled),
            WaitResult::Timeout => Err(Stop::failed(format!(
                "Timed out after {:?} waiting for {}",
                max_wait, what
            ))),
            WaitResult::ReadFailure => Err(Stop::failed(format!(
                "Lost the analog inputs while waiting for {}",
                what
            ))),
        }
    }

    /// [`Self::set_relay_safe`] as a step
    pub(super) fn switch(&self, name: &str, on: bool) -> Result<(), Stop> {
        if self.set_relay_safe(name, on) {
            Ok(())
        } else {
            Err(Stop::failed(format!("Could not switch {} {}", name, on_off(on))))
        }
    }

    /// Cancellable settling delay
    pub(super) fn pause(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), Stop> {
        if cancel.sleep(duration) {
            Ok(())
        } else {
            Err(Stop::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::rig_with;
    use super::*;
    use crate::types::analog;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn refused_relay_leaves_state_unchanged() {
        let rig = rig_with(0.001, None);
        rig.energize(&[relays::PUMP_SCROLL]);
        rig.sim.fail_relay_by_name(relays::VALVE_ROUGH);

        assert!(!rig.engine.set_relay_safe(relays::VALVE_ROUGH, true));
        assert!(!rig.safety().relay_state(relays::VALVE_ROUGH));
        assert!(!rig.sim.relay_by_name(relays::VALVE_ROUGH));
    }

    #[test]
    fn safety_denial_sends_nothing() {
        let rig = rig_with(0.001, None);
        rig.sim.clear_log();
        // Backing valve needs the scroll pump
        assert!(!rig.engine.set_relay_safe(relays::VALVE_BACKING, true));
        assert!(rig.sim.relay_commands().is_empty());
        assert!(!rig.safety().relay_state(relays::VALVE_BACKING));
    }

    #[test]
    fn matching_state_is_a_no_op() {
        let rig = rig_with(0.001, None);
        rig.sim.clear_log();
        assert!(rig.engine.set_relay_safe(relays::VALVE_VENT, false));
        assert!(rig.sim.command_log().is_empty());
    }

    #[test]
    fn ion_gauge_switches_by_pulse() {
        let rig = rig_with(0.001, None);
        rig.sim.set_analog_volts(analog::CHAMBER_PRESSURE, 0.5);
        rig.sync_inputs();
        rig.safety().set_system_status("high_vacuum");

        assert!(rig.engine.set_relay_safe(relays::ION_GAUGE, true));
        assert!(rig.safety().ion_gauge_on());
        assert!(rig.safety().relay_state(relays::ION_GAUGE));
        // Relay released after the pulse
        assert!(!rig.sim.relay_by_name(relays::ION_GAUGE));
        assert_eq!(
            rig.sim.relay_commands(),
            vec![
                (relays::ION_GAUGE.to_string(), true),
                (relays::ION_GAUGE.to_string(), false)
            ]
        );

        // Already on: no second pulse
        rig.sim.clear_log();
        assert!(rig.engine.set_relay_safe(relays::ION_GAUGE, true));
        assert!(rig.sim.relay_commands().is_empty());
    }

    #[test]
    fn wait_returns_met_and_merges_readings() {
        let rig = rig_with(0.001, None);
        rig.sim.set_analog_volts(analog::TURBO_SPIN, 3.6);
        let result = rig.engine.wait_for_analog_condition(
            |v| v[analog::TURBO_SPIN] > 3.5,
            Duration::from_secs(1),
            Duration::from_millis(5),
            &CancellationToken::new(),
        );
        assert_eq!(result, WaitResult::Met);
        assert!(rig.safety().snapshot().analog_inputs[analog::TURBO_SPIN] > 3.5);
    }

    #[test]
    fn wait_times_out() {
        let rig = rig_with(0.001, None);
        let result = rig.engine.wait_for_analog_condition(
            |v| v[analog::CHAMBER_PRESSURE] < 1.0,
            Duration::from_millis(50),
            Duration::from_millis(5),
            &CancellationToken::new(),
        );
        assert_eq!(result, WaitResult::Timeout);
    }

    #[test]
    fn cancelling_a_long_wait_returns_within_one_poll() {
        let rig = rig_with(1.0, None);
        let cancel = CancellationToken::new();
        let engine = Arc::clone(&rig.engine);
        let token = cancel.clone();
        let waiter = thread::spawn(move || {
            let start = Instant::now();
            let result = engine.wait_for_analog_condition(
                |v| v[analog::CHAMBER_PRESSURE] < 0.1,
                Duration::from_secs(300),
                Duration::from_secs(1),
                &token,
            );
            (result, start.elapsed())
        });
        thread::sleep(Duration::from_millis(100));
        cancel.cancel();
        let (result, elapsed) = waiter.join().unwrap();
        assert_eq!(result, WaitResult::Cancelled);
        assert!(elapsed < Duration::from_millis(1100), "took {:?}", elapsed);
    }

    #[test]
    fn silent_controller_is_a_read_failure() {
        let rig = rig_with(0.001, None);
        rig.sim.set_silent(true);
        let result = rig.engine.wait_for_analog_condition(
            |_| true,
            Duration::from_secs(30),
            Duration::from_millis(1),
            &CancellationToken::new(),
        );
        assert_eq!(result, WaitResult::ReadFailure);
    }
}
