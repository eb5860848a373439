//! In-memory relay controller that speaks the firmware's line protocol.
//!
//! Used by the test suite and by `sputter-ctl --simulate`. An optional plant
//! model moves the analog channels in response to the relays so procedures
//! can run end to end without hardware.

use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::discovery::PortCandidate;
use super::transport::{Connector, Transport};
use crate::error::ControlError;
use crate::protocol::{self, Command};
use crate::types::{NUM_ANALOG, NUM_DIGITAL, NUM_RELAYS, RelayMap, analog, digital, relays};

pub const SIM_PORT: &str = "/dev/ttySIM0";
const READ_WAIT: Duration = Duration::from_millis(10);

/// First-order approach of the analog channels toward relay-dependent targets
#[derive(Debug, Clone)]
pub struct PlantModel {
    /// Simulated seconds per real second
    pub time_scale: f64,
    last_step: Instant,
}

impl PlantModel {
    pub fn new(time_scale: f64) -> Self {
        Self {
            time_scale,
            last_step: Instant::now(),
        }
    }
}

struct SimState {
    relays: [bool; NUM_RELAYS],
    digital: [bool; NUM_DIGITAL],
    analog: [f64; NUM_ANALOG],
    ion_gauge_on: bool,
    outbox: VecDeque<String>,
    log: Vec<String>,
    failing: HashSet<u8>,
    silent: bool,
    unreachable: bool,
    plant: Option<PlantModel>,
}

struct Shared {
    state: Mutex<SimState>,
    readable: Condvar,
    relay_map: RelayMap,
}

/// Handle to a simulated controller. Clones share the same device.
#[derive(Clone)]
pub struct SimController {
    shared: Arc<Shared>,
}

impl SimController {
    /// Controller at rest: chamber vented, door closed, water flowing, arm home
    pub fn new(relay_map: RelayMap) -> Self {
        let state = SimState {
            relays: [false; NUM_RELAYS],
            digital: [true, true, true, false],
            analog: [4.9, 4.9, 4.9, 0.0],
            ion_gauge_on: false,
            outbox: VecDeque::new(),
            log: Vec::new(),
            failing: HashSet::new(),
            silent: false,
            unreachable: false,
            plant: None,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                readable: Condvar::new(),
                relay_map,
            }),
        }
    }

    pub fn with_plant(self, time_scale: f64) -> Self {
        self.shared.state.lock().plant = Some(PlantModel::new(time_scale));
        self
    }

    pub fn connector(&self) -> SimConnector {
        SimConnector {
            controller: self.clone(),
        }
    }

    pub fn relay(&self, index: u8) -> bool {
        index >= 1
            && (index as usize) <= NUM_RELAYS
            && self.shared.state.lock().relays[index as usize - 1]
    }

    pub fn relay_by_name(&self, name: &str) -> bool {
        self.shared
            .relay_map
            .index(name)
            .is_some_and(|index| self.relay(index))
    }

    /// Force a relay without going through the protocol
    pub fn force_relay(&self, name: &str, on: bool) {
        if let Some(index) = self.shared.relay_map.index(name) {
            self.shared.state.lock().relays[index as usize - 1] = on;
        }
    }

    pub fn set_analog_volts(&self, channel: usize, volts: f64) {
        self.shared.state.lock().analog[channel] = volts;
    }

    pub fn analog_volts(&self, channel: usize) -> f64 {
        self.shared.state.lock().analog[channel]
    }

    pub fn set_digital(&self, channel: usize, value: bool) {
        self.shared.state.lock().digital[channel] = value;
    }

    pub fn set_ion_gauge(&self, on: bool) {
        let mut state = self.shared.state.lock();
        state.ion_gauge_on = on;
        state.analog[analog::ION_GAUGE] = if on { 2.0 } else { 4.9 };
    }

    /// Make a relay answer `ERROR`
    pub fn fail_relay(&self, index: u8) {
        self.shared.state.lock().failing.insert(index);
    }

    pub fn fail_relay_by_name(&self, name: &str) {
        if let Some(index) = self.shared.relay_map.index(name) {
            self.fail_relay(index);
        }
    }

    pub fn clear_failures(&self) {
        self.shared.state.lock().failing.clear();
    }

    /// Swallow commands without answering
    pub fn set_silent(&self, silent: bool) {
        self.shared.state.lock().silent = silent;
    }

    /// Refuse new connections, as if the cable were unplugged
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.state.lock().unreachable = unreachable;
    }

    /// Queue an unsolicited line
    pub fn inject_line(&self, line: &str) {
        self.shared.state.lock().outbox.push_back(line.to_string());
        self.shared.readable.notify_all();
    }

    /// Every command received, in order
    pub fn command_log(&self) -> Vec<String> {
        self.shared.state.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.shared.state.lock().log.clear();
    }

    /// Relay commands from the log, translated to `(name, on)`
    pub fn relay_commands(&self) -> Vec<(String, bool)> {
        self.command_log()
            .iter()
            .filter_map(|line| match protocol::parse_command(line)? {
                Command::Relay { index, on } => {
                    let name = self.shared.relay_map.name_of(index)?;
                    Some((name.to_string(), on))
                }
                _ => None,
            })
            .collect()
    }

    fn handle(&self, line: &str) {
        let mut state = self.shared.state.lock();
        state.log.push(line.to_string());
        if state.silent || line.is_empty() {
            return;
        }
        let response = match protocol::parse_command(line) {
            Some(Command::Relay { index, on }) => {
                if state.failing.contains(&index) {
                    protocol::ERROR.to_string()
                } else {
                    let slot = index as usize - 1;
                    let ion_index = self.shared.relay_map.index(relays::ION_GAUGE);
                    if ion_index == Some(index) && on && !state.relays[slot] {
                        let toggled = !state.ion_gauge_on;
                        state.ion_gauge_on = toggled;
                        state.analog[analog::ION_GAUGE] = if toggled { 2.0 } else { 4.9 };
                    }
                    state.relays[slot] = on;
                    protocol::OK.to_string()
                }
            }
            Some(Command::AllOff) => {
                state.relays = [false; NUM_RELAYS];
                protocol::OK.to_string()
            }
            Some(Command::Status) => protocol::format_bits(protocol::STATUS_PREFIX, &state.relays),
            Some(Command::DigitalInputs) => {
                self.step_plant(&mut state);
                protocol::format_bits(protocol::DIGITAL_PREFIX, &state.digital)
            }
            Some(Command::AnalogInputs) => {
                self.step_plant(&mut state);
                let raw: Vec<String> = state
                    .analog
                    .iter()
                    .map(|v| protocol::volts_to_raw(*v).to_string())
                    .collect();
                format!("{}{}", protocol::ANALOG_PREFIX, raw.join(","))
            }
            None => protocol::ERROR.to_string(),
        };
        state.outbox.push_back(response);
        self.shared.readable.notify_all();
    }

    fn step_plant(&self, state: &mut SimState) {
        let Some(plant) = state.plant.as_mut() else {
            return;
        };
        let now = Instant::now();
        let dt = now.duration_since(plant.last_step).as_secs_f64() * plant.time_scale;
        plant.last_step = now;

        let on = |name: &str| {
            self.shared
                .relay_map
                .index(name)
                .is_some_and(|i| state.relays[i as usize - 1])
        };
        let approach = |value: f64, target: f64, tau: f64| {
            target + (value - target) * (-dt / tau).exp()
        };

        let scroll = on(relays::PUMP_SCROLL);
        let turbo = on(relays::PUMP_TURBO);
        let gate = on(relays::VALVE_TURBO_GATE);
        let backing = on(relays::VALVE_BACKING);
        let rough = on(relays::VALVE_ROUGH);
        let vent = on(relays::VALVE_VENT);
        let ll_gate = on(relays::VALVE_LOADLOCK_GATE);
        let ll_rough = on(relays::VALVE_LOADLOCK_ROUGH);
        let ll_vent = on(relays::VALVE_LOADLOCK_VENT);

        let spin = state.analog[analog::TURBO_SPIN];
        let chamber = state.analog[analog::CHAMBER_PRESSURE];
        let loadlock = state.analog[analog::LOADLOCK_PRESSURE];

        let chamber_target = if vent {
            Some((4.9, 20.0))
        } else if gate && turbo && spin > 3.0 {
            Some((0.4, 20.0))
        } else if gate && backing && scroll {
            Some((1.2, 30.0))
        } else if rough && scroll {
            Some((1.2, 30.0))
        } else {
            None
        };
        if let Some((target, tau)) = chamber_target {
            state.analog[analog::CHAMBER_PRESSURE] = approach(chamber, target, tau);
        }

        let spin_target = if turbo {
            (3.7, 30.0)
        } else if vent {
            (0.5, 10.0)
        } else {
            (0.5, 60.0)
        };
        state.analog[analog::TURBO_SPIN] = approach(spin, spin_target.0, spin_target.1);

        let loadlock_target = if ll_vent {
            Some((4.9, 3.0))
        } else if ll_rough && scroll {
            Some((1.0, 10.0))
        } else if ll_gate {
            Some((state.analog[analog::CHAMBER_PRESSURE], 2.0))
        } else {
            None
        };
        if let Some((target, tau)) = loadlock_target {
            state.analog[analog::LOADLOCK_PRESSURE] = approach(loadlock, target, tau);
        }

        // An operator opens the door once the chamber is up to air and closes it when the vent shuts.
        if vent && state.analog[analog::CHAMBER_PRESSURE] > 4.8 {
            state.digital[digital::DOOR_CLOSED] = false;
        } else if !vent {
            state.digital[digital::DOOR_CLOSED] = true;
        }
        if state.ion_gauge_on && state.analog[analog::CHAMBER_PRESSURE] > 1.0 {
            state.ion_gauge_on = false;
            state.analog[analog::ION_GAUGE] = 4.9;
        }
    }
}

/// Transport end of a simulated connection
pub struct SimTransport {
    controller: SimController,
}

impl Transport for SimTransport {
    fn write_line(&mut self, line: &str) -> Result<(), ControlError> {
        self.controller.handle(line.trim());
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>, ControlError> {
        let shared = &self.controller.shared;
        let mut state = shared.state.lock();
        if state.outbox.is_empty() {
            shared.readable.wait_for(&mut state, READ_WAIT);
        }
        Ok(state.outbox.pop_front())
    }

    fn port_name(&self) -> &str {
        SIM_PORT
    }
}

pub struct SimConnector {
    controller: SimController,
}

impl Connector for SimConnector {
    fn candidates(&self) -> Vec<PortCandidate> {
        vec![PortCandidate::new(SIM_PORT, "Simulated Arduino Mega 2560", Some(0x2341))]
    }

    fn open(&self, port: &str) -> Result<Box<dyn Transport>, ControlError> {
        if port != SIM_PORT {
            return Err(ControlError::NoDevice(format!("{} does not exist", port)));
        }
        if self.controller.shared.state.lock().unreachable {
            return Err(ControlError::NoDevice(format!("{} is not responding", port)));
        }
        self.controller.inject_line(protocol::READY_TOKEN);
        Ok(Box::new(SimTransport {
            controller: self.controller.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn sim() -> SimController {
        SimController::new(AppConfig::default().relay_map().unwrap())
    }

    #[test]
    fn answers_protocol_commands() {
        let sim = sim();
        let mut transport = sim.connector().open(SIM_PORT).unwrap();
        assert_eq!(transport.read_line().unwrap().as_deref(), Some("ARDUINO_READY"));

        transport.write_line("RELAY_2_ON").unwrap();
        assert_eq!(transport.read_line().unwrap().as_deref(), Some("OK"));
        transport.write_line("STATUS").unwrap();
        let status = transport.read_line().unwrap().unwrap();
        assert!(protocol::parse_status(&status).unwrap()[1]);
        transport.write_line("BOGUS").unwrap();
        assert_eq!(transport.read_line().unwrap().as_deref(), Some("ERROR"));
    }

    #[test]
    fn ion_gauge_toggles_on_rising_edge() {
        let sim = sim();
        let mut transport = sim.connector().open(SIM_PORT).unwrap();
        let index = AppConfig::default().relay_map().unwrap().index(relays::ION_GAUGE).unwrap();
        transport.write_line(&format!("RELAY_{}_ON", index)).unwrap();
        transport.write_line(&format!("RELAY_{}_OFF", index)).unwrap();
        assert_eq!(sim.analog_volts(analog::ION_GAUGE), 2.0);
        transport.write_line(&format!("RELAY_{}_ON", index)).unwrap();
        assert_eq!(sim.analog_volts(analog::ION_GAUGE), 4.9);
    }

    #[test]
    fn plant_pumps_down_through_rough_valve() {
        let sim = sim().with_plant(1000.0);
        sim.force_relay(relays::PUMP_SCROLL, true);
        sim.force_relay(relays::VALVE_ROUGH, true);
        let mut transport = sim.connector().open(SIM_PORT).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        transport.write_line("GET_ANALOG_INPUTS").unwrap();
        assert!(sim.analog_volts(analog::CHAMBER_PRESSURE) < 1.5);
    }

    #[test]
    fn refuses_connections_when_unreachable() {
        let sim = sim();
        sim.set_unreachable(true);
        assert!(sim.connector().open(SIM_PORT).is_err());
        assert!(sim.connector().open("/dev/ttyACM7").is_err());
    }
}
