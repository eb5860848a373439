use crate::error::ControlError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Relay names used by the built-in procedures.
pub mod relays {
    pub const MAINS_POWER: &str = "mains_power";
    pub const PUMP_SCROLL: &str = "pump_scroll";
    pub const PUMP_TURBO: &str = "pump_turbo";
    pub const VALVE_TURBO_GATE: &str = "valve_turbo_gate";
    pub const VALVE_BACKING: &str = "valve_backing";
    pub const VALVE_ROUGH: &str = "valve_rough";
    pub const VALVE_VENT: &str = "valve_vent";
    pub const VALVE_LOADLOCK_GATE: &str = "valve_loadlock_gate";
    pub const VALVE_LOADLOCK_ROUGH: &str = "valve_loadlock_rough";
    pub const VALVE_LOADLOCK_VENT: &str = "valve_loadlock_vent";
    pub const VALVE_GAS1: &str = "valve_gas1";
    pub const VALVE_GAS2: &str = "valve_gas2";
    pub const VALVE_GAS3: &str = "valve_gas3";
    pub const SHUTTER1: &str = "shutter1";
    pub const SHUTTER2: &str = "shutter2";
    pub const ION_GAUGE: &str = "ion_gauge";
    pub const LIGHT_BULB: &str = "light_bulb";

    pub const GAS_VALVES: [&str; 3] = [VALVE_GAS1, VALVE_GAS2, VALVE_GAS3];

    /// Closing order used when returning to the default state. Turbo gate first.
    pub const DEFAULT_CLOSE_ORDER: [&str; 12] = [
        VALVE_TURBO_GATE,
        VALVE_BACKING,
        VALVE_ROUGH,
        VALVE_VENT,
        VALVE_LOADLOCK_GATE,
        VALVE_LOADLOCK_ROUGH,
        VALVE_LOADLOCK_VENT,
        VALVE_GAS1,
        VALVE_GAS2,
        VALVE_GAS3,
        SHUTTER1,
        SHUTTER2,
    ];
}

/// Number of relays driven by the controller firmware
pub const NUM_RELAYS: usize = 23;
pub const NUM_ANALOG: usize = 4;
pub const NUM_DIGITAL: usize = 4;

/// Analog channel indices
pub mod analog {
    pub const LOADLOCK_PRESSURE: usize = 0;
    pub const CHAMBER_PRESSURE: usize = 1;
    pub const ION_GAUGE: usize = 2;
    pub const TURBO_SPIN: usize = 3;
}

/// Digital input indices
pub mod digital {
    pub const WATER_FLOW: usize = 0;
    pub const ARM_HOME: usize = 1;
    pub const DOOR_CLOSED: usize = 2;
    pub const SPARE: usize = 3;
}

pub type StateName = String;

/// Operator privilege mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Mode {
    #[default]
    Normal,
    Manual,
    Override,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Normal => "Normal",
            Mode::Manual => "Manual",
            Mode::Override => "Override",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(Mode::Normal),
            "manual" => Ok(Mode::Manual),
            "override" => Ok(Mode::Override),
            other => Err(format!("unknown mode '{}'", other)),
        }
    }
}

/// Automated procedures the supervisor can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureId {
    Pump,
    Vent,
    VentLoadLock,
    LoadUnload,
    Sputter,
    GoToDefault,
    GoToStandby,
    Abort,
}

impl ProcedureId {
    pub const ALL: [ProcedureId; 8] = [
        ProcedureId::Pump,
        ProcedureId::Vent,
        ProcedureId::VentLoadLock,
        ProcedureId::LoadUnload,
        ProcedureId::Sputter,
        ProcedureId::GoToDefault,
        ProcedureId::GoToStandby,
        ProcedureId::Abort,
    ];

    /// Name used in condition expressions and state tables
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcedureId::Pump => "pump",
            ProcedureId::Vent => "vent",
            ProcedureId::VentLoadLock => "vent_loadlock",
            ProcedureId::LoadUnload => "load_unload",
            ProcedureId::Sputter => "sputter",
            ProcedureId::GoToDefault => "default",
            ProcedureId::GoToStandby => "standby",
            ProcedureId::Abort => "abort",
        }
    }

    /// Key listed in a state's `allowed_procedures`
    pub fn config_key(&self) -> String {
        format!("{}_procedure", self.as_str())
    }

    /// State a running procedure is expected to hold the system in
    pub fn expected_state(&self) -> Option<&'static str> {
        match self {
            ProcedureId::Pump => Some("pumping"),
            ProcedureId::Vent => Some("venting"),
            ProcedureId::VentLoadLock => Some("loadlock_venting"),
            ProcedureId::LoadUnload => Some("load_unload"),
            ProcedureId::Sputter => Some("sputter"),
            _ => None,
        }
    }
}

impl fmt::Display for ProcedureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcedureId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_lowercase();
        let key = key.strip_suffix("_procedure").unwrap_or(&key);
        let key = key.replace('-', "_");
        ProcedureId::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == key)
            .ok_or_else(|| format!("unknown procedure '{}'", s))
    }
}

/// Point-in-time copy of everything a safety check looks at
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStateSnapshot {
    pub analog_inputs: [f64; NUM_ANALOG],
    pub digital_inputs: [bool; NUM_DIGITAL],
    pub relay_states: HashMap<String, bool>,
    pub current_mode: Mode,
    pub current_procedure: Option<ProcedureId>,
    pub system_status: StateName,
    pub sputter_procedure_active: bool,
}

impl SystemStateSnapshot {
    pub fn new(initial_state: &str) -> Self {
        Self {
            analog_inputs: [0.0; NUM_ANALOG],
            digital_inputs: [false; NUM_DIGITAL],
            relay_states: HashMap::new(),
            current_mode: Mode::Normal,
            current_procedure: None,
            system_status: initial_state.to_string(),
            sputter_procedure_active: false,
        }
    }

    pub fn relay(&self, name: &str) -> bool {
        self.relay_states.get(name).copied().unwrap_or(false)
    }

    /// Ion gauge proxy voltage drops below the threshold when the gauge is on.
    /// Readings at or below 0.25 V mean a disconnected channel.
    pub fn ion_gauge_on(&self, on_threshold: f64) -> bool {
        let v = self.analog_inputs[analog::ION_GAUGE];
        v <= on_threshold && v > 0.25
    }
}

impl Default for SystemStateSnapshot {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Partial update merged into the snapshot. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct SnapshotUpdate {
    pub analog_inputs: Option<[f64; NUM_ANALOG]>,
    pub digital_inputs: Option<[bool; NUM_DIGITAL]>,
    pub relay_states: Option<HashMap<String, bool>>,
    pub current_mode: Option<Mode>,
    pub current_procedure: Option<Option<ProcedureId>>,
    pub system_status: Option<StateName>,
}

impl SnapshotUpdate {
    pub fn analog(values: [f64; NUM_ANALOG]) -> Self {
        Self {
            analog_inputs: Some(values),
            ..Default::default()
        }
    }

    pub fn digital(values: [bool; NUM_DIGITAL]) -> Self {
        Self {
            digital_inputs: Some(values),
            ..Default::default()
        }
    }

    pub fn relay(name: &str, state: bool) -> Self {
        Self {
            relay_states: Some(HashMap::from([(name.to_string(), state)])),
            ..Default::default()
        }
    }

    pub fn procedure(procedure: Option<ProcedureId>) -> Self {
        Self {
            current_procedure: Some(procedure),
            ..Default::default()
        }
    }

    pub fn status(status: impl Into<String>) -> Self {
        Self {
            system_status: Some(status.into()),
            ..Default::default()
        }
    }
}

/// Name to 1-based relay index table built from the configured pin map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayMap {
    by_name: BTreeMap<String, u8>,
}

impl RelayMap {
    /// Resolve each relay's Arduino pin through the firmware's pin order.
    /// Values that are not a listed pin are taken as relay indices directly.
    pub fn from_pins(
        relays: &HashMap<String, u32>,
        relay_pins: &[u32],
    ) -> Result<Self, ControlError> {
        let pin_to_index: HashMap<u32, usize> = relay_pins
            .iter()
            .enumerate()
            .map(|(i, pin)| (*pin, i + 1))
            .collect();

        let mut by_name = BTreeMap::new();
        for (name, pin) in relays {
            let index = pin_to_index.get(pin).copied().unwrap_or(*pin as usize);
            if index == 0 || index > NUM_RELAYS {
                return Err(ControlError::UnknownRelay(format!(
                    "{} (pin {} does not map to a relay 1..={})",
                    name, pin, NUM_RELAYS
                )));
            }
            by_name.insert(name.clone(), index as u8);
        }
        Ok(Self { by_name })
    }

    pub fn index(&self, name: &str) -> Option<u8> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, index: u8) -> Option<&str> {
        self.by_name
            .iter()
            .find(|(_, i)| **i == index)
            .map(|(name, _)| name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u8)> {
        self.by_name.iter().map(|(name, i)| (name.as_str(), *i))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Map a STATUS bit vector onto relay names
    pub fn states_from_status(&self, status: &[bool]) -> HashMap<String, bool> {
        self.iter()
            .filter_map(|(name, index)| {
                status
                    .get(index as usize - 1)
                    .map(|state| (name.to_string(), *state))
            })
            .collect()
    }
}

/// Convert the chamber pirani voltage to pressure in Torr
pub fn voltage_to_pressure_torr(voltage: f64) -> f64 {
    let p = 10f64.powf(2.239072 * voltage - 4.012614);
    if p.is_finite() { p } else { 0.0 }
}

/// Turbo spin in percent of full speed from the controller's analog output
pub fn turbo_spin_percent(voltage: f64) -> f64 {
    (voltage * 25.0 - 12.5).clamp(0.0, 100.0)
}

/// Inverse of `turbo_spin_percent` without clamping
pub fn turbo_spin_voltage(percent: f64) -> f64 {
    (percent + 12.5) / 25.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_procedure_from_str() {
        assert_eq!("pump".parse::<ProcedureId>(), Ok(ProcedureId::Pump));
        assert_eq!(
            "vent_loadlock_procedure".parse::<ProcedureId>(),
            Ok(ProcedureId::VentLoadLock)
        );
        assert_eq!("load-unload".parse::<ProcedureId>(), Ok(ProcedureId::LoadUnload));
        assert!("bake".parse::<ProcedureId>().is_err());
    }

    #[test]
    fn test_ion_gauge_on_ignores_disconnected_channel() {
        let mut snapshot = SystemStateSnapshot::default();
        snapshot.analog_inputs[analog::ION_GAUGE] = 0.1;
        assert!(!snapshot.ion_gauge_on(4.4));

        snapshot.analog_inputs[analog::ION_GAUGE] = 3.0;
        assert!(snapshot.ion_gauge_on(4.4));

        snapshot.analog_inputs[analog::ION_GAUGE] = 4.9;
        assert!(!snapshot.ion_gauge_on(4.4));
    }

    #[test]
    fn test_relay_map_resolves_pins_in_firmware_order() {
        let pins = [22, 23, 24, 25];
        let relays = HashMap::from([
            ("mains_power".to_string(), 22),
            ("pump_turbo".to_string(), 24),
            ("spare".to_string(), 3),
        ]);
        let map = RelayMap::from_pins(&relays, &pins).unwrap();
        assert_eq!(map.index("mains_power"), Some(1));
        assert_eq!(map.index("pump_turbo"), Some(3));
        // not a listed pin, used as an index
        assert_eq!(map.index("spare"), Some(3));

        let bad = HashMap::from([("ghost".to_string(), 99)]);
        assert!(RelayMap::from_pins(&bad, &pins).is_err());
    }

    #[test]
    fn test_states_from_status() {
        let relays = HashMap::from([("a".to_string(), 1), ("b".to_string(), 3)]);
        let map = RelayMap::from_pins(&relays, &[]).unwrap();
        let states = map.states_from_status(&[true, false, false]);
        assert_eq!(states.get("a"), Some(&true));
        assert_eq!(states.get("b"), Some(&false));
    }

    #[test]
    fn test_turbo_spin_conversion() {
        assert!((turbo_spin_voltage(60.0) - 2.9).abs() < 1e-9);
        assert_eq!(turbo_spin_percent(0.0), 0.0);
        assert_eq!(turbo_spin_percent(5.0), 100.0);
    }

    #[test]
    fn test_pressure_conversion_is_monotonic() {
        let low = voltage_to_pressure_torr(0.5);
        let high = voltage_to_pressure_torr(4.5);
        assert!(low < high);
        assert!(high > 100.0);
    }
}
