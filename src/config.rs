use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::condition::{Condition, ConditionSpec};
use crate::types::{ProcedureId, RelayMap, relays};

/// Configuration shipped with the crate. Used when no file is found on disk.
pub const BUNDLED_CONFIG: &str = include_str!("../config/sputter_control.toml");

/// Arduino pin order of the relay board. Position `i` drives `RELAY_{i+1}`.
pub const DEFAULT_RELAY_PINS: [u32; 23] = [
    22, 23, 24, 25, 26, 36, 28, 29, 30, 31, 32, 33, 34, 35, 27, 37, 38, 39, 40, 41, 44, 46, 48,
];

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub serial: SerialConfig,
    pub logging: LoggingConfig,
    pub polling: PollingConfig,
    /// Relay name to Arduino pin
    pub relays: HashMap<String, u32>,
    pub relay_pins: Vec<u32>,
    pub analog_channels: Vec<AnalogChannelConfig>,
    pub pressure_thresholds: HashMap<String, f64>,
    pub button_safety: HashMap<String, SafetyRuleConfig>,
    /// Keyed by lowercase mode name
    pub mode_restrictions: HashMap<String, ModeRestrictionConfig>,
    pub emergency_conditions: Vec<EmergencyConditionConfig>,
    pub system_status: SystemStatusConfig,
    pub gas: GasConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SerialConfig {
    /// Fixed port. When unset the port is discovered.
    pub port: Option<String>,
    pub baud: u32,
    pub command_timeout_ms: u64,
    pub ready_timeout_ms: u64,
    /// Overrides `~/.sputter_control/last_port`
    pub port_cache: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    pub event_log: bool,
    pub event_log_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PollingConfig {
    pub status_interval_ms: u64,
    pub input_interval_ms: u64,
    pub max_consecutive_failures: u32,
    pub reconnect_attempts: u32,
    /// Backoff grows linearly: attempt n waits n times this
    pub reconnect_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AnalogChannelConfig {
    pub name: String,
    #[serde(default = "unit_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
}

fn unit_scale() -> f64 {
    1.0
}

impl AnalogChannelConfig {
    pub fn apply(&self, raw_volts: f64) -> f64 {
        raw_volts * self.scale + self.offset
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SafetyRuleConfig {
    pub required_conditions: Vec<ConditionSpec>,
    pub forbidden_conditions: Vec<String>,
    pub confirmation_required: bool,
    pub confirmation_message: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ModeRestrictionConfig {
    /// When present, only these buttons may be pressed manually
    pub allowed_buttons: Option<Vec<String>>,
    pub forbidden_buttons: Vec<String>,
    pub extra_safety_conditions: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EmergencyConditionConfig {
    pub name: String,
    pub condition: String,
    pub message: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SystemStatusConfig {
    pub initial_state: String,
    /// Declaration order breaks ties between equally matching states
    pub states: Vec<StateDefinitionConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StateDefinitionConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub allowed_procedures: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GasConfig {
    pub enabled: bool,
    pub channels: Vec<GasChannelConfig>,
    pub limits: GasLimitsConfig,
    /// Channel name to setpoint applied when sputtering starts
    pub sputter_flows: HashMap<String, f64>,
    pub read_interval_ms: u64,
    pub sputter_read_interval_ms: u64,
    pub command_timeout_ms: u64,
    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u64,
    pub max_consecutive_errors: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GasChannelConfig {
    pub name: String,
    pub unit_id: String,
    pub max_flow: f64,
    pub gas_type: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct GasLimitsConfig {
    pub max_individual_flow: f64,
    pub max_total_flow: f64,
    pub max_oxygen_percentage: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            logging: LoggingConfig::default(),
            polling: PollingConfig::default(),
            relays: default_relays(),
            relay_pins: DEFAULT_RELAY_PINS.to_vec(),
            analog_channels: default_analog_channels(),
            pressure_thresholds: default_pressure_thresholds(),
            button_safety: HashMap::new(),
            mode_restrictions: HashMap::new(),
            emergency_conditions: Vec::new(),
            system_status: SystemStatusConfig::default(),
            gas: GasConfig::default(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: 9600,
            command_timeout_ms: 2000,
            ready_timeout_ms: 5000,
            port_cache: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            event_log: true,
            event_log_path: "./logs".to_string(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            status_interval_ms: 1000,
            input_interval_ms: 700,
            max_consecutive_failures: 3,
            reconnect_attempts: 3,
            reconnect_backoff_ms: 2000,
        }
    }
}

impl Default for SystemStatusConfig {
    fn default() -> Self {
        Self {
            initial_state: "default".to_string(),
            states: Vec::new(),
        }
    }
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channels: Vec::new(),
            limits: GasLimitsConfig::default(),
            sputter_flows: HashMap::new(),
            read_interval_ms: 5000,
            sputter_read_interval_ms: 1000,
            command_timeout_ms: 10_000,
            auto_reconnect: true,
            reconnect_interval_ms: 5000,
            max_consecutive_errors: 5,
        }
    }
}

impl Default for GasLimitsConfig {
    fn default() -> Self {
        Self {
            max_individual_flow: 200.0,
            max_total_flow: 500.0,
            max_oxygen_percentage: 50.0,
        }
    }
}

fn default_relays() -> HashMap<String, u32> {
    [
        (relays::MAINS_POWER, 22),
        (relays::PUMP_TURBO, 23),
        (relays::VALVE_TURBO_GATE, 24),
        (relays::VALVE_BACKING, 25),
        (relays::VALVE_ROUGH, 26),
        (relays::VALVE_VENT, 36),
        (relays::VALVE_LOADLOCK_GATE, 28),
        (relays::VALVE_LOADLOCK_ROUGH, 29),
        (relays::VALVE_LOADLOCK_VENT, 30),
        (relays::VALVE_GAS1, 31),
        (relays::VALVE_GAS2, 32),
        (relays::VALVE_GAS3, 33),
        (relays::SHUTTER1, 34),
        (relays::SHUTTER2, 35),
        (relays::ION_GAUGE, 27),
        (relays::LIGHT_BULB, 37),
        (relays::PUMP_SCROLL, 44),
    ]
    .into_iter()
    .map(|(name, pin)| (name.to_string(), pin))
    .collect()
}

fn default_analog_channels() -> Vec<AnalogChannelConfig> {
    ["loadlock_pressure", "chamber_pressure", "ion_gauge", "turbo_spin"]
        .into_iter()
        .map(|name| AnalogChannelConfig {
            name: name.to_string(),
            scale: 1.0,
            offset: 0.0,
        })
        .collect()
}

fn default_pressure_thresholds() -> HashMap<String, f64> {
    [
        ("chamber_medium_vacuum", 2.0),
        ("chamber_atmospheric", 4.5),
        ("chamber_high_vacuum", 0.7),
        ("loadlock_rough_vacuum", 1.6),
        ("ion_gauge_on_threshold", 4.4),
        ("ion_gauge_max_safe", 0.8),
    ]
    .into_iter()
    .map(|(name, v)| (name.to_string(), v))
    .collect()
}

impl AppConfig {
    /// The bundled configuration without file or environment layering
    pub fn bundled() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::from_str(BUNDLED_CONFIG, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// True when rules or states are present. Without them every check is denied.
    pub fn has_safety_tables(&self) -> bool {
        !self.button_safety.is_empty() || !self.system_status.states.is_empty()
    }

    pub fn relay_map(&self) -> Result<RelayMap, ConfigError> {
        RelayMap::from_pins(&self.relays, &self.relay_pins)
            .map_err(|e| ConfigError::Message(e.to_string()))
    }

    pub fn threshold(&self, name: &str) -> Option<f64> {
        self.pressure_thresholds.get(name).copied()
    }

    pub fn state(&self, name: &str) -> Option<&StateDefinitionConfig> {
        self.system_status.states.iter().find(|s| s.name == name)
    }

    /// Check cross-references that serde cannot. Collects every problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let relay_map = match self.relay_map() {
            Ok(map) => Some(map),
            Err(e) => {
                problems.push(e.to_string());
                None
            }
        };

        if let Some(map) = &relay_map {
            for name in relays::DEFAULT_CLOSE_ORDER
                .iter()
                .chain([relays::MAINS_POWER, relays::PUMP_TURBO, relays::PUMP_SCROLL].iter())
            {
                if !map.contains(name) {
                    problems.push(format!("relay '{}' used by procedures is not mapped", name));
                }
            }
            for button in self.button_safety.keys() {
                if !map.contains(button) {
                    problems.push(format!("safety rule for unknown relay '{}'", button));
                }
            }
        }

        let mut check = |context: String, source: &str| {
            if !Condition::compile(source).is_valid() {
                problems.push(format!("{}: cannot parse '{}'", context, source));
            }
        };

        for (button, rule) in &self.button_safety {
            for spec in &rule.required_conditions {
                for source in spec.sources() {
                    check(format!("button_safety.{}", button), source);
                }
            }
            for source in &rule.forbidden_conditions {
                check(format!("button_safety.{}", button), source);
            }
        }
        for (mode, restriction) in &self.mode_restrictions {
            for source in &restriction.extra_safety_conditions {
                check(format!("mode_restrictions.{}", mode), source);
            }
        }
        for emergency in &self.emergency_conditions {
            check(format!("emergency_conditions.{}", emergency.name), &emergency.condition);
        }
        for state in &self.system_status.states {
            for source in &state.conditions {
                check(format!("system_status.{}", state.name), source);
            }
        }

        if !self.system_status.states.is_empty() && self.state(&self.system_status.initial_state).is_none() {
            problems.push(format!(
                "initial_state '{}' is not a declared state",
                self.system_status.initial_state
            ));
        }

        for state in &self.system_status.states {
            for key in &state.allowed_procedures {
                if key.parse::<ProcedureId>().is_err() {
                    problems.push(format!(
                        "state '{}' allows unknown procedure '{}'",
                        state.name, key
                    ));
                }
            }
        }

        let limits = &self.gas.limits;
        if limits.max_individual_flow <= 0.0 || limits.max_total_flow <= 0.0 {
            problems.push("gas flow limits must be positive".to_string());
        }
        if !(0.0..=100.0).contains(&limits.max_oxygen_percentage) {
            problems.push("max_oxygen_percentage must be within 0..=100".to_string());
        }
        for channel in &self.gas.channels {
            if channel.max_flow <= 0.0 {
                problems.push(format!("gas channel '{}' needs a positive max_flow", channel.name));
            }
        }
        for name in self.gas.sputter_flows.keys() {
            if !self.gas.channels.iter().any(|c| &c.name == name) {
                problems.push(format!("sputter flow for unknown gas channel '{}'", name));
            }
        }

        if self.analog_channels.len() > crate::types::NUM_ANALOG {
            problems.push(format!(
                "at most {} analog channels are supported",
                crate::types::NUM_ANALOG
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Message(problems.join("; ")))
        }
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        let possible_paths = [
            "sputter_control.toml",
            "config.toml",
            "config/sputter_control.toml",
        ];

        match possible_paths.iter().find(|p| Path::new(p).exists()) {
            Some(path) => builder = builder.add_source(File::with_name(path)),
            None => {
                log::info!("No configuration file found, using bundled configuration");
                builder = builder.add_source(File::from_str(BUNDLED_CONFIG, FileFormat::Toml));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("SPUTTER_CONTROL")
            .separator("__")
            .try_parsing(true),
    );

    let config: AppConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration, falling back to the bundled tables on error
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using bundled defaults", e);
            AppConfig::bundled().unwrap_or_else(|e| {
                log::error!(
                    "Bundled configuration is unusable ({}), all safety checks will deny",
                    e
                );
                AppConfig::default()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_config_is_valid() {
        let config = AppConfig::bundled().unwrap();
        config.validate().unwrap();
        assert!(config.has_safety_tables());
        assert_eq!(config.system_status.initial_state, "default");
        assert_eq!(config.system_status.states[0].name, "default");
        assert_eq!(config.system_status.states.last().unwrap().name, "error");
        assert_eq!(config.gas.channels.len(), 3);
    }

    #[test]
    fn nested_required_conditions_deserialize_as_groups() {
        let config = AppConfig::bundled().unwrap();
        let rule = &config.button_safety["pump_turbo"];
        assert_eq!(rule.required_conditions.len(), 2);
        assert!(matches!(rule.required_conditions[0], ConditionSpec::All(_)));
        assert!(rule.confirmation_required);
    }

    #[test]
    fn default_relay_map_resolves_pins() {
        let map = AppConfig::default().relay_map().unwrap();
        assert_eq!(map.index(relays::MAINS_POWER), Some(1));
        assert_eq!(map.index(relays::VALVE_VENT), Some(6));
        assert_eq!(map.index(relays::ION_GAUGE), Some(15));
        assert_eq!(map.index(relays::PUMP_SCROLL), Some(21));
    }

    #[test]
    fn defaults_have_no_safety_tables() {
        assert!(!AppConfig::default().has_safety_tables());
    }

    #[test]
    fn validate_reports_bad_condition_and_initial_state() {
        let mut config = AppConfig::bundled().unwrap();
        config.system_status.initial_state = "nowhere".to_string();
        config.emergency_conditions.push(EmergencyConditionConfig {
            name: "broken".to_string(),
            condition: "ai_volts[1] <".to_string(),
            message: "x".to_string(),
        });
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("nowhere"));
        assert!(err.contains("emergency_conditions.broken"));
    }

    #[test]
    fn validate_rejects_non_positive_limits() {
        let mut config = AppConfig::bundled().unwrap();
        config.gas.limits.max_total_flow = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/sputter.toml"))).is_err());
    }

    #[test]
    fn analog_channel_applies_scale_and_offset() {
        let channel = AnalogChannelConfig {
            name: "x".to_string(),
            scale: 2.0,
            offset: -0.5,
        };
        assert_eq!(channel.apply(1.5), 2.5);
    }
}
