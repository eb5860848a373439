use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

use crate::condition::{Condition, EvalContext, RequiredConditions};
use crate::config::AppConfig;
use crate::types::{Mode, ProcedureId, SnapshotUpdate, StateName, SystemStateSnapshot, relays};

/// Minimum score for a running procedure's expected state to hold
const PROCEDURE_STATE_STICKINESS: f64 = 0.8;
/// Scores at or below this never select a state
const MIN_STATE_SCORE: f64 = 0.5;

/// Outcome of a button check. A denial is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyResult {
    pub allowed: bool,
    pub message: String,
    pub confirmation_required: bool,
    pub confirmation_message: Option<String>,
}

impl SafetyResult {
    fn allow(message: impl Into<String>) -> Self {
        Self {
            allowed: true,
            message: message.into(),
            confirmation_required: false,
            confirmation_message: None,
        }
    }

    fn deny(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            message: message.into(),
            confirmation_required: false,
            confirmation_message: None,
        }
    }
}

struct SafetyRule {
    required: RequiredConditions,
    forbidden: Vec<Condition>,
    confirmation_required: bool,
    confirmation_message: Option<String>,
    error_message: Option<String>,
}

struct ModeRestriction {
    allowed_buttons: Option<Vec<String>>,
    forbidden_buttons: Vec<String>,
    extra_conditions: Vec<Condition>,
}

struct EmergencyCondition {
    name: String,
    condition: Condition,
    message: String,
}

/// One row of the state table
#[derive(Debug, Clone)]
pub struct StateDefinition {
    pub name: StateName,
    pub description: String,
    pub color: String,
    pub conditions: Vec<Condition>,
    pub allowed_procedures: Vec<String>,
}

impl StateDefinition {
    /// Fraction of conditions that hold. A state without conditions scores 0.
    pub fn score(&self, ctx: &EvalContext) -> f64 {
        if self.conditions.is_empty() {
            return 0.0;
        }
        let met = self.conditions.iter().filter(|c| c.evaluate(ctx)).count();
        met as f64 / self.conditions.len() as f64
    }

    pub fn allows(&self, procedure: ProcedureId) -> bool {
        let key = procedure.config_key();
        self.allowed_procedures.iter().any(|p| *p == key)
    }
}

/// Compiled safety tables. Immutable after load.
struct SafetyTables {
    rules: HashMap<String, SafetyRule>,
    modes: HashMap<String, ModeRestriction>,
    emergencies: Vec<EmergencyCondition>,
    states: Vec<StateDefinition>,
}

impl SafetyTables {
    fn compile(config: &AppConfig) -> Self {
        let rules = config
            .button_safety
            .iter()
            .map(|(button, rule)| {
                (
                    button.clone(),
                    SafetyRule {
                        required: RequiredConditions::compile(&rule.required_conditions),
                        forbidden: rule
                            .forbidden_conditions
                            .iter()
                            .map(|s| Condition::compile(s))
                            .collect(),
                        confirmation_required: rule.confirmation_required,
                        confirmation_message: rule.confirmation_message.clone(),
                        error_message: rule.error_message.clone(),
                    },
                )
            })
            .collect();

        let modes = config
            .mode_restrictions
            .iter()
            .map(|(mode, restriction)| {
                (
                    mode.to_lowercase(),
                    ModeRestriction {
                        allowed_buttons: restriction.allowed_buttons.clone(),
                        forbidden_buttons: restriction.forbidden_buttons.clone(),
                        extra_conditions: restriction
                            .extra_safety_conditions
                            .iter()
                            .map(|s| Condition::compile(s))
                            .collect(),
                    },
                )
            })
            .collect();

        let emergencies = config
            .emergency_conditions
            .iter()
            .map(|e| EmergencyCondition {
                name: e.name.clone(),
                condition: Condition::compile(&e.condition),
                message: e.message.clone(),
            })
            .collect();

        let states = config
            .system_status
            .states
            .iter()
            .map(|s| StateDefinition {
                name: s.name.clone(),
                description: s.description.clone(),
                color: s.color.clone(),
                conditions: s.conditions.iter().map(|c| Condition::compile(c)).collect(),
                allowed_procedures: s.allowed_procedures.clone(),
            })
            .collect();

        Self {
            rules,
            modes,
            emergencies,
            states,
        }
    }
}

/// Owns the live snapshot and answers every "may I?" question.
///
/// Writers merge partial updates under one write lock; readers take copies.
pub struct SafetyCoordinator {
    tables: Option<SafetyTables>,
    thresholds: HashMap<String, f64>,
    initial_state: StateName,
    snapshot: RwLock<SystemStateSnapshot>,
}

impl SafetyCoordinator {
    pub fn new(config: &AppConfig) -> Self {
        let tables = if config.has_safety_tables() {
            Some(SafetyTables::compile(config))
        } else {
            warn!("No safety configuration loaded, every button check will be denied");
            None
        };
        let initial_state = config.system_status.initial_state.clone();
        Self {
            tables,
            thresholds: config.pressure_thresholds.clone(),
            snapshot: RwLock::new(SystemStateSnapshot::new(&initial_state)),
            initial_state,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.tables.is_some()
    }

    pub fn snapshot(&self) -> SystemStateSnapshot {
        self.snapshot.read().clone()
    }

    pub fn thresholds(&self) -> &HashMap<String, f64> {
        &self.thresholds
    }

    /// Threshold value, or `fallback` if the table does not define it
    pub fn threshold_or(&self, name: &str, fallback: f64) -> f64 {
        self.thresholds.get(name).copied().unwrap_or(fallback)
    }

    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    /// Merge a partial update. Absent fields stay as they are; relay states merge per relay.
    pub fn update_system_state(&self, update: SnapshotUpdate) {
        let mut snapshot = self.snapshot.write();
        if let Some(analog) = update.analog_inputs {
            snapshot.analog_inputs = analog.map(|v| if v.is_finite() { v } else { 0.0 });
        }
        if let Some(digital) = update.digital_inputs {
            snapshot.digital_inputs = digital;
        }
        if let Some(relay_states) = update.relay_states {
            snapshot.relay_states.extend(relay_states);
        }
        if let Some(mode) = update.current_mode {
            snapshot.current_mode = mode;
        }
        if let Some(procedure) = update.current_procedure {
            snapshot.current_procedure = procedure;
        }
        if let Some(status) = update.system_status {
            snapshot.system_status = status;
        }
    }

    pub fn set_relay_state(&self, name: &str, state: bool) {
        self.update_system_state(SnapshotUpdate::relay(name, state));
    }

    pub fn relay_state(&self, name: &str) -> bool {
        self.snapshot.read().relay(name)
    }

    pub fn mode(&self) -> Mode {
        self.snapshot.read().current_mode
    }

    pub fn set_mode(&self, mode: Mode) {
        info!("Operating mode set to {}", mode);
        self.update_system_state(SnapshotUpdate {
            current_mode: Some(mode),
            ..Default::default()
        });
    }

    pub fn system_status(&self) -> StateName {
        self.snapshot.read().system_status.clone()
    }

    pub fn set_system_status(&self, status: &str) {
        self.update_system_state(SnapshotUpdate::status(status));
    }

    pub fn set_sputter_procedure_active(&self, active: bool) {
        self.snapshot.write().sputter_procedure_active = active;
    }

    pub fn is_sputter_procedure_active(&self) -> bool {
        self.snapshot.read().sputter_procedure_active
    }

    pub fn ion_gauge_on(&self) -> bool {
        let snapshot = self.snapshot.read();
        EvalContext::new(&snapshot, &self.thresholds).ion_gauge_on()
    }

    pub fn state_definition(&self, name: &str) -> Option<&StateDefinition> {
        self.tables
            .as_ref()
            .and_then(|t| t.states.iter().find(|s| s.name == name))
    }

    pub fn state_names(&self) -> Vec<&str> {
        self.tables
            .as_ref()
            .map(|t| t.states.iter().map(|s| s.name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Decide whether `button` may be switched right now
    pub fn check_button_safety(&self, button: &str, is_procedure_call: bool) -> SafetyResult {
        let Some(tables) = &self.tables else {
            return SafetyResult::deny("Safety configuration not loaded");
        };

        let snapshot = self.snapshot();
        let ctx = EvalContext::new(&snapshot, &self.thresholds);

        if !(is_procedure_call && snapshot.current_mode == Mode::Normal) {
            if let Some(denied) = self.check_mode_restrictions(tables, button, &ctx) {
                return denied;
            }
        }

        for emergency in &tables.emergencies {
            if emergency.condition.evaluate(&ctx) {
                warn!(
                    "Emergency condition '{}' active, denying {}",
                    emergency.name, button
                );
                return SafetyResult::deny(format!("EMERGENCY: {}", emergency.message));
            }
        }

        let Some(rule) = tables.rules.get(button) else {
            return SafetyResult::allow("No specific safety conditions defined");
        };

        if let Err(failed) = rule.required.check(&ctx) {
            let message = match (&rule.error_message, failed) {
                (Some(msg), _) => msg.clone(),
                (None, Some(condition)) => format!("Safety condition failed: {}", condition),
                (None, None) => "None of the required condition groups satisfied".to_string(),
            };
            info!("Denied {}: {}", button, message);
            return SafetyResult::deny(message);
        }

        if let Some(condition) = rule.forbidden.iter().find(|c| c.evaluate(&ctx)) {
            let message = rule
                .error_message
                .clone()
                .unwrap_or_else(|| format!("Forbidden condition detected: {}", condition));
            info!("Denied {}: {}", button, message);
            return SafetyResult::deny(message);
        }

        let vent_during_vent = button == relays::VALVE_VENT
            && snapshot.current_procedure == Some(ProcedureId::Vent);
        let mut result = SafetyResult::allow("Safety check passed");
        if !is_procedure_call && rule.confirmation_required && !vent_during_vent {
            result.confirmation_required = true;
            result.confirmation_message = Some(
                rule.confirmation_message
                    .clone()
                    .unwrap_or_else(|| format!("Confirm operation: {}", button)),
            );
        }
        debug!("Allowed {} (procedure call: {})", button, is_procedure_call);
        result
    }

    fn check_mode_restrictions(
        &self,
        tables: &SafetyTables,
        button: &str,
        ctx: &EvalContext,
    ) -> Option<SafetyResult> {
        let mode = ctx.snapshot.current_mode;
        let restriction = tables.modes.get(&mode.as_str().to_lowercase())?;

        if restriction.forbidden_buttons.iter().any(|b| b == button) {
            return Some(SafetyResult::deny(format!(
                "{} is forbidden in {} mode",
                button, mode
            )));
        }

        if let Some(allowed) = &restriction.allowed_buttons {
            let sputter_exception = ctx.snapshot.sputter_procedure_active
                && (relays::GAS_VALVES.contains(&button) || button == relays::VALVE_TURBO_GATE);
            let vent_exception = button == relays::VALVE_VENT
                && ctx.snapshot.current_procedure == Some(ProcedureId::Vent);
            if !allowed.iter().any(|b| b == button) && !sputter_exception && !vent_exception {
                return Some(SafetyResult::deny(format!(
                    "Only automatic procedures allowed in {} mode",
                    mode
                )));
            }
        }

        restriction
            .extra_conditions
            .iter()
            .find(|c| !c.evaluate(ctx))
            .map(|c| SafetyResult::deny(format!("Mode safety condition failed: {}", c)))
    }

    /// Best-matching state for the current snapshot
    pub fn determine_system_state(&self) -> StateName {
        let Some(tables) = &self.tables else {
            return self.initial_state.clone();
        };
        let snapshot = self.snapshot();
        let ctx = EvalContext::new(&snapshot, &self.thresholds);

        // A running procedure's state is scored first and wins partial-match ties
        let mut best: Option<(&StateDefinition, f64)> = None;
        let expected = snapshot
            .current_procedure
            .and_then(|p| p.expected_state())
            .and_then(|expected| tables.states.iter().find(|s| s.name == expected))
            .filter(|state| !state.conditions.is_empty());
        if let Some(state) = expected {
            let score = state.score(&ctx);
            if score >= PROCEDURE_STATE_STICKINESS {
                debug!("Procedure state '{}' holds (score {:.2})", state.name, score);
                return state.name.clone();
            }
            best = Some((state, score));
        }

        for state in &tables.states {
            if state.conditions.is_empty() || expected.is_some_and(|e| e.name == state.name) {
                continue;
            }
            let score = state.score(&ctx);
            if score >= 1.0 {
                return state.name.clone();
            }
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((state, score));
            }
        }

        match best {
            Some((state, score)) if score > MIN_STATE_SCORE => state.name.clone(),
            _ => self.initial_state.clone(),
        }
    }

    /// Determine the state and store it in the snapshot
    pub fn refresh_system_status(&self) -> StateName {
        let status = self.determine_system_state();
        let previous = self.system_status();
        if previous != status {
            info!("System status: {} -> {}", previous, status);
            self.set_system_status(&status);
        }
        status
    }

    /// Whether the current state lists `procedure` as allowed
    pub fn can_start_procedure(&self, procedure: ProcedureId) -> Result<(), String> {
        if self.tables.is_none() {
            return Err("Safety configuration not loaded".to_string());
        }
        let status = self.system_status();
        match self.state_definition(&status) {
            Some(state) if state.allows(procedure) => Ok(()),
            Some(_) => Err(format!(
                "{} procedure is not allowed in state '{}'",
                procedure, status
            )),
            None => Err(format!("Unknown system state '{}'", status)),
        }
    }
}
