use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Timed out waiting for response to {0}")]
    HardwareTimeout(String),
    /// The controller reported an interlock violation. Needs physical intervention.
    #[error("Hardware safety halt: {0}")]
    SafetyHalt(String),
    #[error("Not connected to relay controller")]
    NotConnected,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Unknown relay: {0}")]
    UnknownRelay(String),
    #[error("Relay index {0} out of range")]
    InvalidRelay(u8),
    #[error("Condition error: {0}")]
    Condition(String),
    #[error("Gas channel error: {0}")]
    Gas(String),
    #[error("No controller found: {0}")]
    NoDevice(String),
    #[error("Procedure denied: {0}")]
    ProcedureDenied(String),
}

impl ControlError {
    /// Errors that must stop startup instead of being retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, ControlError::SafetyHalt(_))
    }
}
