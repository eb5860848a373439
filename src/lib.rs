pub mod condition;
pub mod config;
pub mod error;
pub mod gas;
pub mod hardware;
pub mod logger;
pub mod poller;
pub mod procedures;
pub mod protocol;
pub mod safety;
pub mod supervisor;
pub mod types;
pub mod utils;

pub use condition::{Condition, ConditionSpec, EvalContext, Expr};
pub use config::{AppConfig, load_config, load_config_or_default};
pub use error::ControlError;
pub use gas::{GasFlowController, MfcDriver, MfcReading};
pub use hardware::{ConnectionState, HardwareLink, LinkSettings};
pub use logger::{Logger, ProcedureEventLog};
pub use poller::{InputPoller, PollCycle};
pub use procedures::{ProcedureEngine, ProcedureOutcome, ProcedureTimings, UserConfirmation};
pub use safety::{SafetyCoordinator, SafetyResult};
pub use supervisor::{Completion, ProcedureSupervisor, RunHandle};
pub use types::{
    Mode, ProcedureId, RelayMap, SnapshotUpdate, StateName, SystemStateSnapshot,
    turbo_spin_percent, voltage_to_pressure_torr,
};
pub use utils::CancellationToken;
