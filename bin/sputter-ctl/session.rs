use log::{info, warn};
use std::sync::Arc;

use sputter_control::gas::sim::SimMfcDriver;
use sputter_control::hardware::sim::{SIM_PORT, SimController};
use sputter_control::{
    AppConfig, GasFlowController, HardwareLink, InputPoller, LinkSettings, PollCycle,
    ProcedureEngine, ProcedureEventLog, ProcedureSupervisor, ProcedureTimings, RelayMap,
    SafetyCoordinator,
};

/// Simulated chamber runs this many times faster than the real one
const SIM_PLANT_SPEEDUP: f64 = 10.0;
const SIM_TIMING_SCALE: f64 = 0.1;

/// Everything one CLI invocation talks to
pub struct Session {
    config: AppConfig,
    link: Arc<HardwareLink>,
    safety: Arc<SafetyCoordinator>,
    relays: RelayMap,
    gas: Option<Arc<GasFlowController>>,
    engine: Arc<ProcedureEngine>,
    _sim: Option<SimController>,
}

impl Session {
    pub fn open(config: AppConfig, simulate: bool) -> Result<Self, Box<dyn std::error::Error>> {
        config.validate()?;
        let relays = config.relay_map()?;

        let (link, sim, timings) = if simulate {
            info!("Using the chamber simulator");
            let sim = SimController::new(relays.clone()).with_plant(SIM_PLANT_SPEEDUP);
            let settings = LinkSettings {
                fixed_port: Some(SIM_PORT.to_string()),
                cache: None,
                ..LinkSettings::from_config(&config.serial)
            };
            let link = HardwareLink::new(Box::new(sim.connector()), settings);
            (link, Some(sim), ProcedureTimings::scaled(SIM_TIMING_SCALE))
        } else {
            let link = HardwareLink::serial(LinkSettings::from_config(&config.serial));
            (link, None, ProcedureTimings::default())
        };
        let link = Arc::new(link);
        let port = link.auto_connect()?;
        info!("Relay controller on {}", port);

        let safety = Arc::new(SafetyCoordinator::new(&config));

        let gas = match (config.gas.enabled, simulate) {
            (true, true) => Some(Arc::new(GasFlowController::start(
                config.gas.clone(),
                Box::new(SimMfcDriver::new()),
            ))),
            (true, false) => {
                warn!("No mass-flow controller driver is available, gas control disabled");
                None
            }
            _ => None,
        };

        let mut engine = ProcedureEngine::new(
            Arc::clone(&link),
            Arc::clone(&safety),
            relays.clone(),
            &config,
        )
        .with_timings(timings);
        if let Some(gas) = &gas {
            engine = engine.with_gas(Arc::clone(gas));
        }
        if config.logging.event_log {
            let events = ProcedureEventLog::in_directory(&config.logging.event_log_path);
            engine = engine.with_event_log(Arc::new(events));
        }

        Ok(Self {
            config,
            link,
            safety,
            relays,
            gas,
            engine: Arc::new(engine),
            _sim: sim,
        })
    }

    pub fn link(&self) -> &HardwareLink {
        &self.link
    }

    pub fn safety(&self) -> &SafetyCoordinator {
        &self.safety
    }

    pub fn relays(&self) -> &RelayMap {
        &self.relays
    }

    fn poll_cycle(&self) -> PollCycle {
        let cycle = PollCycle::new(
            Arc::clone(&self.link),
            Arc::clone(&self.safety),
            self.relays.clone(),
            self.config.analog_channels.clone(),
            self.config.polling.clone(),
        );
        match &self.gas {
            Some(gas) => cycle.with_gas(Arc::clone(gas)),
            None => cycle,
        }
    }

    /// One synchronous read of every input
    pub fn poll_once(&self) -> bool {
        self.poll_cycle().poll_once()
    }

    pub fn start_poller(&self) -> InputPoller {
        InputPoller::start(self.poll_cycle())
    }

    pub fn supervisor(&self) -> ProcedureSupervisor {
        ProcedureSupervisor::new(Arc::clone(&self.engine))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(gas) = &self.gas {
            gas.stop();
        }
        if let Some(events) = self.engine.events() {
            if let Err(e) = events.flush() {
                warn!("Could not flush the procedure event log: {}", e);
            }
        }
        self.link.disconnect();
    }
}
