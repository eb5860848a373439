use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{MfcDriver, MfcReading};
use crate::config::GasChannelConfig;
use crate::error::ControlError;

#[derive(Default)]
struct SimMfcState {
    connected: HashSet<String>,
    setpoints: HashMap<String, f64>,
    gases: HashMap<String, String>,
    failing_reads: HashSet<String>,
    flow_commands: Vec<(String, f64)>,
}

/// Flow controllers that settle instantly on their setpoint
#[derive(Clone, Default)]
pub struct SimMfcDriver {
    state: Arc<Mutex<SimMfcState>>,
}

impl SimMfcDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_reads(&self, channel: &str, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_reads.insert(channel.to_string());
        } else {
            state.failing_reads.remove(channel);
        }
    }

    /// Every `set_flow_rate` that reached the driver
    pub fn flow_commands(&self) -> Vec<(String, f64)> {
        self.state.lock().flow_commands.clone()
    }

    pub fn setpoint(&self, channel: &str) -> f64 {
        self.state.lock().setpoints.get(channel).copied().unwrap_or(0.0)
    }
}

impl MfcDriver for SimMfcDriver {
    fn connect(&mut self, channel: &GasChannelConfig) -> Result<(), ControlError> {
        self.state.lock().connected.insert(channel.name.clone());
        Ok(())
    }

    fn disconnect(&mut self, channel: &str) {
        self.state.lock().connected.remove(channel);
    }

    fn read(&mut self, channel: &str) -> Result<MfcReading, ControlError> {
        let state = self.state.lock();
        if !state.connected.contains(channel) || state.failing_reads.contains(channel) {
            return Err(ControlError::Gas(format!("{} did not answer", channel)));
        }
        let setpoint = state.setpoints.get(channel).copied().unwrap_or(0.0);
        Ok(MfcReading {
            timestamp: Utc::now(),
            pressure: 14.7,
            temperature: 22.0,
            volumetric_flow: setpoint,
            mass_flow: setpoint,
            setpoint,
            gas: state.gases.get(channel).cloned().unwrap_or_default(),
        })
    }

    fn set_flow_rate(&mut self, channel: &str, sccm: f64) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        if !state.connected.contains(channel) {
            return Err(ControlError::Gas(format!("{} not connected", channel)));
        }
        state.flow_commands.push((channel.to_string(), sccm));
        state.setpoints.insert(channel.to_string(), sccm);
        Ok(())
    }

    fn set_gas(&mut self, channel: &str, gas: &str) -> Result<(), ControlError> {
        self.state
            .lock()
            .gases
            .insert(channel.to_string(), gas.to_string());
        Ok(())
    }
}
