//! Procedure supervisor
//!
//! Owns the single active procedure run: admission, the worker thread, the
//! per-run cancellation token, completion states and failure recovery.

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::ControlError;
use crate::logger::EventKind;
use crate::procedures::{ProcedureEngine, ProcedureOutcome, UserConfirmation};
use crate::types::{ProcedureId, SnapshotUpdate, StateName};
use crate::utils::CancellationToken;

const DEFAULT_STATE: &str = "default";
const ERROR_STATE: &str = "error";
const LOAD_UNLOAD_STATE: &str = "load_unload";

/// Sent on the completion channel once a run has settled
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub procedure: ProcedureId,
    pub outcome: ProcedureOutcome,
    pub system_status: StateName,
    pub finished_at: DateTime<Utc>,
}

/// Caller's view of a started run
pub struct RunHandle {
    procedure: ProcedureId,
    cancel: CancellationToken,
    done: Receiver<ProcedureOutcome>,
}

impl RunHandle {
    pub fn procedure(&self) -> ProcedureId {
        self.procedure
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Block until the run has settled
    pub fn wait(self) -> ProcedureOutcome {
        self.done.recv().unwrap_or_else(|_| {
            ProcedureOutcome::Failure("Procedure worker exited without a result".to_string())
        })
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<ProcedureOutcome> {
        self.done.recv_timeout(timeout).ok()
    }
}

struct ActiveRun {
    procedure: ProcedureId,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ActiveRun {
    fn is_alive(&self) -> bool {
        !self.finished.load(Ordering::SeqCst)
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{} procedure worker panicked", self.procedure);
            }
        }
    }
}

/// State shared with the worker threads
#[derive(Clone)]
struct RunContext {
    engine: Arc<ProcedureEngine>,
    pending: Arc<Mutex<Option<UserConfirmation>>>,
    completions: Sender<Completion>,
}

impl RunContext {
    fn record(&self, procedure: ProcedureId, kind: EventKind, message: impl Into<String>) {
        if let Some(events) = self.engine.events() {
            events.record(Some(procedure), kind, message);
        }
    }

    fn execute(
        &self,
        procedure: ProcedureId,
        previous: StateName,
        cancel: CancellationToken,
        finished: Arc<AtomicBool>,
        done: Sender<ProcedureOutcome>,
    ) {
        info!("{} procedure started", procedure);
        self.record(procedure, EventKind::Started, format!("{} procedure started", procedure));

        let outcome = self.engine.run(procedure, &cancel);
        let outcome = self.settle(procedure, outcome, &previous);

        let safety = self.engine.safety();
        let system_status = safety.system_status();
        finished.store(true, Ordering::SeqCst);

        let _ = done.send(outcome.clone());
        let completion = Completion {
            procedure,
            outcome,
            system_status,
            finished_at: Utc::now(),
        };
        if self.completions.send(completion).is_err() {
            warn!("Completion of {} had no listener", procedure);
        }
    }

    /// Apply the completion state or run recovery. Clears the current procedure.
    fn settle(
        &self,
        procedure: ProcedureId,
        outcome: ProcedureOutcome,
        previous: &str,
    ) -> ProcedureOutcome {
        let safety = self.engine.safety();
        match outcome {
            ProcedureOutcome::Success => {
                let status = completion_state(procedure, previous);
                info!("{} procedure succeeded, status {}", procedure, status);
                self.record(procedure, EventKind::Succeeded, format!("status {}", status));
                self.finish_with(Some(status));
                ProcedureOutcome::Success
            }
            ProcedureOutcome::AwaitingUserConfirmation(request) => {
                info!("{} procedure waits for the operator", procedure);
                self.record(procedure, EventKind::AwaitingConfirmation, &request.message);
                *self.pending.lock() = Some(request.clone());
                self.finish_with(Some(LOAD_UNLOAD_STATE.to_string()));
                ProcedureOutcome::AwaitingUserConfirmation(request)
            }
            ProcedureOutcome::Cancelled => {
                warn!("{} procedure cancelled", procedure);
                self.record(procedure, EventKind::Cancelled, "cancelled by operator");
                self.finish_with(None);
                safety.refresh_system_status();
                ProcedureOutcome::Cancelled
            }
            ProcedureOutcome::Failure(reason) => {
                error!("{} procedure failed: {}", procedure, reason);
                self.record(procedure, EventKind::Failed, &reason);
                let message = self.recover(procedure, &reason);
                ProcedureOutcome::Failure(message)
            }
        }
    }

    /// One return to default after a failure. No retries beyond that.
    fn recover(&self, procedure: ProcedureId, reason: &str) -> String {
        let is_recovery_run = matches!(procedure, ProcedureId::GoToDefault | ProcedureId::Abort);
        let recovered = if is_recovery_run {
            false
        } else {
            self.record(procedure, EventKind::Recovery, "Returning to the default state");
            self.engine.go_to_default_state()
        };

        if recovered {
            self.finish_with(Some(DEFAULT_STATE.to_string()));
            format!(
                "{} procedure failed: {}. The system was returned to the default state. \
                 Verify valve positions and pump states before continuing.",
                procedure, reason
            )
        } else {
            self.finish_with(Some(ERROR_STATE.to_string()));
            error!("Return to the default state failed, status set to error");
            self.record(procedure, EventKind::Recovery, "Return to the default state failed");
            format!(
                "{} procedure failed: {}. A return to the default state was attempted and did not complete. \
                 Inspect the chamber manually: close every valve, check the turbo and mains power.",
                procedure, reason
            )
        }
    }

    fn finish_with(&self, status: Option<StateName>) {
        self.engine.safety().update_system_state(SnapshotUpdate {
            current_procedure: Some(None),
            system_status: status,
            ..Default::default()
        });
    }
}

/// Status a successful run leaves the system in
fn completion_state(procedure: ProcedureId, previous: &str) -> StateName {
    match procedure {
        ProcedureId::Pump => "high_vacuum".to_string(),
        ProcedureId::Vent => "vented".to_string(),
        ProcedureId::VentLoadLock => previous.to_string(),
        ProcedureId::LoadUnload => "high_vacuum".to_string(),
        ProcedureId::GoToStandby => "standby".to_string(),
        ProcedureId::Sputter | ProcedureId::GoToDefault | ProcedureId::Abort => {
            DEFAULT_STATE.to_string()
        }
    }
}

/// Runs at most one procedure at a time on its own worker thread
pub struct ProcedureSupervisor {
    context: RunContext,
    active: Mutex<Option<ActiveRun>>,
    completion_rx: Receiver<Completion>,
}

impl ProcedureSupervisor {
    pub fn new(engine: Arc<ProcedureEngine>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            context: RunContext {
                engine,
                pending: Arc::new(Mutex::new(None)),
                completions: tx,
            },
            active: Mutex::new(None),
            completion_rx: rx,
        }
    }

    pub fn engine(&self) -> &Arc<ProcedureEngine> {
        &self.context.engine
    }

    /// Receiver for completion notifications
    pub fn completions(&self) -> Receiver<Completion> {
        self.completion_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().as_ref().is_some_and(ActiveRun::is_alive)
    }

    pub fn running_procedure(&self) -> Option<ProcedureId> {
        self.active
            .lock()
            .as_ref()
            .filter(|run| run.is_alive())
            .map(|run| run.procedure)
    }

    pub fn pending_confirmation(&self) -> Option<UserConfirmation> {
        self.context.pending.lock().clone()
    }

    /// Start `procedure` if nothing else runs and the current state allows it
    pub fn start(&self, procedure: ProcedureId) -> Result<RunHandle, ControlError> {
        let mut active = self.active.lock();
        if let Some(run) = active.as_ref().filter(|run| run.is_alive()) {
            return Err(ControlError::ProcedureDenied(format!(
                "{} procedure is already running",
                run.procedure
            )));
        }
        self.context
            .engine
            .safety()
            .can_start_procedure(procedure)
            .map_err(ControlError::ProcedureDenied)?;
        Ok(self.launch(&mut active, procedure))
    }

    /// Cancel the active run. Returns `false` if nothing was running.
    pub fn cancel(&self) -> bool {
        match self.active.lock().as_ref() {
            Some(run) if run.is_alive() => {
                info!("Cancelling {} procedure", run.procedure);
                run.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel whatever runs, wait for its worker, then tear down and return
    /// to default. Not subject to the state table.
    pub fn abort(&self) -> RunHandle {
        let mut active = self.active.lock();
        if let Some(mut run) = active.take() {
            if run.is_alive() {
                warn!("Aborting {} procedure", run.procedure);
            }
            run.cancel.cancel();
            run.join();
        }
        self.context.pending.lock().take();
        self.launch(&mut active, ProcedureId::Abort)
    }

    fn launch(&self, active: &mut Option<ActiveRun>, procedure: ProcedureId) -> RunHandle {
        if let Some(mut previous_run) = active.take() {
            previous_run.join();
        }
        self.context.pending.lock().take();

        let safety = self.context.engine.safety();
        let previous = safety.system_status();
        safety.update_system_state(SnapshotUpdate::procedure(Some(procedure)));

        let cancel = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let context = self.context.clone();
        let token = cancel.clone();
        let flag = Arc::clone(&finished);
        let handle = thread::spawn(move || {
            context.execute(procedure, previous, token, flag, done_tx);
        });

        *active = Some(ActiveRun {
            procedure,
            cancel: cancel.clone(),
            finished,
            handle: Some(handle),
        });
        RunHandle {
            procedure,
            cancel,
            done: done_rx,
        }
    }

    /// Operator confirmed the load/unload transfer
    pub fn complete_load_unload(&self) -> Result<ProcedureOutcome, ControlError> {
        if self.context.pending.lock().take().is_none() {
            return Err(ControlError::ProcedureDenied(
                "No load/unload transfer awaits confirmation".to_string(),
            ));
        }
        let outcome = self.context.engine.complete_load_unload();
        let kind = if outcome.is_success() {
            EventKind::Succeeded
        } else {
            EventKind::Failed
        };
        let message = match &outcome {
            ProcedureOutcome::Failure(reason) => reason.clone(),
            _ => "transfer confirmed".to_string(),
        };
        self.context.record(ProcedureId::LoadUnload, kind, message);
        let completion = Completion {
            procedure: ProcedureId::LoadUnload,
            outcome: outcome.clone(),
            system_status: self.context.engine.safety().system_status(),
            finished_at: Utc::now(),
        };
        let _ = self.context.completions.send(completion);
        Ok(outcome)
    }

    /// Operator dismissed the transfer dialog. The gate stays open.
    pub fn cancel_load_unload(&self) -> bool {
        if self.context.pending.lock().take().is_none() {
            return false;
        }
        self.context.engine.cancel_load_unload();
        self.context.record(
            ProcedureId::LoadUnload,
            EventKind::Cancelled,
            "transfer dialog dismissed, load-lock gate left open",
        );
        true
    }
}

impl Drop for ProcedureSupervisor {
    fn drop(&mut self) {
        if let Some(mut run) = self.active.lock().take() {
            run.cancel.cancel();
            run.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedures::testing::high_vacuum_rig;
    use crate::types::{analog, relays};

    #[test]
    fn second_start_is_denied_until_the_run_ends() {
        let rig = high_vacuum_rig(0.01);
        let supervisor = ProcedureSupervisor::new(Arc::clone(&rig.engine));

        let handle = supervisor.start(ProcedureId::Vent).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(supervisor.is_running());
        assert_eq!(supervisor.running_procedure(), Some(ProcedureId::Vent));
        match supervisor.start(ProcedureId::Pump) {
            Err(ControlError::ProcedureDenied(reason)) => {
                assert!(reason.contains("already running"), "{}", reason)
            }
            other => panic!("unexpected start result {:?}", other.map(|h| h.procedure())),
        }

        assert!(supervisor.cancel());
        assert_eq!(handle.wait(), ProcedureOutcome::Cancelled);
        assert!(!supervisor.is_running());
        assert!(!rig.sim.relay_by_name(relays::VALVE_VENT));
        assert_eq!(rig.safety().snapshot().current_procedure, None);

        let handle = supervisor.start(ProcedureId::GoToDefault).unwrap();
        assert_eq!(handle.wait(), ProcedureOutcome::Success);
        assert_eq!(rig.safety().system_status(), "default");
    }

    #[test]
    fn state_table_denies_procedures() {
        let rig = high_vacuum_rig(0.01);
        rig.safety().set_system_status("vented");
        let supervisor = ProcedureSupervisor::new(Arc::clone(&rig.engine));
        assert!(matches!(
            supervisor.start(ProcedureId::Sputter),
            Err(ControlError::ProcedureDenied(_))
        ));
        assert!(rig.sim.relay_commands().is_empty());
    }

    #[test]
    fn failed_run_recovers_to_default() {
        let rig = high_vacuum_rig(0.01);
        rig.sim.set_analog_volts(analog::CHAMBER_PRESSURE, 3.0);
        let supervisor = ProcedureSupervisor::new(Arc::clone(&rig.engine));
        let completions = supervisor.completions();

        let outcome = supervisor.start(ProcedureId::LoadUnload).unwrap().wait();
        match outcome {
            ProcedureOutcome::Failure(message) => {
                assert!(message.contains("returned to the default state"), "{}", message)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(rig.safety().system_status(), "default");
        assert!(rig.sim.relay_by_name(relays::PUMP_SCROLL));

        let completion = completions.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(completion.procedure, ProcedureId::LoadUnload);
        assert_eq!(completion.system_status, "default");
    }

    #[test]
    fn load_unload_waits_for_confirmation() {
        let rig = high_vacuum_rig(0.01);
        rig.sim.set_analog_volts(analog::LOADLOCK_PRESSURE, 1.0);
        let supervisor = ProcedureSupervisor::new(Arc::clone(&rig.engine));

        let outcome = supervisor.start(ProcedureId::LoadUnload).unwrap().wait();
        assert!(matches!(outcome, ProcedureOutcome::AwaitingUserConfirmation(_)));
        assert!(supervisor.pending_confirmation().is_some());
        assert_eq!(rig.safety().system_status(), "load_unload");

        assert_eq!(supervisor.complete_load_unload().unwrap(), ProcedureOutcome::Success);
        assert!(supervisor.pending_confirmation().is_none());
        assert!(!rig.sim.relay_by_name(relays::VALVE_LOADLOCK_GATE));
        assert!(supervisor.complete_load_unload().is_err());
    }

    #[test]
    fn abort_cancels_and_returns_to_default() {
        let rig = high_vacuum_rig(0.01);
        let supervisor = ProcedureSupervisor::new(Arc::clone(&rig.engine));
        let _vent = supervisor.start(ProcedureId::Vent).unwrap();
        thread::sleep(Duration::from_millis(100));

        let outcome = supervisor.abort().wait();
        assert_eq!(outcome, ProcedureOutcome::Success);
        assert_eq!(rig.safety().system_status(), "default");
        assert!(!rig.sim.relay_by_name(relays::MAINS_POWER));
        assert!(rig.sim.relay_by_name(relays::PUMP_SCROLL));
    }
}
