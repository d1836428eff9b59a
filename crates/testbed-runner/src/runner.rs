//! ---
//! tb_section: "04-run-state-machine"
//! tb_subsection: "module"
//! tb_type: "source"
//! tb_scope: "runtime"
//! tb_description: "The stage runner driving a whole checkpointed run."
//! tb_version: "v0.1.0"
//! tb_owner: "tbd"
//! ---

//! Drives one run from checkpoint load to fleet teardown.

use std::sync::Arc;

use testbed_common::{ConfigError, HarnessConfig};
use testbed_keys::Keyring;
use testbed_orchestrator::WorkerOrchestrator;
use testbed_state::{RunState, StageRecord, StateStore};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::stage::{Stage, StageContext};
use crate::RunError;

/// Internal phase labels used for run progress logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunPhase {
    Loading,
    Resetting,
    Resuming,
    Executing,
    Finalizing,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RunPhase::Loading => "loading",
            RunPhase::Resetting => "resetting",
            RunPhase::Resuming => "resuming",
            RunPhase::Executing => "executing",
            RunPhase::Finalizing => "finalizing",
        };
        f.write_str(label)
    }
}

/// Terminal verdict of one run.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every declared stage is recorded `succeeded`.
    Completed,
    /// The run stopped early; the checkpoint holds the resume point.
    Aborted(RunError),
}

impl RunOutcome {
    /// Whether the run finished all stages.
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }

    /// Process exit status for this verdict.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Aborted(_) => 1,
        }
    }
}

/// Requests an early end to a run in progress.
///
/// Cloneable and cheap; typically handed to a signal listener. The
/// runner notices the trigger between stages and mid-stage alike,
/// tears the fleet down and reports [`RunError::Interrupted`].
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl InterruptHandle {
    /// Ask the run to stop as soon as possible.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Owns one run: the fleet, the signer, the checkpoint store and the
/// declared stage sequence.
pub struct StageRunner {
    config: HarnessConfig,
    orchestrator: WorkerOrchestrator,
    keyring: Arc<Keyring>,
    store: Box<dyn StateStore>,
    stages: Vec<Box<dyn Stage>>,
    interrupt_tx: Arc<watch::Sender<bool>>,
    interrupt_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("config", &self.config)
            .field("orchestrator", &self.orchestrator)
            .field("keyring", &self.keyring)
            .field("stages", &self.stages.len())
            .finish_non_exhaustive()
    }
}

impl StageRunner {
    /// Assemble a runner over an already-constructed fleet.
    ///
    /// Stage names must be unique and non-empty; they key checkpoint
    /// records, so a duplicate would make resume ambiguous.
    pub fn new(
        config: &HarnessConfig,
        orchestrator: WorkerOrchestrator,
        keyring: Arc<Keyring>,
        store: Box<dyn StateStore>,
        stages: Vec<Box<dyn Stage>>,
    ) -> Result<Self, ConfigError> {
        let mut seen: Vec<&str> = Vec::new();
        for stage in &stages {
            let name = stage.name();
            if name.is_empty() {
                return Err(ConfigError::Invalid {
                    detail: "a stage has an empty name".to_owned(),
                });
            }
            if seen.contains(&name) {
                return Err(ConfigError::Invalid {
                    detail: format!("duplicate stage name '{name}'"),
                });
            }
            seen.push(name);
        }

        let (interrupt_tx, interrupt_rx) = watch::channel(false);
        Ok(Self {
            config: config.clone(),
            orchestrator,
            keyring,
            store,
            stages,
            interrupt_tx: Arc::new(interrupt_tx),
            interrupt_rx,
        })
    }

    /// Handle through which a signal listener can end the run early.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            tx: self.interrupt_tx.clone(),
        }
    }

    /// Fleet view, useful for status reporting after a run.
    pub fn orchestrator(&self) -> &WorkerOrchestrator {
        &self.orchestrator
    }

    /// Execute the run to a terminal verdict.
    ///
    /// With `force_reset` the prior checkpoint and all worker scratch
    /// directories are discarded and every stage runs again. Without
    /// it, stages already recorded `succeeded` are skipped. Whatever
    /// happens, the fleet is torn down before this returns.
    pub async fn run(&mut self, force_reset: bool) -> RunOutcome {
        let result = self.drive(force_reset).await;

        info!(phase = %RunPhase::Finalizing, "tearing worker fleet down");
        if let Err(err) = self.orchestrator.stop_all().await {
            for failure in &err.failures {
                warn!(worker = failure.worker(), error = %failure, "worker resisted teardown");
            }
        }

        match result {
            Ok(()) => {
                info!(run_id = %self.config.harness.run_id, "run completed");
                RunOutcome::Completed
            }
            Err(err) => {
                error!(run_id = %self.config.harness.run_id, error = %err, "run aborted");
                RunOutcome::Aborted(err)
            }
        }
    }

    /// Everything up to finalization.
    async fn drive(&mut self, force_reset: bool) -> Result<(), RunError> {
        let run_id = self.config.harness.run_id.clone();
        info!(run_id = %run_id, phase = %RunPhase::Loading, force_reset, "run starting");

        let mut state = if force_reset {
            info!(run_id = %run_id, phase = %RunPhase::Resetting, "discarding checkpoint and scratch space");
            // A reset restarts even a fleet that is already up.
            if let Err(err) = self.orchestrator.stop_all().await {
                for failure in &err.failures {
                    warn!(worker = failure.worker(), error = %failure, "worker resisted teardown");
                }
            }
            self.store.clear(&run_id)?;
            self.scrub_scratch_dirs()?;
            RunState::new(&run_id)
        } else {
            match self.store.load(&run_id)? {
                Some(state) => {
                    self.check_drift(&state)?;
                    info!(
                        run_id = %run_id,
                        phase = %RunPhase::Resuming,
                        recorded = state.stages.len(),
                        "resuming from checkpoint"
                    );
                    state
                }
                None => RunState::new(&run_id),
            }
        };

        let mut interrupt_rx = self.interrupt_rx.clone();
        if *interrupt_rx.borrow() {
            return Err(RunError::Interrupted);
        }

        tokio::select! {
            _ = wait_for_interrupt(&mut interrupt_rx) => {
                warn!(run_id = %run_id, "interrupted during fleet bring-up");
                return Err(RunError::Interrupted);
            }
            started = self.orchestrator.start_all() => started?,
        }

        info!(
            run_id = %run_id,
            phase = %RunPhase::Executing,
            stages = self.stages.len(),
            "executing stages"
        );
        for index in 0..self.stages.len() {
            let stage = &self.stages[index];
            let name = stage.name().to_owned();

            if state.is_succeeded(&name) && stage.skip_completed() {
                debug!(stage = %name, "already succeeded, skipping");
                continue;
            }
            if *interrupt_rx.borrow() {
                return Err(RunError::Interrupted);
            }

            info!(stage = %name, index, description = stage.description(), "stage starting");
            let ctx = StageContext {
                orchestrator: &self.orchestrator,
                signer: &self.keyring,
                run_id: &run_id,
                data_dir: &self.config.harness.data_dir,
            };

            let outcome = tokio::select! {
                _ = wait_for_interrupt(&mut interrupt_rx) => None,
                result = stage.execute(&ctx) => Some(result),
            };
            let Some(result) = outcome else {
                warn!(stage = %name, "interrupted mid-stage, outcome discarded");
                return Err(RunError::Interrupted);
            };

            match result {
                Ok(value) => {
                    let previous = state.clone();
                    let payload = (!value.is_null()).then_some(value);
                    state.upsert(StageRecord::succeeded(&name, payload));
                    if let Err(err) = self.store.save(&run_id, &state) {
                        // Not durable means not succeeded; forget the
                        // in-memory record before aborting.
                        state = previous;
                        error!(stage = %name, error = %err, "checkpoint save failed");
                        return Err(err.into());
                    }
                    info!(stage = %name, "stage succeeded");
                }
                Err(err) => {
                    state.upsert(StageRecord::failed(&name, err.to_string()));
                    if let Err(save_err) = self.store.save(&run_id, &state) {
                        warn!(stage = %name, error = %save_err, "failed to checkpoint stage failure");
                    }
                    return Err(RunError::Stage {
                        stage: name,
                        source: err,
                    });
                }
            }
        }

        // Covers the all-skipped path, where no stage wrote anything.
        self.store.save(&run_id, &state)?;
        Ok(())
    }

    /// Reject checkpoints whose records cannot have come from this
    /// stage sequence: every recorded name must appear in the declared
    /// order. A mismatch usually means the suite changed under an old
    /// run id.
    fn check_drift(&self, state: &RunState) -> Result<(), RunError> {
        let declared: Vec<&str> = self.stages.iter().map(|stage| stage.name()).collect();
        let mut cursor = 0usize;
        for record in &state.stages {
            match declared[cursor..]
                .iter()
                .position(|name| *name == record.name.as_str())
            {
                Some(offset) => cursor += offset + 1,
                None => {
                    return Err(RunError::StateDrift {
                        detail: format!(
                            "recorded stage '{}' does not fit the declared sequence; \
                             re-run with a reset to discard the stale checkpoint",
                            record.name
                        ),
                    })
                }
            }
        }
        Ok(())
    }

    /// Remove every worker's scratch directory as part of a reset.
    fn scrub_scratch_dirs(&self) -> Result<(), RunError> {
        for name in self.config.workers.keys() {
            let dir = self.config.scratch_dir(name);
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => debug!(worker = %name, path = %dir.display(), "scrubbed scratch dir"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(ConfigError::Io { path: dir, source }.into());
                }
            }
        }
        Ok(())
    }
}

/// Resolves once the interrupt flag flips to true.
async fn wait_for_interrupt(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone means nobody can interrupt anymore.
            std::future::pending::<()>().await;
        }
    }
}
