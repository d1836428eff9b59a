//! ---
//! tb_section: "04-run-state-machine"
//! tb_subsection: "module"
//! tb_type: "source"
//! tb_scope: "runtime"
//! tb_description: "Stage sequencing, checkpointing and resume."
//! tb_version: "v0.1.0"
//! tb_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! The run state machine.
//!
//! A run moves through `Loading`, then `Resuming` or `Resetting`, then
//! `Executing`, then `Finalizing`, and ends `Completed` or `Aborted`.
//! The [`StageRunner`] owns that progression: it brings the worker
//! fleet up, executes the declared [`Stage`]s in order, checkpoints
//! after every stage outcome, and always tears the fleet down at the
//! end, however the run went.

use testbed_common::ConfigError;
use testbed_orchestrator::OrchestratorError;
use testbed_state::StateStoreError;
use testbed_worker::StartupError;
use thiserror::Error;

pub mod runner;
pub mod stage;

pub use runner::{InterruptHandle, RunOutcome, StageRunner};
pub use stage::{Stage, StageContext, StageError};

/// Why a run ended `Aborted`.
#[derive(Debug, Error)]
pub enum RunError {
    /// The configuration was rejected before any worker spawned.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A worker failed to become ready; the fleet was rolled back.
    #[error(transparent)]
    Startup(#[from] StartupError),

    /// A stage's callable reported failure.
    #[error("stage '{stage}' failed: {source}")]
    Stage {
        /// Name of the failed stage.
        stage: String,
        /// What went wrong inside it.
        #[source]
        source: StageError,
    },

    /// Loading or saving the checkpoint failed.
    #[error(transparent)]
    Store(#[from] StateStoreError),

    /// The persisted checkpoint does not line up with the declared
    /// stage sequence.
    #[error("checkpoint does not match the declared stages: {detail}")]
    StateDrift {
        /// Which recorded stage broke the match.
        detail: String,
    },

    /// An external interrupt ended the run early.
    #[error("run interrupted")]
    Interrupted,
}

impl From<OrchestratorError> for RunError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Config(inner) => RunError::Config(inner),
            OrchestratorError::Startup(inner) => RunError::Startup(inner),
            OrchestratorError::AlreadyRunning => RunError::Config(ConfigError::Invalid {
                detail: "worker fleet is already running".to_owned(),
            }),
        }
    }
}
