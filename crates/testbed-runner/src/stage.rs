//! ---
//! tb_section: "04-run-state-machine"
//! tb_subsection: "module"
//! tb_type: "source"
//! tb_scope: "runtime"
//! tb_description: "The stage contract and its execution context."
//! tb_version: "v0.1.0"
//! tb_owner: "tbd"
//! ---

//! What a test stage is and what it gets to work with.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use testbed_keys::{Keyring, SigningError};
use testbed_orchestrator::WorkerOrchestrator;
use thiserror::Error;

/// Errors a stage callable can report.
///
/// A stage failure aborts the run but never poisons the checkpoint:
/// the failure is recorded and earlier successes stay resumable.
#[derive(Debug, Error)]
pub enum StageError {
    /// The stage's own logic failed.
    #[error("{detail}")]
    Failed {
        /// Human readable failure description.
        detail: String,
    },

    /// Producing or verifying a signed fixture failed.
    #[error("signing failed: {0}")]
    Signing(#[from] SigningError),

    /// A filesystem interaction inside the stage failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    /// Shorthand for a [`StageError::Failed`] with the given detail.
    pub fn failed(detail: impl Into<String>) -> Self {
        StageError::Failed {
            detail: detail.into(),
        }
    }
}

/// What a stage sees while it executes.
///
/// The context is rebuilt per stage invocation and borrows the live
/// harness; stages never own fleet or signer state.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    /// The running fleet, for port lookups and console inspection.
    pub orchestrator: &'a WorkerOrchestrator,
    /// Role keyring for producing signed fixtures.
    pub signer: &'a Keyring,
    /// Identifier of the run being executed.
    pub run_id: &'a str,
    /// Root directory for run-scoped artifacts.
    pub data_dir: &'a Path,
}

/// One ordered, named unit of test logic.
///
/// Stages execute strictly in declaration order. A stage that already
/// succeeded in a previous attempt is skipped on resume, unless it
/// opts out via [`Stage::skip_completed`].
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable name, unique within the declared sequence.
    fn name(&self) -> &str;

    /// One line describing what the stage checks.
    fn description(&self) -> &str {
        ""
    }

    /// Whether a previously succeeded attempt may be skipped on
    /// resume. Stages whose effects do not survive between harness
    /// invocations return `false` to always re-run.
    fn skip_completed(&self) -> bool {
        true
    }

    /// Run the stage against the live fleet.
    ///
    /// The returned payload is checkpointed with the stage record;
    /// return [`Value::Null`] when there is nothing worth keeping.
    async fn execute(&self, ctx: &StageContext<'_>) -> Result<Value, StageError>;
}
