//! ---
//! tb_section: "02-worker-lifecycle"
//! tb_subsection: "module"
//! tb_type: "source"
//! tb_scope: "runtime"
//! tb_description: "Single worker process lifecycle."
//! tb_version: "v0.1.0"
//! tb_owner: "tbd"
//! ---

//! Lifecycle of one supervised worker process.
//!
//! A [`WorkerProcess`] owns exactly one operating system process: it
//! spawns it with a fully resolved environment, relays its console
//! output into a shared [`OutputSink`], decides when the worker counts
//! as ready, and later tears it down. Fleet-level concerns such as
//! start order and rollback live one layer up, in the orchestrator.

use std::time::Duration;

use thiserror::Error;

pub mod output;
pub mod process;

pub use output::{OutputLine, OutputSink, StreamKind};
pub use process::{WorkerProcess, WorkerSpec, WorkerState};

/// Errors raised while bringing a worker up.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The worker was asked to start from a state that does not allow it.
    #[error("worker '{worker}' cannot start while {state}")]
    InvalidState {
        /// Worker name.
        worker: String,
        /// State the worker was in when start was requested.
        state: WorkerState,
    },

    /// The operating system refused to spawn the process.
    #[error("failed to spawn worker '{worker}': {source}")]
    Spawn {
        /// Worker name.
        worker: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The process exited before it was considered ready.
    #[error("worker '{worker}' exited before becoming ready (exit code {code:?})")]
    ExitedBeforeReady {
        /// Worker name.
        worker: String,
        /// Exit code, when the platform reported one.
        code: Option<i32>,
        /// Last stderr lines the worker wrote before dying.
        stderr_tail: String,
    },

    /// Observing the child process failed.
    #[error("io error while supervising worker '{worker}': {source}")]
    Io {
        /// Worker name.
        worker: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl StartupError {
    /// Name of the worker this error belongs to.
    pub fn worker(&self) -> &str {
        match self {
            StartupError::InvalidState { worker, .. }
            | StartupError::Spawn { worker, .. }
            | StartupError::ExitedBeforeReady { worker, .. }
            | StartupError::Io { worker, .. } => worker,
        }
    }
}

/// Errors raised while tearing a worker down.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Signalling or reaping the process failed outright.
    #[error("failed to terminate worker '{worker}': {source}")]
    Terminate {
        /// Worker name.
        worker: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The process could not be reaped even after a forced kill.
    #[error("worker '{worker}' still running {waited:?} after forced kill")]
    Unreaped {
        /// Worker name.
        worker: String,
        /// Total time spent waiting for the process to go away.
        waited: Duration,
    },
}

impl ShutdownError {
    /// Name of the worker this error belongs to.
    pub fn worker(&self) -> &str {
        match self {
            ShutdownError::Terminate { worker, .. } | ShutdownError::Unreaped { worker, .. } => {
                worker
            }
        }
    }
}
