//! ---
//! tb_section: "05-checkpoint-persistence"
//! tb_subsection: "module"
//! tb_type: "source"
//! tb_scope: "runtime"
//! tb_description: "Run state records and checkpoint stores."
//! tb_version: "v0.1.0"
//! tb_owner: "tbd"
//! ---

#![warn(missing_docs)]

//! Durable run state for the testbed harness.
//!
//! A run is a named sequence of stages. After every stage outcome the
//! runner checkpoints a [`RunState`] through a [`StateStore`], so an
//! interrupted run can resume without repeating stages that already
//! succeeded. The default store, [`JsonStateStore`], keeps one JSON
//! envelope per run id on the local filesystem and refuses to load
//! anything it cannot vouch for.

use std::path::PathBuf;

use thiserror::Error;

pub mod run_state;
pub mod store;

pub use run_state::{RunState, StageRecord, StageStatus};
pub use store::{JsonStateStore, StateStore, STATE_VERSION};

/// Convenience alias used by every fallible operation in this crate.
pub type Result<T> = std::result::Result<T, StateStoreError>;

/// Errors raised while loading, saving or clearing run state.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// Filesystem access failed.
    #[error("state store io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization to or from JSON failed.
    #[error("state store serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The file exists but its contents cannot be trusted.
    #[error("corrupt run state at {path:?}: {detail}")]
    Corrupt {
        /// Location of the offending file.
        path: PathBuf,
        /// What exactly failed to check out.
        detail: String,
    },

    /// The envelope was written by an incompatible harness version.
    #[error("unsupported run state version {found} at {path:?} (expected {expected})")]
    Version {
        /// Location of the offending file.
        path: PathBuf,
        /// Version number found in the envelope.
        found: u16,
        /// Version number this build writes and reads.
        expected: u16,
    },
}
