//! ---
//! tb_section: "01-harness-core"
//! tb_subsection: "module"
//! tb_type: "source"
//! tb_scope: "code"
//! tb_description: "Shared primitives for the harness control plane."
//! tb_version: "v0.1.0"
//! tb_owner: "tbd"
//! ---
//! Core shared primitives for the testbed harness workspace.
//! This crate exposes configuration loading, logging initialisation, and the
//! configuration error type consumed across the workspace.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    HarnessConfig, HarnessSettings, LoadedHarnessConfig, LoggingConfig, OverrideKey,
    ReadinessConfig, ReadinessProbe, WorkerConfig,
};
pub use error::ConfigError;
pub use logging::{init_tracing, LogFormat};
