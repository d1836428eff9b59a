//! ---
//! tb_section: "01-harness-core"
//! tb_subsection: "module"
//! tb_type: "source"
//! tb_scope: "code"
//! tb_description: "Shared primitives for the harness control plane."
//! tb_version: "v0.1.0"
//! tb_owner: "tbd"
//! ---
use std::path::PathBuf;

/// Error type for configuration loading, validation, and resolution.
///
/// Every variant is raised before any worker process is spawned; a
/// configuration problem must never leave a partial fleet behind.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading a configuration or key file from disk failed.
    #[error("unable to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The configuration file is not valid TOML for the expected schema.
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    /// None of the candidate configuration paths exist.
    #[error("no configuration file found. inspected: {inspected}")]
    NotFound { inspected: String },
    /// A structural invariant of the configuration does not hold.
    #[error("invalid configuration: {detail}")]
    Invalid { detail: String },
    /// A secret binding names a control-process variable that is unset.
    #[error("worker '{worker}' requires secret {var} from unset environment variable {source_var}")]
    MissingSecret {
        worker: String,
        var: String,
        source_var: String,
    },
    /// A keypair binding names a role the keyring does not hold.
    #[error("worker '{worker}' references unknown keypair role '{role}'")]
    UnknownRole { worker: String, role: String },
    /// A worker entrypoint does not resolve to a readable file.
    #[error("worker '{worker}' entrypoint {path:?} is not a readable file")]
    MissingEntrypoint { worker: String, path: PathBuf },
    /// A worker binding collides with a variable the harness assigns itself.
    #[error("worker '{worker}' binds reserved variable {var}")]
    ReservedVariable { worker: String, var: String },
    /// The same environment variable is bound more than once for a worker.
    #[error("worker '{worker}' binds variable {var} more than once")]
    DuplicateVariable { worker: String, var: String },
    /// An override names a key outside the recognised set.
    #[error("unknown override key '{key}' (known: {known})")]
    UnknownOverride { key: String, known: String },
    /// An override value failed to parse for its key.
    #[error("invalid value for override '{key}': {detail}")]
    InvalidOverride { key: String, detail: String },
}
