//! ---
//! tb_section: "01-harness-core"
//! tb_subsection: "module"
//! tb_type: "source"
//! tb_scope: "code"
//! tb_description: "Shared primitives for the harness control plane."
//! tb_version: "v0.1.0"
//! tb_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::error::ConfigError;
use crate::logging::LogFormat;

/// Environment variables the orchestrator assigns to every worker itself.
pub const RESERVED_WORKER_VARS: &[&str] = &["PORT", "DATA_DIR"];

fn default_base_port() -> u16 {
    9000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("target/testbed")
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("target/testbed/keys")
}

fn default_run_id() -> String {
    "default".to_owned()
}

fn default_grace_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_readiness_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_grace_window() -> Duration {
    Duration::from_secs(3)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Primary configuration object for a harness invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    #[serde(default)]
    pub harness: HarnessSettings,
    #[serde(default)]
    pub workers: IndexMap<String, WorkerConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where a [`HarnessConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedHarnessConfig {
    pub config: HarnessConfig,
    pub source: PathBuf,
}

impl HarnessConfig {
    pub const ENV_CONFIG_PATH: &'static str = "TESTBED_CONFIG";

    /// Load configuration from disk, respecting the `TESTBED_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self, ConfigError> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(
        candidates: &[P],
    ) -> Result<LoadedHarnessConfig, ConfigError> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedHarnessConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedHarnessConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(ConfigError::NotFound {
            inspected: candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Parse and validate a configuration from a concrete file path.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: HarnessConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Retrieve a worker configuration by name.
    pub fn worker(&self, name: &str) -> Option<&WorkerConfig> {
        self.workers.get(name)
    }

    /// Declaration index of a worker, which fixes its port offset.
    pub fn ordinal_of(&self, name: &str) -> Option<usize> {
        self.workers.get_index_of(name)
    }

    /// Deterministic port assignment: `base_port + ordinal`.
    pub fn port_for(&self, name: &str) -> Option<u16> {
        self.ordinal_of(name)
            .map(|ordinal| self.harness.base_port + ordinal as u16)
    }

    /// Directory holding persisted run state.
    pub fn state_dir(&self) -> PathBuf {
        self.harness.data_dir.join("state")
    }

    /// Scratch directory assigned to one worker.
    pub fn scratch_dir(&self, name: &str) -> PathBuf {
        self.harness.data_dir.join("workers").join(name)
    }

    /// Distinct keypair roles referenced by worker bindings, in declaration order.
    pub fn keypair_roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = Vec::new();
        for worker in self.workers.values() {
            for role in worker.keys.values() {
                if !roles.iter().any(|known| known == role) {
                    roles.push(role.clone());
                }
            }
        }
        roles
    }

    /// Apply a single `key=value` override from the closed [`OverrideKey`] set.
    pub fn apply_override_spec(&mut self, spec: &str) -> Result<(), ConfigError> {
        let (key, value) = spec.split_once('=').ok_or_else(|| ConfigError::InvalidOverride {
            key: spec.to_owned(),
            detail: "expected key=value".to_owned(),
        })?;
        self.apply_override(key.trim().parse()?, value.trim())
    }

    /// Apply one recognised override.
    pub fn apply_override(&mut self, key: OverrideKey, value: &str) -> Result<(), ConfigError> {
        match key {
            OverrideKey::BasePort => {
                self.harness.base_port =
                    value.parse().map_err(|_| ConfigError::InvalidOverride {
                        key: key.as_str().to_owned(),
                        detail: format!("'{value}' is not a port number"),
                    })?;
            }
            OverrideKey::DataDir => {
                if value.is_empty() {
                    return Err(ConfigError::InvalidOverride {
                        key: key.as_str().to_owned(),
                        detail: "path cannot be empty".to_owned(),
                    });
                }
                self.harness.data_dir = PathBuf::from(value);
            }
            OverrideKey::KeyDir => {
                if value.is_empty() {
                    return Err(ConfigError::InvalidOverride {
                        key: key.as_str().to_owned(),
                        detail: "path cannot be empty".to_owned(),
                    });
                }
                self.harness.key_dir = PathBuf::from(value);
            }
            OverrideKey::RunId => {
                if !is_slug(value) {
                    return Err(ConfigError::InvalidOverride {
                        key: key.as_str().to_owned(),
                        detail: format!("'{value}' is not a valid run id"),
                    });
                }
                self.harness.run_id = value.to_owned();
            }
            OverrideKey::GraceTimeout => {
                let secs: u64 = value.parse().map_err(|_| ConfigError::InvalidOverride {
                    key: key.as_str().to_owned(),
                    detail: format!("'{value}' is not a number of seconds"),
                })?;
                self.harness.grace_timeout = Duration::from_secs(secs);
            }
        }
        Ok(())
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.is_empty() {
            return Err(ConfigError::Invalid {
                detail: "configuration must declare at least one worker".to_owned(),
            });
        }
        let highest = self.harness.base_port as u32 + self.workers.len() as u32 - 1;
        if highest > u16::MAX as u32 {
            return Err(ConfigError::Invalid {
                detail: format!(
                    "base_port {} leaves no room for {} workers",
                    self.harness.base_port,
                    self.workers.len()
                ),
            });
        }
        if !is_slug(&self.harness.run_id) {
            return Err(ConfigError::Invalid {
                detail: format!("run_id '{}' is not a valid identifier", self.harness.run_id),
            });
        }
        for (name, worker) in &self.workers {
            if !is_slug(name) {
                return Err(ConfigError::Invalid {
                    detail: format!("worker name '{name}' is not a valid identifier"),
                });
            }
            worker.validate(name)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for HarnessConfig {
    type Err = ConfigError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let config: HarnessConfig =
            toml::from_str(content).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }
}

/// Top-level `[harness]` settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessSettings {
    /// First port of the contiguous range assigned to workers.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Root directory for worker scratch space and persisted run state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory holding role keypair files.
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,
    /// Identifier of the logical run whose progress is checkpointed.
    #[serde(default = "default_run_id")]
    pub run_id: String,
    /// Seconds a worker is given to exit before the forced-kill path.
    #[serde(default = "default_grace_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub grace_timeout: Duration,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            data_dir: default_data_dir(),
            key_dir: default_key_dir(),
            run_id: default_run_id(),
            grace_timeout: default_grace_timeout(),
        }
    }
}

/// Declaration of one worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Program launched for this worker.
    pub entrypoint: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Literal environment assignments passed through verbatim.
    #[serde(default)]
    pub env: IndexMap<String, String>,
    /// Maps worker variables to control-process variables, resolved at start.
    #[serde(default)]
    pub secrets: IndexMap<String, String>,
    /// Maps worker variables to keyring roles, resolved to keypair file paths.
    #[serde(default)]
    pub keys: IndexMap<String, String>,
    #[serde(default)]
    pub readiness: ReadinessConfig,
}

impl WorkerConfig {
    /// Validate one worker declaration against its map key.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.entrypoint.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                detail: format!("worker '{name}' has an empty entrypoint"),
            });
        }
        self.readiness.validate(name)?;

        let mut seen: Vec<&str> = Vec::new();
        for var in self
            .env
            .keys()
            .chain(self.secrets.keys())
            .chain(self.keys.keys())
        {
            if !is_env_name(var) {
                return Err(ConfigError::Invalid {
                    detail: format!("worker '{name}' binds malformed variable name '{var}'"),
                });
            }
            if RESERVED_WORKER_VARS.contains(&var.as_str()) {
                return Err(ConfigError::ReservedVariable {
                    worker: name.to_owned(),
                    var: var.clone(),
                });
            }
            if seen.contains(&var.as_str()) {
                return Err(ConfigError::DuplicateVariable {
                    worker: name.to_owned(),
                    var: var.clone(),
                });
            }
            seen.push(var);
        }
        Ok(())
    }
}

/// How a started worker is judged ready for stages.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadinessConfig {
    #[serde(default)]
    pub probe: ReadinessProbe,
    /// Seconds the whole readiness wait may take.
    #[serde(default = "default_readiness_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
    /// Seconds a `grace`-probed worker must stay alive before it counts as ready.
    #[serde(default = "default_grace_window")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub grace_window: Duration,
    /// Milliseconds between liveness/probe checks.
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
}

impl ReadinessConfig {
    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid {
                detail: format!("worker '{name}' readiness timeout must be positive"),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                detail: format!("worker '{name}' readiness poll interval must be positive"),
            });
        }
        Ok(())
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            probe: ReadinessProbe::default(),
            timeout: default_readiness_timeout(),
            grace_window: default_grace_window(),
            poll_interval: default_poll_interval(),
        }
    }
}

/// Readiness signal polled while a worker is `Starting`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessProbe {
    /// Process alive after the grace window elapses.
    #[default]
    Grace,
    /// TCP connect to the worker's assigned port succeeds.
    Tcp,
}

/// Logging settings for the harness control process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// Closed set of configuration keys an operator may override per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideKey {
    BasePort,
    DataDir,
    KeyDir,
    RunId,
    GraceTimeout,
}

impl OverrideKey {
    /// Every recognised key, in help-text order.
    pub const ALL: &'static [OverrideKey] = &[
        OverrideKey::BasePort,
        OverrideKey::DataDir,
        OverrideKey::KeyDir,
        OverrideKey::RunId,
        OverrideKey::GraceTimeout,
    ];

    /// Spelling used in `--set key=value` arguments.
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideKey::BasePort => "base_port",
            OverrideKey::DataDir => "data_dir",
            OverrideKey::KeyDir => "key_dir",
            OverrideKey::RunId => "run_id",
            OverrideKey::GraceTimeout => "grace_timeout",
        }
    }

    fn known() -> String {
        Self::ALL
            .iter()
            .map(|key| key.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl std::str::FromStr for OverrideKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownOverride {
                key: s.to_owned(),
                known: Self::known(),
            })
    }
}

fn is_slug(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

fn is_env_name(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [workers.leader]
        entrypoint = "/bin/sh"
    "#;

    #[test]
    fn minimal_config_applies_defaults() {
        let config: HarnessConfig = MINIMAL.parse().unwrap();
        assert_eq!(config.harness.base_port, 9000);
        assert_eq!(config.harness.run_id, "default");
        assert_eq!(config.harness.grace_timeout, Duration::from_secs(5));
        let worker = config.worker("leader").unwrap();
        assert_eq!(worker.readiness.probe, ReadinessProbe::Grace);
        assert_eq!(worker.readiness.timeout, Duration::from_secs(30));
        assert_eq!(worker.readiness.poll_interval, Duration::from_millis(200));
    }

    #[test]
    fn ports_follow_declaration_order() {
        let config: HarnessConfig = r#"
            [harness]
            base_port = 9000

            [workers.leader]
            entrypoint = "/bin/sh"

            [workers.worker-a]
            entrypoint = "/bin/sh"

            [workers.worker-b]
            entrypoint = "/bin/sh"
        "#
        .parse()
        .unwrap();
        assert_eq!(config.port_for("leader"), Some(9000));
        assert_eq!(config.port_for("worker-a"), Some(9001));
        assert_eq!(config.port_for("worker-b"), Some(9002));
        assert_eq!(config.port_for("absent"), None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = r#"
            [harness]
            bsae_port = 9000

            [workers.leader]
            entrypoint = "/bin/sh"
        "#
        .parse::<HarnessConfig>()
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        let err = r#"
            [workers.leader]
            entrypoint = "/bin/sh"
            restart_policy = "always"
        "#
        .parse::<HarnessConfig>()
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn empty_worker_set_is_invalid() {
        let err = "".parse::<HarnessConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn reserved_and_duplicate_bindings_are_rejected() {
        let err = r#"
            [workers.leader]
            entrypoint = "/bin/sh"
            [workers.leader.env]
            PORT = "9999"
        "#
        .parse::<HarnessConfig>()
        .unwrap_err();
        assert!(matches!(err, ConfigError::ReservedVariable { ref var, .. } if var == "PORT"));

        let err = r#"
            [workers.leader]
            entrypoint = "/bin/sh"
            [workers.leader.env]
            TOKEN = "literal"
            [workers.leader.secrets]
            TOKEN = "CONTROL_TOKEN"
        "#
        .parse::<HarnessConfig>()
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateVariable { ref var, .. } if var == "TOKEN"));
    }

    #[test]
    fn port_range_overflow_is_invalid() {
        let err = r#"
            [harness]
            base_port = 65535

            [workers.leader]
            entrypoint = "/bin/sh"

            [workers.backup]
            entrypoint = "/bin/sh"
        "#
        .parse::<HarnessConfig>()
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn overrides_apply_to_known_keys_only() {
        let mut config: HarnessConfig = MINIMAL.parse().unwrap();
        config.apply_override_spec("base_port=9100").unwrap();
        config.apply_override_spec("run_id=nightly-3").unwrap();
        config.apply_override_spec("grace_timeout=9").unwrap();
        assert_eq!(config.harness.base_port, 9100);
        assert_eq!(config.harness.run_id, "nightly-3");
        assert_eq!(config.harness.grace_timeout, Duration::from_secs(9));

        let err = config.apply_override_spec("workers=none").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOverride { .. }));
        let err = config.apply_override_spec("base_port=not-a-port").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
        let err = config.apply_override_spec("base_port").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }

    #[test]
    fn keypair_roles_deduplicate_in_order() {
        let config: HarnessConfig = r#"
            [workers.leader]
            entrypoint = "/bin/sh"
            [workers.leader.keys]
            LEADER_KEYPAIR = "leader"
            SHARED_KEYPAIR = "participant"

            [workers.member]
            entrypoint = "/bin/sh"
            [workers.member.keys]
            MEMBER_KEYPAIR = "participant"
        "#
        .parse()
        .unwrap();
        assert_eq!(config.keypair_roles(), vec!["leader", "participant"]);
    }

    #[test]
    fn load_prefers_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testbed.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let missing = dir.path().join("absent.toml");

        let loaded = HarnessConfig::load_with_source(&[&missing, &path]).unwrap();
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.workers.len(), 1);

        let err = HarnessConfig::load(&[&missing]).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }
}
