//! ---
//! tb_section: "03-fleet-orchestration"
//! tb_subsection: "module"
//! tb_type: "source"
//! tb_scope: "runtime"
//! tb_description: "Fleet startup, rollback and reverse-order teardown."
//! tb_version: "v0.1.0"
//! tb_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Orchestration of the whole worker fleet.
//!
//! The orchestrator turns a validated [`HarnessConfig`] into running
//! [`WorkerProcess`]es. Startup is two-phase: every worker's
//! environment, entrypoint and scratch directory is resolved before
//! any process spawns, so a configuration problem can never leave a
//! half-started fleet behind. Workers start in declaration order; a
//! startup failure rolls the already-started prefix back in reverse
//! order, and `stop_all` tears the fleet down in reverse order too.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use testbed_common::{ConfigError, HarnessConfig, WorkerConfig};
use testbed_keys::Keyring;
use testbed_worker::{
    OutputSink, ShutdownError, StartupError, WorkerProcess, WorkerSpec, WorkerState,
};
use thiserror::Error;
use tracing::{error, info, warn};

/// Errors raised while bringing the fleet up.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Pre-spawn resolution rejected the configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A worker failed to start; the fleet has been rolled back.
    #[error(transparent)]
    Startup(#[from] StartupError),

    /// `start_all` was called while workers were still running.
    #[error("worker fleet is already running")]
    AlreadyRunning,
}

/// Aggregate teardown failure listing every worker that resisted.
///
/// Teardown never stops at the first failure; remaining workers are
/// still stopped and all individual errors are collected here.
#[derive(Debug, Error)]
#[error("{} worker(s) failed to stop", failures.len())]
pub struct TeardownError {
    /// Individual shutdown failures, in stop order.
    pub failures: Vec<ShutdownError>,
}

/// Point-in-time view of one fleet member.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    /// Worker name.
    pub name: String,
    /// Declaration index.
    pub ordinal: usize,
    /// Assigned port.
    pub port: u16,
    /// Current lifecycle state.
    pub state: WorkerState,
}

/// Supervisor for every worker declared in the configuration.
#[derive(Debug)]
pub struct WorkerOrchestrator {
    config: HarnessConfig,
    keyring: Arc<Keyring>,
    sink: OutputSink,
    workers: Vec<WorkerProcess>,
    grace_timeout: Duration,
}

impl WorkerOrchestrator {
    /// Build an orchestrator over a validated configuration.
    ///
    /// Keypair bindings are checked against the keyring here, so a
    /// missing role surfaces before any run is attempted.
    pub fn new(
        config: &HarnessConfig,
        keyring: Arc<Keyring>,
        sink: OutputSink,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        for (name, worker) in &config.workers {
            for role in worker.keys.values() {
                if !keyring.contains(role) {
                    return Err(ConfigError::UnknownRole {
                        worker: name.clone(),
                        role: role.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(Self {
            grace_timeout: config.harness.grace_timeout,
            config: config.clone(),
            keyring,
            sink,
            workers: Vec::new(),
        })
    }

    /// Console sink shared by every worker in the fleet.
    pub fn sink(&self) -> &OutputSink {
        &self.sink
    }

    /// Live handle to one worker, if it was ever launched.
    pub fn worker(&self, name: &str) -> Option<&WorkerProcess> {
        self.workers.iter().find(|worker| worker.name() == name)
    }

    /// State and port of every declared worker, in declaration order.
    ///
    /// Workers that were never launched report
    /// [`WorkerState::NotStarted`].
    pub fn status(&self) -> Vec<WorkerStatus> {
        self.config
            .workers
            .keys()
            .enumerate()
            .map(|(ordinal, name)| WorkerStatus {
                name: name.clone(),
                ordinal,
                port: self.config.harness.base_port + ordinal as u16,
                state: self
                    .worker(name)
                    .map(WorkerProcess::state)
                    .unwrap_or(WorkerState::NotStarted),
            })
            .collect()
    }

    /// Whether every declared worker is currently ready.
    pub fn all_ready(&self) -> bool {
        self.workers.len() == self.config.workers.len()
            && self
                .workers
                .iter()
                .all(|worker| worker.state() == WorkerState::Ready)
    }

    /// Port assigned to a declared worker: `base_port + ordinal`.
    pub fn port_for(&self, name: &str) -> Option<u16> {
        self.config.port_for(name)
    }

    /// Fully resolved child environment for a declared worker.
    ///
    /// The same resolution `start_all` performs, without spawning a
    /// process or touching the filesystem. Secrets are read from the
    /// control process environment at call time.
    pub fn env_for(&self, name: &str) -> Result<IndexMap<String, String>, ConfigError> {
        let (ordinal, _, worker) =
            self.config
                .workers
                .get_full(name)
                .ok_or_else(|| ConfigError::Invalid {
                    detail: format!("unknown worker '{name}'"),
                })?;
        self.resolve_env(ordinal, name, worker)
    }

    /// Start every worker in declaration order.
    ///
    /// Phase one resolves all environments, entrypoints and scratch
    /// directories without spawning anything; phase two spawns and
    /// readiness-checks one worker at a time. If any worker fails,
    /// every worker started so far is stopped in reverse order and the
    /// startup error is returned.
    pub async fn start_all(&mut self) -> Result<(), OrchestratorError> {
        if self
            .workers
            .iter()
            .any(|worker| !worker.state().is_terminal())
        {
            return Err(OrchestratorError::AlreadyRunning);
        }

        let specs = self.resolve_fleet()?;
        self.workers.clear();
        info!(workers = specs.len(), "starting worker fleet");

        for spec in specs {
            let mut worker = WorkerProcess::new(spec, self.sink.clone());
            let outcome = worker.start().await;
            self.workers.push(worker);
            if let Err(err) = outcome {
                error!(
                    worker = err.worker(),
                    error = %err,
                    "worker failed to start, rolling fleet back"
                );
                self.rollback().await;
                return Err(err.into());
            }
        }

        info!(workers = self.workers.len(), "worker fleet ready");
        Ok(())
    }

    /// Stop every launched worker in reverse declaration order.
    ///
    /// All workers are attempted even when one fails; failures are
    /// collected into a single [`TeardownError`]. Stopping an idle or
    /// never-started fleet is a no-op.
    pub async fn stop_all(&mut self) -> Result<(), TeardownError> {
        if !self.workers.is_empty() {
            info!(workers = self.workers.len(), "stopping worker fleet");
        }
        let mut failures = Vec::new();
        for worker in self.workers.iter_mut().rev() {
            if let Err(err) = worker.stop(self.grace_timeout).await {
                error!(worker = err.worker(), error = %err, "worker teardown failed");
                failures.push(err);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownError { failures })
        }
    }

    /// Reverse-order stop after a failed startup. Errors are logged,
    /// not returned; the startup failure is the interesting one.
    async fn rollback(&mut self) {
        for worker in self.workers.iter_mut().rev() {
            if let Err(err) = worker.stop(self.grace_timeout).await {
                warn!(worker = err.worker(), error = %err, "rollback stop failed");
            }
        }
    }

    /// Resolve every worker into a launchable spec without spawning.
    fn resolve_fleet(&self) -> Result<Vec<WorkerSpec>, ConfigError> {
        let mut specs = Vec::with_capacity(self.config.workers.len());
        for (ordinal, (name, worker)) in self.config.workers.iter().enumerate() {
            specs.push(self.resolve_worker(ordinal, name, worker)?);
        }
        Ok(specs)
    }

    fn resolve_worker(
        &self,
        ordinal: usize,
        name: &str,
        worker: &WorkerConfig,
    ) -> Result<WorkerSpec, ConfigError> {
        let entrypoint = worker.entrypoint.clone();
        if names_a_path(&entrypoint) && !entrypoint.is_file() {
            return Err(ConfigError::MissingEntrypoint {
                worker: name.to_owned(),
                path: entrypoint,
            });
        }

        let scratch_dir = self.config.scratch_dir(name);
        fs::create_dir_all(&scratch_dir).map_err(|source| ConfigError::Io {
            path: scratch_dir.clone(),
            source,
        })?;

        Ok(WorkerSpec {
            name: name.to_owned(),
            ordinal,
            port: self.config.harness.base_port + ordinal as u16,
            entrypoint,
            args: worker.args.clone(),
            working_dir: worker.working_dir.clone(),
            env: self.resolve_env(ordinal, name, worker)?,
            readiness: worker.readiness.clone(),
        })
    }

    fn resolve_env(
        &self,
        ordinal: usize,
        name: &str,
        worker: &WorkerConfig,
    ) -> Result<IndexMap<String, String>, ConfigError> {
        let port = self.config.harness.base_port + ordinal as u16;
        let scratch_dir = self.config.scratch_dir(name);

        // Assembly order matters: harness-assigned variables go last
        // so nothing a declaration binds can shadow them.
        let mut env: IndexMap<String, String> = IndexMap::new();
        if let Ok(path) = std::env::var("PATH") {
            env.insert("PATH".to_owned(), path);
        }
        for (var, value) in &worker.env {
            env.insert(var.clone(), value.clone());
        }
        for (var, source_var) in &worker.secrets {
            let value = std::env::var(source_var).map_err(|_| ConfigError::MissingSecret {
                worker: name.to_owned(),
                var: var.clone(),
                source_var: source_var.clone(),
            })?;
            env.insert(var.clone(), value);
        }
        for (var, role) in &worker.keys {
            let path = self
                .keyring
                .path_for(role)
                .map_err(|_| ConfigError::UnknownRole {
                    worker: name.to_owned(),
                    role: role.clone(),
                })?;
            env.insert(var.clone(), path.display().to_string());
        }
        env.insert("PORT".to_owned(), port.to_string());
        env.insert("DATA_DIR".to_owned(), scratch_dir.display().to_string());
        Ok(env)
    }
}

/// Whether an entrypoint names a concrete path rather than a bare
/// program to be found on the worker's PATH.
fn names_a_path(entrypoint: &Path) -> bool {
    entrypoint.is_absolute() || entrypoint.components().count() > 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use testbed_common::{HarnessSettings, LoggingConfig, ReadinessConfig, ReadinessProbe};
    use tempfile::tempdir;
    use tokio::time::sleep;

    fn shell_worker(script: &str) -> WorkerConfig {
        WorkerConfig {
            entrypoint: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
            env: IndexMap::new(),
            secrets: IndexMap::new(),
            keys: IndexMap::new(),
            readiness: ReadinessConfig {
                probe: ReadinessProbe::Grace,
                timeout: Duration::from_secs(5),
                grace_window: Duration::from_millis(100),
                poll_interval: Duration::from_millis(20),
            },
        }
    }

    fn fleet_config(root: &Path, workers: Vec<(&str, WorkerConfig)>) -> HarnessConfig {
        let mut map = IndexMap::new();
        for (name, worker) in workers {
            map.insert(name.to_string(), worker);
        }
        HarnessConfig {
            harness: HarnessSettings {
                base_port: 9000,
                data_dir: root.join("data"),
                key_dir: root.join("keys"),
                run_id: "default".to_string(),
                grace_timeout: Duration::from_secs(2),
            },
            workers: map,
            logging: LoggingConfig::default(),
        }
    }

    fn empty_keyring(root: &Path) -> Arc<Keyring> {
        let roles: [&str; 0] = [];
        Arc::new(Keyring::ensure(root.join("keys"), &roles).unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fleet_starts_in_declaration_order_with_sequential_ports() {
        let dir = tempdir().unwrap();
        let config = fleet_config(
            dir.path(),
            vec![
                ("leader", shell_worker("echo \"port=$PORT\"; sleep 5")),
                ("worker-a", shell_worker("echo \"port=$PORT\"; sleep 5")),
                ("worker-b", shell_worker("echo \"port=$PORT\"; sleep 5")),
            ],
        );
        let mut orchestrator =
            WorkerOrchestrator::new(&config, empty_keyring(dir.path()), OutputSink::default())
                .unwrap();

        orchestrator.start_all().await.unwrap();
        assert!(orchestrator.all_ready());

        let status = orchestrator.status();
        let summary: Vec<(String, u16)> = status
            .iter()
            .map(|worker| (worker.name.clone(), worker.port))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("leader".to_string(), 9000),
                ("worker-a".to_string(), 9001),
                ("worker-b".to_string(), 9002),
            ]
        );

        // Each worker saw its own assigned port in the environment.
        sleep(Duration::from_millis(200)).await;
        let sink = orchestrator.sink().clone();
        for (name, port) in [("leader", 9000), ("worker-a", 9001), ("worker-b", 9002)] {
            let lines = sink.lines_for(name);
            assert!(
                lines.iter().any(|l| l.line == format!("port={port}")),
                "{name} did not report port {port}"
            );
        }

        orchestrator.stop_all().await.unwrap();
        assert!(orchestrator
            .status()
            .iter()
            .all(|worker| worker.state == WorkerState::Stopped));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_worker_rolls_back_started_prefix() {
        let dir = tempdir().unwrap();
        let config = fleet_config(
            dir.path(),
            vec![
                ("leader", shell_worker("sleep 5")),
                ("crasher", shell_worker("echo doomed >&2; exit 7")),
                ("worker-b", shell_worker("sleep 5")),
            ],
        );
        let mut orchestrator =
            WorkerOrchestrator::new(&config, empty_keyring(dir.path()), OutputSink::default())
                .unwrap();

        let err = orchestrator.start_all().await.unwrap_err();
        match err {
            OrchestratorError::Startup(StartupError::ExitedBeforeReady {
                worker,
                code,
                stderr_tail,
            }) => {
                assert_eq!(worker, "crasher");
                assert_eq!(code, Some(7));
                assert!(stderr_tail.contains("doomed"));
            }
            other => panic!("expected startup failure, got {other}"),
        }

        let status = orchestrator.status();
        assert_eq!(status[0].state, WorkerState::Stopped, "leader rolled back");
        assert_eq!(status[1].state, WorkerState::Failed);
        assert_eq!(
            status[2].state,
            WorkerState::NotStarted,
            "later workers never spawn"
        );
    }

    #[test]
    fn lookups_are_deterministic_and_spawn_nothing() {
        let dir = tempdir().unwrap();
        let mut with_env = shell_worker("sleep 5");
        with_env.env.insert("MODE".to_string(), "itest".to_string());
        let config = fleet_config(
            dir.path(),
            vec![("leader", shell_worker("sleep 5")), ("edge", with_env)],
        );
        let orchestrator =
            WorkerOrchestrator::new(&config, empty_keyring(dir.path()), OutputSink::default())
                .unwrap();

        assert_eq!(orchestrator.port_for("leader"), Some(9000));
        assert_eq!(orchestrator.port_for("edge"), Some(9001));
        assert_eq!(orchestrator.port_for("ghost"), None);

        let env = orchestrator.env_for("edge").unwrap();
        assert_eq!(env.get("PORT").map(String::as_str), Some("9001"));
        assert_eq!(env.get("MODE").map(String::as_str), Some("itest"));
        let scratch = env.get("DATA_DIR").unwrap();
        assert!(scratch.ends_with("edge"), "{scratch}");
        // A lookup resolves the scratch path without creating it.
        assert!(!config.scratch_dir("edge").exists());
        assert!(orchestrator.env_for("ghost").is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn missing_secret_aborts_before_any_spawn() {
        let dir = tempdir().unwrap();
        let mut with_secret = shell_worker("sleep 5");
        with_secret.secrets.insert(
            "API_TOKEN".to_string(),
            "TESTBED_TEST_UNSET_SECRET_SOURCE".to_string(),
        );
        let config = fleet_config(
            dir.path(),
            vec![
                ("leader", shell_worker("sleep 5")),
                ("needs-secret", with_secret),
            ],
        );
        let mut orchestrator =
            WorkerOrchestrator::new(&config, empty_keyring(dir.path()), OutputSink::default())
                .unwrap();

        let err = orchestrator.start_all().await.unwrap_err();
        match err {
            OrchestratorError::Config(ConfigError::MissingSecret {
                worker, source_var, ..
            }) => {
                assert_eq!(worker, "needs-secret");
                assert_eq!(source_var, "TESTBED_TEST_UNSET_SECRET_SOURCE");
            }
            other => panic!("expected missing secret, got {other}"),
        }

        // Fail-fast: nothing spawned, not even the healthy leader.
        assert!(orchestrator
            .status()
            .iter()
            .all(|worker| worker.state == WorkerState::NotStarted));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn key_bindings_resolve_to_readable_keypair_files() {
        let dir = tempdir().unwrap();
        let keyring = Arc::new(Keyring::ensure(dir.path().join("keys"), &["leader"]).unwrap());

        let mut with_key = shell_worker(
            "test -f \"$LEADER_KEY\" && echo key-ok || echo key-missing >&2; sleep 5",
        );
        with_key
            .keys
            .insert("LEADER_KEY".to_string(), "leader".to_string());
        let config = fleet_config(dir.path(), vec![("signer", with_key)]);

        let mut orchestrator =
            WorkerOrchestrator::new(&config, keyring, OutputSink::default()).unwrap();
        orchestrator.start_all().await.unwrap();

        sleep(Duration::from_millis(200)).await;
        let lines = orchestrator.sink().lines_for("signer");
        assert!(
            lines.iter().any(|l| l.line == "key-ok"),
            "worker could not read its bound keypair file"
        );

        orchestrator.stop_all().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unknown_key_role_is_rejected_at_construction() {
        let dir = tempdir().unwrap();
        let mut with_key = shell_worker("sleep 5");
        with_key
            .keys
            .insert("GHOST_KEY".to_string(), "ghost".to_string());
        let config = fleet_config(dir.path(), vec![("signer", with_key)]);

        let err = WorkerOrchestrator::new(&config, empty_keyring(dir.path()), OutputSink::default())
            .unwrap_err();
        assert!(
            matches!(
                err,
                OrchestratorError::Config(ConfigError::UnknownRole { .. })
            ),
            "{err}"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn start_all_while_running_is_rejected() {
        let dir = tempdir().unwrap();
        let config = fleet_config(dir.path(), vec![("leader", shell_worker("sleep 5"))]);
        let mut orchestrator =
            WorkerOrchestrator::new(&config, empty_keyring(dir.path()), OutputSink::default())
                .unwrap();

        orchestrator.start_all().await.unwrap();
        let err = orchestrator.start_all().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyRunning));

        orchestrator.stop_all().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn missing_entrypoint_fails_resolution() {
        let dir = tempdir().unwrap();
        let mut worker = shell_worker("sleep 5");
        worker.entrypoint = dir.path().join("does-not-exist");
        let config = fleet_config(dir.path(), vec![("ghost", worker)]);

        let mut orchestrator =
            WorkerOrchestrator::new(&config, empty_keyring(dir.path()), OutputSink::default())
                .unwrap();
        let err = orchestrator.start_all().await.unwrap_err();
        assert!(
            matches!(
                err,
                OrchestratorError::Config(ConfigError::MissingEntrypoint { .. })
            ),
            "{err}"
        );
    }
}
