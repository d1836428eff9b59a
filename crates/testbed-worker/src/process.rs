//! ---
//! tb_section: "02-worker-lifecycle"
//! tb_subsection: "module"
//! tb_type: "source"
//! tb_scope: "runtime"
//! tb_description: "Spawn, readiness probe and teardown of one worker."
//! tb_version: "v0.1.0"
//! tb_owner: "tbd"
//! ---

//! One supervised process, from spawn to reaped.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use testbed_common::{ReadinessConfig, ReadinessProbe};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::output::{OutputSink, StreamKind};
use crate::{ShutdownError, StartupError};

/// How many stderr lines a startup failure quotes.
const STDERR_TAIL_LINES: usize = 20;

/// Bounded wait for the process to disappear after a forced kill.
const KILL_REAP_WINDOW: Duration = Duration::from_secs(2);

/// Everything needed to launch one worker, fully resolved.
///
/// Secrets and key paths have already been materialized into `env` by
/// the orchestrator. Nothing here is read from the harness process
/// environment at spawn time; the child sees exactly `env` and nothing
/// else.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Worker name, unique within the fleet.
    pub name: String,
    /// Position in declaration order, drives the port offset.
    pub ordinal: usize,
    /// Port assigned to this worker.
    pub port: u16,
    /// Program to execute.
    pub entrypoint: PathBuf,
    /// Arguments passed to the entrypoint.
    pub args: Vec<String>,
    /// Working directory, inherited from the harness when `None`.
    pub working_dir: Option<PathBuf>,
    /// Complete child environment, in assembly order.
    pub env: IndexMap<String, String>,
    /// How readiness is decided for this worker.
    pub readiness: ReadinessConfig,
}

/// Lifecycle states of a worker process.
///
/// Within one start/stop cycle the state only moves forward. A worker
/// that reached `Stopped` or `Failed` may be started again, which
/// begins a fresh cycle at `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Never started.
    NotStarted,
    /// Spawned, readiness not yet decided.
    Starting,
    /// Up and considered ready.
    Ready,
    /// Teardown in progress.
    Stopping,
    /// Terminated cleanly by the harness.
    Stopped,
    /// Died early, failed its probe or resisted teardown.
    Failed,
}

impl WorkerState {
    /// Whether this state ends a lifecycle cycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            WorkerState::NotStarted => "not-started",
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One supervised worker process.
#[derive(Debug)]
pub struct WorkerProcess {
    spec: WorkerSpec,
    state: WorkerState,
    child: Option<Child>,
    io_tasks: Vec<JoinHandle<()>>,
    sink: OutputSink,
}

impl WorkerProcess {
    /// Supervisor for `spec`, relaying console output into `sink`.
    pub fn new(spec: WorkerSpec, sink: OutputSink) -> Self {
        Self {
            spec,
            state: WorkerState::NotStarted,
            child: None,
            io_tasks: Vec::new(),
            sink,
        }
    }

    /// Launch spec this supervisor was built from.
    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// Worker name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Port assigned to this worker.
    pub fn port(&self) -> u16 {
        self.spec.port
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Spawn the process and wait until it counts as ready.
    ///
    /// On any failure the worker ends up in [`WorkerState::Failed`]
    /// with the process killed and reaped; a worker is never left
    /// running behind a startup error.
    pub async fn start(&mut self) -> Result<(), StartupError> {
        match self.state {
            WorkerState::NotStarted | WorkerState::Stopped | WorkerState::Failed => {}
            state => {
                return Err(StartupError::InvalidState {
                    worker: self.spec.name.clone(),
                    state,
                })
            }
        }
        self.state = WorkerState::Starting;
        self.io_tasks.clear();

        let mut command = Command::new(&self.spec.entrypoint);
        command
            .args(&self.spec.args)
            .env_clear()
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            command.current_dir(dir);
        }

        debug!(
            worker = %self.spec.name,
            entrypoint = %self.spec.entrypoint.display(),
            port = self.spec.port,
            "spawning worker"
        );

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.state = WorkerState::Failed;
                return Err(StartupError::Spawn {
                    worker: self.spec.name.clone(),
                    source,
                });
            }
        };

        if let Some(stdout) = child.stdout.take() {
            self.io_tasks.push(spawn_relay(
                self.spec.name.clone(),
                StreamKind::Stdout,
                stdout,
                self.sink.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            self.io_tasks.push(spawn_relay(
                self.spec.name.clone(),
                StreamKind::Stderr,
                stderr,
                self.sink.clone(),
            ));
        }

        match self.await_ready(&mut child).await {
            Ok(()) => {
                let pid = child.id();
                self.child = Some(child);
                self.state = WorkerState::Ready;
                info!(worker = %self.spec.name, port = self.spec.port, pid, "worker ready");
                Ok(())
            }
            Err(err) => {
                // An early exit has already been reaped; only kill
                // what is still running.
                if child.try_wait().ok().flatten().is_none() {
                    if let Err(kill_err) = child.kill().await {
                        warn!(
                            worker = %self.spec.name,
                            error = %kill_err,
                            "failed to kill unready worker"
                        );
                    }
                }
                self.drain_io().await;
                self.state = WorkerState::Failed;
                Err(err)
            }
        }
    }

    /// Terminate the process, waiting up to `grace` for it to be
    /// reaped before escalating.
    ///
    /// Stopping a worker that never started, or one already stopped,
    /// is a no-op. Stopping a failed worker reaps any leftover process
    /// but keeps the failed verdict.
    pub async fn stop(&mut self, grace: Duration) -> Result<(), ShutdownError> {
        match self.state {
            WorkerState::NotStarted | WorkerState::Stopped => return Ok(()),
            WorkerState::Failed => {
                if let Some(mut child) = self.child.take() {
                    let _ = child.kill().await;
                }
                self.drain_io().await;
                return Ok(());
            }
            WorkerState::Starting | WorkerState::Ready | WorkerState::Stopping => {}
        }

        self.state = WorkerState::Stopping;
        let Some(mut child) = self.child.take() else {
            self.state = WorkerState::Stopped;
            return Ok(());
        };

        debug!(worker = %self.spec.name, grace = ?grace, "stopping worker");
        let waited = Instant::now();

        if let Err(source) = child.start_kill() {
            // Signalling an already-exited child is fine, anything
            // else means we cannot take it down.
            if child.try_wait().ok().flatten().is_none() {
                self.state = WorkerState::Failed;
                return Err(ShutdownError::Terminate {
                    worker: self.spec.name.clone(),
                    source,
                });
            }
        }

        match timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(worker = %self.spec.name, code = ?status.code(), "worker reaped");
            }
            Ok(Err(source)) => {
                self.state = WorkerState::Failed;
                return Err(ShutdownError::Terminate {
                    worker: self.spec.name.clone(),
                    source,
                });
            }
            Err(_) => {
                warn!(worker = %self.spec.name, "worker not reaped within grace, forcing");
                match timeout(KILL_REAP_WINDOW, child.kill()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(source)) => {
                        self.state = WorkerState::Failed;
                        return Err(ShutdownError::Terminate {
                            worker: self.spec.name.clone(),
                            source,
                        });
                    }
                    Err(_) => {
                        self.state = WorkerState::Failed;
                        return Err(ShutdownError::Unreaped {
                            worker: self.spec.name.clone(),
                            waited: waited.elapsed(),
                        });
                    }
                }
            }
        }

        self.drain_io().await;
        self.state = WorkerState::Stopped;
        info!(worker = %self.spec.name, "worker stopped");
        Ok(())
    }

    /// Poll until the worker is ready, exits, or the deadline passes.
    async fn await_ready(&mut self, child: &mut Child) -> Result<(), StartupError> {
        let readiness = self.spec.readiness.clone();
        let started = Instant::now();

        loop {
            let exited = child.try_wait().map_err(|source| StartupError::Io {
                worker: self.spec.name.clone(),
                source,
            })?;
            if let Some(status) = exited {
                self.drain_io().await;
                return Err(StartupError::ExitedBeforeReady {
                    worker: self.spec.name.clone(),
                    code: status.code(),
                    stderr_tail: self.sink.stderr_tail(&self.spec.name, STDERR_TAIL_LINES),
                });
            }

            match readiness.probe {
                ReadinessProbe::Grace => {
                    if started.elapsed() >= readiness.grace_window {
                        return Ok(());
                    }
                }
                ReadinessProbe::Tcp => {
                    if TcpStream::connect(("127.0.0.1", self.spec.port))
                        .await
                        .is_ok()
                    {
                        return Ok(());
                    }
                }
            }

            // The deadline caps the wait; a process still alive when it
            // passes counts as ready even if the probe never confirmed.
            if started.elapsed() >= readiness.timeout {
                warn!(
                    worker = %self.spec.name,
                    waited = ?started.elapsed(),
                    "readiness probe never confirmed, continuing with the live process"
                );
                return Ok(());
            }
            sleep(readiness.poll_interval).await;
        }
    }

    /// Wait briefly for the console relays to flush and finish.
    async fn drain_io(&mut self) {
        for task in self.io_tasks.drain(..) {
            let _ = timeout(Duration::from_secs(1), task).await;
        }
    }
}

/// Relay one console stream into the sink, line by line.
fn spawn_relay<R>(
    worker: String,
    stream: StreamKind,
    reader: R,
    sink: OutputSink,
) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    match stream {
                        StreamKind::Stdout => info!(worker = %worker, "{line}"),
                        StreamKind::Stderr => warn!(worker = %worker, "{line}"),
                    }
                    sink.record(&worker, stream, line);
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(worker = %worker, stream = %stream, error = %err, "console relay stopped");
                    break;
                }
            }
        }
    })
}
