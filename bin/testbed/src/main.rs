//! ---
//! tb_section: "01-harness-core"
//! tb_subsection: "binary"
//! tb_type: "source"
//! tb_scope: "code"
//! tb_description: "Binary entrypoint for the testbed harness CLI."
//! tb_version: "v0.1.0"
//! tb_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use testbed_common::{init_tracing, HarnessConfig};
use testbed_keys::Keyring;
use testbed_orchestrator::WorkerOrchestrator;
use testbed_runner::StageRunner;
use testbed_state::{JsonStateStore, StateStore};
use testbed_worker::OutputSink;
use tokio::signal;
use tracing::{info, warn};

mod stages;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Multi-process test harness",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Bring the worker fleet up and execute the stage suite")]
    Run {
        #[arg(long, help = "Discard the prior checkpoint and worker scratch space")]
        reset: bool,

        #[arg(
            long = "set",
            value_name = "KEY=VALUE",
            help = "Override a configuration value (base_port, data_dir, key_dir, run_id, grace_timeout)"
        )]
        set: Vec<String>,
    },
    #[command(about = "Generate missing role keypairs")]
    Keygen {
        #[arg(long, help = "Rotate keypairs that already exist")]
        force: bool,
    },
    #[command(about = "Print persisted stage progress without executing anything")]
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("testbed.toml"));
    candidates.push(PathBuf::from("configs/testbed.toml"));

    let loaded = HarnessConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;

    let command = cli.command.unwrap_or(Commands::Run {
        reset: false,
        set: Vec::new(),
    });
    if let Commands::Run { set, .. } = &command {
        for spec in set {
            config.apply_override_spec(spec)?;
        }
    }

    init_tracing("testbed", &config.logging)?;
    info!(
        config_path = %loaded.source.display(),
        run_id = %config.harness.run_id,
        workers = config.workers.len(),
        "configuration loaded"
    );

    match command {
        Commands::Run { reset, .. } => run_suite(config, reset).await,
        Commands::Keygen { force } => keygen(&config, force),
        Commands::Status => status(&config),
    }
}

async fn run_suite(config: HarnessConfig, reset: bool) -> Result<()> {
    let keyring = Arc::new(Keyring::ensure(
        &config.harness.key_dir,
        &config.keypair_roles(),
    )?);
    let orchestrator = WorkerOrchestrator::new(&config, keyring.clone(), OutputSink::default())?;
    let store = Box::new(JsonStateStore::new(config.state_dir())?);
    let mut runner = StageRunner::new(&config, orchestrator, keyring, store, stages::builtin())?;

    let interrupt = runner.interrupt_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c received; interrupting the run");
            interrupt.trigger();
        }
    });

    let outcome = runner.run(reset).await;
    if !outcome.is_completed() {
        // The abort reason is already on the log; exit status is the contract.
        std::process::exit(outcome.exit_code());
    }
    Ok(())
}

fn keygen(config: &HarnessConfig, force: bool) -> Result<()> {
    let roles = config.keypair_roles();
    if roles.is_empty() {
        println!("configuration references no keypair roles; nothing to generate");
        return Ok(());
    }
    let keyring = if force {
        Keyring::regenerate(&config.harness.key_dir, &roles)?
    } else {
        Keyring::ensure(&config.harness.key_dir, &roles)?
    };
    for role in keyring.roles() {
        println!("{role}: {}", keyring.path_for(role)?.display());
    }
    Ok(())
}

fn status(config: &HarnessConfig) -> Result<()> {
    let store = JsonStateStore::new(config.state_dir())?;
    let run_id = &config.harness.run_id;
    match store.load(run_id)? {
        Some(state) => {
            println!("run '{run_id}': {} stage(s) recorded", state.stages.len());
            for record in &state.stages {
                let completed = record
                    .completed_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".to_owned());
                match &record.error {
                    Some(detail) => {
                        println!("  {:<24} {:<10} {completed}  {detail}", record.name, record.status)
                    }
                    None => println!("  {:<24} {:<10} {completed}", record.name, record.status),
                }
            }
        }
        None => println!("run '{run_id}': no checkpoint recorded"),
    }
    Ok(())
}
