use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use foreman::audit::MemoryAuditSink;
use foreman::config::Config;
use foreman::core::store::TicketStore;
use foreman::core::ticket::TicketSpec;
use foreman::gate::ConstGate;
use foreman::orchestration::{
    AssignmentPolicy, ImmediateExecutor, LifecycleMachine, LockGranularity, LockManager,
    Orchestrator, OrchestratorEvent, ReviewQueueBuilder, TriggerRegistry,
};
use foreman::{flog, flog_error, Error, Result};

/// Foreman - ticket orchestration scheduler for a pool of coding agents
#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    FOREMAN_DEBUG=1     Enable debug logging (alternative to --debug)\n    FOREMAN_LOG=...     Log filter, e.g. `debug` or `info,locks=trace,store=debug`"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.foreman/foreman.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Schedule a batch of tickets to completion and print the review report
    Run {
        /// Path to the batch file (JSON array of ticket specs)
        #[arg(long)]
        batch: PathBuf,

        /// Worker pool size (overrides config)
        #[arg(long)]
        workers: Option<usize>,

        /// Serialize all tickets through one repository-wide lock
        #[arg(long)]
        serial: bool,

        /// Disable escalation trigger detection
        #[arg(long)]
        no_triggers: bool,
    },

    /// Validate a batch file without scheduling anything
    Validate {
        /// Path to the batch file
        #[arg(long)]
        batch: PathBuf,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    foreman::log::init_with_debug(cli.debug);

    let result = match cli.command {
        Command::Run {
            batch,
            workers,
            serial,
            no_triggers,
        } => run_batch(batch, workers, serial, no_triggers).await,
        Command::Validate { batch } => validate_batch(batch),
        Command::Config => show_config(),
    };
    if let Err(err) = &result {
        flog_error!("command failed: {}", err);
    }
    result
}

fn read_batch(path: &PathBuf) -> Result<Vec<TicketSpec>> {
    let text = fs::read_to_string(path)?;
    let specs: Vec<TicketSpec> = serde_json::from_str(&text)?;
    if specs.is_empty() {
        return Err(Error::Validation("batch file contains no tickets".into()));
    }
    Ok(specs)
}

/// Enqueue every spec into a fresh store, surfacing duplicate ids,
/// self-dependencies, and cycles through the store's own checks.
fn load_into_store(specs: Vec<TicketSpec>, store: &mut TicketStore) -> Result<()> {
    for spec in specs {
        store.enqueue(spec.into_ticket())?;
    }
    Ok(())
}

fn validate_batch(path: PathBuf) -> Result<()> {
    let specs = read_batch(&path)?;
    let ids: std::collections::HashSet<&str> = specs.iter().map(|s| s.id.as_str()).collect();
    for spec in &specs {
        for dep in &spec.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(Error::Validation(format!(
                    "ticket {} depends on {}, which is not in the batch",
                    spec.id, dep
                )));
            }
        }
    }
    let count = specs.len();
    let mut store = TicketStore::new(Arc::new(MemoryAuditSink::new()));
    load_into_store(specs, &mut store)?;
    println!("batch OK: {} ticket(s)", count);
    Ok(())
}

fn show_config() -> Result<()> {
    let config = Config::load()?;
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

async fn run_batch(
    path: PathBuf,
    workers: Option<usize>,
    serial: bool,
    no_triggers: bool,
) -> Result<()> {
    Config::ensure_dirs()?;
    let mut config = Config::load()?;
    if let Some(workers) = workers {
        config.max_workers = workers;
    }
    config.validate()?;

    let specs = read_batch(&path)?;
    flog!(
        "run: batch={} tickets={} workers={}",
        path.display(),
        specs.len(),
        config.max_workers
    );

    let sink = Arc::new(MemoryAuditSink::new());
    let store = Arc::new(RwLock::new(TicketStore::new(sink.clone())));
    load_into_store(specs, &mut *store.write().await)?;

    let triggers = if no_triggers {
        TriggerRegistry::new()
    } else {
        TriggerRegistry::with_defaults()
    };
    let machine = LifecycleMachine::new(
        config,
        Arc::new(ImmediateExecutor),
        Arc::new(ConstGate::passing(90.0)),
        triggers,
    );
    let policy = if serial {
        AssignmentPolicy::new(LockGranularity::WholeRepository)
    } else {
        AssignmentPolicy::default()
    };

    let (event_tx, mut event_rx) = mpsc::channel::<OrchestratorEvent>(256);
    let locks = Arc::new(RwLock::new(LockManager::new()));
    let mut orchestrator = Orchestrator::new(store.clone(), locks, machine, policy, event_tx);

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                OrchestratorEvent::TicketAssigned {
                    ticket_id,
                    worker_id,
                } => {
                    eprintln!("assigned   {} -> worker {}", ticket_id, worker_id.short());
                }
                OrchestratorEvent::TicketCompleted {
                    ticket_id,
                    quality_score,
                } => {
                    eprintln!("completed  {} (score {:.1})", ticket_id, quality_score);
                }
                OrchestratorEvent::TicketFailed { ticket_id, reason } => {
                    eprintln!("failed     {} ({})", ticket_id, reason);
                }
                OrchestratorEvent::TicketSkipped { ticket_id, reason } => {
                    eprintln!("skipped    {} ({})", ticket_id, reason);
                }
                OrchestratorEvent::TicketEscalated { ticket_id, trigger } => {
                    eprintln!("escalated  {} ({})", ticket_id, trigger);
                }
                OrchestratorEvent::BatchComplete => {
                    eprintln!("batch complete");
                }
            }
        }
    });

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted, stopping after this tick");
            signal_cancel.cancel();
        }
    });

    orchestrator
        .run_to_completion(Duration::from_millis(50), cancel)
        .await?;

    for record in orchestrator.open_escalations() {
        eprintln!(
            "needs human review: {} ({}: {})",
            record.ticket_id, record.trigger_type, record.context
        );
    }

    let report = {
        let store = store.read().await;
        ReviewQueueBuilder::build_with_history(store.all_tickets(), &sink)
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    drop(orchestrator);
    let _ = printer.await;
    Ok(())
}
