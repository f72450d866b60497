//! agent-coord binary entry point
//!
//! Runs a TOML work plan through the coordinator, validates plans and shows
//! persisted coordinator state.

use ai_agent_cli::{completions, Plan};
use ai_agent_common::{CoordinationError, StateStore, SystemConfig, TaskStatus};
use ai_agent_coordinator::{tracing_setup, AgentCoordinator, CommandBackend, StatusEvent};
use ai_agent_storage::open_store;
use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "agent-coord")]
#[command(version)]
#[command(about = "Coordinate agents sharing one working tree")]
struct Cli {
    /// Path to configuration file; built-in defaults when omitted
    #[arg(short, long, global = true, env = "AGENT_COORD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hire the plan's agents, submit its tasks and run until all are finished
    Run {
        #[arg(short, long)]
        plan: PathBuf,

        /// Working directory for task commands (defaults to locks.workspace_root)
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
    /// Check a plan for duplicates, unknown dependencies and cycles
    Validate {
        #[arg(short, long)]
        plan: PathBuf,
    },
    /// Show persisted agents, locks and tasks
    Status,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        completions::generate(shell, &mut Cli::command());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => SystemConfig::from_file(path).map_err(|e| {
            eprintln!("Failed to load configuration: {:#}", e);
            e
        })?,
        None => SystemConfig::default(),
    };

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    tracing_setup::init_tracing_with_level(level, config.logging.json)?;

    match cli.command {
        Commands::Run { plan, workdir } => run(config, plan, workdir).await,
        Commands::Validate { plan } => validate(plan),
        Commands::Status => status(config).await,
        Commands::Completions { .. } => Ok(()),
    }
}

fn validate(path: PathBuf) -> Result<()> {
    let plan = Plan::from_file(&path)?;
    println!("✓ Plan is valid");
    println!("  Agents: {}", plan.agents.len());
    println!("  Tasks: {}", plan.tasks.len());
    Ok(())
}

async fn run(config: SystemConfig, plan_path: PathBuf, workdir: Option<PathBuf>) -> Result<()> {
    let plan = Plan::from_file(&plan_path)?;
    let store = open_store(&config.storage).await?;

    let mut backend = CommandBackend::new(&config.worker);
    if let Some(dir) = workdir.or_else(|| config.locks.workspace_root.clone()) {
        backend = backend.with_workdir(dir);
    }

    let coordinator = Arc::new(AgentCoordinator::new(&config, Arc::new(backend), store));
    let restored = coordinator.restore().await?;
    if restored.tasks > 0 {
        info!(
            "Resuming: {} tasks on record, {} in flight, {} requeued",
            restored.tasks,
            restored.resumed.len(),
            restored.requeued.len()
        );
    }

    for agent in &plan.agents {
        match coordinator.hire(&agent.name, &agent.role).await {
            Ok(_) | Err(CoordinationError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e).context(format!("Failed to hire {}", agent.name)),
        }
    }
    for task in plan.new_tasks() {
        let id = task.id.clone().context("plan tasks always carry an id")?;
        if coordinator.task_status(&id).await.is_some() {
            continue;
        }
        coordinator
            .submit_task(task)
            .await
            .with_context(|| format!("Failed to submit {}", id))?;
    }

    let printer = {
        let mut events = coordinator.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => print_event(&event),
                    Err(RecvError::Lagged(missed)) => warn!("Dropped {} status events", missed),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let shutdown = CancellationToken::new();
    let loops = coordinator.run(shutdown.clone());
    let mut poll = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted; state is kept for the next run");
                break;
            }
            _ = poll.tick() => {
                if coordinator.all_tasks_terminal().await {
                    break;
                }
            }
        }
    }

    shutdown.cancel();
    for handle in loops {
        if let Err(e) = handle.await {
            error!("Coordinator loop panicked: {}", e);
        }
    }
    coordinator.shutdown().await;
    printer.abort();

    let tasks = coordinator.list_tasks().await;
    println!();
    for task in &tasks {
        println!(
            "  {:<20} {:<10} {}",
            task.id.as_str(),
            task.status.to_string(),
            task.failure.as_deref().unwrap_or("")
        );
    }

    let failed = tasks.iter().filter(|t| t.status == TaskStatus::Failed).count();
    if failed > 0 {
        bail!("{} of {} tasks failed", failed, tasks.len());
    }
    Ok(())
}

fn print_event(event: &StatusEvent) {
    let task = event
        .task_id
        .as_ref()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "[{}] {:?} {} {}: {}",
        event.timestamp.format("%H:%M:%S"),
        event.event_type,
        event.agent_id.as_deref().unwrap_or("-"),
        task,
        event.message
    );
}

async fn status(config: SystemConfig) -> Result<()> {
    let store = open_store(&config.storage).await?;
    let state = store.load().await.context("Failed to load coordinator state")?;

    println!("Agents ({}):", state.agents.len());
    for agent in &state.agents {
        let task = agent
            .current_task
            .as_ref()
            .map(|t| t.to_string())
            .unwrap_or_default();
        println!(
            "  {:<16} {:<12} {:<8} {}",
            agent.name,
            agent.role,
            agent.status.to_string(),
            task
        );
    }

    println!("Locks ({}):", state.locks.len());
    for lock in &state.locks {
        println!("  {:<40} {:<16} {}", lock.path.display(), lock.owner, lock.description);
    }

    println!("Tasks ({}):", state.tasks.len());
    for task in &state.tasks {
        println!(
            "  {:<20} {:<10} {:<16} {}",
            task.id.as_str(),
            task.status.to_string(),
            task.assigned_agent.as_deref().unwrap_or("-"),
            task.failure.as_deref().unwrap_or(&task.description)
        );
    }
    Ok(())
}
