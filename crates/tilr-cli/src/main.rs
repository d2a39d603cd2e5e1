use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tilr_adapters::{FixtureSource, IssueTrackerSource, TicketingSource};
use tilr_core::Phase;
use tilr_storage::ContinuationStore;
use tilr_sync::{
    init_tables, Controller, ControllerSettings, Daemon, StoredTriggers, SyncConfig, TickOutcome,
    TriggerRegistry,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tilr")]
#[command(about = "Ticket/issue link reconciler")]
struct Cli {
    /// Serve both systems from a fixture bundle instead of the live APIs.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create any missing tables.
    Init,
    /// Daily entry point: begin a cycle, or resume the one in flight.
    Start,
    /// Recurring entry point: advance the cycle in flight by one step.
    Continue,
    /// Run the daily schedule and continue trigger in-process.
    Daemon,
    /// Print the continuation state.
    Status,
}

type Sources = (Arc<dyn TicketingSource>, Arc<dyn IssueTrackerSource>);

fn sources(cli: &Cli, config: &SyncConfig) -> Result<Sources> {
    match &cli.fixtures {
        Some(path) => {
            let source = Arc::new(
                FixtureSource::load(path)
                    .with_context(|| format!("loading fixtures from {}", path.display()))?,
            );
            Ok((source.clone(), source))
        }
        None => config.http_sources(),
    }
}

fn controller(
    config: &SyncConfig,
    (ticketing, tracker): Sources,
    continuation: Arc<dyn ContinuationStore>,
    triggers: Arc<dyn TriggerRegistry>,
) -> Result<Controller> {
    Ok(Controller::new(
        Arc::new(config.table_store()),
        continuation,
        ticketing,
        tracker,
        triggers,
        ControllerSettings {
            chunk_size: config.chunk_size,
            continue_every: config.continue_every,
            archive_policy: config.archive_policy()?,
        },
    ))
}

fn report(outcome: TickOutcome) -> Result<()> {
    match outcome {
        TickOutcome::Stalled { phase, kind } => bail!("{phase} step failed ({kind}); state unchanged"),
        other => {
            println!("{other:?}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let continuation: Arc<dyn ContinuationStore> = Arc::new(config.continuation_store());
    let stored = Arc::new(StoredTriggers::new(continuation.clone()));

    match cli.command.as_ref().unwrap_or(&Commands::Status) {
        Commands::Init => {
            let created = init_tables(&config.table_store()).await?;
            println!(
                "tables ready under {} (created: {})",
                config.tables_dir().display(),
                created.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", ")
            );
        }
        Commands::Start => {
            let controller = controller(&config, sources(&cli, &config)?, continuation, stored)?;
            report(controller.start_cycle().await)?;
        }
        Commands::Continue => {
            let controller = controller(&config, sources(&cli, &config)?, continuation, stored)?;
            report(controller.continue_cycle().await)?;
        }
        Commands::Daemon => {
            let daemon = Daemon::new().await?;
            let controller = controller(
                &config,
                sources(&cli, &config)?,
                continuation,
                daemon.triggers(),
            )?;
            info!(data_dir = %config.data_dir.display(), "starting daemon");
            daemon
                .run(controller, &config.sync_cron, config.continue_every)
                .await?;
        }
        Commands::Status => {
            let state = tilr_sync::state::load_state(continuation.as_ref()).await?;
            println!("phase={}", state.phase);
            println!("fetch_cursor={}", state.fetch_cursor);
            if state.phase == Phase::Running {
                println!("chunk_cursor={}", state.chunk_cursor);
            }
            if let Some(cycle_id) = state.cycle_id {
                println!("cycle_id={cycle_id}");
            }
            match stored.interval().await? {
                Some(every) => println!("continue_trigger=every {}s", every.as_secs()),
                None => println!("continue_trigger=none"),
            }
        }
    }

    Ok(())
}
