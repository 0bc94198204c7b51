//! registrysync CLI: run the indexer and drive project registration.
//!
//! Usage:
//! ```bash
//! registrysync run
//! registrysync status
//! registrysync next-step --project <uuid> --wallet 0x… [--curator]
//! registrysync repair --project <uuid>
//! registrysync plan-donation --project <uuid> --funder 0x… --amount <base units>
//! registrysync recover
//! ```
//!
//! Configuration comes from `REGISTRYSYNC_*` environment variables.
//! Exit status is 2 when the request itself was refused (unknown project,
//! wrong status, wrong wallet) and 1 for every other failure.

mod logging;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use registrysync_core::checkpoint::CheckpointStore;
use registrysync_core::config::SyncConfig;
use registrysync_core::error::SyncError;
use registrysync_core::handler::HandlerRegistry;
use registrysync_core::orchestrator::{Actor, RegistrationOrchestrator};
use registrysync_core::projector::Projector;
use registrysync_core::store::EventStore;
use registrysync_evm::{EvmLedger, EvmTxEncoder, HttpTransport, IndexerBuilder};
use registrysync_storage::SqliteStorage;

use logging::{init_tracing, LogConfig};

type Ledger = EvmLedger<HttpTransport>;
type Orchestrator = RegistrationOrchestrator<SqliteStorage, Ledger, EvmTxEncoder>;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "registrysync: keep a project database consistent with an on-chain registry",
    long_about = None
)]
struct Cli {
    /// Enable debug logging for the registrysync crates.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the recovery pass, then index until Ctrl-C.
    Run,
    /// Show stream checkpoints and event counts.
    Status,
    /// Print the next registration step as JSON.
    NextStep {
        #[arg(long)]
        project: Uuid,
        /// Wallet of the caller.
        #[arg(long)]
        wallet: String,
        /// The caller holds the curator role.
        #[arg(long)]
        curator: bool,
    },
    /// Re-read on-chain state for a project and repair the off-chain record.
    Repair {
        #[arg(long)]
        project: Uuid,
    },
    /// Print the transactions needed to donate `amount` base units.
    PlanDonation {
        #[arg(long)]
        project: Uuid,
        #[arg(long)]
        funder: String,
        #[arg(long)]
        amount: u128,
    },
    /// Re-apply events left pending by an interrupted run, then exit.
    Recover,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_status(&e))
        }
    }
}

fn exit_status(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<SyncError>() {
        Some(e) if e.is_client_error() => 2,
        _ => 1,
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = SyncConfig::from_env().context("loading REGISTRYSYNC_* configuration")?;

    let mut log = LogConfig {
        level: config.log_level.clone(),
        json: config.log_json,
        ..LogConfig::default()
    };
    if cli.verbose {
        for component in ["registrysync_core", "registrysync_evm", "registrysync_storage"] {
            log.components.insert(component.into(), "debug".into());
        }
    }
    init_tracing(&log);

    let store = Arc::new(
        SqliteStorage::open(&config.database_url)
            .await
            .with_context(|| format!("opening database {}", config.database_url))?,
    );

    match cli.command {
        Commands::Run => cmd_run(&config, store).await,
        Commands::Status => cmd_status(&config, &store).await,
        Commands::NextStep {
            project,
            wallet,
            curator,
        } => {
            let actor = if curator {
                Actor::curator(&wallet)
            } else {
                Actor::owner(&wallet)
            };
            let step = orchestrator(&config, store)?
                .next_step(project, &actor)
                .await?;
            print_json(&step)
        }
        Commands::Repair { project } => {
            let report = orchestrator(&config, store)?.repair(project).await?;
            print_json(&report)
        }
        Commands::PlanDonation {
            project,
            funder,
            amount,
        } => {
            let plan = orchestrator(&config, store)?
                .plan_donation(project, &funder, amount)
                .await?;
            print_json(&plan)
        }
        Commands::Recover => {
            let handlers = HandlerRegistry::standard(Arc::clone(&store), config.indexer.token_decimals);
            let projector = Projector::new(store, Arc::new(handlers));
            let recovered = projector.recover_pending(config.indexer.chain_id).await?;
            println!("Re-applied {recovered} pending event(s)");
            Ok(())
        }
    }
}

fn ledger(config: &SyncConfig) -> anyhow::Result<Arc<Ledger>> {
    let timeout = Duration::from_millis(config.rpc_timeout_ms);
    let transport = HttpTransport::new(config.rpc_url.clone(), timeout)?;
    Ok(Arc::new(EvmLedger::new(
        transport,
        &config.registry_address,
        config.token_address.as_deref(),
        timeout,
    )))
}

fn orchestrator(config: &SyncConfig, store: Arc<SqliteStorage>) -> anyhow::Result<Orchestrator> {
    let encoder = EvmTxEncoder::new(
        &config.registry_address,
        config.token_address.as_deref(),
        config.indexer.chain_id,
    );
    Ok(RegistrationOrchestrator::new(
        store,
        ledger(config)?,
        Arc::new(encoder),
        config.certificate_address(),
        config.indexer.token_decimals,
    ))
}

async fn cmd_run(config: &SyncConfig, store: Arc<SqliteStorage>) -> anyhow::Result<()> {
    let indexer = IndexerBuilder::from_sync_config(config).build(ledger(config)?, store)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested; finishing current cycle");
            let _ = shutdown_tx.send(true);
        }
    });

    tracing::info!(
        chain_id = config.indexer.chain_id,
        registry = %config.registry_address,
        rpc = %config.rpc_url,
        "Starting registrysync indexer"
    );
    indexer.run(shutdown_rx).await;
    tracing::info!(state = %indexer.state(), "Indexer stopped");
    Ok(())
}

async fn cmd_status(config: &SyncConfig, store: &SqliteStorage) -> anyhow::Result<()> {
    let chain_id = config.indexer.chain_id;
    let checkpoints = store.list_checkpoints(chain_id).await?;
    let events = store.event_count(chain_id).await?;
    let pending = store.pending_events(chain_id).await?.len();

    println!("registrysync {}", env!("CARGO_PKG_VERSION"));
    println!("  Chain id:        {chain_id}");
    println!("  Registry:        {}", config.registry_address);
    println!("  Certificate:     {}", config.certificate_address());
    println!("  Events recorded: {events}");
    println!("  Events pending:  {pending}");
    if checkpoints.is_empty() {
        println!("  Checkpoints:     none (indexing starts at block {})", config.indexer.start_block);
    } else {
        println!("  Checkpoints:");
        for cp in checkpoints {
            println!("    {:<60} {}", cp.stream_id, cp.block_number);
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn refused_requests_exit_with_two() {
        let refused = anyhow::Error::from(SyncError::Unauthorized("0xabc".into()));
        assert_eq!(exit_status(&refused), 2);
        let failed = anyhow::Error::from(SyncError::Network("timeout".into()));
        assert_eq!(exit_status(&failed), 1);
        let wrapped = anyhow::Error::from(SyncError::NotFound("project".into()))
            .context("planning next step");
        assert_eq!(exit_status(&wrapped), 2);
    }

    #[test]
    fn parses_next_step() {
        let id = Uuid::new_v4();
        let cli = Cli::parse_from([
            "registrysync",
            "next-step",
            "--project",
            &id.to_string(),
            "--wallet",
            "0xabc",
            "--curator",
        ]);
        match cli.command {
            Commands::NextStep {
                project, curator, ..
            } => {
                assert_eq!(project, id);
                assert!(curator);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
