use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use offplan_adapters::EstatyClient;
use offplan_storage::PgCatalogStore;
use offplan_sync::{DatabaseConfig, SyncConfig, SyncEngine};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod logging;

use logging::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "offplan-cli")]
#[command(about = "Off-plan catalog sync against the Estaty API")]
struct Cli {
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
    /// Print the run summary as JSON instead of a one-line report.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Walk every upstream page, reconcile each listing, then sweep deletions.
    FullSync,
    /// Check recently synced listings and escalate to a full pass on drift.
    Incremental {
        #[arg(long)]
        sample_size: Option<usize>,
        #[arg(long)]
        threshold: Option<usize>,
    },
    /// Mirror the upstream lookup tables.
    SyncReferences,
    Migrate,
    /// Run the cron jobs until interrupted.
    Schedule,
}

type Engine = SyncEngine<EstatyClient, PgCatalogStore>;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.log_format)?;

    match cli.command.unwrap_or(Commands::FullSync) {
        Commands::FullSync => {
            let config = SyncConfig::from_env()?;
            let engine = build_engine(&config).await?;
            let summary = engine.full_sync(&cancel_on_ctrl_c()).await?;
            if cli.json {
                print_json(&summary)?;
            } else {
                println!(
                    "full sync complete: run_id={} pages={} new={} changed={} partial={} unchanged={} failed={} deleted={}",
                    summary.run_id,
                    summary.pages,
                    summary.new,
                    summary.changed,
                    summary.partial_units_changed,
                    summary.unchanged,
                    summary.failed.len(),
                    summary.deleted()
                );
            }
        }
        Commands::Incremental {
            sample_size,
            threshold,
        } => {
            let mut config = SyncConfig::from_env()?;
            if let Some(sample_size) = sample_size {
                config.sample_size = sample_size;
            }
            if threshold.is_some() {
                config.unchanged_threshold = threshold;
            }
            let engine = build_engine(&config).await?;
            let report = engine.incremental(&cancel_on_ctrl_c()).await?;
            if cli.json {
                print_json(&report)?;
            } else {
                let drift = report
                    .drift
                    .map(|signal| signal.listing_id.to_string())
                    .unwrap_or_else(|| "none".to_string());
                println!(
                    "incremental check complete: run_id={} checked={} unchanged={} skipped={} drift={} escalated={}",
                    report.run_id,
                    report.checked,
                    report.unchanged,
                    report.skipped.len(),
                    drift,
                    report.escalated()
                );
            }
        }
        Commands::SyncReferences => {
            let config = SyncConfig::from_env()?;
            let engine = build_engine(&config).await?;
            let counts = engine.sync_references().await?;
            if cli.json {
                print_json(&counts)?;
            } else {
                println!(
                    "reference sync complete: upserted={} pruned={}",
                    counts.total_upserted(),
                    counts.total_pruned()
                );
            }
        }
        Commands::Migrate => {
            let database = DatabaseConfig::from_env()?;
            connect_store(&database).await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env()?;
            config.scheduler_enabled = true;
            let engine = Arc::new(build_engine(&config).await?);
            let cancel = CancellationToken::new();

            let Some(mut sched) =
                offplan_sync::build_scheduler(Arc::clone(&engine), &config, cancel.clone()).await?
            else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for interrupt")?;
            warn!("interrupt received; stopping scheduler");
            cancel.cancel();
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn connect_store(database: &DatabaseConfig) -> Result<PgCatalogStore> {
    let store = PgCatalogStore::connect(&database.url, database.max_connections)
        .await
        .context("connecting to the catalog database")?;
    store.migrate().await.context("running migrations")?;
    Ok(store)
}

async fn build_engine(config: &SyncConfig) -> Result<Engine> {
    let client = EstatyClient::new(config.api_config()).context("building the Estaty client")?;
    let store = connect_store(&config.database).await?;
    Ok(SyncEngine::new(client, store, config.engine_options()))
}

/// Token cancelled on the first Ctrl-C; the run stops at the next listing boundary.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current listing");
            trigger.cancel();
        }
    });
    token
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
