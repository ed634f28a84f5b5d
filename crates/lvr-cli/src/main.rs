use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use lvr_adapters::{refresh_catalog, CatalogStore, SnapshotPageSource};
use lvr_storage::DataLayout;
use lvr_sync::{Pipeline, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lvr-cli")]
#[command(about = "LVR open-data harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one pipeline pass: check the notice, fetch, transform, load.
    Run,
    /// Start the cron scheduler and run until interrupted.
    Schedule,
    /// Refresh the historical period catalog only.
    Catalog,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = lvr_sync::run_once_from_env().await?;
            println!(
                "run complete: run_id={} changed={} reason={} periods_fetched={} rows_loaded={} failed={}",
                summary.run_id,
                summary.changed,
                summary.reason,
                summary.periods_fetched,
                summary.rows_loaded,
                summary.periods_failed.len()
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(Pipeline::new(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                eprintln!("scheduler disabled; set LVR_SCHEDULER_ENABLED=1 to enable");
                return Ok(());
            };
            sched.start().await?;
            info!("scheduler started; waiting for interrupt");
            tokio::signal::ctrl_c().await?;
            sched.shutdown().await?;
        }
        Commands::Catalog => {
            let layout = DataLayout::new(&config.data_root);
            let page = SnapshotPageSource::new(&config.notice_dump, &config.period_page_dump);
            let store = CatalogStore::new(layout.catalog_path());
            let refresh = refresh_catalog(&page, &store).await?;
            println!(
                "catalog refresh: updated={} added={:?}",
                refresh.updated, refresh.added
            );
        }
    }

    Ok(())
}
