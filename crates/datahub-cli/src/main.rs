use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use datahub_adapters::{JsonFileRecordStore, RemoteTabularReader};
use datahub_core::DataType;
use datahub_storage::ProcessedFileCache;
use datahub_sync::{DataHubConfig, PgCatalogStore, PopulationPipeline};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "datahub")]
#[command(about = "Data Hub submission tracker: validation, population and progress dashboards")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the record store and validate new submissions until Ctrl-C.
    Validate,
    /// Run a single validation cycle and print its report.
    ValidateOnce,
    /// Ingest validated merchant and transaction submissions.
    Populate {
        /// Keep running on DATAHUB_POPULATE_CRON (or --cron) instead of a single pass.
        #[arg(long)]
        schedule: bool,
        #[arg(long)]
        cron: Option<String>,
    },
    /// Serve the progress dashboard API.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Show or clear the processed-file cache.
    Cache {
        #[arg(long)]
        clear: bool,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

fn remote_sources(config: &DataHubConfig) -> Result<(Arc<JsonFileRecordStore>, Arc<RemoteTabularReader>)> {
    let records = Arc::new(JsonFileRecordStore::new(config.record_store_path.clone()));
    let files = Arc::new(RemoteTabularReader::new(datahub_sync::http_fetcher(config)?));
    Ok((records, files))
}

async fn population_pipeline(config: &DataHubConfig) -> Result<PopulationPipeline> {
    let (records, files) = remote_sources(config)?;
    let catalog = PgCatalogStore::connect(&config.database_url, Duration::from_secs(config.http_timeout_secs))
        .await
        .context("connecting to the catalog database")?;
    let logos = Arc::new(datahub_sync::http_fetcher(config)?);
    Ok(datahub_sync::population_from_config(
        config,
        records,
        files,
        Arc::new(catalog),
        logos,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = DataHubConfig::from_env();

    match cli.command.unwrap_or(Commands::Validate) {
        Commands::Validate => {
            let (records, files) = remote_sources(&config)?;
            let mut poller = datahub_sync::poller_from_config(&config, records, files)?;
            let (stop_tx, stop_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("ctrl-c received; stopping after the current cycle");
                    let _ = stop_tx.send(true);
                }
            });
            poller.run(stop_rx).await;
        }
        Commands::ValidateOnce => {
            let (records, files) = remote_sources(&config)?;
            let mut poller = datahub_sync::poller_from_config(&config, records, files)?;
            let report = poller.run_cycle().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Populate { schedule, cron } => {
            let pipeline = population_pipeline(&config).await?;
            if schedule {
                let cron = cron
                    .or_else(|| config.populate_cron.clone())
                    .context("--schedule needs --cron or DATAHUB_POPULATE_CRON")?;
                let mut sched = datahub_sync::build_population_scheduler(Arc::new(pipeline), &cron).await?;
                sched.start().await.context("starting scheduler")?;
                info!(%cron, "population scheduled; Ctrl-C to stop");
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                sched.shutdown().await.context("stopping scheduler")?;
            } else {
                let summary = pipeline.run_once().await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
        Commands::Serve => {
            datahub_web::serve(&config).await?;
        }
        Commands::Migrate => {
            let catalog = PgCatalogStore::connect(&config.database_url, Duration::from_secs(config.http_timeout_secs))
                .await
                .context("connecting to the catalog database")?;
            catalog.migrate().await.context("applying migrations")?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Cache { clear } => {
            let path = config.processed_cache_path.clone();
            if clear {
                ProcessedFileCache::empty(&path).clear().await?;
                println!("cleared {}", path.display());
            } else {
                let cache = ProcessedFileCache::load(&path).await?;
                for kind in [DataType::Merchants, DataType::ReviewedTransactions, DataType::Ngrams] {
                    println!("{kind}: {} file(s)", cache.files(kind).len());
                    for file in cache.files(kind) {
                        println!("  {} {} ({})", file.date, file.file_name, file.team_member);
                    }
                }
            }
        }
    }

    Ok(())
}
