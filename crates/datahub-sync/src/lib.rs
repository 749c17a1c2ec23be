//! Validation polling, population and scheduling for the submission tracker.

pub mod catalog;
pub mod config;
pub mod poller;
pub mod population;
pub mod validator;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use datahub_adapters::{RecordStore, TabularSource};
use datahub_storage::{CheckpointTracker, HttpClientConfig, HttpFetcher, LogoBlobStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub use catalog::{CatalogError, CatalogStore, PgCatalogStore};
pub use config::{DataHubConfig, LogoFailurePolicy, PartialFailurePolicy, ReferenceData};
pub use poller::{CycleReport, PollState, Poller};
pub use population::{
    normalize_to_png, EntryOutcome, IngestReport, LogoSource, PopulationPipeline, PopulationSummary,
    RowFailure,
};
pub use validator::Validator;

pub const CRATE_NAME: &str = "datahub-sync";

pub fn http_fetcher(config: &DataHubConfig) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })
}

pub fn checkpoint_tracker(config: &DataHubConfig) -> CheckpointTracker {
    CheckpointTracker::new(config.checkpoint_path.clone(), config.lookback())
}

pub fn poller_from_config(
    config: &DataHubConfig,
    records: Arc<dyn RecordStore>,
    files: Arc<dyn TabularSource>,
) -> Result<Poller> {
    let reference = ReferenceData::from_dir(&config.reference_dir)
        .with_context(|| format!("loading reference data from {}", config.reference_dir.display()))?;
    Ok(Poller::new(
        records,
        files,
        Validator::new(reference),
        checkpoint_tracker(config),
        config.poll_interval,
    ))
}

pub fn population_from_config(
    config: &DataHubConfig,
    records: Arc<dyn RecordStore>,
    files: Arc<dyn TabularSource>,
    catalog: Arc<dyn CatalogStore>,
    logos: Arc<dyn LogoSource>,
) -> PopulationPipeline {
    PopulationPipeline::new(
        records,
        files,
        catalog,
        logos,
        LogoBlobStore::new(config.logo_dir.clone(), config.logo_base_url.clone()),
    )
    .with_policies(config.partial_failure_policy, config.logo_failure_policy)
}

/// Scheduler firing one population run per cron tick. Overlapping ticks are refused by the
/// pipeline's run lock and logged.
pub async fn build_population_scheduler(
    pipeline: Arc<PopulationPipeline>,
    cron: &str,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    merchants = summary.merchants_inserted,
                    transactions = summary.transactions_inserted,
                    "scheduled population run finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled population run failed"),
            }
        })
    })
    .with_context(|| format!("creating population job for cron {cron}"))?;
    sched.add(job).await.context("adding population job")?;
    Ok(sched)
}
