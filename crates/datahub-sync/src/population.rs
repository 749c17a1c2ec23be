//! Ingests validated merchant and reviewed-transaction submissions into the catalog.
//!
//! Merchant files run before transaction files so transactions can reference merchants
//! submitted in the same run. Every row is attempted; row failures are logged and counted,
//! never propagated past the row.

use std::io::Cursor;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datahub_adapters::{RecordStore, TabularSource};
use datahub_core::{
    DataType, LogoRecord, LogoStatus, NewMerchant, NewTransaction, Row, SubmissionEntry, Table,
    SUBMISSION_MERCHANT_SOURCE_ID,
};
use datahub_storage::{FetchError, HttpFetcher, LogoBlobStore};
use image::ImageFormat;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::{CatalogError, CatalogStore};
use crate::config::{LogoFailurePolicy, PartialFailurePolicy};

pub const TRANSACTION_STATUS: &str = "complete";
pub const TRANSACTION_CLIENT_ID: i64 = 1;
pub const EXTRACTED_MERCHANT_COLUMN: &str = "extracted_merchant_for_review";

/// Downloads logo images referenced by merchant rows.
#[async_trait]
pub trait LogoSource: Send + Sync {
    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[async_trait]
impl LogoSource for HttpFetcher {
    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        Ok(self.fetch_bytes(url).await?.body)
    }
}

/// PNG URLs pass through untouched; anything else is decoded and re-encoded as PNG.
pub fn normalize_to_png(url: &str, bytes: &[u8]) -> Result<Vec<u8>, image::ImageError> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if path.to_ascii_lowercase().ends_with(".png") {
        return Ok(bytes.to_vec());
    }
    let decoded = image::load_from_memory(bytes)?;
    let mut out = Cursor::new(Vec::new());
    decoded.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

#[derive(Debug, Error)]
pub enum RowFailure {
    #[error("missing value for `{0}`")]
    MissingValue(&'static str),
    #[error("country `{0}` is not in the catalog")]
    UnknownCountry(String),
    #[error("category `{0}` is not in the catalog")]
    UnknownCategory(String),
    #[error("logo {url}: {message}")]
    Logo { url: String, message: String },
    #[error("blob storage: {0}")]
    Storage(String),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    pub row: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub rows: usize,
    pub inserted: usize,
    /// Rows intentionally left alone: already in the catalog, blank description, unknown merchant.
    pub skipped: usize,
    pub failures: Vec<RowError>,
}

impl IngestReport {
    fn fail(&mut self, row: usize, failure: &RowFailure) {
        warn!(row, error = %failure, "row ingestion failed");
        self.failures.push(RowError {
            row,
            message: failure.to_string(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryOutcome {
    pub entry_id: String,
    pub file_name: String,
    pub data_type: DataType,
    pub report: IngestReport,
    pub marked_done: bool,
    /// Set when the file itself could not be read.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PopulationSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entries: Vec<EntryOutcome>,
    pub merchants_inserted: usize,
    pub transactions_inserted: usize,
    pub row_failures: usize,
}

enum RowResult {
    Inserted,
    Skipped(&'static str),
}

pub struct PopulationPipeline {
    records: Arc<dyn RecordStore>,
    files: Arc<dyn TabularSource>,
    catalog: Arc<dyn CatalogStore>,
    logos: Arc<dyn LogoSource>,
    blobs: LogoBlobStore,
    partial_failure: PartialFailurePolicy,
    logo_failure: LogoFailurePolicy,
    run_lock: Mutex<()>,
}

impl PopulationPipeline {
    pub fn new(
        records: Arc<dyn RecordStore>,
        files: Arc<dyn TabularSource>,
        catalog: Arc<dyn CatalogStore>,
        logos: Arc<dyn LogoSource>,
        blobs: LogoBlobStore,
    ) -> Self {
        Self {
            records,
            files,
            catalog,
            logos,
            blobs,
            partial_failure: PartialFailurePolicy::default(),
            logo_failure: LogoFailurePolicy::default(),
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_policies(mut self, partial_failure: PartialFailurePolicy, logo_failure: LogoFailurePolicy) -> Self {
        self.partial_failure = partial_failure;
        self.logo_failure = logo_failure;
        self
    }

    pub async fn run_once(&self) -> Result<PopulationSummary> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| anyhow::anyhow!("a population run is already in progress"))?;

        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let entries = self
            .records
            .query_unpopulated()
            .await
            .context("querying unpopulated submissions")?;

        let (merchants, transactions): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .filter(|e| {
                matches!(
                    e.data_type,
                    Some(DataType::Merchants) | Some(DataType::ReviewedTransactions)
                )
            })
            .partition(|e| e.data_type == Some(DataType::Merchants));
        info!(
            %run_id,
            merchant_files = merchants.len(),
            transaction_files = transactions.len(),
            "population run started"
        );

        let mut outcomes = Vec::with_capacity(merchants.len() + transactions.len());
        for entry in merchants.iter().chain(transactions.iter()) {
            let Some(data_type) = entry.data_type else {
                continue;
            };
            let span = info_span!("populate_entry", entry_id = %entry.id, file_name = %entry.file_name);
            outcomes.push(self.populate_entry(entry, data_type).instrument(span).await);
        }

        let count = |kind: DataType| -> usize {
            outcomes
                .iter()
                .filter(|o| o.data_type == kind)
                .map(|o| o.report.inserted)
                .sum()
        };
        let summary = PopulationSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            merchants_inserted: count(DataType::Merchants),
            transactions_inserted: count(DataType::ReviewedTransactions),
            row_failures: outcomes.iter().map(|o| o.report.failures.len()).sum(),
            entries: outcomes,
        };
        info!(
            %run_id,
            merchants = summary.merchants_inserted,
            transactions = summary.transactions_inserted,
            row_failures = summary.row_failures,
            "population run finished"
        );
        Ok(summary)
    }

    async fn populate_entry(&self, entry: &SubmissionEntry, data_type: DataType) -> EntryOutcome {
        let mut outcome = EntryOutcome {
            entry_id: entry.id.clone(),
            file_name: entry.file_name.clone(),
            data_type,
            report: IngestReport::default(),
            marked_done: false,
            error: None,
        };

        let transactions = match data_type {
            DataType::Merchants => false,
            DataType::ReviewedTransactions => true,
            DataType::Ngrams => {
                warn!(%data_type, "no ingestion for this data type; entry left untouched");
                outcome.error = Some(format!("{data_type} files are not ingested"));
                return outcome;
            }
        };

        let table = match self.files.read_table(&entry.file_url).await {
            Ok(table) => table,
            Err(err) => {
                warn!(error = %err, "reading submission failed; leaving it for the next run");
                outcome.error = Some(err.to_string());
                return outcome;
            }
        };

        outcome.report = if transactions {
            self.ingest_transactions(&table).await
        } else {
            self.ingest_merchants(&table).await
        };

        let clean = outcome.report.failures.is_empty();
        if !clean && self.partial_failure == PartialFailurePolicy::LeaveForRetry {
            warn!(failures = outcome.report.failures.len(), "row failures; entry left for retry");
            return outcome;
        }
        match self.records.set_populated_done(&entry.id).await {
            Ok(()) => outcome.marked_done = true,
            Err(err) => warn!(error = %err, "marking entry populated failed"),
        }
        info!(
            rows = outcome.report.rows,
            inserted = outcome.report.inserted,
            skipped = outcome.report.skipped,
            failures = outcome.report.failures.len(),
            "entry populated"
        );
        outcome
    }

    pub async fn ingest_merchants(&self, table: &Table) -> IngestReport {
        let mut report = IngestReport {
            rows: table.len(),
            ..Default::default()
        };
        for row in table.rows() {
            match self.ingest_merchant_row(&row).await {
                Ok(Some(merchant_id)) => {
                    info!(row = row.index(), merchant_id, "merchant inserted");
                    report.inserted += 1;
                }
                Ok(None) => {
                    tracing::debug!(row = row.index(), "merchant already in catalog");
                    report.skipped += 1;
                }
                Err(failure) => report.fail(row.index(), &failure),
            }
        }
        report
    }

    /// `None` when a validated merchant with the same name already exists in the country,
    /// which keeps re-runs of a partially failed file from duplicating merchants.
    async fn ingest_merchant_row(&self, row: &Row<'_>) -> Result<Option<i64>, RowFailure> {
        let name = row.get("name").ok_or(RowFailure::MissingValue("name"))?;
        let country_name = row.get("country").ok_or(RowFailure::MissingValue("country"))?;
        let category_name = row.get("category").ok_or(RowFailure::MissingValue("category"))?;

        let country = self
            .catalog
            .resolve_country(&country_name.to_lowercase())
            .await?
            .ok_or_else(|| RowFailure::UnknownCountry(country_name.to_string()))?;
        if self.catalog.validated_merchant_exists(name, country.id).await? {
            return Ok(None);
        }
        let genify_merchant_id = self.catalog.next_genify_merchant_id(&country.iso2).await?;
        let category = self
            .catalog
            .resolve_category(category_name)
            .await?
            .ok_or_else(|| RowFailure::UnknownCategory(category_name.to_string()))?;

        let logo_id = match row.get("logo_url") {
            None => None,
            Some(url) => match self.store_logo(name, url).await {
                Ok(logo) => Some(logo.id),
                Err(failure) if self.logo_failure == LogoFailurePolicy::InsertWithoutLogo => {
                    warn!(row = row.index(), error = %failure, "inserting merchant without logo");
                    None
                }
                Err(failure) => return Err(failure),
            },
        };

        let merchant = NewMerchant {
            uuid: Uuid::new_v4(),
            date_created: Utc::now(),
            validated: true,
            validation_comment: row.get("comment").map(ToString::to_string),
            name: name.to_string(),
            category: category_name.to_string(),
            subcategory: row.get("subcategory").map(ToString::to_string),
            website: row.get("website").unwrap_or_default().to_string(),
            country_id: country.id,
            source_id: SUBMISSION_MERCHANT_SOURCE_ID,
            logo_id,
            genify_merchant_id,
            category_id: category.id,
            genify_category_id: category.genify_category_id,
        };
        Ok(Some(self.catalog.insert_merchant(&merchant).await?))
    }

    async fn store_logo(&self, merchant_name: &str, url: &str) -> Result<LogoRecord, RowFailure> {
        let logo_error = |message: String| RowFailure::Logo {
            url: url.to_string(),
            message,
        };
        let bytes = self
            .logos
            .download(url)
            .await
            .map_err(|err| logo_error(err.to_string()))?;
        let png = normalize_to_png(url, &bytes).map_err(|err| logo_error(err.to_string()))?;

        let key = LogoBlobStore::logo_key(merchant_name);
        let blob = self
            .blobs
            .put(&key, &png)
            .await
            .map_err(|err| RowFailure::Storage(format!("{err:#}")))?;
        Ok(self.catalog.upsert_logo(&blob.public_url, &blob.key).await?)
    }

    pub async fn ingest_transactions(&self, table: &Table) -> IngestReport {
        let mut report = IngestReport {
            rows: table.len(),
            ..Default::default()
        };
        for row in table.rows() {
            match self.ingest_transaction_row(&row).await {
                Ok(RowResult::Inserted) => report.inserted += 1,
                Ok(RowResult::Skipped(reason)) => {
                    tracing::debug!(row = row.index(), reason, "transaction row skipped");
                    report.skipped += 1;
                }
                Err(failure) => report.fail(row.index(), &failure),
            }
        }
        report
    }

    async fn ingest_transaction_row(&self, row: &Row<'_>) -> Result<RowResult, RowFailure> {
        let Some(description) = row.get("description") else {
            return Ok(RowResult::Skipped("blank description"));
        };
        let Some(merchant_name) = row.get(EXTRACTED_MERCHANT_COLUMN) else {
            return Ok(RowResult::Skipped("no extracted merchant"));
        };
        let Some(merchant) = self.catalog.find_validated_merchant(merchant_name).await? else {
            return Ok(RowResult::Skipped("merchant not in catalog"));
        };
        if self.catalog.validated_transaction_exists(description).await? {
            return Ok(RowResult::Skipped("already ingested"));
        }

        let logo = match merchant.logo_id {
            Some(id) => self.catalog.logo_url(id).await?,
            None => None,
        };
        let category_id = match merchant.category.as_deref() {
            Some(category) => self.catalog.genify_category_id_by_name(category).await?,
            None => None,
        };
        let now = Utc::now();
        let transaction = NewTransaction {
            raw_description: description.to_string(),
            category_id,
            uuid: Uuid::new_v4(),
            category_name: merchant.category.clone(),
            merchant_website: merchant.website.clone(),
            logo,
            client_id: TRANSACTION_CLIENT_ID,
            status: TRANSACTION_STATUS.to_string(),
            date: now.date_naive(),
            clean_description: merchant_name.to_string(),
            subcategory_name: merchant.subcategory.clone(),
            display_description: merchant_name.to_string(),
            validated: true,
            validation_date: now,
            merchant_ids: vec![merchant.id],
            logo_status: if merchant.logo_id.is_some() {
                LogoStatus::Found
            } else {
                LogoStatus::NotFound
            },
            genify_clean_description: merchant_name.to_string(),
        };
        if self.catalog.insert_transaction(&transaction).await? {
            Ok(RowResult::Inserted)
        } else {
            Ok(RowResult::Skipped("already ingested"))
        }
    }
}
