//! Collaborator contracts: the submission record store and the remote tabular reader.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datahub_core::{EntryType, PopulatedFlag, SubmissionEntry, Table, ValidationLabel};
use datahub_storage::{decode_table, write_atomic, FetchError, HttpFetcher, TabularError, TabularFormat};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "datahub-adapters";

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("record store entry `{0}` not found")]
    NotFound(String),
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Query and writeback surface of the external record store tracking submissions.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Entries created strictly after `after` whose labels do not contain `OK`.
    async fn query_unvalidated_since(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Vec<SubmissionEntry>, RecordStoreError>;

    /// `Submission` entries with an empty populated flag, ascending by submission date.
    async fn query_unpopulated(&self) -> Result<Vec<SubmissionEntry>, RecordStoreError>;

    async fn query_all(&self) -> Result<Vec<SubmissionEntry>, RecordStoreError>;

    async fn set_validated_flag(&self, id: &str, validated: bool) -> Result<(), RecordStoreError>;

    async fn set_validation_labels(
        &self,
        id: &str,
        labels: &[ValidationLabel],
    ) -> Result<(), RecordStoreError>;

    async fn set_populated_done(&self, id: &str) -> Result<(), RecordStoreError>;
}

pub fn matches_validation_query(entry: &SubmissionEntry, after: DateTime<Utc>) -> bool {
    entry.created_at > after && !entry.is_labelled_ok()
}

pub fn matches_population_query(entry: &SubmissionEntry) -> bool {
    entry.entry_type == EntryType::Submission && entry.populated == PopulatedFlag::Empty
}

fn population_order(mut entries: Vec<SubmissionEntry>) -> Vec<SubmissionEntry> {
    entries.sort_by(|a, b| {
        a.submission_date
            .cmp(&b.submission_date)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
    entries
}

enum Mutation<'a> {
    Validated(bool),
    Labels(&'a [ValidationLabel]),
    PopulatedDone,
}

fn apply_mutation(
    entries: &mut [SubmissionEntry],
    id: &str,
    mutation: Mutation<'_>,
) -> Result<(), RecordStoreError> {
    let entry = entries
        .iter_mut()
        .find(|e| e.id == id)
        .ok_or_else(|| RecordStoreError::NotFound(id.to_string()))?;
    match mutation {
        Mutation::Validated(flag) => entry.validated = Some(flag),
        Mutation::Labels(labels) => entry.validation_labels = labels.to_vec(),
        Mutation::PopulatedDone => entry.populated = PopulatedFlag::Done,
    }
    Ok(())
}

/// Process-local record store, used for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    entries: Mutex<Vec<SubmissionEntry>>,
    unavailable: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryRecordStore {
    pub fn new(entries: Vec<SubmissionEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            ..Default::default()
        }
    }

    /// Make every query fail, simulating an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn push(&self, entry: SubmissionEntry) {
        self.entries.lock().await.push(entry);
    }

    pub async fn get(&self, id: &str) -> Option<SubmissionEntry> {
        self.entries.lock().await.iter().find(|e| e.id == id).cloned()
    }

    fn check_available(&self) -> Result<(), RecordStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RecordStoreError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }

    async fn mutate(&self, id: &str, mutation: Mutation<'_>) -> Result<(), RecordStoreError> {
        let mut entries = self.entries.lock().await;
        apply_mutation(&mut entries, id, mutation)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn query_unvalidated_since(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Vec<SubmissionEntry>, RecordStoreError> {
        self.check_available()?;
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .filter(|e| matches_validation_query(e, after))
            .cloned()
            .collect())
    }

    async fn query_unpopulated(&self) -> Result<Vec<SubmissionEntry>, RecordStoreError> {
        self.check_available()?;
        let entries = self.entries.lock().await;
        Ok(population_order(
            entries
                .iter()
                .filter(|e| matches_population_query(e))
                .cloned()
                .collect(),
        ))
    }

    async fn query_all(&self) -> Result<Vec<SubmissionEntry>, RecordStoreError> {
        self.check_available()?;
        Ok(self.entries.lock().await.clone())
    }

    async fn set_validated_flag(&self, id: &str, validated: bool) -> Result<(), RecordStoreError> {
        self.mutate(id, Mutation::Validated(validated)).await
    }

    async fn set_validation_labels(
        &self,
        id: &str,
        labels: &[ValidationLabel],
    ) -> Result<(), RecordStoreError> {
        self.mutate(id, Mutation::Labels(labels)).await
    }

    async fn set_populated_done(&self, id: &str) -> Result<(), RecordStoreError> {
        self.mutate(id, Mutation::PopulatedDone).await
    }
}

/// Record store persisted as a JSON array of entries, rewritten atomically on every update.
#[derive(Debug)]
pub struct JsonFileRecordStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_entries(&self) -> anyhow::Result<Vec<SubmissionEntry>> {
        if !tokio::fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking {}", self.path.display()))?
        {
            return Ok(Vec::new());
        }
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }

    async fn mutate(&self, id: &str, mutation: Mutation<'_>) -> Result<(), RecordStoreError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_entries().await?;
        apply_mutation(&mut entries, id, mutation)?;
        let bytes = serde_json::to_vec_pretty(&entries).context("serializing record store")?;
        write_atomic(&self.path, &bytes).await?;
        debug!(path = %self.path.display(), entry_id = id, "record store updated");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonFileRecordStore {
    async fn query_unvalidated_since(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Vec<SubmissionEntry>, RecordStoreError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .read_entries()
            .await?
            .into_iter()
            .filter(|e| matches_validation_query(e, after))
            .collect())
    }

    async fn query_unpopulated(&self) -> Result<Vec<SubmissionEntry>, RecordStoreError> {
        let _guard = self.lock.lock().await;
        let entries = self.read_entries().await?;
        Ok(population_order(
            entries.into_iter().filter(matches_population_query).collect(),
        ))
    }

    async fn query_all(&self) -> Result<Vec<SubmissionEntry>, RecordStoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_entries().await?)
    }

    async fn set_validated_flag(&self, id: &str, validated: bool) -> Result<(), RecordStoreError> {
        self.mutate(id, Mutation::Validated(validated)).await
    }

    async fn set_validation_labels(
        &self,
        id: &str,
        labels: &[ValidationLabel],
    ) -> Result<(), RecordStoreError> {
        self.mutate(id, Mutation::Labels(labels)).await
    }

    async fn set_populated_done(&self, id: &str) -> Result<(), RecordStoreError> {
        self.mutate(id, Mutation::PopulatedDone).await
    }
}

/// Turns a file URL into a decoded table.
#[async_trait]
pub trait TabularSource: Send + Sync {
    async fn read_table(&self, url: &str) -> Result<Table, TabularError>;
}

/// Downloads submitted files over HTTP and decodes csv, csv.gz or xlsx content.
#[derive(Debug, Clone)]
pub struct RemoteTabularReader {
    http: HttpFetcher,
}

impl RemoteTabularReader {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl TabularSource for RemoteTabularReader {
    async fn read_table(&self, url: &str) -> Result<Table, TabularError> {
        let response = self.http.fetch_bytes(url).await?;
        let format = TabularFormat::detect(response.content_type.as_deref(), url).ok_or_else(|| {
            TabularError::UnsupportedFormat {
                url: url.to_string(),
            }
        })?;
        decode_table(&response.body, format)
    }
}

#[derive(Debug, Clone)]
pub enum StubFile {
    Table(Table),
    Unsupported,
    AccessDenied,
}

/// Map-backed tabular source; unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct InMemoryTabularSource {
    files: std::sync::Mutex<HashMap<String, StubFile>>,
    reads: AtomicUsize,
}

impl InMemoryTabularSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, url: &str, table: Table) -> Self {
        self.insert(url, StubFile::Table(table));
        self
    }

    pub fn with_file(self, url: &str, file: StubFile) -> Self {
        self.insert(url, file);
        self
    }

    pub fn insert(&self, url: &str, file: StubFile) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(url.to_string(), file);
        }
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TabularSource for InMemoryTabularSource {
    async fn read_table(&self, url: &str) -> Result<Table, TabularError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let stub = self
            .files
            .lock()
            .ok()
            .and_then(|files| files.get(url).cloned());
        match stub {
            Some(StubFile::Table(table)) => Ok(table),
            Some(StubFile::Unsupported) => Err(TabularError::UnsupportedFormat {
                url: url.to_string(),
            }),
            Some(StubFile::AccessDenied) => Err(TabularError::Fetch(FetchError::AccessDenied {
                url: url.to_string(),
            })),
            None => Err(TabularError::Fetch(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use datahub_core::DataType;
    use tempfile::tempdir;

    fn entry(id: &str, day: u32, created_hour: u32) -> SubmissionEntry {
        SubmissionEntry {
            id: id.to_string(),
            title: "Egypt Q1".into(),
            entry_type: EntryType::Submission,
            data_type: Some(DataType::Merchants),
            team_member: Some("amira".into()),
            file_url: format!("https://files.example.com/{id}.csv"),
            file_name: format!("{id}.csv"),
            submission_date: NaiveDate::from_ymd_opt(2026, 3, day).unwrap(),
            created_at: Utc.with_ymd_and_hms(2026, 3, 10, created_hour, 0, 0).single().unwrap(),
            validation_labels: vec![],
            validated: None,
            populated: PopulatedFlag::Empty,
        }
    }

    #[tokio::test]
    async fn validation_query_excludes_ok_and_old_entries() {
        let mut ok = entry("ok", 1, 12);
        ok.validation_labels = vec![ValidationLabel::Ok];
        let mut bad = entry("bad", 1, 12);
        bad.validation_labels = vec![ValidationLabel::InvalidCountry];
        let store = InMemoryRecordStore::new(vec![ok, bad, entry("fresh", 1, 12), entry("old", 1, 1)]);

        let after = Utc.with_ymd_and_hms(2026, 3, 10, 6, 0, 0).single().unwrap();
        let ids: Vec<_> = store
            .query_unvalidated_since(after)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["bad", "fresh"]);
    }

    #[tokio::test]
    async fn population_query_sorts_by_submission_date() {
        let mut source = entry("source", 1, 1);
        source.entry_type = EntryType::Source;
        let mut done = entry("done", 2, 1);
        done.populated = PopulatedFlag::Done;
        let store = InMemoryRecordStore::new(vec![entry("late", 9, 1), source, done, entry("early", 3, 1)]);

        let ids: Vec<_> = store
            .query_unpopulated()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn unavailable_store_fails_queries() {
        let store = InMemoryRecordStore::new(vec![entry("a", 1, 1)]);
        store.set_unavailable(true);
        assert!(matches!(
            store.query_all().await,
            Err(RecordStoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn json_store_persists_writeback() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("records.json");
        std::fs::write(&path, serde_json::to_vec(&vec![entry("a", 1, 1)]).unwrap()).unwrap();

        let store = JsonFileRecordStore::new(&path);
        store
            .set_validation_labels("a", &[ValidationLabel::InvalidCategory])
            .await
            .unwrap();
        store.set_validated_flag("a", false).await.unwrap();
        store.set_populated_done("a").await.unwrap();
        assert!(matches!(
            store.set_populated_done("missing").await,
            Err(RecordStoreError::NotFound(_))
        ));

        let reopened = JsonFileRecordStore::new(&path);
        let all = reopened.query_all().await.unwrap();
        assert_eq!(all[0].validation_labels, vec![ValidationLabel::InvalidCategory]);
        assert_eq!(all[0].validated, Some(false));
        assert!(all[0].is_populated());
        assert!(reopened.query_unpopulated().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stub_tabular_source_reports_named_errors() {
        let source = InMemoryTabularSource::new()
            .with_table("https://f/a.csv", Table::from_rows(&["description"], &[&["X"]]))
            .with_file("https://f/b.pdf", StubFile::Unsupported)
            .with_file("https://f/c.csv", StubFile::AccessDenied);

        assert_eq!(source.read_table("https://f/a.csv").await.unwrap().len(), 1);
        assert!(matches!(
            source.read_table("https://f/b.pdf").await,
            Err(TabularError::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            source.read_table("https://f/c.csv").await,
            Err(TabularError::Fetch(FetchError::AccessDenied { .. }))
        ));
        assert_eq!(source.read_count(), 3);
    }
}
