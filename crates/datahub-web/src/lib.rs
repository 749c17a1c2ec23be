//! Read-only JSON dashboard API over reviewer progress and coverage.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use datahub_adapters::{JsonFileRecordStore, RecordStore, RemoteTabularReader, TabularSource};
use datahub_core::{DataType, SubmissionEntry, Table};
use datahub_metrics::{
    is_ngram_entry, merchant_collection_summary, reconcile, scope_entries, source_entries,
    FileError, MerchantCollectionSummary, ReconciliationReport, ReviewerTable, SourceFile,
};
use datahub_storage::{ProcessedFile, ProcessedFileCache, TabularError};
use datahub_sync::DataHubConfig;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "datahub-web";

const TABLE_MEMO_CAPACITY: usize = 256;

/// Decoded tables keyed by file identity rather than URL; the oldest entry goes first.
struct TableMemo {
    capacity: usize,
    order: VecDeque<String>,
    tables: HashMap<String, Table>,
}

impl TableMemo {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            tables: HashMap::new(),
        }
    }

    fn get(&self, key: &str) -> Option<Table> {
        self.tables.get(key).cloned()
    }

    fn insert(&mut self, key: String, table: Table) {
        if self.tables.insert(key.clone(), table).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.tables.remove(&oldest);
            }
        }
    }
}

pub struct AppState {
    records: Arc<dyn RecordStore>,
    files: Arc<dyn TabularSource>,
    processed: Mutex<ProcessedFileCache>,
    tables: Mutex<TableMemo>,
}

impl AppState {
    pub fn new(
        records: Arc<dyn RecordStore>,
        files: Arc<dyn TabularSource>,
        processed: ProcessedFileCache,
    ) -> Self {
        Self {
            records,
            files,
            processed: Mutex::new(processed),
            tables: Mutex::new(TableMemo::new(TABLE_MEMO_CAPACITY)),
        }
    }

    async fn load_source(&self, source: &SourceFile) -> Result<Table, TabularError> {
        let key = format!("source/{}/{}", source.title, source.file_name);
        if let Some(table) = self.tables.lock().await.get(&key) {
            return Ok(table);
        }
        let table = self.files.read_table(&source.file_url).await?;
        self.tables.lock().await.insert(key, table.clone());
        Ok(table)
    }

    /// Memo first, then the processed-file snapshot, and only then the remote file.
    async fn load_submission(
        &self,
        kind: DataType,
        entry: &SubmissionEntry,
        file: &ProcessedFile,
    ) -> Result<Table, TabularError> {
        let key = format!("{kind}/{}", file.key());
        if let Some(table) = self.tables.lock().await.get(&key) {
            return Ok(table);
        }

        let snapshot = self
            .processed
            .lock()
            .await
            .load_table(kind, &file.file_name, file.date)
            .await;
        match snapshot {
            Ok(Some(table)) => {
                debug!(file_name = %file.file_name, %kind, "table restored from processed-file cache");
                self.tables.lock().await.insert(key, table.clone());
                return Ok(table);
            }
            Ok(None) => {}
            Err(err) => warn!(
                file_name = %file.file_name,
                error = %format!("{err:#}"),
                "processed-file snapshot unreadable; fetching again"
            ),
        }

        let table = self.files.read_table(&entry.file_url).await?;
        {
            let mut processed = self.processed.lock().await;
            processed.record(kind, file.clone());
            if let Err(err) = processed.store_table(kind, file, &table).await {
                warn!(file_name = %file.file_name, error = %format!("{err:#}"), "storing table snapshot failed");
            }
        }
        self.tables.lock().await.insert(key, table.clone());
        Ok(table)
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ProgressQuery {
    source: String,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub source: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub report: ReconciliationReport,
    pub merchants: MerchantCollectionSummary,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sources", get(sources_handler))
        .route("/api/progress", get(progress_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &DataHubConfig) -> anyhow::Result<()> {
    let records = Arc::new(JsonFileRecordStore::new(config.record_store_path.clone()));
    let files = Arc::new(RemoteTabularReader::new(datahub_sync::http_fetcher(config)?));
    let processed = ProcessedFileCache::load(config.processed_cache_path.clone()).await?;
    let state = AppState::new(records, files, processed);

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "dashboard api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(&DataHubConfig::from_env()).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": CRATE_NAME }))
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.records.query_all().await {
        Ok(entries) => Json(source_entries(&entries)).into_response(),
        Err(err) => ApiError::new(StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    }
}

async fn progress_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProgressQuery>,
) -> Result<Json<ProgressResponse>, ApiError> {
    let start = query.start.unwrap_or(NaiveDate::MIN);
    let end = query.end.unwrap_or(NaiveDate::MAX);
    if start > end {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "start is after end"));
    }

    let entries = state
        .records
        .query_all()
        .await
        .map_err(|err| ApiError::new(StatusCode::BAD_GATEWAY, err.to_string()))?;
    let source = source_entries(&entries)
        .into_iter()
        .find(|s| s.title == query.source)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown source `{}`", query.source)))?;
    let source_table = state.load_source(&source).await.map_err(|err| {
        ApiError::new(StatusCode::BAD_GATEWAY, format!("{}: {err}", source.file_name))
    })?;

    let scoped = scope_entries(&entries, &query.source, start, end);
    let loaded = load_scoped_files(&state, &scoped).await;

    let mut report = reconcile(&source_table, &loaded.reviewer_tables)
        .map_err(|err| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()))?;
    report.file_errors.extend(loaded.file_errors);
    let merchants = merchant_collection_summary(
        loaded
            .merchant_tables
            .iter()
            .map(|(member, table)| (member.as_str(), table)),
    );

    if let Err(err) = state.processed.lock().await.save().await {
        warn!(error = %format!("{err:#}"), "saving processed-file cache failed");
    }

    Ok(Json(ProgressResponse {
        source: query.source,
        start,
        end,
        report,
        merchants,
    }))
}

#[derive(Default)]
struct LoadedFiles {
    reviewer_tables: Vec<ReviewerTable>,
    merchant_tables: Vec<(String, Table)>,
    file_errors: Vec<FileError>,
}

fn dashboard_kind(entry: &SubmissionEntry) -> Option<DataType> {
    if is_ngram_entry(entry) {
        Some(DataType::Ngrams)
    } else if entry.data_type == Some(DataType::Merchants) {
        Some(DataType::Merchants)
    } else {
        None
    }
}

/// Loads every ngram and merchants file in scope once per `(file name, date)`, preferring
/// tables already held by the processed-file cache. A file that cannot be read is reported
/// and the rest still load.
async fn load_scoped_files(state: &AppState, scoped: &[&SubmissionEntry]) -> LoadedFiles {
    let mut loaded = LoadedFiles::default();
    let mut seen = HashSet::new();
    for entry in scoped {
        let Some(kind) = dashboard_kind(entry) else {
            continue;
        };
        let file = ProcessedFile {
            team_member: entry.reviewer().to_string(),
            file_name: entry.file_name.clone(),
            date: entry.submission_date,
        };
        if !seen.insert((kind, file.key())) {
            continue;
        }

        let table = match state.load_submission(kind, entry, &file).await {
            Ok(table) => table,
            Err(err) => {
                warn!(entry_id = %entry.id, file_name = %entry.file_name, error = %err, "dashboard file unreadable");
                loaded.file_errors.push(FileError {
                    reviewer: entry.reviewer().to_string(),
                    file_name: entry.file_name.clone(),
                    message: err.to_string(),
                });
                continue;
            }
        };

        match kind {
            DataType::Merchants => loaded
                .merchant_tables
                .push((entry.reviewer().to_string(), table)),
            _ => loaded.reviewer_tables.push(ReviewerTable {
                reviewer: entry.reviewer().to_string(),
                file_name: entry.file_name.clone(),
                date: entry.submission_date,
                table,
            }),
        }
    }
    loaded
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use datahub_adapters::{InMemoryRecordStore, InMemoryTabularSource, StubFile};
    use datahub_core::{EntryType, PopulatedFlag};
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn entry(id: &str, entry_type: EntryType, data_type: Option<DataType>, member: &str, day: u32) -> SubmissionEntry {
        SubmissionEntry {
            id: id.to_string(),
            title: "Egypt Q1".into(),
            entry_type,
            data_type,
            team_member: Some(member.to_string()),
            file_url: format!("https://files.example.com/{id}.csv"),
            file_name: format!("{id}.csv"),
            submission_date: NaiveDate::from_ymd_opt(2026, 4, day).unwrap(),
            created_at: Utc.with_ymd_and_hms(2026, 4, day, 9, 0, 0).single().unwrap(),
            validation_labels: vec![],
            validated: None,
            populated: PopulatedFlag::Empty,
        }
    }

    fn ngrams(rows: &[&[&str]]) -> Table {
        Table::from_rows(&["description", "ngram", "merchant_id"], rows)
    }

    fn state(processed_path: std::path::PathBuf) -> AppState {
        let records = InMemoryRecordStore::new(vec![
            entry("source", EntryType::Source, None, "lead", 1),
            entry("amira-1", EntryType::NgramFile, Some(DataType::Ngrams), "amira", 3),
            entry("omar-1", EntryType::NgramFile, Some(DataType::Ngrams), "omar", 4),
            entry("omar-2", EntryType::NgramFile, Some(DataType::Ngrams), "omar", 5),
            entry("merchants-1", EntryType::Submission, Some(DataType::Merchants), "amira", 6),
            entry("late", EntryType::NgramFile, Some(DataType::Ngrams), "amira", 28),
        ]);
        let files = InMemoryTabularSource::new()
            .with_table(
                "https://files.example.com/source.csv",
                Table::from_rows(&["description"], &[&["A"], &["B"], &["C"], &["D"]]),
            )
            .with_table(
                "https://files.example.com/amira-1.csv",
                ngrams(&[&["A", "a", "eg-1"], &["B", "b", "0"]]),
            )
            .with_table(
                "https://files.example.com/omar-1.csv",
                ngrams(&[&["B", "b", "n-1"], &["C", "c", "eg-2"]]),
            )
            .with_file("https://files.example.com/omar-2.csv", StubFile::AccessDenied)
            .with_table(
                "https://files.example.com/merchants-1.csv",
                Table::from_rows(&["name"], &[&["Carrefour"], &["carrefour"], &["Talabat"]]),
            )
            .with_table("https://files.example.com/late.csv", ngrams(&[&["D", "d", "eg-3"]]));
        AppState::new(
            Arc::new(records),
            Arc::new(files),
            ProcessedFileCache::empty(processed_path),
        )
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let dir = tempdir().unwrap();
        let (status, body) = get_json(app(state(dir.path().join("p.json"))), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn sources_lists_only_source_entries() {
        let dir = tempdir().unwrap();
        let (status, body) = get_json(app(state(dir.path().join("p.json"))), "/api/sources").await;
        assert_eq!(status, StatusCode::OK);
        let sources = body.as_array().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0]["file_name"], "source.csv");
    }

    #[tokio::test]
    async fn progress_reconciles_scoped_files_and_reports_errors_inline() {
        let dir = tempdir().unwrap();
        let processed_path = dir.path().join("processed.json");
        let (status, body) = get_json(
            app(state(processed_path.clone())),
            "/api/progress?source=Egypt%20Q1&start=2026-04-01&end=2026-04-10",
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let report = &body["report"];
        assert_eq!(report["total_source"], 4);
        assert_eq!(report["overlapped"], 1);
        assert_eq!(report["aggregate_matched"], 3);
        assert_eq!(report["remaining"], 1);
        let errors = report["file_errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["file_name"], "omar-2.csv");
        assert_eq!(body["merchants"]["per_member"]["amira"], 2);

        let cache = ProcessedFileCache::load(processed_path).await.unwrap();
        assert_eq!(cache.files(DataType::Ngrams).len(), 2);
        assert_eq!(cache.files(DataType::Merchants).len(), 1);
    }

    #[tokio::test]
    async fn repeated_refreshes_reuse_loaded_tables() {
        let dir = tempdir().unwrap();
        let files = Arc::new(
            InMemoryTabularSource::new()
                .with_table("https://files.example.com/source.csv", Table::from_rows(&["description"], &[&["A"]]))
                .with_table("https://files.example.com/amira-1.csv", ngrams(&[&["A", "a", "eg-1"]])),
        );
        let records = Arc::new(InMemoryRecordStore::new(vec![
            entry("source", EntryType::Source, None, "lead", 1),
            entry("amira-1", EntryType::NgramFile, Some(DataType::Ngrams), "amira", 3),
        ]));
        let router = app(AppState::new(records, files.clone(), ProcessedFileCache::empty(dir.path().join("p.json"))));

        for _ in 0..3 {
            let (status, _) = get_json(router.clone(), "/api/progress?source=Egypt%20Q1").await;
            assert_eq!(status, StatusCode::OK);
        }
        assert_eq!(files.read_count(), 2);
    }

    #[tokio::test]
    async fn recorded_files_are_not_downloaded_again_after_restart() {
        let dir = tempdir().unwrap();
        let processed_path = dir.path().join("processed.json");
        // File links are re-signed on every record-store query.
        let signed = |sig: u32| {
            let mut source = entry("source", EntryType::Source, None, "lead", 1);
            let mut ngram = entry("amira-1", EntryType::NgramFile, Some(DataType::Ngrams), "amira", 3);
            source.file_url = format!("https://files.example.com/source.csv?sig={sig}");
            ngram.file_url = format!("https://files.example.com/amira-1.csv?sig={sig}");
            let files = InMemoryTabularSource::new()
                .with_table(&source.file_url, Table::from_rows(&["description"], &[&["A"], &["B"]]))
                .with_table(&ngram.file_url, ngrams(&[&["A", "a", "eg-1"]]));
            (Arc::new(InMemoryRecordStore::new(vec![source, ngram])), Arc::new(files))
        };

        let (records, files) = signed(1);
        let cache = ProcessedFileCache::load(&processed_path).await.unwrap();
        let (status, first) = get_json(
            app(AppState::new(records, files.clone(), cache)),
            "/api/progress?source=Egypt%20Q1",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(files.read_count(), 2);

        let (records, files) = signed(2);
        let cache = ProcessedFileCache::load(&processed_path).await.unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 4, 3).unwrap();
        assert!(cache.contains(DataType::Ngrams, "amira-1.csv", date));
        let (status, second) = get_json(
            app(AppState::new(records, files.clone(), cache)),
            "/api/progress?source=Egypt%20Q1",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        // Only the source list is fetched; the ngram file comes from the cache.
        assert_eq!(files.read_count(), 1);
        assert_eq!(second["report"], first["report"]);
    }

    #[test]
    fn table_memo_evicts_oldest_beyond_capacity() {
        let mut memo = TableMemo::new(2);
        for key in ["a", "b", "c"] {
            memo.insert(key.to_string(), Table::from_rows(&["description"], &[&[key]]));
        }
        memo.insert("b".to_string(), Table::default());

        assert!(memo.get("a").is_none());
        assert_eq!(memo.tables.len(), 2);
        assert_eq!(memo.order.len(), 2);
        assert_eq!(memo.get("c").unwrap().cell(0, 0), Some("c"));
    }

    #[tokio::test]
    async fn unknown_source_is_not_found() {
        let dir = tempdir().unwrap();
        let (status, body) = get_json(app(state(dir.path().join("p.json"))), "/api/progress?source=Mars").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("Mars"));
    }
}
