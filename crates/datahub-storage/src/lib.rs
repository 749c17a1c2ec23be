//! On-disk state, blob storage and HTTP/tabular transport for Data Hub.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use chrono::{DateTime, NaiveDate, Utc};
use datahub_core::{DataType, Table};
use flate2::read::GzDecoder;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "datahub-storage";

/// Write `bytes` to `path` through a sibling temp file and a rename, so readers never
/// observe a partially written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Persists the time of the last fully successful validation poll.
#[derive(Debug, Clone)]
pub struct CheckpointTracker {
    path: PathBuf,
    lookback: chrono::Duration,
}

impl CheckpointTracker {
    pub fn new(path: impl Into<PathBuf>, lookback: chrono::Duration) -> Self {
        Self {
            path: path.into(),
            lookback,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lookback(&self) -> chrono::Duration {
        self.lookback
    }

    /// Last persisted checkpoint, or `now - lookback` when nothing usable is on disk.
    pub async fn load(&self) -> DateTime<Utc> {
        match self.read_persisted().await {
            Ok(Some(ts)) => ts,
            Ok(None) => Utc::now() - self.lookback,
            Err(err) => {
                warn!(path = %self.path.display(), error = %format!("{err:#}"), "ignoring unreadable checkpoint");
                Utc::now() - self.lookback
            }
        }
    }

    /// Earliest creation time a fetch based on `checkpoint` must include.
    pub fn window_start(&self, checkpoint: DateTime<Utc>) -> DateTime<Utc> {
        checkpoint - self.lookback
    }

    /// Persist `at`, never moving the stored checkpoint backwards. Returns the value on disk.
    pub async fn save(&self, at: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
        if let Ok(Some(existing)) = self.read_persisted().await {
            if existing > at {
                warn!(%existing, requested = %at, "refusing to move checkpoint backwards");
                return Ok(existing);
            }
        }
        write_atomic(&self.path, at.to_rfc3339().as_bytes()).await?;
        Ok(at)
    }

    async fn read_persisted(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking {}", self.path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let ts = DateTime::parse_from_rfc3339(text.trim())
            .with_context(|| format!("parsing checkpoint {}", self.path.display()))?;
        Ok(Some(ts.with_timezone(&Utc)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedFile {
    pub team_member: String,
    pub file_name: String,
    pub date: NaiveDate,
}

impl ProcessedFile {
    pub fn key(&self) -> String {
        processed_key(&self.file_name, self.date)
    }
}

fn processed_key(file_name: &str, date: NaiveDate) -> String {
    format!("{file_name}|{date}")
}

/// Persisted memo of files already incorporated per data type, keyed by `(file name, date)`.
#[derive(Debug, Clone, Default)]
pub struct ProcessedFileCache {
    path: PathBuf,
    files: BTreeMap<String, BTreeMap<String, ProcessedFile>>,
}

impl ProcessedFileCache {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            files: BTreeMap::new(),
        }
    }

    pub async fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(Self::empty(path));
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let files = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self { path, files })
    }

    pub fn contains(&self, kind: DataType, file_name: &str, date: NaiveDate) -> bool {
        self.files
            .get(kind.as_str())
            .is_some_and(|m| m.contains_key(&processed_key(file_name, date)))
    }

    /// Record a file; returns `false` when the `(file name, date)` key was already present.
    pub fn record(&mut self, kind: DataType, file: ProcessedFile) -> bool {
        let bucket = self.files.entry(kind.as_str().to_string()).or_default();
        let key = file.key();
        if bucket.contains_key(&key) {
            return false;
        }
        bucket.insert(key, file);
        true
    }

    pub fn files(&self, kind: DataType) -> Vec<&ProcessedFile> {
        self.files
            .get(kind.as_str())
            .map(|m| m.values().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.files.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.files).context("serializing processed-file cache")?;
        write_atomic(&self.path, &bytes).await
    }

    /// Decoded tables of recorded files live beside the cache file, e.g. `processed.tables/`.
    pub fn tables_dir(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "processed".to_string());
        self.path.with_file_name(format!("{stem}.tables"))
    }

    fn table_path(&self, kind: DataType, file_name: &str, date: NaiveDate) -> PathBuf {
        let digest = sha256_hex(processed_key(file_name, date).as_bytes());
        self.tables_dir().join(kind.as_str()).join(format!("{digest}.json"))
    }

    pub async fn store_table(&self, kind: DataType, file: &ProcessedFile, table: &Table) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(table).context("serializing table snapshot")?;
        write_atomic(&self.table_path(kind, &file.file_name, file.date), &bytes).await
    }

    /// Snapshot of a recorded file; `None` when the file was never recorded or its
    /// snapshot is gone.
    pub async fn load_table(
        &self,
        kind: DataType,
        file_name: &str,
        date: NaiveDate,
    ) -> anyhow::Result<Option<Table>> {
        if !self.contains(kind, file_name, date) {
            return Ok(None);
        }
        let path = self.table_path(kind, file_name, date);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        let table = serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(table))
    }

    /// Forget every recorded file and its snapshot, then persist the empty cache.
    pub async fn clear(&mut self) -> anyhow::Result<()> {
        self.files.clear();
        let dir = self.tables_dir();
        if fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking {}", dir.display()))?
        {
            fs::remove_dir_all(&dir)
                .await
                .with_context(|| format!("removing {}", dir.display()))?;
        }
        self.save().await
    }
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub key: String,
    pub public_url: String,
    pub content_hash: String,
    pub byte_size: usize,
    /// The key already held identical content.
    pub unchanged: bool,
}

/// Filesystem-backed object store for merchant logos.
///
/// Keys are relative paths such as `logos/Acme.png`; the public URL is the configured
/// base URL joined with the key.
#[derive(Debug, Clone)]
pub struct LogoBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl LogoBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logo_key(merchant_name: &str) -> String {
        let name: String = merchant_name
            .trim()
            .chars()
            .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
            .collect();
        format!("logos/{name}.png")
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url.trim_end_matches('/'), key)
    }

    pub async fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<StoredBlob> {
        let content_hash = sha256_hex(bytes);
        let absolute_path = self.root.join(key);

        let unchanged = match fs::read(&absolute_path).await {
            Ok(existing) => sha256_hex(&existing) == content_hash,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => {
                return Err(err).with_context(|| format!("reading blob {}", absolute_path.display()))
            }
        };
        if !unchanged {
            write_atomic(&absolute_path, bytes).await?;
        }

        Ok(StoredBlob {
            key: key.to_string(),
            public_url: self.public_url(key),
            content_hash,
            byte_size: bytes.len(),
            unchanged,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("access denied to {url}; check that the file link is correct and still shared")]
    AccessDenied { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(ToString::to_string);
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    if status == StatusCode::FORBIDDEN {
                        return Err(FetchError::AccessDenied { url: final_url });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(attempt, error = %err, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabularFormat {
    Csv,
    CsvGz,
    Xlsx,
}

const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

impl TabularFormat {
    /// Pick a decoder from the response content type, falling back to the URL path.
    pub fn detect(content_type: Option<&str>, url: &str) -> Option<Self> {
        let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
        let path = url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.contains("text/csv") || path.ends_with(".csv") {
            Some(Self::Csv)
        } else if content_type.contains("application/gzip")
            || content_type.contains("application/x-gzip")
            || path.ends_with(".csv.gz")
        {
            Some(Self::CsvGz)
        } else if content_type.contains(XLSX_CONTENT_TYPE) || path.ends_with(".xlsx") {
            Some(Self::Xlsx)
        } else {
            None
        }
    }
}

#[derive(Debug, Error)]
pub enum TabularError {
    #[error("unsupported file format for {url}")]
    UnsupportedFormat { url: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding {format:?} file: {message}")]
    Decode {
        format: TabularFormat,
        message: String,
    },
}

impl TabularError {
    fn decode(format: TabularFormat, err: impl std::fmt::Display) -> Self {
        Self::Decode {
            format,
            message: err.to_string(),
        }
    }
}

pub fn decode_table(bytes: &[u8], format: TabularFormat) -> Result<Table, TabularError> {
    match format {
        TabularFormat::Csv => decode_csv(bytes).map_err(|e| TabularError::decode(format, e)),
        TabularFormat::CsvGz => {
            let mut inflated = Vec::new();
            GzDecoder::new(bytes)
                .read_to_end(&mut inflated)
                .map_err(|e| TabularError::decode(format, e))?;
            decode_csv(&inflated).map_err(|e| TabularError::decode(format, e))
        }
        TabularFormat::Xlsx => decode_xlsx(bytes),
    }
}

fn decode_csv(bytes: &[u8]) -> Result<Table, csv::Error> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_reader(bytes);
    let columns = reader
        .headers()?
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(|c| Some(c.to_string())).collect());
    }
    Ok(Table::new(columns, rows))
}

fn decode_xlsx(bytes: &[u8]) -> Result<Table, TabularError> {
    let format = TabularFormat::Xlsx;
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| TabularError::decode(format, e))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| TabularError::decode(format, "workbook has no sheets"))?
        .map_err(|e| TabularError::decode(format, e))?;

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(Table::default());
    };
    let columns = header
        .iter()
        .map(|c| xlsx_cell(c).unwrap_or_default())
        .collect::<Vec<_>>();
    let rows = rows
        .map(|r| r.iter().map(xlsx_cell).collect())
        .collect();
    Ok(Table::new(columns, rows))
}

fn xlsx_cell(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty => None,
        Data::String(s) => Some(s.clone()),
        Data::Int(i) => Some(i.to_string()),
        // Whole floats are ids more often than measurements.
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => Some(format!("{}", *f as i64)),
        Data::Float(f) => Some(f.to_string()),
        Data::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}
