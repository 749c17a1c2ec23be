//! Core domain model for the Data Hub submission tracker.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "datahub-core";

/// Literal written to an entry's populated flag once ingestion has run.
pub const POPULATED_DONE: &str = "Done";

/// `merchant.source_id` recorded for merchants ingested from reviewer submissions.
pub const SUBMISSION_MERCHANT_SOURCE_ID: i64 = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown entry type `{0}`")]
    EntryType(String),
    #[error("unknown data type `{0}`")]
    DataType(String),
    #[error("malformed genify merchant id `{0}`")]
    GenifyMerchantId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntryType {
    Source,
    Submission,
    #[serde(rename = "Ngram-File")]
    NgramFile,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "Source",
            Self::Submission => "Submission",
            Self::NgramFile => "Ngram-File",
        }
    }
}

impl FromStr for EntryType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Source" => Ok(Self::Source),
            "Submission" => Ok(Self::Submission),
            "Ngram-File" => Ok(Self::NgramFile),
            other => Err(ParseError::EntryType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    Merchants,
    #[serde(rename = "Reviewed Transactions")]
    ReviewedTransactions,
    Ngrams,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merchants => "Merchants",
            Self::ReviewedTransactions => "Reviewed Transactions",
            Self::Ngrams => "Ngrams",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Merchants" => Ok(Self::Merchants),
            "Reviewed Transactions" | "ReviewedTransactions" => Ok(Self::ReviewedTransactions),
            "Ngrams" => Ok(Self::Ngrams),
            other => Err(ParseError::DataType(other.to_string())),
        }
    }
}

/// Multi-select labels written back to a submission entry after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValidationLabel {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "Invalid Column Name")]
    InvalidColumnName,
    #[serde(rename = "Invalid Category")]
    InvalidCategory,
    #[serde(rename = "Invalid Country")]
    InvalidCountry,
    #[serde(rename = "Invalid Logo URL")]
    InvalidLogoUrl,
}

impl ValidationLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::InvalidColumnName => "Invalid Column Name",
            Self::InvalidCategory => "Invalid Category",
            Self::InvalidCountry => "Invalid Country",
            Self::InvalidLogoUrl => "Invalid Logo URL",
        }
    }
}

impl fmt::Display for ValidationLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of validating one submission file.
///
/// Holds either exactly `[OK]` or a non-empty, ordered, duplicate-free list of failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    labels: Vec<ValidationLabel>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self {
            labels: vec![ValidationLabel::Ok],
        }
    }

    pub fn from_failures(failures: impl IntoIterator<Item = ValidationLabel>) -> Self {
        let mut labels = Vec::new();
        for label in failures {
            if label != ValidationLabel::Ok && !labels.contains(&label) {
                labels.push(label);
            }
        }
        if labels.is_empty() {
            return Self::ok();
        }
        Self { labels }
    }

    pub fn is_ok(&self) -> bool {
        self.labels == [ValidationLabel::Ok]
    }

    pub fn labels(&self) -> &[ValidationLabel] {
        &self.labels
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PopulatedFlag {
    #[default]
    #[serde(rename = "")]
    Empty,
    Done,
}

/// One row of the external record store tracking a submitted file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionEntry {
    pub id: String,
    /// Source title the submission belongs to.
    pub title: String,
    pub entry_type: EntryType,
    #[serde(default)]
    pub data_type: Option<DataType>,
    #[serde(default)]
    pub team_member: Option<String>,
    pub file_url: String,
    pub file_name: String,
    pub submission_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub validation_labels: Vec<ValidationLabel>,
    #[serde(default)]
    pub validated: Option<bool>,
    #[serde(default)]
    pub populated: PopulatedFlag,
}

impl SubmissionEntry {
    pub fn is_labelled(&self) -> bool {
        !self.validation_labels.is_empty()
    }

    pub fn is_labelled_ok(&self) -> bool {
        self.validation_labels.contains(&ValidationLabel::Ok)
    }

    pub fn is_populated(&self) -> bool {
        self.populated == PopulatedFlag::Done
    }

    pub fn reviewer(&self) -> &str {
        self.team_member.as_deref().unwrap_or("unknown")
    }
}

/// In-memory tabular dataset decoded from a submitted file.
///
/// Cells are trimmed on construction; blank cells and `NaN` become `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        let columns: Vec<String> = columns.into_iter().map(|c| c.trim().to_string()).collect();
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, None);
                row.into_iter().map(normalize_cell).collect()
            })
            .collect();
        Self { columns, rows }
    }

    /// Convenience constructor for literal data, mostly used by tests.
    pub fn from_rows(columns: &[&str], rows: &[&[&str]]) -> Self {
        Self::new(
            columns.iter().map(|c| c.to_string()).collect(),
            rows.iter()
                .map(|r| r.iter().map(|c| Some(c.to_string())).collect())
                .collect(),
        )
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_deref()
    }

    /// All values of a column, `None` if the column is absent.
    pub fn column(&self, name: &str) -> Option<Vec<Option<&str>>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|r| r[idx].as_deref()).collect())
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        (0..self.rows.len()).map(move |index| Row { table: self, index })
    }
}

fn normalize_cell(cell: Option<String>) -> Option<String> {
    let cell = cell?;
    let trimmed = cell.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    table: &'a Table,
    index: usize,
}

impl<'a> Row<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn get(&self, column: &str) -> Option<&'a str> {
        let col = self.table.column_index(column)?;
        self.table.cell(self.index, col)
    }
}

/// Canonical merchant identifier: lower-case ISO-2 country code plus a per-country sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenifyMerchantId {
    pub country_code: String,
    pub sequence: i64,
}

impl GenifyMerchantId {
    pub fn new(country_code: &str, sequence: i64) -> Self {
        Self {
            country_code: country_code.to_ascii_lowercase(),
            sequence,
        }
    }

    /// Successor of the highest existing sequence for the country, starting at 0.
    pub fn next_after(country_code: &str, max_existing: Option<i64>) -> Self {
        Self::new(country_code, max_existing.map_or(0, |max| max + 1))
    }
}

impl fmt::Display for GenifyMerchantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.country_code, self.sequence)
    }
}

impl FromStr for GenifyMerchantId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (code, seq) = s
            .split_once('-')
            .ok_or_else(|| ParseError::GenifyMerchantId(s.to_string()))?;
        let sequence = seq
            .parse()
            .map_err(|_| ParseError::GenifyMerchantId(s.to_string()))?;
        if code.is_empty() {
            return Err(ParseError::GenifyMerchantId(s.to_string()));
        }
        Ok(Self::new(code, sequence))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryRef {
    pub id: i64,
    pub iso2: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRef {
    pub id: i64,
    pub genify_category_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogoRecord {
    pub id: i64,
    /// Public URL of the stored object.
    pub logo_url: String,
    /// Storage key; unique across the table.
    pub file_url: String,
}

/// Merchant row ready for insertion; `id` is assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMerchant {
    pub uuid: Uuid,
    pub date_created: DateTime<Utc>,
    pub validated: bool,
    pub validation_comment: Option<String>,
    pub name: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub website: String,
    pub country_id: i64,
    pub source_id: i64,
    pub logo_id: Option<i64>,
    pub genify_merchant_id: GenifyMerchantId,
    pub category_id: i64,
    pub genify_category_id: Option<i64>,
}

/// Subset of a validated merchant needed to build transaction records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerchantSummary {
    pub id: i64,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub website: Option<String>,
    pub logo_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoStatus {
    Found,
    NotFound,
}

impl LogoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Found => "found",
            Self::NotFound => "not_found",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub raw_description: String,
    pub category_id: Option<i64>,
    pub uuid: Uuid,
    pub category_name: Option<String>,
    pub merchant_website: Option<String>,
    pub logo: Option<String>,
    pub client_id: i64,
    pub status: String,
    pub date: NaiveDate,
    pub clean_description: String,
    pub subcategory_name: Option<String>,
    pub display_description: String,
    pub validated: bool,
    pub validation_date: DateTime<Utc>,
    pub merchant_ids: Vec<i64>,
    pub logo_status: LogoStatus,
    pub genify_clean_description: String,
}
