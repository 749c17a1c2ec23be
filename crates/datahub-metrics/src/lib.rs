//! Reviewer progress and coverage reconciliation over already-fetched submission tables.
//!
//! Everything here is pure: callers fetch the source table and the reviewer tables, and
//! [`reconcile`] derives per-file ngram metrics, per-reviewer reviewed counts with
//! cross-reviewer overlaps credited once, and aggregate coverage against the source.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use datahub_core::{DataType, EntryType, SubmissionEntry, Table};
use serde::Serialize;
use thiserror::Error;

pub const CRATE_NAME: &str = "datahub-metrics";

/// Merchant-id values marking an ngram the reviewer could not attribute.
pub const INVALID_MERCHANT_SENTINELS: &[&str] = &["0", "?"];

/// Merchant ids minted by reviewers for merchants missing from the catalog.
pub const NEW_MERCHANT_PREFIX: &str = "n-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ColumnRole {
    Description,
    MerchantId,
    NgramKey,
}

/// Historical header names per role, highest priority first.
pub const COLUMN_ALIASES: &[(ColumnRole, &[&str])] = &[
    (ColumnRole::Description, &["description"]),
    (
        ColumnRole::MerchantId,
        &["merchant_id", "Merchant ID", "merchant id", "merchantId", "genify_merchant_id"],
    ),
    (
        ColumnRole::NgramKey,
        &["ngram", "ngrams", "Ngram", "extracted_merchant_for_review", "extracted_merchant"],
    ),
];

pub fn aliases_for(role: ColumnRole) -> &'static [&'static str] {
    COLUMN_ALIASES
        .iter()
        .find(|(r, _)| *r == role)
        .map(|(_, aliases)| *aliases)
        .unwrap_or(&[])
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("{file}: none of the {role:?} column aliases {tried:?} is present")]
    MissingColumn {
        role: ColumnRole,
        tried: Vec<String>,
        file: String,
    },
}

/// First alias of `role` present in the table's header.
pub fn resolve_column(table: &Table, role: ColumnRole) -> Option<&'static str> {
    aliases_for(role)
        .iter()
        .copied()
        .find(|alias| table.has_column(alias))
}

pub fn require_column(
    table: &Table,
    role: ColumnRole,
    file: &str,
) -> Result<&'static str, ReconcileError> {
    resolve_column(table, role).ok_or_else(|| ReconcileError::MissingColumn {
        role,
        tried: aliases_for(role).iter().map(ToString::to_string).collect(),
        file: file.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NgramClass {
    Invalid,
    Valid,
    /// Valid and attributed to a reviewer-minted merchant.
    ValidNew,
}

impl NgramClass {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::Invalid)
    }
}

pub fn classify_merchant_id(value: Option<&str>) -> NgramClass {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return NgramClass::Invalid;
    };
    if INVALID_MERCHANT_SENTINELS.contains(&value) || value.eq_ignore_ascii_case("nan") {
        return NgramClass::Invalid;
    }
    // Spreadsheet exports turn 0 into 0.0.
    if value.parse::<f64>().is_ok_and(|v| v == 0.0 || v.is_nan()) {
        return NgramClass::Invalid;
    }
    if value.to_ascii_lowercase().starts_with(NEW_MERCHANT_PREFIX) {
        NgramClass::ValidNew
    } else {
        NgramClass::Valid
    }
}

/// One reviewer's submitted ngram file, already decoded.
#[derive(Debug, Clone)]
pub struct ReviewerTable {
    pub reviewer: String,
    pub file_name: String,
    pub date: NaiveDate,
    pub table: Table,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileMetrics {
    pub reviewer: String,
    pub file_name: String,
    pub date: NaiveDate,
    pub total_rows: usize,
    pub count_valid: usize,
    pub count_invalid: usize,
    pub coverage_valid: f64,
    pub coverage_invalid: f64,
    /// Distinct ngram keys on valid rows.
    pub merchants: usize,
    /// Distinct ngram keys on rows attributed to reviewer-minted merchants.
    pub new_merchants: usize,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

pub fn file_metrics(file: &ReviewerTable) -> Result<FileMetrics, ReconcileError> {
    let merchant_col = require_column(&file.table, ColumnRole::MerchantId, &file.file_name)?;
    let ngram_col = require_column(&file.table, ColumnRole::NgramKey, &file.file_name)?;

    let mut count_valid = 0;
    let mut merchants = BTreeSet::new();
    let mut new_merchants = BTreeSet::new();
    for row in file.table.rows() {
        let class = classify_merchant_id(row.get(merchant_col));
        if !class.is_valid() {
            continue;
        }
        count_valid += 1;
        if let Some(key) = row.get(ngram_col) {
            merchants.insert(key);
            if class == NgramClass::ValidNew {
                new_merchants.insert(key);
            }
        }
    }

    let total_rows = file.table.len();
    let count_invalid = total_rows - count_valid;
    Ok(FileMetrics {
        reviewer: file.reviewer.clone(),
        file_name: file.file_name.clone(),
        date: file.date,
        total_rows,
        count_valid,
        count_invalid,
        coverage_valid: ratio(count_valid, total_rows),
        coverage_invalid: ratio(count_invalid, total_rows),
        merchants: merchants.len(),
        new_merchants: new_merchants.len(),
    })
}

fn description_set(table: &Table, file: &str) -> Result<BTreeSet<String>, ReconcileError> {
    let col = require_column(table, ColumnRole::Description, file)?;
    Ok(table
        .rows()
        .filter_map(|row| row.get(col))
        .map(ToString::to_string)
        .collect())
}

/// Union over all reviewer pairs of the intersection of their description sets.
///
/// Input is one description set per reviewer; a reviewer's files are merged beforehand so
/// repeats within one reviewer's own work never count as overlap.
pub fn overlap_set<'a>(
    reviewer_sets: impl IntoIterator<Item = &'a BTreeSet<String>>,
) -> BTreeSet<String> {
    let sets: Vec<_> = reviewer_sets.into_iter().collect();
    let mut overlap = BTreeSet::new();
    for (i, a) in sets.iter().enumerate() {
        for b in &sets[i + 1..] {
            overlap.extend(a.intersection(b).cloned());
        }
    }
    overlap
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewerSummary {
    pub reviewer: String,
    /// Per-file metrics ordered by submission date.
    pub files: Vec<FileMetrics>,
    /// Distinct descriptions reviewed by this reviewer alone.
    pub reviewed_transactions: usize,
    pub coverage: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileError {
    pub reviewer: String,
    pub file_name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationReport {
    pub total_source: usize,
    pub reviewers: Vec<ReviewerSummary>,
    /// Descriptions reviewed by two or more reviewers, credited once here.
    pub overlapped: usize,
    pub reviewed_total: usize,
    pub aggregate_matched: usize,
    pub aggregate_coverage: f64,
    pub remaining: usize,
    pub remaining_coverage: f64,
    pub file_errors: Vec<FileError>,
}

/// Reconcile reviewer work against the source description list.
///
/// Only the source table's own header can fail the whole run; a reviewer file with an
/// unusable header is reported in `file_errors` and left out.
pub fn reconcile(
    source: &Table,
    reviewer_tables: &[ReviewerTable],
) -> Result<ReconciliationReport, ReconcileError> {
    let source_descriptions = description_set(source, "source")?;
    let total_source = source_descriptions.len();

    let mut file_errors = Vec::new();
    let mut per_reviewer: BTreeMap<String, (Vec<FileMetrics>, BTreeSet<String>)> = BTreeMap::new();
    for file in reviewer_tables {
        let described = description_set(&file.table, &file.file_name)
            .and_then(|descriptions| file_metrics(file).map(|metrics| (metrics, descriptions)));
        match described {
            Ok((metrics, descriptions)) => {
                let slot = per_reviewer.entry(file.reviewer.clone()).or_default();
                slot.0.push(metrics);
                slot.1.extend(descriptions);
            }
            Err(err) => file_errors.push(FileError {
                reviewer: file.reviewer.clone(),
                file_name: file.file_name.clone(),
                message: err.to_string(),
            }),
        }
    }

    let overlap = overlap_set(per_reviewer.values().map(|(_, d)| d));

    let mut reviewed_union: BTreeSet<String> = overlap.clone();
    let mut reviewers = Vec::with_capacity(per_reviewer.len());
    for (reviewer, (mut files, descriptions)) in per_reviewer {
        files.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.file_name.cmp(&b.file_name)));
        let own: BTreeSet<String> = descriptions
            .into_iter()
            .filter(|d| !overlap.contains(d))
            .collect();
        reviewers.push(ReviewerSummary {
            reviewer,
            files,
            reviewed_transactions: own.len(),
            coverage: ratio(own.len(), total_source),
        });
        reviewed_union.extend(own);
    }

    let reviewed_total =
        reviewers.iter().map(|r| r.reviewed_transactions).sum::<usize>() + overlap.len();
    let aggregate_matched = source_descriptions
        .iter()
        .filter(|d| reviewed_union.contains(*d))
        .count();
    let remaining = total_source.saturating_sub(aggregate_matched);

    Ok(ReconciliationReport {
        total_source,
        reviewers,
        overlapped: overlap.len(),
        reviewed_total,
        aggregate_matched,
        aggregate_coverage: ratio(aggregate_matched, total_source),
        remaining,
        remaining_coverage: ratio(remaining, total_source),
        file_errors,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFile {
    pub title: String,
    pub file_url: String,
    pub file_name: String,
}

pub fn source_entries(entries: &[SubmissionEntry]) -> Vec<SourceFile> {
    entries
        .iter()
        .filter(|e| e.entry_type == EntryType::Source)
        .map(|e| SourceFile {
            title: e.title.clone(),
            file_url: e.file_url.clone(),
            file_name: e.file_name.clone(),
        })
        .collect()
}

/// Non-source entries of one source title submitted inside `[start, end]`.
pub fn scope_entries<'a>(
    entries: &'a [SubmissionEntry],
    source_title: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<&'a SubmissionEntry> {
    entries
        .iter()
        .filter(|e| {
            e.entry_type != EntryType::Source
                && e.title == source_title
                && (start..=end).contains(&e.submission_date)
        })
        .collect()
}

pub fn is_ngram_entry(entry: &SubmissionEntry) -> bool {
    entry.entry_type == EntryType::NgramFile || entry.data_type == Some(DataType::Ngrams)
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MerchantCollectionSummary {
    pub per_member: BTreeMap<String, usize>,
    /// Distinct lower-cased merchant names across all members.
    pub collected: BTreeSet<String>,
}

/// Per member, the sum over their Merchants files of distinct lower-cased names per file.
pub fn merchant_collection_summary<'a>(
    files: impl IntoIterator<Item = (&'a str, &'a Table)>,
) -> MerchantCollectionSummary {
    let mut summary = MerchantCollectionSummary::default();
    for (member, table) in files {
        let names: BTreeSet<String> = table
            .column("name")
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .map(str::to_lowercase)
            .collect();
        *summary.per_member.entry(member.to_string()).or_default() += names.len();
        summary.collected.extend(names);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use datahub_core::PopulatedFlag;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 4, day).unwrap()
    }

    fn ngram_table(rows: &[(&str, &str, &str)]) -> Table {
        let rows: Vec<Vec<Option<String>>> = rows
            .iter()
            .map(|(d, n, m)| vec![Some(d.to_string()), Some(n.to_string()), Some(m.to_string())])
            .collect();
        Table::new(
            vec!["description".into(), "ngram".into(), "merchant_id".into()],
            rows,
        )
    }

    fn reviewer(name: &str, file: &str, day: u32, descriptions: impl IntoIterator<Item = String>) -> ReviewerTable {
        let rows: Vec<Vec<Option<String>>> = descriptions
            .into_iter()
            .map(|d| vec![Some(d.clone()), Some(format!("ng {d}")), Some("12".into())])
            .collect();
        ReviewerTable {
            reviewer: name.into(),
            file_name: file.into(),
            date: date(day),
            table: Table::new(vec!["description".into(), "ngram".into(), "merchant_id".into()], rows),
        }
    }

    fn source(count: usize) -> Table {
        Table::new(
            vec!["description".into()],
            (0..count).map(|i| vec![Some(format!("TXN {i}"))]).collect(),
        )
    }

    #[test]
    fn merchant_id_classification() {
        assert_eq!(classify_merchant_id(Some("0")), NgramClass::Invalid);
        assert_eq!(classify_merchant_id(Some("0.0")), NgramClass::Invalid);
        assert_eq!(classify_merchant_id(Some("?")), NgramClass::Invalid);
        assert_eq!(classify_merchant_id(Some("NaN")), NgramClass::Invalid);
        assert_eq!(classify_merchant_id(None), NgramClass::Invalid);
        assert_eq!(classify_merchant_id(Some("n-7")), NgramClass::ValidNew);
        assert_eq!(classify_merchant_id(Some("eg-12")), NgramClass::Valid);
        assert_eq!(classify_merchant_id(Some("1532")), NgramClass::Valid);
    }

    #[test]
    fn alias_resolution_follows_priority_order() {
        let table = Table::from_rows(&["Merchant ID", "merchant_id", "extracted_merchant"], &[]);
        assert_eq!(resolve_column(&table, ColumnRole::MerchantId), Some("merchant_id"));
        assert_eq!(resolve_column(&table, ColumnRole::NgramKey), Some("extracted_merchant"));

        let err = require_column(&table, ColumnRole::Description, "week1.csv").unwrap_err();
        let ReconcileError::MissingColumn { tried, file, .. } = err;
        assert_eq!(tried, vec!["description".to_string()]);
        assert_eq!(file, "week1.csv");
    }

    #[test]
    fn file_metrics_counts_valid_invalid_and_new_merchants() {
        let file = ReviewerTable {
            reviewer: "amira".into(),
            file_name: "week1.csv".into(),
            date: date(1),
            table: ngram_table(&[
                ("CARREFOUR MAADI", "carrefour", "eg-1"),
                ("CARREFOUR ZAMALEK", "carrefour", "eg-1"),
                ("KOSHARY TAHRIR", "koshary tahrir", "n-7"),
                ("POS 8812", "pos", "0"),
                ("??", "unknown", "?"),
            ]),
        };
        let m = file_metrics(&file).unwrap();
        assert_eq!(m.total_rows, 5);
        assert_eq!(m.count_valid, 3);
        assert_eq!(m.count_invalid, 2);
        assert!((m.coverage_valid - 0.6).abs() < 1e-9);
        assert!((m.coverage_invalid - 0.4).abs() < 1e-9);
        assert_eq!(m.merchants, 2);
        assert_eq!(m.new_merchants, 1);
    }

    #[test]
    fn overlap_is_counted_once_and_excluded_from_reviewers() {
        let a = reviewer("A", "a.csv", 1, ["X".to_string(), "only-a".to_string()]);
        let b = reviewer("B", "b.csv", 1, ["X".to_string(), "only-b".to_string()]);
        let c = reviewer("C", "c.csv", 1, ["only-c".to_string()]);
        let src = Table::from_rows(
            &["description"],
            &[&["X"], &["only-a"], &["only-b"], &["only-c"], &["untouched"]],
        );

        let report = reconcile(&src, &[a, b, c]).unwrap();
        assert_eq!(report.overlapped, 1);
        let by_name: BTreeMap<_, _> = report
            .reviewers
            .iter()
            .map(|r| (r.reviewer.as_str(), r.reviewed_transactions))
            .collect();
        assert_eq!(by_name["A"], 1);
        assert_eq!(by_name["B"], 1);
        assert_eq!(by_name["C"], 1);
        assert_eq!(report.reviewed_total, 4);
        assert_eq!(report.aggregate_matched, 4);
        assert_eq!(report.remaining, 1);
    }

    #[test]
    fn same_reviewer_repeats_are_not_overlap() {
        let first = reviewer("A", "a1.csv", 1, ["X".to_string()]);
        let second = reviewer("A", "a2.csv", 2, ["X".to_string()]);
        let report = reconcile(&Table::from_rows(&["description"], &[&["X"]]), &[second, first]).unwrap();
        assert_eq!(report.overlapped, 0);
        assert_eq!(report.reviewers[0].reviewed_transactions, 1);
        let names: Vec<_> = report.reviewers[0].files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["a1.csv", "a2.csv"]);
    }

    #[test]
    fn end_to_end_coverage_matches_hand_count() {
        let src = source(100);
        let a = reviewer("A", "a.csv", 1, (0..40).map(|i| format!("TXN {i}")));
        let b = reviewer("B", "b.csv", 2, (35..65).map(|i| format!("TXN {i}")));

        let report = reconcile(&src, &[a, b]).unwrap();
        assert_eq!(report.total_source, 100);
        assert_eq!(report.overlapped, 5);
        assert_eq!(report.reviewers[0].reviewed_transactions, 35);
        assert_eq!(report.reviewers[1].reviewed_transactions, 25);
        assert_eq!(report.reviewed_total, 65);
        assert_eq!(report.aggregate_matched, 65);
        assert!((report.aggregate_coverage - 0.65).abs() < 1e-9);
        assert_eq!(report.remaining, 35);
    }

    #[test]
    fn broken_reviewer_file_is_reported_inline() {
        let good = reviewer("A", "a.csv", 1, ["X".to_string()]);
        let broken = ReviewerTable {
            reviewer: "B".into(),
            file_name: "b.csv".into(),
            date: date(1),
            table: Table::from_rows(&["description", "comment"], &[&["X", "?"]]),
        };
        let report = reconcile(&Table::from_rows(&["description"], &[&["X"]]), &[good, broken]).unwrap();
        assert_eq!(report.file_errors.len(), 1);
        assert_eq!(report.file_errors[0].file_name, "b.csv");
        assert_eq!(report.overlapped, 0);
        assert_eq!(report.aggregate_matched, 1);
    }

    #[test]
    fn source_without_description_fails_loudly() {
        let err = reconcile(&Table::from_rows(&["desc"], &[]), &[]).unwrap_err();
        assert!(matches!(err, ReconcileError::MissingColumn { role: ColumnRole::Description, .. }));
    }

    #[test]
    fn scoping_filters_by_title_type_and_date() {
        let base = SubmissionEntry {
            id: "1".into(),
            title: "Egypt Q1".into(),
            entry_type: EntryType::NgramFile,
            data_type: Some(DataType::Ngrams),
            team_member: Some("amira".into()),
            file_url: "https://f/1.csv".into(),
            file_name: "1.csv".into(),
            submission_date: date(5),
            created_at: Utc.with_ymd_and_hms(2026, 4, 5, 0, 0, 0).single().unwrap(),
            validation_labels: vec![],
            validated: None,
            populated: PopulatedFlag::Empty,
        };
        let mut other_title = base.clone();
        other_title.title = "UAE Q1".into();
        let mut too_late = base.clone();
        too_late.submission_date = date(20);
        let mut src = base.clone();
        src.entry_type = EntryType::Source;

        let entries = vec![base, other_title, too_late, src];
        let scoped = scope_entries(&entries, "Egypt Q1", date(1), date(10));
        assert_eq!(scoped.len(), 1);
        assert!(is_ngram_entry(scoped[0]));
        assert_eq!(source_entries(&entries).len(), 1);
    }

    #[test]
    fn merchant_collection_counts_per_member_and_overall() {
        let a1 = Table::from_rows(&["name"], &[&["Carrefour"], &["carrefour"], &["Talabat"]]);
        let a2 = Table::from_rows(&["name"], &[&["Carrefour"]]);
        let b = Table::from_rows(&["name"], &[&["Uber"]]);
        let summary = merchant_collection_summary([("amira", &a1), ("amira", &a2), ("omar", &b)]);
        assert_eq!(summary.per_member["amira"], 3);
        assert_eq!(summary.per_member["omar"], 1);
        assert_eq!(summary.collected.len(), 3);
    }
}
