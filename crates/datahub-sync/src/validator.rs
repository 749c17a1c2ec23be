//! Schema and content checks run against each submitted file.

use std::collections::BTreeSet;

use datahub_core::{DataType, Table, ValidationLabel, ValidationOutcome};
use datahub_metrics::{resolve_column, ColumnRole};

use crate::config::ReferenceData;

pub const MERCHANT_COLUMNS: &[&str] = &[
    "name",
    "id",
    "category",
    "subcategory",
    "website",
    "logo_url",
    "country",
    "validation_date",
    "status",
    "comment",
];

pub const REVIEWED_TRANSACTION_COLUMNS: &[&str] =
    &["description", "extracted_merchant_for_review", "merchant_id"];

pub const ALLOWED_LOGO_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg"];

/// Required columns absent from the table, in requirement order.
pub fn missing_columns<'a>(table: &Table, required: &'a [String]) -> Vec<&'a str> {
    required
        .iter()
        .map(String::as_str)
        .filter(|column| !table.has_column(column))
        .collect()
}

/// Distinct category values not in the canonical list. Blank cells count as invalid.
pub fn invalid_categories(table: &Table, canonical: &BTreeSet<String>) -> Vec<String> {
    distinct_values(table, "category", |v| v.to_string())
        .into_iter()
        .filter(|v| !canonical.contains(v))
        .collect()
}

/// Like [`invalid_categories`] but compared case-insensitively.
pub fn invalid_countries(table: &Table, canonical_lowercase: &BTreeSet<String>) -> Vec<String> {
    distinct_values(table, "country", str::to_lowercase)
        .into_iter()
        .filter(|v| !canonical_lowercase.contains(v))
        .collect()
}

/// Non-empty logo URLs whose path does not end with an allowed extension.
pub fn invalid_logo_urls(table: &Table, allowed: &[&str]) -> Vec<String> {
    let Some(urls) = table.column("logo_url") else {
        return Vec::new();
    };
    urls.into_iter()
        .flatten()
        .filter(|url| !has_allowed_extension(url, allowed))
        .map(ToString::to_string)
        .collect()
}

pub fn has_allowed_extension(url: &str, allowed: &[&str]) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    allowed.iter().any(|ext| path.ends_with(ext))
}

fn distinct_values(table: &Table, column: &str, normalize: impl Fn(&str) -> String) -> BTreeSet<String> {
    table
        .column(column)
        .unwrap_or_default()
        .into_iter()
        .map(|cell| cell.map(&normalize).unwrap_or_default())
        .collect()
}

#[derive(Debug, Clone)]
pub struct Validator {
    reference: ReferenceData,
}

impl Validator {
    pub fn new(reference: ReferenceData) -> Self {
        Self { reference }
    }

    pub fn reference(&self) -> &ReferenceData {
        &self.reference
    }

    pub fn validate(&self, data_type: DataType, table: &Table) -> ValidationOutcome {
        let mut failures = Vec::new();
        match data_type {
            DataType::Merchants => {
                if !missing_columns(table, &self.reference.merchant_columns).is_empty() {
                    failures.push(ValidationLabel::InvalidColumnName);
                }
                if !invalid_categories(table, &self.reference.categories).is_empty() {
                    failures.push(ValidationLabel::InvalidCategory);
                }
                if !invalid_countries(table, &self.reference.countries).is_empty() {
                    failures.push(ValidationLabel::InvalidCountry);
                }
                if !invalid_logo_urls(table, ALLOWED_LOGO_EXTENSIONS).is_empty() {
                    failures.push(ValidationLabel::InvalidLogoUrl);
                }
            }
            DataType::ReviewedTransactions => {
                if !missing_columns(table, &self.reference.reviewed_transaction_columns).is_empty() {
                    failures.push(ValidationLabel::InvalidColumnName);
                }
            }
            DataType::Ngrams => {
                let unresolved = [ColumnRole::Description, ColumnRole::MerchantId, ColumnRole::NgramKey]
                    .into_iter()
                    .any(|role| resolve_column(table, role).is_none());
                if unresolved {
                    failures.push(ValidationLabel::InvalidColumnName);
                }
            }
        }
        ValidationOutcome::from_failures(failures)
    }
}
