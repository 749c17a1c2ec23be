//! Relational catalog of countries, categories, logos, merchants and transactions.

use std::time::Duration;

use async_trait::async_trait;
use datahub_core::{
    CategoryRef, CountryRef, GenifyMerchantId, LogoRecord, MerchantSummary, NewMerchant,
    NewTransaction,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Message(String),
}

/// Reads and writes the population pipeline needs from the relational store.
///
/// Sequence allocation (`next_genify_merchant_id`, merchant ids) is `MAX + 1`; it assumes
/// a single writer.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Case-insensitive lookup by country name.
    async fn resolve_country(&self, name: &str) -> Result<Option<CountryRef>, CatalogError>;

    async fn next_genify_merchant_id(&self, country_code: &str) -> Result<GenifyMerchantId, CatalogError>;

    async fn resolve_category(&self, name: &str) -> Result<Option<CategoryRef>, CatalogError>;

    /// Returns the existing record when `file_url` is already known.
    async fn upsert_logo(&self, logo_url: &str, file_url: &str) -> Result<LogoRecord, CatalogError>;

    async fn insert_merchant(&self, merchant: &NewMerchant) -> Result<i64, CatalogError>;

    async fn find_validated_merchant(&self, name: &str) -> Result<Option<MerchantSummary>, CatalogError>;

    /// Case-insensitive on the name, scoped to one country.
    async fn validated_merchant_exists(&self, name: &str, country_id: i64) -> Result<bool, CatalogError>;

    async fn validated_transaction_exists(&self, raw_description: &str) -> Result<bool, CatalogError>;

    async fn logo_url(&self, logo_id: i64) -> Result<Option<String>, CatalogError>;

    async fn genify_category_id_by_name(&self, name: &str) -> Result<Option<i64>, CatalogError>;

    /// `false` when a validated transaction with the same raw description already exists.
    async fn insert_transaction(&self, transaction: &NewTransaction) -> Result<bool, CatalogError>;
}

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<Self, CatalogError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), CatalogError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn resolve_country(&self, name: &str) -> Result<Option<CountryRef>, CatalogError> {
        let row = sqlx::query("SELECT id, iso_2 FROM country WHERE LOWER(name) = LOWER($1) LIMIT 1")
            .bind(name.trim())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(CountryRef {
            id: row.try_get("id")?,
            iso2: row.try_get("iso_2")?,
        }))
    }

    async fn next_genify_merchant_id(&self, country_code: &str) -> Result<GenifyMerchantId, CatalogError> {
        let code = country_code.to_ascii_lowercase();
        let max: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(CAST(SPLIT_PART(genify_merchant_id, '-', 2) AS BIGINT))
              FROM merchant
             WHERE genify_merchant_id LIKE $1
            "#,
        )
        .bind(format!("{code}-%"))
        .fetch_one(&self.pool)
        .await?;
        Ok(GenifyMerchantId::next_after(&code, max))
    }

    async fn resolve_category(&self, name: &str) -> Result<Option<CategoryRef>, CatalogError> {
        let row = sqlx::query("SELECT id, genify_category_id FROM category WHERE name_eng = $1 LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(CategoryRef {
            id: row.try_get("id")?,
            genify_category_id: row.try_get("genify_category_id")?,
        }))
    }

    async fn upsert_logo(&self, logo_url: &str, file_url: &str) -> Result<LogoRecord, CatalogError> {
        let row = sqlx::query(
            r#"
            INSERT INTO logo (logo_url, file_url)
            VALUES ($1, $2)
            ON CONFLICT (file_url) DO UPDATE SET file_url = EXCLUDED.file_url
            RETURNING id, logo_url, file_url
            "#,
        )
        .bind(logo_url)
        .bind(file_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(LogoRecord {
            id: row.try_get("id")?,
            logo_url: row.try_get("logo_url")?,
            file_url: row.try_get("file_url")?,
        })
    }

    async fn insert_merchant(&self, merchant: &NewMerchant) -> Result<i64, CatalogError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO merchant (
                id, uuid, date_created, validated, validation_comment, name, type, subtype,
                website, country_id, source_id, logo_id, genify_merchant_id, category_id,
                genify_category_id
            )
            SELECT COALESCE(MAX(id), 0) + 1, $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14
              FROM merchant
            RETURNING id
            "#,
        )
        .bind(merchant.uuid)
        .bind(merchant.date_created)
        .bind(merchant.validated)
        .bind(&merchant.validation_comment)
        .bind(&merchant.name)
        .bind(&merchant.category)
        .bind(&merchant.subcategory)
        .bind(&merchant.website)
        .bind(merchant.country_id)
        .bind(merchant.source_id)
        .bind(merchant.logo_id)
        .bind(merchant.genify_merchant_id.to_string())
        .bind(merchant.category_id)
        .bind(merchant.genify_category_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn find_validated_merchant(&self, name: &str) -> Result<Option<MerchantSummary>, CatalogError> {
        let row = sqlx::query(
            r#"
            SELECT id, type, subtype, website, logo_id
              FROM merchant
             WHERE name = $1 AND validated = TRUE
             ORDER BY id
             LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(MerchantSummary {
            id: row.try_get("id")?,
            category: row.try_get("type")?,
            subcategory: row.try_get("subtype")?,
            website: row.try_get("website")?,
            logo_id: row.try_get("logo_id")?,
        }))
    }

    async fn validated_merchant_exists(&self, name: &str, country_id: i64) -> Result<bool, CatalogError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM merchant
                 WHERE LOWER(name) = LOWER($1) AND country_id = $2 AND validated = TRUE
            )
            "#,
        )
        .bind(name.trim())
        .bind(country_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn validated_transaction_exists(&self, raw_description: &str) -> Result<bool, CatalogError> {
        let exists: bool = sqlx::query_scalar(
            r#"SELECT EXISTS (SELECT 1 FROM "transaction" WHERE raw_description = $1 AND validated = TRUE)"#,
        )
        .bind(raw_description)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn logo_url(&self, logo_id: i64) -> Result<Option<String>, CatalogError> {
        let url: Option<String> = sqlx::query_scalar("SELECT logo_url FROM logo WHERE id = $1")
            .bind(logo_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(url)
    }

    async fn genify_category_id_by_name(&self, name: &str) -> Result<Option<i64>, CatalogError> {
        let id: Option<Option<i64>> =
            sqlx::query_scalar("SELECT genify_category_id FROM category WHERE name_eng = $1 LIMIT 1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id.flatten())
    }

    async fn insert_transaction(&self, transaction: &NewTransaction) -> Result<bool, CatalogError> {
        let result = sqlx::query(
            r#"
            INSERT INTO "transaction" (
                raw_description, category_id, uuid, category_name, merchant_website, logo,
                client_id, status, date, clean_description, subcategory_name,
                display_description, validated, validation_date, merchant_ids, logo_status,
                genify_clean_description
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (raw_description) WHERE validated DO NOTHING
            "#,
        )
        .bind(&transaction.raw_description)
        .bind(transaction.category_id)
        .bind(transaction.uuid)
        .bind(&transaction.category_name)
        .bind(&transaction.merchant_website)
        .bind(&transaction.logo)
        .bind(transaction.client_id)
        .bind(&transaction.status)
        .bind(transaction.date)
        .bind(&transaction.clean_description)
        .bind(&transaction.subcategory_name)
        .bind(&transaction.display_description)
        .bind(transaction.validated)
        .bind(transaction.validation_date)
        .bind(&transaction.merchant_ids)
        .bind(transaction.logo_status.as_str())
        .bind(&transaction.genify_clean_description)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
