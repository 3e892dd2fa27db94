//! libSQL backend — async `MetricsStore` trait implementation.
//!
//! Supports local file and in-memory databases. Money columns are stored
//! as decimal strings; timestamps as RFC 3339 text, which also keeps SQL
//! range comparisons correct.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection as LibSqlConnection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use crate::ads::types::EntityLevel;
use crate::classify::{Category, Classification, ClassificationSource, ManualOverride};
use crate::error::StoreError;
use crate::inventory::{AdAccount, Connection};
use crate::lens::{AccountLensMetrics, Lens, LensPoint, LensSummary};
use crate::monitor::{Health, PerformanceRow, Trend};
use crate::recommend::{AiRunTelemetry, RecAction, Recommendation, RunStatus};
use crate::store::migrations;
use crate::store::traits::{MetricsStore, RetentionStats, SubCampaignRow};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: LibSqlConnection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    fn conn(&self) -> &LibSqlConnection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap_or(NaiveDate::MIN)
}

fn parse_decimal(s: &str) -> Decimal {
    s.parse().unwrap_or(Decimal::ZERO)
}

fn parse_optional_decimal(s: &Option<String>) -> Option<Decimal> {
    s.as_deref().and_then(|v| v.parse().ok())
}

/// Convert `Option<String>` to a libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_decimal(d: Option<Decimal>) -> libsql::Value {
    match d {
        Some(d) => libsql::Value::Text(d.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

// ── Row mappers ─────────────────────────────────────────────────────

const PERFORMANCE_COLUMNS: &str = "user_id, level, entity_id, name, parent_id, account_id, \
     spend_usd, results, cost_per_result_usd, ctr, cpc, cpm, trend, health, \
     recommendation, action, confidence, model, reason, captured_at";

fn row_to_performance(row: &libsql::Row) -> Result<PerformanceRow, libsql::Error> {
    let level: String = row.get(1)?;
    let trend: String = row.get(12)?;
    let health: String = row.get(13)?;
    let recommendation: String = row.get(14)?;
    let action: String = row.get(15)?;
    let captured_at: String = row.get(19)?;
    Ok(PerformanceRow {
        user_id: row.get(0)?,
        level: EntityLevel::from_str_loose(&level).unwrap_or(EntityLevel::Account),
        entity_id: row.get(2)?,
        name: row.get(3)?,
        parent_id: row.get(4)?,
        account_id: row.get(5)?,
        spend_usd: parse_decimal(&row.get::<String>(6)?),
        results: row.get::<i64>(7)?.max(0) as u64,
        cost_per_result_usd: parse_optional_decimal(&row.get(8)?),
        ctr: parse_optional_decimal(&row.get(9)?),
        cpc: parse_optional_decimal(&row.get(10)?),
        cpm: parse_optional_decimal(&row.get(11)?),
        trend: Trend::from_str_loose(&trend).unwrap_or(Trend::Stable),
        health: Health::from_str_loose(&health).unwrap_or(Health::Watch),
        recommendation: Recommendation::from_str_loose(&recommendation)
            .unwrap_or(Recommendation::Stable),
        action: RecAction::from_str_loose(&action).unwrap_or(RecAction::None),
        confidence: row.get::<i64>(16)?.clamp(0, 100) as u8,
        model: row.get(17)?,
        reason: row.get(18)?,
        captured_at: parse_datetime(&captured_at),
    })
}

fn row_to_summary(row: &libsql::Row) -> Result<LensSummary, libsql::Error> {
    let lens: String = row.get(1)?;
    let synced: String = row.get(8)?;
    Ok(LensSummary {
        user_id: row.get(0)?,
        lens: Lens::from_str_loose(&lens).unwrap_or(Lens::Overview),
        spend_usd: parse_decimal(&row.get::<String>(2)?),
        results: row.get::<i64>(3)?.max(0) as u64,
        cost_per_result_usd: parse_optional_decimal(&row.get(4)?),
        accounts: row.get::<i64>(5)?.max(0) as u64,
        active_ads: row.get::<i64>(6)?.max(0) as u64,
        active_campaigns: row.get::<i64>(7)?.max(0) as u64,
        last_synced_at: parse_datetime(&synced),
    })
}

fn row_to_metrics(row: &libsql::Row) -> Result<AccountLensMetrics, libsql::Error> {
    let lens: String = row.get(2)?;
    let date: String = row.get(3)?;
    Ok(AccountLensMetrics {
        user_id: row.get(0)?,
        account_id: row.get(1)?,
        lens: Lens::from_str_loose(&lens).unwrap_or(Lens::Overview),
        source_date: parse_date(&date),
        currency: row.get(4)?,
        spend_original: parse_decimal(&row.get::<String>(5)?),
        spend_usd: parse_decimal(&row.get::<String>(6)?),
        results: row.get::<i64>(7)?.max(0) as u64,
        cost_per_result_usd: parse_optional_decimal(&row.get(8)?),
        active_ads: row.get::<i64>(9)?.max(0) as u64,
        active_campaigns: row.get::<i64>(10)?.max(0) as u64,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl MetricsStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Connections & inventory ─────────────────────────────────────

    async fn upsert_connection(&self, conn: &Connection) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO connections (user_id, access_token, connected_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                     access_token = excluded.access_token,
                     updated_at = excluded.updated_at",
                params![
                    conn.user_id.clone(),
                    conn.access_token.expose_secret().to_string(),
                    conn.connected_at.to_rfc3339(),
                    now,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("upsert_connection: {e}")))?;
        Ok(())
    }

    async fn get_connection(&self, user_id: &str) -> Result<Option<Connection>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id, access_token, connected_at FROM connections WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_connection: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let token: String = row
                    .get(1)
                    .map_err(|e| StoreError::Query(format!("get_connection row parse: {e}")))?;
                let connected: String = row
                    .get(2)
                    .map_err(|e| StoreError::Query(format!("get_connection row parse: {e}")))?;
                Ok(Some(Connection {
                    user_id: row
                        .get(0)
                        .map_err(|e| StoreError::Query(format!("get_connection row parse: {e}")))?,
                    access_token: SecretString::from(token),
                    connected_at: parse_datetime(&connected),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_connection: {e}"))),
        }
    }

    async fn list_connections(&self) -> Result<Vec<Connection>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id, access_token, connected_at FROM connections ORDER BY user_id",
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_connections: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("list_connections: {e}")))?
        {
            let token: String = row
                .get(1)
                .map_err(|e| StoreError::Query(format!("list_connections row parse: {e}")))?;
            let connected: String = row
                .get(2)
                .map_err(|e| StoreError::Query(format!("list_connections row parse: {e}")))?;
            out.push(Connection {
                user_id: row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("list_connections row parse: {e}")))?,
                access_token: SecretString::from(token),
                connected_at: parse_datetime(&connected),
            });
        }
        Ok(out)
    }

    async fn delete_connection(&self, user_id: &str) -> Result<(), StoreError> {
        self.conn()
            .execute("DELETE FROM connections WHERE user_id = ?1", params![user_id])
            .await
            .map_err(|e| StoreError::Query(format!("delete_connection: {e}")))?;
        self.conn()
            .execute("DELETE FROM ad_accounts WHERE user_id = ?1", params![user_id])
            .await
            .map_err(|e| StoreError::Query(format!("delete_connection accounts: {e}")))?;
        debug!(user_id, "Connection and inventory removed");
        Ok(())
    }

    async fn replace_ad_accounts(
        &self,
        user_id: &str,
        accounts: &[AdAccount],
    ) -> Result<(), StoreError> {
        self.conn()
            .execute("DELETE FROM ad_accounts WHERE user_id = ?1", params![user_id])
            .await
            .map_err(|e| StoreError::Query(format!("replace_ad_accounts delete: {e}")))?;

        for account in accounts {
            self.conn()
                .execute(
                    "INSERT INTO ad_accounts (user_id, account_id, name, currency)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        user_id,
                        account.account_id.clone(),
                        account.name.clone(),
                        account.currency.clone(),
                    ],
                )
                .await
                .map_err(|e| StoreError::Query(format!("replace_ad_accounts insert: {e}")))?;
        }
        Ok(())
    }

    async fn list_ad_accounts(&self, user_id: &str) -> Result<Vec<AdAccount>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id, account_id, name, currency FROM ad_accounts
                 WHERE user_id = ?1 ORDER BY account_id",
                params![user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_ad_accounts: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("list_ad_accounts: {e}")))?
        {
            out.push(AdAccount {
                user_id: row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("list_ad_accounts row parse: {e}")))?,
                account_id: row
                    .get(1)
                    .map_err(|e| StoreError::Query(format!("list_ad_accounts row parse: {e}")))?,
                name: row
                    .get(2)
                    .map_err(|e| StoreError::Query(format!("list_ad_accounts row parse: {e}")))?,
                currency: row
                    .get(3)
                    .map_err(|e| StoreError::Query(format!("list_ad_accounts row parse: {e}")))?,
            });
        }
        Ok(out)
    }

    // ── Sub-campaign classifications ────────────────────────────────

    async fn upsert_sub_campaigns(
        &self,
        user_id: &str,
        rows: &[SubCampaignRow],
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        for row in rows {
            // Manual rows keep their classification columns; everything
            // else refreshes.
            self.conn()
                .execute(
                    "INSERT INTO sub_campaigns (user_id, adset_id, account_id, campaign_id,
                         name, optimization_goal, destination_type, has_lead_form,
                         category, source, confidence, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                     ON CONFLICT(user_id, adset_id) DO UPDATE SET
                         account_id = excluded.account_id,
                         campaign_id = excluded.campaign_id,
                         name = excluded.name,
                         optimization_goal = excluded.optimization_goal,
                         destination_type = excluded.destination_type,
                         has_lead_form = excluded.has_lead_form,
                         category = CASE WHEN sub_campaigns.source = 'manual'
                             THEN sub_campaigns.category ELSE excluded.category END,
                         source = CASE WHEN sub_campaigns.source = 'manual'
                             THEN 'manual' ELSE excluded.source END,
                         confidence = CASE WHEN sub_campaigns.source = 'manual'
                             THEN sub_campaigns.confidence ELSE excluded.confidence END,
                         updated_at = excluded.updated_at",
                    params![
                        user_id,
                        row.adset_id.clone(),
                        row.account_id.clone(),
                        opt_text_owned(row.campaign_id.clone()),
                        opt_text_owned(row.name.clone()),
                        opt_text_owned(row.optimization_goal.clone()),
                        opt_text_owned(row.destination_type.clone()),
                        row.has_lead_form as i64,
                        row.classification.category.as_str(),
                        row.classification.source.as_str(),
                        row.classification.confidence as i64,
                        now.clone(),
                    ],
                )
                .await
                .map_err(|e| StoreError::Query(format!("upsert_sub_campaigns: {e}")))?;
        }
        Ok(())
    }

    async fn manual_overrides(
        &self,
        user_id: &str,
    ) -> Result<HashMap<String, ManualOverride>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT adset_id, category, confidence FROM sub_campaigns
                 WHERE user_id = ?1 AND source = 'manual'",
                params![user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("manual_overrides: {e}")))?;

        let mut out = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("manual_overrides: {e}")))?
        {
            let adset_id: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("manual_overrides row parse: {e}")))?;
            let category: String = row
                .get(1)
                .map_err(|e| StoreError::Query(format!("manual_overrides row parse: {e}")))?;
            let confidence: i64 = row
                .get(2)
                .map_err(|e| StoreError::Query(format!("manual_overrides row parse: {e}")))?;

            let Some(category) = Category::from_str_loose(&category) else {
                warn!(adset_id, category, "skipping manual override with unknown category");
                continue;
            };
            out.insert(
                adset_id,
                ManualOverride {
                    category,
                    confidence: (confidence > 0).then_some(confidence.clamp(0, 100) as u8),
                },
            );
        }
        Ok(out)
    }

    async fn set_manual_classification(
        &self,
        user_id: &str,
        adset_id: &str,
        account_id: &str,
        classification: &Classification,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO sub_campaigns (user_id, adset_id, account_id, category,
                     source, confidence, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(user_id, adset_id) DO UPDATE SET
                     category = excluded.category,
                     source = excluded.source,
                     confidence = excluded.confidence,
                     updated_at = excluded.updated_at",
                params![
                    user_id,
                    adset_id,
                    account_id,
                    classification.category.as_str(),
                    ClassificationSource::Manual.as_str(),
                    classification.confidence as i64,
                    now,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_manual_classification: {e}")))?;
        Ok(())
    }

    // ── Lens metrics ────────────────────────────────────────────────

    async fn upsert_account_metrics(&self, row: &AccountLensMetrics) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO lens_account_metrics (user_id, account_id, lens, source_date,
                     currency, spend_original, spend_usd, results, cost_per_result_usd,
                     active_ads, active_campaigns, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(user_id, account_id, lens, source_date) DO UPDATE SET
                     currency = excluded.currency,
                     spend_original = excluded.spend_original,
                     spend_usd = excluded.spend_usd,
                     results = excluded.results,
                     cost_per_result_usd = excluded.cost_per_result_usd,
                     active_ads = excluded.active_ads,
                     active_campaigns = excluded.active_campaigns,
                     updated_at = excluded.updated_at",
                params![
                    row.user_id.clone(),
                    row.account_id.clone(),
                    row.lens.as_str(),
                    row.source_date.to_string(),
                    row.currency.clone(),
                    row.spend_original.to_string(),
                    row.spend_usd.to_string(),
                    row.results as i64,
                    opt_decimal(row.cost_per_result_usd),
                    row.active_ads as i64,
                    row.active_campaigns as i64,
                    now,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("upsert_account_metrics: {e}")))?;
        Ok(())
    }

    async fn get_account_metrics(
        &self,
        user_id: &str,
        lens: Lens,
        date: NaiveDate,
    ) -> Result<Vec<AccountLensMetrics>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id, account_id, lens, source_date, currency, spend_original,
                        spend_usd, results, cost_per_result_usd, active_ads, active_campaigns
                 FROM lens_account_metrics
                 WHERE user_id = ?1 AND lens = ?2 AND source_date = ?3
                 ORDER BY account_id",
                params![user_id, lens.as_str(), date.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_account_metrics: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get_account_metrics: {e}")))?
        {
            out.push(
                row_to_metrics(&row)
                    .map_err(|e| StoreError::Query(format!("get_account_metrics row parse: {e}")))?,
            );
        }
        Ok(out)
    }

    async fn upsert_lens_summary(&self, summary: &LensSummary) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO lens_summaries (user_id, lens, spend_usd, results,
                     cost_per_result_usd, accounts, active_ads, active_campaigns, last_synced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(user_id, lens) DO UPDATE SET
                     spend_usd = excluded.spend_usd,
                     results = excluded.results,
                     cost_per_result_usd = excluded.cost_per_result_usd,
                     accounts = excluded.accounts,
                     active_ads = excluded.active_ads,
                     active_campaigns = excluded.active_campaigns,
                     last_synced_at = excluded.last_synced_at",
                params![
                    summary.user_id.clone(),
                    summary.lens.as_str(),
                    summary.spend_usd.to_string(),
                    summary.results as i64,
                    opt_decimal(summary.cost_per_result_usd),
                    summary.accounts as i64,
                    summary.active_ads as i64,
                    summary.active_campaigns as i64,
                    summary.last_synced_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("upsert_lens_summary: {e}")))?;
        Ok(())
    }

    async fn get_lens_summaries(&self, user_id: &str) -> Result<Vec<LensSummary>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id, lens, spend_usd, results, cost_per_result_usd,
                        accounts, active_ads, active_campaigns, last_synced_at
                 FROM lens_summaries WHERE user_id = ?1 ORDER BY lens",
                params![user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_lens_summaries: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get_lens_summaries: {e}")))?
        {
            out.push(
                row_to_summary(&row)
                    .map_err(|e| StoreError::Query(format!("get_lens_summaries row parse: {e}")))?,
            );
        }
        Ok(out)
    }

    async fn append_lens_point(&self, point: &LensPoint) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO lens_timeseries (user_id, lens, spend_usd, results,
                     cost_per_result_usd, captured_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    point.user_id.clone(),
                    point.lens.as_str(),
                    point.spend_usd.to_string(),
                    point.results as i64,
                    opt_decimal(point.cost_per_result_usd),
                    point.captured_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_lens_point: {e}")))?;
        Ok(())
    }

    async fn lens_points_since(
        &self,
        user_id: &str,
        lens: Lens,
        since: DateTime<Utc>,
    ) -> Result<Vec<LensPoint>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id, lens, spend_usd, results, cost_per_result_usd, captured_at
                 FROM lens_timeseries
                 WHERE user_id = ?1 AND lens = ?2 AND captured_at >= ?3
                 ORDER BY captured_at",
                params![user_id, lens.as_str(), since.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("lens_points_since: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("lens_points_since: {e}")))?
        {
            let lens_str: String = row
                .get(1)
                .map_err(|e| StoreError::Query(format!("lens_points_since row parse: {e}")))?;
            let captured: String = row
                .get(5)
                .map_err(|e| StoreError::Query(format!("lens_points_since row parse: {e}")))?;
            out.push(LensPoint {
                user_id: row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("lens_points_since row parse: {e}")))?,
                lens: Lens::from_str_loose(&lens_str).unwrap_or(Lens::Overview),
                spend_usd: parse_decimal(
                    &row.get::<String>(2)
                        .map_err(|e| StoreError::Query(format!("lens_points_since row parse: {e}")))?,
                ),
                results: row
                    .get::<i64>(3)
                    .map_err(|e| StoreError::Query(format!("lens_points_since row parse: {e}")))?
                    .max(0) as u64,
                cost_per_result_usd: parse_optional_decimal(
                    &row.get(4)
                        .map_err(|e| StoreError::Query(format!("lens_points_since row parse: {e}")))?,
                ),
                captured_at: parse_datetime(&captured),
            });
        }
        Ok(out)
    }

    // ── Performance state & snapshots ───────────────────────────────

    async fn get_performance_state(
        &self,
        user_id: &str,
    ) -> Result<Vec<PerformanceRow>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PERFORMANCE_COLUMNS} FROM performance_state
                     WHERE user_id = ?1 ORDER BY level, entity_id"
                ),
                params![user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_performance_state: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get_performance_state: {e}")))?
        {
            out.push(row_to_performance(&row).map_err(|e| {
                StoreError::Query(format!("get_performance_state row parse: {e}"))
            })?);
        }
        Ok(out)
    }

    async fn replace_performance_state(
        &self,
        user_id: &str,
        rows: &[PerformanceRow],
        cycle_ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let stamp = cycle_ts.to_rfc3339();
        for row in rows {
            self.conn()
                .execute(
                    "INSERT INTO performance_state (user_id, level, entity_id, name, parent_id,
                         account_id, spend_usd, results, cost_per_result_usd, ctr, cpc, cpm,
                         trend, health, recommendation, action, confidence, model, reason,
                         captured_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                         ?15, ?16, ?17, ?18, ?19, ?20)
                     ON CONFLICT(user_id, level, entity_id) DO UPDATE SET
                         name = excluded.name,
                         parent_id = excluded.parent_id,
                         account_id = excluded.account_id,
                         spend_usd = excluded.spend_usd,
                         results = excluded.results,
                         cost_per_result_usd = excluded.cost_per_result_usd,
                         ctr = excluded.ctr,
                         cpc = excluded.cpc,
                         cpm = excluded.cpm,
                         trend = excluded.trend,
                         health = excluded.health,
                         recommendation = excluded.recommendation,
                         action = excluded.action,
                         confidence = excluded.confidence,
                         model = excluded.model,
                         reason = excluded.reason,
                         captured_at = excluded.captured_at",
                    params![
                        user_id,
                        row.level.as_str(),
                        row.entity_id.clone(),
                        row.name.clone(),
                        opt_text_owned(row.parent_id.clone()),
                        row.account_id.clone(),
                        row.spend_usd.to_string(),
                        row.results as i64,
                        opt_decimal(row.cost_per_result_usd),
                        opt_decimal(row.ctr),
                        opt_decimal(row.cpc),
                        opt_decimal(row.cpm),
                        row.trend.as_str(),
                        row.health.as_str(),
                        row.recommendation.as_str(),
                        row.action.as_str(),
                        row.confidence as i64,
                        row.model.clone(),
                        row.reason.clone(),
                        stamp.clone(),
                    ],
                )
                .await
                .map_err(|e| StoreError::Query(format!("replace_performance_state: {e}")))?;
        }

        // Sweep entities that did not appear in this cycle.
        let swept = self
            .conn()
            .execute(
                "DELETE FROM performance_state WHERE user_id = ?1 AND captured_at < ?2",
                params![user_id, stamp],
            )
            .await
            .map_err(|e| StoreError::Query(format!("replace_performance_state sweep: {e}")))?;
        if swept > 0 {
            debug!(user_id, swept, "swept stale performance-state rows");
        }
        Ok(())
    }

    async fn count_performance_state(&self, user_id: &str) -> Result<u64, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM performance_state WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("count_performance_state: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).map_err(|e| {
                    StoreError::Query(format!("count_performance_state row parse: {e}"))
                })?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(StoreError::Query(format!("count_performance_state: {e}"))),
        }
    }

    async fn append_snapshots(&self, rows: &[PerformanceRow]) -> Result<(), StoreError> {
        for row in rows {
            self.conn()
                .execute(
                    "INSERT INTO performance_snapshots (user_id, level, entity_id, name,
                         parent_id, account_id, spend_usd, results, cost_per_result_usd,
                         ctr, cpc, cpm, trend, health, recommendation, action, confidence,
                         model, reason, captured_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                         ?15, ?16, ?17, ?18, ?19, ?20)",
                    params![
                        row.user_id.clone(),
                        row.level.as_str(),
                        row.entity_id.clone(),
                        row.name.clone(),
                        opt_text_owned(row.parent_id.clone()),
                        row.account_id.clone(),
                        row.spend_usd.to_string(),
                        row.results as i64,
                        opt_decimal(row.cost_per_result_usd),
                        opt_decimal(row.ctr),
                        opt_decimal(row.cpc),
                        opt_decimal(row.cpm),
                        row.trend.as_str(),
                        row.health.as_str(),
                        row.recommendation.as_str(),
                        row.action.as_str(),
                        row.confidence as i64,
                        row.model.clone(),
                        row.reason.clone(),
                        row.captured_at.to_rfc3339(),
                    ],
                )
                .await
                .map_err(|e| StoreError::Query(format!("append_snapshots: {e}")))?;
        }
        Ok(())
    }

    async fn snapshots_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<PerformanceRow>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PERFORMANCE_COLUMNS} FROM performance_snapshots
                     WHERE user_id = ?1 AND captured_at >= ?2
                     ORDER BY captured_at"
                ),
                params![user_id, since.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("snapshots_since: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("snapshots_since: {e}")))?
        {
            out.push(
                row_to_performance(&row)
                    .map_err(|e| StoreError::Query(format!("snapshots_since row parse: {e}")))?,
            );
        }
        Ok(out)
    }

    // ── AI telemetry & slot claim ───────────────────────────────────

    async fn try_claim_ai_slot(
        &self,
        user_id: &str,
        slot_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        // Conditional upsert: the update fires only when the stored run
        // predates this slot. rows_affected tells us who won the race.
        let affected = self
            .conn()
            .execute(
                "INSERT INTO ai_runs (user_id, last_run_at, last_slot_start, updated_at)
                 VALUES (?1, ?2, ?3, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET
                     last_run_at = excluded.last_run_at,
                     last_slot_start = excluded.last_slot_start,
                     updated_at = excluded.updated_at
                 WHERE ai_runs.last_run_at IS NULL OR ai_runs.last_run_at < ?3",
                params![user_id, now.to_rfc3339(), slot_start.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("try_claim_ai_slot: {e}")))?;
        Ok(affected > 0)
    }

    async fn record_ai_run(&self, telemetry: &AiRunTelemetry) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        // COALESCE keeps the stored run timestamps when a skipped run
        // reports None, so the slot gate stays intact.
        self.conn()
            .execute(
                "INSERT INTO ai_runs (user_id, last_run_at, last_slot_start, status, error,
                     candidates, updated, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(user_id) DO UPDATE SET
                     last_run_at = COALESCE(excluded.last_run_at, ai_runs.last_run_at),
                     last_slot_start = COALESCE(excluded.last_slot_start, ai_runs.last_slot_start),
                     status = excluded.status,
                     error = excluded.error,
                     candidates = excluded.candidates,
                     updated = excluded.updated,
                     updated_at = excluded.updated_at",
                params![
                    telemetry.user_id.clone(),
                    opt_datetime(telemetry.last_run_at),
                    opt_datetime(telemetry.last_slot_start),
                    telemetry.status.as_str(),
                    opt_text_owned(telemetry.error.clone()),
                    telemetry.candidates as i64,
                    telemetry.updated as i64,
                    now,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("record_ai_run: {e}")))?;
        Ok(())
    }

    async fn get_ai_telemetry(&self, user_id: &str) -> Result<Option<AiRunTelemetry>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id, last_run_at, last_slot_start, status, error, candidates, updated
                 FROM ai_runs WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_ai_telemetry: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let status: String = row
                    .get(3)
                    .map_err(|e| StoreError::Query(format!("get_ai_telemetry row parse: {e}")))?;
                Ok(Some(AiRunTelemetry {
                    user_id: row
                        .get(0)
                        .map_err(|e| StoreError::Query(format!("get_ai_telemetry row parse: {e}")))?,
                    last_run_at: parse_optional_datetime(
                        &row.get(1).map_err(|e| {
                            StoreError::Query(format!("get_ai_telemetry row parse: {e}"))
                        })?,
                    ),
                    last_slot_start: parse_optional_datetime(
                        &row.get(2).map_err(|e| {
                            StoreError::Query(format!("get_ai_telemetry row parse: {e}"))
                        })?,
                    ),
                    status: RunStatus::from_str_loose(&status).unwrap_or(RunStatus::Skipped),
                    error: row
                        .get(4)
                        .map_err(|e| StoreError::Query(format!("get_ai_telemetry row parse: {e}")))?,
                    candidates: row
                        .get::<i64>(5)
                        .map_err(|e| StoreError::Query(format!("get_ai_telemetry row parse: {e}")))?
                        .max(0) as u64,
                    updated: row
                        .get::<i64>(6)
                        .map_err(|e| StoreError::Query(format!("get_ai_telemetry row parse: {e}")))?
                        .max(0) as u64,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_ai_telemetry: {e}"))),
        }
    }

    // ── Retention ───────────────────────────────────────────────────

    async fn prune_lens_points(
        &self,
        cutoff: DateTime<Utc>,
        compact_before: DateTime<Utc>,
    ) -> Result<RetentionStats, StoreError> {
        let expired = self
            .conn()
            .execute(
                "DELETE FROM lens_timeseries WHERE captured_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("prune_lens_points expire: {e}")))?;

        let compacted = self
            .conn()
            .execute(
                "DELETE FROM lens_timeseries AS x
                 WHERE x.captured_at < ?1
                   AND EXISTS (
                       SELECT 1 FROM lens_timeseries AS newer
                       WHERE newer.user_id = x.user_id
                         AND newer.lens = x.lens
                         AND date(newer.captured_at) = date(x.captured_at)
                         AND newer.captured_at > x.captured_at)",
                params![compact_before.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("prune_lens_points compact: {e}")))?;

        Ok(RetentionStats { expired, compacted })
    }

    async fn prune_snapshots(
        &self,
        cutoff: DateTime<Utc>,
        compact_before: DateTime<Utc>,
    ) -> Result<RetentionStats, StoreError> {
        let expired = self
            .conn()
            .execute(
                "DELETE FROM performance_snapshots WHERE captured_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("prune_snapshots expire: {e}")))?;

        let compacted = self
            .conn()
            .execute(
                "DELETE FROM performance_snapshots AS x
                 WHERE x.captured_at < ?1
                   AND EXISTS (
                       SELECT 1 FROM performance_snapshots AS newer
                       WHERE newer.user_id = x.user_id
                         AND newer.level = x.level
                         AND newer.entity_id = x.entity_id
                         AND date(newer.captured_at) = date(x.captured_at)
                         AND newer.captured_at > x.captured_at)",
                params![compact_before.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("prune_snapshots compact: {e}")))?;

        Ok(RetentionStats { expired, compacted })
    }

    async fn prune_account_metrics(&self, cutoff_date: NaiveDate) -> Result<u64, StoreError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM lens_account_metrics WHERE source_date < ?1",
                params![cutoff_date.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("prune_account_metrics: {e}")))?;
        Ok(deleted)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn connection(user_id: &str) -> Connection {
        Connection {
            user_id: user_id.to_string(),
            access_token: SecretString::from("tok_1"),
            connected_at: Utc::now(),
        }
    }

    fn sub_campaign(adset_id: &str, classification: Classification) -> SubCampaignRow {
        SubCampaignRow {
            adset_id: adset_id.to_string(),
            account_id: "act_1".to_string(),
            campaign_id: Some("c_1".to_string()),
            name: Some("adset".to_string()),
            optimization_goal: Some("CONVERSATIONS".to_string()),
            destination_type: None,
            has_lead_form: false,
            classification,
        }
    }

    fn auto_class(category: Category) -> Classification {
        Classification {
            category,
            source: ClassificationSource::Auto,
            confidence: 86,
        }
    }

    fn perf_row(user: &str, level: EntityLevel, entity: &str, at: DateTime<Utc>) -> PerformanceRow {
        PerformanceRow {
            user_id: user.to_string(),
            level,
            entity_id: entity.to_string(),
            name: entity.to_string(),
            parent_id: None,
            account_id: "act_1".to_string(),
            spend_usd: dec!(12.50),
            results: 4,
            cost_per_result_usd: Some(dec!(3.13)),
            ctr: Some(dec!(1.2)),
            cpc: None,
            cpm: None,
            trend: Trend::Stable,
            health: Health::Watch,
            recommendation: Recommendation::Stable,
            action: RecAction::None,
            confidence: 55,
            model: "rule".to_string(),
            reason: "No significant movement".to_string(),
            captured_at: at,
        }
    }

    // ── Connections ─────────────────────────────────────────────────

    #[tokio::test]
    async fn new_local_creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("dir").join("metrics.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        assert!(db_path.exists());
        drop(db);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = test_db().await;
        migrations::run_migrations(db.conn()).await.unwrap();
    }

    #[tokio::test]
    async fn connection_roundtrip() {
        let db = test_db().await;
        db.upsert_connection(&connection("u1")).await.unwrap();
        db.upsert_connection(&connection("u2")).await.unwrap();

        let fetched = db.get_connection("u1").await.unwrap().unwrap();
        assert_eq!(fetched.user_id, "u1");
        assert_eq!(fetched.access_token.expose_secret(), "tok_1");

        let all = db.list_connections().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].user_id, "u1");

        db.delete_connection("u1").await.unwrap();
        assert!(db.get_connection("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inventory_replace_and_list() {
        let db = test_db().await;
        let accounts = vec![
            AdAccount {
                user_id: "u1".to_string(),
                account_id: "act_2".to_string(),
                name: "Second".to_string(),
                currency: "PEN".to_string(),
            },
            AdAccount {
                user_id: "u1".to_string(),
                account_id: "act_1".to_string(),
                name: "First".to_string(),
                currency: "USD".to_string(),
            },
        ];
        db.replace_ad_accounts("u1", &accounts).await.unwrap();

        let listed = db.list_ad_accounts("u1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].account_id, "act_1");
        assert_eq!(listed[1].currency, "PEN");

        db.replace_ad_accounts("u1", &accounts[..1]).await.unwrap();
        assert_eq!(db.list_ad_accounts("u1").await.unwrap().len(), 1);
    }

    // ── Classifications ─────────────────────────────────────────────

    #[tokio::test]
    async fn manual_classification_survives_auto_upserts() {
        let db = test_db().await;

        db.upsert_sub_campaigns("u1", &[sub_campaign("as_1", auto_class(Category::Messaging))])
            .await
            .unwrap();

        let manual = Classification {
            category: Category::Sales,
            source: ClassificationSource::Manual,
            confidence: 90,
        };
        db.set_manual_classification("u1", "as_1", "act_1", &manual)
            .await
            .unwrap();

        // Auto re-sync must not clobber the manual category.
        db.upsert_sub_campaigns("u1", &[sub_campaign("as_1", auto_class(Category::Awareness))])
            .await
            .unwrap();

        let overrides = db.manual_overrides("u1").await.unwrap();
        let m = overrides.get("as_1").unwrap();
        assert_eq!(m.category, Category::Sales);
        assert_eq!(m.confidence, Some(90));
    }

    #[tokio::test]
    async fn auto_rows_are_not_overrides() {
        let db = test_db().await;
        db.upsert_sub_campaigns("u1", &[sub_campaign("as_1", auto_class(Category::Leads))])
            .await
            .unwrap();
        assert!(db.manual_overrides("u1").await.unwrap().is_empty());
    }

    // ── Lens metrics ────────────────────────────────────────────────

    #[tokio::test]
    async fn account_metrics_upsert_is_idempotent() {
        let db = test_db().await;
        let date = NaiveDate::from_ymd_opt(2026, 8, 22).unwrap();
        let row = AccountLensMetrics {
            user_id: "u1".to_string(),
            account_id: "act_1".to_string(),
            lens: Lens::Leads,
            source_date: date,
            currency: "PEN".to_string(),
            spend_original: dec!(37.00),
            spend_usd: dec!(10.00),
            results: 5,
            cost_per_result_usd: Some(dec!(2.00)),
            active_ads: 3,
            active_campaigns: 1,
        };

        db.upsert_account_metrics(&row).await.unwrap();
        db.upsert_account_metrics(&row).await.unwrap();

        let fetched = db.get_account_metrics("u1", Lens::Leads, date).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0], row);
    }

    #[tokio::test]
    async fn summary_is_one_row_per_lens() {
        let db = test_db().await;
        let mut summary = LensSummary {
            user_id: "u1".to_string(),
            lens: Lens::Sales,
            spend_usd: dec!(100),
            results: 2,
            cost_per_result_usd: Some(dec!(50)),
            accounts: 1,
            active_ads: 4,
            active_campaigns: 2,
            last_synced_at: Utc::now(),
        };
        db.upsert_lens_summary(&summary).await.unwrap();
        summary.spend_usd = dec!(140);
        db.upsert_lens_summary(&summary).await.unwrap();

        let all = db.get_lens_summaries("u1").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].spend_usd, dec!(140));
    }

    // ── Performance state ───────────────────────────────────────────

    #[tokio::test]
    async fn replace_state_upserts_then_sweeps() {
        let db = test_db().await;
        let t1 = Utc.with_ymd_and_hms(2026, 8, 22, 10, 0, 0).unwrap();
        let t2 = t1 + Duration::minutes(10);

        let first = vec![
            perf_row("u1", EntityLevel::Campaign, "c_1", t1),
            perf_row("u1", EntityLevel::Campaign, "c_2", t1),
        ];
        db.replace_performance_state("u1", &first, t1).await.unwrap();
        assert_eq!(db.count_performance_state("u1").await.unwrap(), 2);

        // Next cycle: c_2 disappeared, c_3 appeared.
        let second = vec![
            perf_row("u1", EntityLevel::Campaign, "c_1", t2),
            perf_row("u1", EntityLevel::Campaign, "c_3", t2),
        ];
        db.replace_performance_state("u1", &second, t2).await.unwrap();

        let state = db.get_performance_state("u1").await.unwrap();
        let ids: Vec<&str> = state.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["c_1", "c_3"]);
    }

    #[tokio::test]
    async fn replace_state_does_not_touch_other_users() {
        let db = test_db().await;
        let t = Utc::now();
        db.replace_performance_state("u1", &[perf_row("u1", EntityLevel::Ad, "a_1", t)], t)
            .await
            .unwrap();
        db.replace_performance_state("u2", &[perf_row("u2", EntityLevel::Ad, "a_9", t)], t)
            .await
            .unwrap();
        assert_eq!(db.count_performance_state("u1").await.unwrap(), 1);
        assert_eq!(db.count_performance_state("u2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn snapshots_filter_by_time() {
        let db = test_db().await;
        let early = Utc.with_ymd_and_hms(2026, 8, 22, 8, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 8, 22, 12, 0, 0).unwrap();
        db.append_snapshots(&[
            perf_row("u1", EntityLevel::Adset, "as_1", early),
            perf_row("u1", EntityLevel::Adset, "as_1", late),
        ])
        .await
        .unwrap();

        let since = db
            .snapshots_since("u1", Utc.with_ymd_and_hms(2026, 8, 22, 10, 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].captured_at, late);
    }

    // ── Slot claim ──────────────────────────────────────────────────

    #[tokio::test]
    async fn slot_claim_wins_once_per_slot() {
        let db = test_db().await;
        let slot = Utc.with_ymd_and_hms(2026, 8, 22, 14, 30, 0).unwrap();

        let first = db
            .try_claim_ai_slot("u1", slot, slot + Duration::minutes(1))
            .await
            .unwrap();
        let second = db
            .try_claim_ai_slot("u1", slot, slot + Duration::minutes(5))
            .await
            .unwrap();
        assert!(first);
        assert!(!second);

        // Next slot is claimable again.
        let next_slot = slot + Duration::minutes(30);
        let third = db
            .try_claim_ai_slot("u1", next_slot, next_slot + Duration::minutes(1))
            .await
            .unwrap();
        assert!(third);
    }

    #[tokio::test]
    async fn slot_claim_handles_subsecond_run_times() {
        let db = test_db().await;
        let slot = Utc.with_ymd_and_hms(2026, 8, 22, 14, 30, 0).unwrap();

        // Wall-clock run times carry nanoseconds; the gate compares them
        // against whole-second slot boundaries as rfc3339 text.
        let first_run = slot + Duration::nanoseconds(123_456_789);
        assert!(db.try_claim_ai_slot("u1", slot, first_run).await.unwrap());

        let retry = slot + Duration::minutes(7) + Duration::nanoseconds(999_999_999);
        assert!(!db.try_claim_ai_slot("u1", slot, retry).await.unwrap());

        let next_slot = slot + Duration::minutes(30);
        assert!(db
            .try_claim_ai_slot("u1", next_slot, next_slot + Duration::nanoseconds(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn skipped_run_preserves_claim_timestamps() {
        let db = test_db().await;
        let slot = Utc.with_ymd_and_hms(2026, 8, 22, 14, 0, 0).unwrap();
        let run_at = slot + Duration::minutes(2);
        assert!(db.try_claim_ai_slot("u1", slot, run_at).await.unwrap());

        db.record_ai_run(&AiRunTelemetry {
            user_id: "u1".to_string(),
            last_run_at: None,
            last_slot_start: None,
            status: RunStatus::Skipped,
            error: None,
            candidates: 0,
            updated: 0,
        })
        .await
        .unwrap();

        let telemetry = db.get_ai_telemetry("u1").await.unwrap().unwrap();
        assert_eq!(telemetry.status, RunStatus::Skipped);
        assert_eq!(telemetry.last_run_at, Some(run_at));

        // And the gate still holds for this slot.
        assert!(!db.try_claim_ai_slot("u1", slot, run_at + Duration::minutes(3)).await.unwrap());
    }

    // ── Retention ───────────────────────────────────────────────────

    fn lens_point(user: &str, at: DateTime<Utc>) -> LensPoint {
        LensPoint {
            user_id: user.to_string(),
            lens: Lens::Overview,
            spend_usd: dec!(5),
            results: 1,
            cost_per_result_usd: Some(dec!(5)),
            captured_at: at,
        }
    }

    #[tokio::test]
    async fn compaction_keeps_newest_row_per_day() {
        let db = test_db().await;
        let day = Utc.with_ymd_and_hms(2026, 8, 18, 0, 0, 0).unwrap();
        // Three intraday points on one old day, plus one recent point.
        for minutes in [10, 300, 800] {
            db.append_lens_point(&lens_point("u1", day + Duration::minutes(minutes)))
                .await
                .unwrap();
        }
        let recent = Utc.with_ymd_and_hms(2026, 8, 22, 9, 0, 0).unwrap();
        db.append_lens_point(&lens_point("u1", recent)).await.unwrap();

        let cutoff = Utc.with_ymd_and_hms(2026, 8, 15, 0, 0, 0).unwrap();
        let compact_before = Utc.with_ymd_and_hms(2026, 8, 21, 0, 0, 0).unwrap();
        let stats = db.prune_lens_points(cutoff, compact_before).await.unwrap();
        assert_eq!(stats.expired, 0);
        assert_eq!(stats.compacted, 2);

        let kept = db.lens_points_since("u1", Lens::Overview, cutoff).await.unwrap();
        assert_eq!(kept.len(), 2);
        // The survivor for the old day is its newest point.
        assert_eq!(kept[0].captured_at, day + Duration::minutes(800));
    }

    #[tokio::test]
    async fn compaction_orders_subsecond_timestamps() {
        let db = test_db().await;
        let day = Utc.with_ymd_and_hms(2026, 8, 18, 9, 0, 0).unwrap();
        // Capture times carry nanoseconds; the newest of the day must win
        // even against a whole-second row in the same second.
        let late = day + Duration::seconds(40) + Duration::nanoseconds(123_456_789);
        for at in [day + Duration::nanoseconds(900_000_000), late, day + Duration::seconds(40)] {
            db.append_lens_point(&lens_point("u1", at)).await.unwrap();
        }

        let cutoff = Utc.with_ymd_and_hms(2026, 8, 15, 0, 0, 0).unwrap();
        let compact_before = Utc.with_ymd_and_hms(2026, 8, 21, 0, 0, 0).unwrap();
        let stats = db.prune_lens_points(cutoff, compact_before).await.unwrap();
        assert_eq!(stats.compacted, 2);

        let kept = db.lens_points_since("u1", Lens::Overview, cutoff).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].captured_at, late);
    }

    #[tokio::test]
    async fn retention_deletes_expired_rows() {
        let db = test_db().await;
        let old = Utc.with_ymd_and_hms(2026, 8, 10, 12, 0, 0).unwrap();
        db.append_lens_point(&lens_point("u1", old)).await.unwrap();
        db.append_snapshots(&[perf_row("u1", EntityLevel::Ad, "a_1", old)])
            .await
            .unwrap();

        let cutoff = Utc.with_ymd_and_hms(2026, 8, 15, 0, 0, 0).unwrap();
        let points = db.prune_lens_points(cutoff, cutoff).await.unwrap();
        let snaps = db.prune_snapshots(cutoff, cutoff).await.unwrap();
        assert_eq!(points.expired, 1);
        assert_eq!(snaps.expired, 1);
    }

    #[tokio::test]
    async fn snapshot_compaction_is_per_entity() {
        let db = test_db().await;
        let day = Utc.with_ymd_and_hms(2026, 8, 18, 0, 0, 0).unwrap();
        db.append_snapshots(&[
            perf_row("u1", EntityLevel::Ad, "a_1", day + Duration::minutes(10)),
            perf_row("u1", EntityLevel::Ad, "a_1", day + Duration::minutes(500)),
            perf_row("u1", EntityLevel::Ad, "a_2", day + Duration::minutes(20)),
        ])
        .await
        .unwrap();

        let cutoff = Utc.with_ymd_and_hms(2026, 8, 15, 0, 0, 0).unwrap();
        let compact_before = Utc.with_ymd_and_hms(2026, 8, 21, 0, 0, 0).unwrap();
        let stats = db.prune_snapshots(cutoff, compact_before).await.unwrap();
        assert_eq!(stats.compacted, 1);

        let remaining = db.snapshots_since("u1", cutoff).await.unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn account_metrics_expire_by_date() {
        let db = test_db().await;
        let mut row = AccountLensMetrics {
            user_id: "u1".to_string(),
            account_id: "act_1".to_string(),
            lens: Lens::Overview,
            source_date: NaiveDate::from_ymd_opt(2026, 8, 10).unwrap(),
            currency: "USD".to_string(),
            spend_original: dec!(1),
            spend_usd: dec!(1),
            results: 0,
            cost_per_result_usd: None,
            active_ads: 0,
            active_campaigns: 0,
        };
        db.upsert_account_metrics(&row).await.unwrap();
        row.source_date = NaiveDate::from_ymd_opt(2026, 8, 22).unwrap();
        db.upsert_account_metrics(&row).await.unwrap();

        let deleted = db
            .prune_account_metrics(NaiveDate::from_ymd_opt(2026, 8, 15).unwrap())
            .await
            .unwrap();
        assert_eq!(deleted, 1);
    }
}
