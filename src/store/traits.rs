//! Unified `MetricsStore` trait — single async interface for all
//! persistence: connections, inventory, classifications, lens metrics,
//! performance state and AI-run telemetry.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::classify::{Classification, ManualOverride};
use crate::error::StoreError;
use crate::inventory::{AdAccount, Connection};
use crate::lens::{AccountLensMetrics, Lens, LensPoint, LensSummary};
use crate::monitor::PerformanceRow;
use crate::recommend::AiRunTelemetry;

/// A sub-campaign's configuration and classification as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SubCampaignRow {
    pub adset_id: String,
    pub account_id: String,
    pub campaign_id: Option<String>,
    pub name: Option<String>,
    pub optimization_goal: Option<String>,
    pub destination_type: Option<String>,
    pub has_lead_form: bool,
    pub classification: Classification,
}

/// Rows removed by one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionStats {
    pub expired: u64,
    pub compacted: u64,
}

impl RetentionStats {
    pub fn total(&self) -> u64 {
        self.expired + self.compacted
    }
}

/// Backend-agnostic persistence trait for the sync engine.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    // ── Connections & inventory ─────────────────────────────────────

    async fn upsert_connection(&self, conn: &Connection) -> Result<(), StoreError>;

    async fn get_connection(&self, user_id: &str) -> Result<Option<Connection>, StoreError>;

    /// All stored connections, ordered by user id.
    async fn list_connections(&self) -> Result<Vec<Connection>, StoreError>;

    /// Remove a connection and its account inventory.
    async fn delete_connection(&self, user_id: &str) -> Result<(), StoreError>;

    /// Replace a user's account inventory wholesale.
    async fn replace_ad_accounts(
        &self,
        user_id: &str,
        accounts: &[AdAccount],
    ) -> Result<(), StoreError>;

    async fn list_ad_accounts(&self, user_id: &str) -> Result<Vec<AdAccount>, StoreError>;

    // ── Sub-campaign classifications ────────────────────────────────

    /// Upsert classification rows. Rows whose stored source is `manual`
    /// keep their category/source/confidence; only configuration columns
    /// are refreshed. The guard lives in the SQL, not the caller.
    async fn upsert_sub_campaigns(
        &self,
        user_id: &str,
        rows: &[SubCampaignRow],
    ) -> Result<(), StoreError>;

    /// Manual overrides for a user, keyed by adset id.
    async fn manual_overrides(
        &self,
        user_id: &str,
    ) -> Result<HashMap<String, ManualOverride>, StoreError>;

    /// Set a manual classification; it is authoritative from then on.
    async fn set_manual_classification(
        &self,
        user_id: &str,
        adset_id: &str,
        account_id: &str,
        classification: &Classification,
    ) -> Result<(), StoreError>;

    // ── Lens metrics ────────────────────────────────────────────────

    /// Upsert one account's daily row, keyed by (user, account, lens, date).
    async fn upsert_account_metrics(&self, row: &AccountLensMetrics) -> Result<(), StoreError>;

    async fn get_account_metrics(
        &self,
        user_id: &str,
        lens: Lens,
        date: NaiveDate,
    ) -> Result<Vec<AccountLensMetrics>, StoreError>;

    /// Upsert the single summary row per (user, lens).
    async fn upsert_lens_summary(&self, summary: &LensSummary) -> Result<(), StoreError>;

    async fn get_lens_summaries(&self, user_id: &str) -> Result<Vec<LensSummary>, StoreError>;

    /// Append one intraday chart point.
    async fn append_lens_point(&self, point: &LensPoint) -> Result<(), StoreError>;

    async fn lens_points_since(
        &self,
        user_id: &str,
        lens: Lens,
        since: DateTime<Utc>,
    ) -> Result<Vec<LensPoint>, StoreError>;

    // ── Performance state & snapshots ───────────────────────────────

    /// Current state rows for a user, all levels.
    async fn get_performance_state(&self, user_id: &str)
    -> Result<Vec<PerformanceRow>, StoreError>;

    /// Replace a user's current state: upsert every row stamped with
    /// `cycle_ts`, then sweep rows whose stamp predates it. The table is
    /// never empty mid-cycle and ends holding exactly the new batch.
    async fn replace_performance_state(
        &self,
        user_id: &str,
        rows: &[PerformanceRow],
        cycle_ts: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn count_performance_state(&self, user_id: &str) -> Result<u64, StoreError>;

    /// Append history rows; one per entity per cycle.
    async fn append_snapshots(&self, rows: &[PerformanceRow]) -> Result<(), StoreError>;

    /// Snapshot history for a user captured at or after `since`.
    async fn snapshots_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<PerformanceRow>, StoreError>;

    // ── AI telemetry & slot claim ───────────────────────────────────

    /// Atomically claim the recommendation slot starting at `slot_start`.
    /// Returns `false` when another run already holds it. Single
    /// conditional upsert at the storage layer; two racing syncs cannot
    /// both win.
    async fn try_claim_ai_slot(
        &self,
        user_id: &str,
        slot_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Record the outcome of a recommendation run.
    async fn record_ai_run(&self, telemetry: &AiRunTelemetry) -> Result<(), StoreError>;

    async fn get_ai_telemetry(&self, user_id: &str) -> Result<Option<AiRunTelemetry>, StoreError>;

    // ── Retention ───────────────────────────────────────────────────

    /// Drop lens points older than `cutoff`; compact points older than
    /// `compact_before` to the newest row per (user, lens, day).
    async fn prune_lens_points(
        &self,
        cutoff: DateTime<Utc>,
        compact_before: DateTime<Utc>,
    ) -> Result<RetentionStats, StoreError>;

    /// Same policy for snapshot history, keyed per (user, level, entity, day).
    async fn prune_snapshots(
        &self,
        cutoff: DateTime<Utc>,
        compact_before: DateTime<Utc>,
    ) -> Result<RetentionStats, StoreError>;

    /// Drop daily account-metric rows dated before `cutoff_date`. One row
    /// per day already, so no compaction.
    async fn prune_account_metrics(&self, cutoff_date: NaiveDate) -> Result<u64, StoreError>;
}
