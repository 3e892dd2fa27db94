//! Version-tracked schema migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::StoreError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS connections (
            user_id TEXT PRIMARY KEY,
            access_token TEXT NOT NULL,
            connected_at TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS ad_accounts (
            user_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            name TEXT NOT NULL,
            currency TEXT NOT NULL DEFAULT 'USD',
            PRIMARY KEY (user_id, account_id)
        );
        CREATE INDEX IF NOT EXISTS idx_ad_accounts_user ON ad_accounts(user_id);

        CREATE TABLE IF NOT EXISTS sub_campaigns (
            user_id TEXT NOT NULL,
            adset_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            campaign_id TEXT,
            name TEXT,
            optimization_goal TEXT,
            destination_type TEXT,
            has_lead_form INTEGER NOT NULL DEFAULT 0,
            category TEXT NOT NULL,
            source TEXT NOT NULL DEFAULT 'auto',
            confidence INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, adset_id)
        );
        CREATE INDEX IF NOT EXISTS idx_sub_campaigns_account
            ON sub_campaigns(user_id, account_id);
        CREATE INDEX IF NOT EXISTS idx_sub_campaigns_source
            ON sub_campaigns(user_id, source);

        CREATE TABLE IF NOT EXISTS lens_account_metrics (
            user_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            lens TEXT NOT NULL,
            source_date TEXT NOT NULL,
            currency TEXT NOT NULL DEFAULT 'USD',
            spend_original TEXT NOT NULL DEFAULT '0',
            spend_usd TEXT NOT NULL DEFAULT '0',
            results INTEGER NOT NULL DEFAULT 0,
            cost_per_result_usd TEXT,
            active_ads INTEGER NOT NULL DEFAULT 0,
            active_campaigns INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, account_id, lens, source_date)
        );
        CREATE INDEX IF NOT EXISTS idx_lens_account_metrics_user_lens
            ON lens_account_metrics(user_id, lens, source_date);

        CREATE TABLE IF NOT EXISTS lens_summaries (
            user_id TEXT NOT NULL,
            lens TEXT NOT NULL,
            spend_usd TEXT NOT NULL DEFAULT '0',
            results INTEGER NOT NULL DEFAULT 0,
            cost_per_result_usd TEXT,
            accounts INTEGER NOT NULL DEFAULT 0,
            active_ads INTEGER NOT NULL DEFAULT 0,
            active_campaigns INTEGER NOT NULL DEFAULT 0,
            last_synced_at TEXT NOT NULL,
            PRIMARY KEY (user_id, lens)
        );

        CREATE TABLE IF NOT EXISTS lens_timeseries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            lens TEXT NOT NULL,
            spend_usd TEXT NOT NULL DEFAULT '0',
            results INTEGER NOT NULL DEFAULT 0,
            cost_per_result_usd TEXT,
            captured_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_lens_timeseries_user_lens_time
            ON lens_timeseries(user_id, lens, captured_at);

        CREATE TABLE IF NOT EXISTS performance_state (
            user_id TEXT NOT NULL,
            level TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            parent_id TEXT,
            account_id TEXT NOT NULL,
            spend_usd TEXT NOT NULL DEFAULT '0',
            results INTEGER NOT NULL DEFAULT 0,
            cost_per_result_usd TEXT,
            ctr TEXT,
            cpc TEXT,
            cpm TEXT,
            trend TEXT NOT NULL DEFAULT 'stable',
            health TEXT NOT NULL DEFAULT 'watch',
            recommendation TEXT NOT NULL DEFAULT 'stable',
            action TEXT NOT NULL DEFAULT 'none',
            confidence INTEGER NOT NULL DEFAULT 0,
            model TEXT NOT NULL DEFAULT 'rule',
            reason TEXT NOT NULL DEFAULT '',
            captured_at TEXT NOT NULL,
            PRIMARY KEY (user_id, level, entity_id)
        );
        CREATE INDEX IF NOT EXISTS idx_performance_state_account
            ON performance_state(user_id, account_id);

        CREATE TABLE IF NOT EXISTS performance_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            level TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            parent_id TEXT,
            account_id TEXT NOT NULL,
            spend_usd TEXT NOT NULL DEFAULT '0',
            results INTEGER NOT NULL DEFAULT 0,
            cost_per_result_usd TEXT,
            ctr TEXT,
            cpc TEXT,
            cpm TEXT,
            trend TEXT NOT NULL DEFAULT 'stable',
            health TEXT NOT NULL DEFAULT 'watch',
            recommendation TEXT NOT NULL DEFAULT 'stable',
            action TEXT NOT NULL DEFAULT 'none',
            confidence INTEGER NOT NULL DEFAULT 0,
            model TEXT NOT NULL DEFAULT 'rule',
            reason TEXT NOT NULL DEFAULT '',
            captured_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_performance_snapshots_entity_time
            ON performance_snapshots(user_id, level, entity_id, captured_at);
        CREATE INDEX IF NOT EXISTS idx_performance_snapshots_time
            ON performance_snapshots(user_id, captured_at);

        CREATE TABLE IF NOT EXISTS ai_runs (
            user_id TEXT PRIMARY KEY,
            last_run_at TEXT,
            last_slot_start TEXT,
            status TEXT NOT NULL DEFAULT 'skipped',
            error TEXT,
            candidates INTEGER NOT NULL DEFAULT 0,
            updated INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
    "#,
}];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                StoreError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                StoreError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| StoreError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
