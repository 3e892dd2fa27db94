//! Retention and compaction for the time-series tables.
//!
//! Fixed-window retention with daily compaction: rows past the window
//! are deleted; rows from days before yesterday collapse to the newest
//! point per day, so intraday charts stay cheap without losing the
//! daily shape. One pass covers every user, so the sync engine runs it
//! once per batch after the write phase.

use std::sync::Arc;

use chrono::{DateTime, Days, Duration, NaiveTime, Utc};
use tracing::{debug, info};

use crate::error::Result;
use crate::store::traits::MetricsStore;

pub struct RetentionManager {
    store: Arc<dyn MetricsStore>,
    retention_days: i64,
}

impl RetentionManager {
    pub fn new(store: Arc<dyn MetricsStore>, retention_days: i64) -> Self {
        Self {
            store,
            retention_days,
        }
    }

    /// One pass over every retained table.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<()> {
        let cutoff = now - Duration::days(self.retention_days);
        let compact_before = yesterday_start(now);

        let points = self.store.prune_lens_points(cutoff, compact_before).await?;
        let snapshots = self.store.prune_snapshots(cutoff, compact_before).await?;
        let metrics = self
            .store
            .prune_account_metrics(cutoff.date_naive())
            .await?;

        if points.total() + snapshots.total() + metrics > 0 {
            info!(
                lens_expired = points.expired,
                lens_compacted = points.compacted,
                snapshot_expired = snapshots.expired,
                snapshot_compacted = snapshots.compacted,
                account_metrics = metrics,
                "retention pass removed rows"
            );
        } else {
            debug!("retention pass removed nothing");
        }
        Ok(())
    }
}

/// Start of the previous UTC day. Rows captured before this belong to
/// completed days and compact to one per day; yesterday and today keep
/// full intraday resolution.
fn yesterday_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let yesterday = now
        .date_naive()
        .checked_sub_days(Days::new(1))
        .unwrap_or(now.date_naive());
    yesterday.and_time(NaiveTime::MIN).and_utc()
}
