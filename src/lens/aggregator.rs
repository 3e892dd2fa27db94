//! One lens pass over a user's accounts.
//!
//! The five lenses share this aggregator; they differ only in which
//! classified sub-campaigns they include and which action precedence
//! counts a result. All filtering happens against the classification
//! map built before the lens passes start, so the passes carry no
//! ordering dependency between each other.

use std::collections::HashSet;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::ads::AdsClient;
use crate::ads::types::{AdInfo, EntityLevel, InsightRow, first_nonzero, is_active};
use crate::classify::is_messaging_destination;
use crate::config::Thresholds;
use crate::error::Result;
use crate::fx::round_usd;
use crate::inventory::AdAccount;
use crate::lens::{AccountLensMetrics, Lens, LensPoint, LensSummary, UserContext};
use crate::store::traits::MetricsStore;

pub struct LensAggregator {
    ads: Arc<AdsClient>,
    store: Arc<dyn MetricsStore>,
    thresholds: Thresholds,
}

impl LensAggregator {
    pub fn new(ads: Arc<AdsClient>, store: Arc<dyn MetricsStore>, thresholds: Thresholds) -> Self {
        Self {
            ads,
            store,
            thresholds,
        }
    }

    /// Run one lens over every account, persisting per-account rows, the
    /// cross-account summary, and one chart point.
    pub async fn run(&self, ctx: &UserContext<'_>, lens: Lens) -> Result<LensSummary> {
        let level = insight_level(lens);
        let mut rows = Vec::with_capacity(ctx.accounts.len());

        for account in ctx.accounts {
            let insights = self
                .ads
                .insights(ctx.token, &account.account_id, level)
                .await?;

            // Active counts come from a secondary listing. Losing them
            // degrades the row, not the sync.
            let ads = match self.ads.list_ads(ctx.token, &account.account_id).await {
                Ok(ads) => ads,
                Err(e) => {
                    warn!(
                        account_id = %account.account_id,
                        lens = %lens,
                        error = %e,
                        "ads listing failed, active counts default to zero"
                    );
                    Vec::new()
                }
            };

            let row = build_account_row(lens, account, &insights, &ads, ctx);
            self.store.upsert_account_metrics(&row).await?;
            rows.push(row);
        }

        let summary = fold_summary(ctx, lens, &rows, &self.thresholds);
        self.store.upsert_lens_summary(&summary).await?;
        self.store
            .append_lens_point(&LensPoint {
                user_id: ctx.user_id.to_string(),
                lens,
                spend_usd: summary.spend_usd,
                results: summary.results,
                cost_per_result_usd: summary.cost_per_result_usd,
                captured_at: ctx.now,
            })
            .await?;

        debug!(
            user_id = %ctx.user_id,
            lens = %lens,
            spend_usd = %summary.spend_usd,
            results = summary.results,
            "lens pass complete"
        );
        Ok(summary)
    }
}

/// Fold per-account rows into the cross-account summary. Cost per result
/// is recomputed from the summed totals, not averaged across accounts,
/// and an account counts as active on spend or on a running ad.
fn fold_summary(
    ctx: &UserContext<'_>,
    lens: Lens,
    rows: &[AccountLensMetrics],
    thresholds: &Thresholds,
) -> LensSummary {
    let mut spend_usd = Decimal::ZERO;
    let mut results = 0u64;
    let mut active_ads = 0u64;
    let mut active_campaigns = 0u64;
    let mut accounts = 0u64;

    for row in rows {
        spend_usd += row.spend_usd;
        results += row.results;
        active_ads += row.active_ads;
        active_campaigns += row.active_campaigns;
        if row.spend_usd >= thresholds.lens_active_spend_usd || row.active_ads > 0 {
            accounts += 1;
        }
    }

    let cost_per_result_usd =
        (results > 0).then(|| round_usd(spend_usd / Decimal::from(results)));

    LensSummary {
        user_id: ctx.user_id.to_string(),
        lens,
        spend_usd,
        results,
        cost_per_result_usd,
        accounts,
        active_ads,
        active_campaigns,
        last_synced_at: ctx.now,
    }
}

/// The overview lens reads account-level rows; the filtered lenses need
/// sub-campaign granularity to apply classification.
fn insight_level(lens: Lens) -> EntityLevel {
    match lens {
        Lens::Overview => EntityLevel::Account,
        _ => EntityLevel::Adset,
    }
}

/// Whether this lens includes the given sub-campaign. The sales lens
/// drops messaging-destination adsets even when they classify as sales.
fn includes_adset(lens: Lens, ctx: &UserContext<'_>, adset_id: &str) -> bool {
    let Some(category) = lens.category() else {
        return true;
    };
    let classified = ctx
        .classifications
        .get(adset_id)
        .is_some_and(|c| c.category == category);
    if !classified {
        return false;
    }
    if lens == Lens::Sales {
        let destination = ctx
            .adsets
            .get(adset_id)
            .and_then(|a| a.destination_type.as_deref());
        if is_messaging_destination(destination) {
            return false;
        }
    }
    true
}

fn row_included(lens: Lens, ctx: &UserContext<'_>, row: &InsightRow) -> bool {
    match lens {
        Lens::Overview => true,
        _ => row
            .adset_id
            .as_deref()
            .is_some_and(|id| includes_adset(lens, ctx, id)),
    }
}

/// Fold one account's insight rows and ad listing into a persisted row.
fn build_account_row(
    lens: Lens,
    account: &AdAccount,
    insights: &[InsightRow],
    ads: &[AdInfo],
    ctx: &UserContext<'_>,
) -> AccountLensMetrics {
    let mut spend_original = Decimal::ZERO;
    let mut results = 0u64;
    for row in insights {
        if !row_included(lens, ctx, row) {
            continue;
        }
        spend_original += row.spend();
        let actions = row.action_counts();
        results += first_nonzero(&actions, lens.result_precedence())
            .map(|(_, n)| n)
            .unwrap_or(0);
    }

    let mut active_ads = 0u64;
    let mut campaigns = HashSet::new();
    for ad in ads {
        if !is_active(ad.status.as_deref()) {
            continue;
        }
        let Some(campaign_id) = ad.campaign_id.as_deref() else {
            continue;
        };
        if !ctx.active_campaigns.get(campaign_id).copied().unwrap_or(false) {
            continue;
        }
        let in_lens = match lens {
            Lens::Overview => true,
            _ => ad
                .adset_id
                .as_deref()
                .is_some_and(|id| includes_adset(lens, ctx, id)),
        };
        if !in_lens {
            continue;
        }
        active_ads += 1;
        campaigns.insert(campaign_id.to_string());
    }

    let spend_usd = ctx.rates.to_usd_or_original(spend_original, &account.currency);
    let cost_per_result_usd =
        (results > 0).then(|| round_usd(spend_usd / Decimal::from(results)));

    AccountLensMetrics {
        user_id: ctx.user_id.to_string(),
        account_id: account.account_id.clone(),
        lens,
        source_date: ctx.now.date_naive(),
        currency: account.currency.clone(),
        spend_original: round_usd(spend_original),
        spend_usd,
        results,
        cost_per_result_usd,
        active_ads,
        active_campaigns: campaigns.len() as u64,
    }
}
