//! Four-level snapshot builder.
//!
//! One pass per account and level turns today's insight rows into
//! `PerformanceRow`s: unified result counting, USD conversion, trend
//! against the previously persisted state, health, and a provisional
//! rule verdict. The recommendation orchestrator overlays model
//! verdicts before the rows are persisted.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::debug;

use crate::ads::AdsClient;
use crate::ads::types::{EntityLevel, InsightRow, unified_result_count};
use crate::config::Thresholds;
use crate::error::Result;
use crate::fx::round_usd;
use crate::inventory::AdAccount;
use crate::lens::UserContext;
use crate::monitor::{PerformanceRow, PriorState, compute_health, compute_trend};
use crate::recommend::rule_recommendation;
use crate::store::traits::MetricsStore;

/// Monitoring order, broadest level first.
const MONITOR_LEVELS: &[EntityLevel] = &[
    EntityLevel::Account,
    EntityLevel::Campaign,
    EntityLevel::Adset,
    EntityLevel::Ad,
];

type PriorMap = HashMap<(EntityLevel, String), PriorState>;

pub struct PerformanceMonitor {
    ads: Arc<AdsClient>,
    store: Arc<dyn MetricsStore>,
    thresholds: Thresholds,
}

impl PerformanceMonitor {
    pub fn new(ads: Arc<AdsClient>, store: Arc<dyn MetricsStore>, thresholds: Thresholds) -> Self {
        Self {
            ads,
            store,
            thresholds,
        }
    }

    /// Build the full snapshot for one user across all accounts and
    /// levels. Rows carry rule verdicts only; nothing is persisted here.
    pub async fn build(&self, ctx: &UserContext<'_>) -> Result<Vec<PerformanceRow>> {
        let prior: PriorMap = self
            .store
            .get_performance_state(ctx.user_id)
            .await?
            .iter()
            .map(|row| ((row.level, row.entity_id.clone()), PriorState::from(row)))
            .collect();

        let mut rows = Vec::new();
        for account in ctx.accounts {
            for &level in MONITOR_LEVELS {
                let insights = self
                    .ads
                    .insights(ctx.token, &account.account_id, level)
                    .await?;
                for insight in &insights {
                    if let Some(row) =
                        build_row(&self.thresholds, ctx, account, level, insight, &prior)
                    {
                        rows.push(row);
                    }
                }
            }
        }

        debug!(
            user_id = %ctx.user_id,
            entities = rows.len(),
            "performance snapshot built"
        );
        Ok(rows)
    }
}

/// Assemble one row. `None` when the insight carries no id for this
/// level, which happens on delivery-less placeholder rows.
fn build_row(
    thresholds: &Thresholds,
    ctx: &UserContext<'_>,
    account: &AdAccount,
    level: EntityLevel,
    insight: &InsightRow,
    prior: &PriorMap,
) -> Option<PerformanceRow> {
    // Account-level insight rows report the bare numeric account id;
    // key by the inventory id so prior-state lookups stay stable.
    let entity_id = match level {
        EntityLevel::Account => account.account_id.clone(),
        _ => insight.entity_id(level)?.to_string(),
    };

    let name = match level {
        EntityLevel::Account => account.name.clone(),
        _ => insight
            .entity_name(level)
            .map(str::to_string)
            .unwrap_or_else(|| entity_id.clone()),
    };

    let parent_id = match level {
        EntityLevel::Account => None,
        EntityLevel::Campaign => Some(account.account_id.clone()),
        EntityLevel::Adset => insight.campaign_id.clone(),
        EntityLevel::Ad => insight.adset_id.clone(),
    };

    let spend_usd = ctx
        .rates
        .to_usd_or_original(insight.spend(), &account.currency);
    let results = unified_result_count(&insight.action_counts());
    let cost_per_result_usd =
        (results > 0).then(|| round_usd(spend_usd / Decimal::from(results)));

    let trend = compute_trend(
        prior.get(&(level, entity_id.clone())).copied(),
        cost_per_result_usd,
        results,
    );
    let health = compute_health(thresholds, spend_usd, results, cost_per_result_usd, trend);
    let verdict = rule_recommendation(trend, health, results, insight.ctr());

    Some(PerformanceRow {
        user_id: ctx.user_id.to_string(),
        level,
        entity_id,
        name,
        parent_id,
        account_id: account.account_id.clone(),
        spend_usd,
        results,
        cost_per_result_usd,
        ctr: insight.ctr(),
        cpc: insight.cpc(),
        cpm: insight.cpm(),
        trend,
        health,
        recommendation: verdict.recommendation,
        action: verdict.recommendation.base_action(),
        confidence: verdict.confidence,
        model: "rule".to_string(),
        reason: verdict.reason.to_string(),
        captured_at: ctx.now,
    })
}
