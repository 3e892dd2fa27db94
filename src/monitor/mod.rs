//! Performance monitoring across the four entity levels.
//!
//! Trend compares the current cost-per-result and result count against
//! the previously persisted state for the same entity; health folds the
//! trend together with spend/result thresholds into an operational-risk
//! flag.

pub mod snapshot;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::ads::types::EntityLevel;
use crate::config::Thresholds;

pub use snapshot::PerformanceMonitor;

// ── Classifications ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Worsening,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Improving => "improving",
            Self::Stable => "stable",
            Self::Worsening => "worsening",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "improving" => Some(Self::Improving),
            "stable" => Some(Self::Stable),
            "worsening" => Some(Self::Worsening),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Good,
    Watch,
    Bad,
}

impl Health {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Watch => "watch",
            Self::Bad => "bad",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "good" => Some(Self::Good),
            "watch" => Some(Self::Watch),
            "bad" => Some(Self::Bad),
            _ => None,
        }
    }
}

// ── Persisted shape ─────────────────────────────────────────────────

/// One monitored entity's current metrics and verdicts. The same shape
/// serves the current-state table and the append-only snapshot history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRow {
    pub user_id: String,
    pub level: EntityLevel,
    pub entity_id: String,
    pub name: String,
    /// Owning entity one level up; `None` at account level.
    pub parent_id: Option<String>,
    pub account_id: String,
    pub spend_usd: Decimal,
    pub results: u64,
    pub cost_per_result_usd: Option<Decimal>,
    pub ctr: Option<Decimal>,
    pub cpc: Option<Decimal>,
    pub cpm: Option<Decimal>,
    pub trend: Trend,
    pub health: Health,
    pub recommendation: crate::recommend::Recommendation,
    pub action: crate::recommend::RecAction,
    pub confidence: u8,
    /// `rule`, or the model name that produced the recommendation.
    pub model: String,
    pub reason: String,
    pub captured_at: DateTime<Utc>,
}

/// The slice of a previous row that trend computation needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorState {
    pub cost_per_result_usd: Option<Decimal>,
    pub results: u64,
}

impl From<&PerformanceRow> for PriorState {
    fn from(row: &PerformanceRow) -> Self {
        Self {
            cost_per_result_usd: row.cost_per_result_usd,
            results: row.results,
        }
    }
}

// ── Rules ───────────────────────────────────────────────────────────

const COST_DROP_PCT: Decimal = dec!(-10);
const COST_RISE_PCT: Decimal = dec!(10);
const RESULTS_RISE_PCT: Decimal = dec!(15);
const RESULTS_FALL_PCT: Decimal = dec!(-10);

/// Result count at or above which an entity can be marked `good`.
const RESULTS_GOOD_MIN: u64 = 5;

/// Percentage change from `prev` to `current`; `None` when `prev` is zero.
pub fn pct_change(prev: Decimal, current: Decimal) -> Option<Decimal> {
    if prev.is_zero() {
        return None;
    }
    Some((current - prev) / prev * dec!(100))
}

/// Trend against the previously persisted state. A cost drop of exactly
/// 10% counts as improving; a cost rise of exactly 10% is worsening only
/// if results also fell by 10% or more. No prior state is stable.
pub fn compute_trend(
    prior: Option<PriorState>,
    cost_per_result_usd: Option<Decimal>,
    results: u64,
) -> Trend {
    let Some(prior) = prior else {
        return Trend::Stable;
    };

    let cost_change = match (prior.cost_per_result_usd, cost_per_result_usd) {
        (Some(prev), Some(now)) => pct_change(prev, now),
        _ => None,
    };
    let results_change = pct_change(Decimal::from(prior.results), Decimal::from(results));

    let cost_dropped = cost_change.map(|ch| ch <= COST_DROP_PCT).unwrap_or(false);
    let results_rose = match results_change {
        Some(ch) => ch >= RESULTS_RISE_PCT,
        // climbing off zero is a rise
        None => prior.results == 0 && results > 0,
    };
    if cost_dropped || results_rose {
        return Trend::Improving;
    }

    let cost_rose = cost_change.map(|ch| ch >= COST_RISE_PCT).unwrap_or(false);
    let results_fell = results_change.map(|ch| ch <= RESULTS_FALL_PCT).unwrap_or(false);
    if cost_rose && results_fell {
        return Trend::Worsening;
    }

    Trend::Stable
}

/// Operational-risk flag from spend, results and trend.
pub fn compute_health(
    thresholds: &Thresholds,
    spend_usd: Decimal,
    results: u64,
    cost_per_result_usd: Option<Decimal>,
    trend: Trend,
) -> Health {
    let burning = spend_usd >= thresholds.monitor_min_spend_usd && results == 0;
    let worsening_with_cost = trend == Trend::Worsening && cost_per_result_usd.is_some();
    if burning || worsening_with_cost {
        return Health::Bad;
    }

    if results >= RESULTS_GOOD_MIN {
        let cheap = cost_per_result_usd
            .map(|c| c <= thresholds.monitor_low_cost_usd)
            .unwrap_or(false);
        if trend == Trend::Improving || cheap {
            return Health::Good;
        }
    }

    Health::Watch
}
