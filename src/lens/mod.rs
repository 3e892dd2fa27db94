//! Reporting lenses: five filtered views over the same ad data.
//!
//! The overview lens reads account-level insights and counts leads with
//! no sub-campaign filtering; the other four include only sub-campaigns
//! classified into their category and count results through their own
//! action precedence.

pub mod aggregator;

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ads::types::{ActionKind, AdsetInfo};
use crate::classify::{Category, ClassificationMap};
use crate::fx::RateTable;
use crate::inventory::AdAccount;

pub use aggregator::LensAggregator;

// ── Lens enum ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lens {
    Overview,
    Messaging,
    Leads,
    Branding,
    Sales,
}

/// Sync execution order. Overview first, sales last.
pub const LENS_ORDER: &[Lens] = &[
    Lens::Overview,
    Lens::Messaging,
    Lens::Leads,
    Lens::Branding,
    Lens::Sales,
];

impl Lens {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overview => "overview",
            Self::Messaging => "messaging",
            Self::Leads => "leads",
            Self::Branding => "branding",
            Self::Sales => "sales",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "overview" => Some(Self::Overview),
            "messaging" => Some(Self::Messaging),
            "leads" => Some(Self::Leads),
            "branding" => Some(Self::Branding),
            "sales" => Some(Self::Sales),
            _ => None,
        }
    }

    /// Category whose sub-campaigns this lens includes. `None` for the
    /// overview lens, which does not filter.
    pub fn category(&self) -> Option<Category> {
        match self {
            Self::Overview => None,
            Self::Messaging => Some(Category::Messaging),
            Self::Leads => Some(Category::Leads),
            Self::Branding => Some(Category::Awareness),
            Self::Sales => Some(Category::Sales),
        }
    }

    /// Action precedence used to count a "result" for this lens. First
    /// kind with a non-zero count wins.
    pub fn result_precedence(&self) -> &'static [ActionKind] {
        match self {
            Self::Overview => &[ActionKind::Lead],
            Self::Messaging => &[ActionKind::MessagingStart],
            Self::Leads => &[ActionKind::Lead],
            Self::Branding => &[ActionKind::Engagement, ActionKind::View, ActionKind::Click],
            Self::Sales => &[ActionKind::Purchase],
        }
    }
}

impl std::fmt::Display for Lens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Persisted shapes ────────────────────────────────────────────────

/// One account's daily totals under one lens. Upserted by
/// (user, account, lens, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountLensMetrics {
    pub user_id: String,
    pub account_id: String,
    pub lens: Lens,
    pub source_date: NaiveDate,
    pub currency: String,
    pub spend_original: Decimal,
    pub spend_usd: Decimal,
    pub results: u64,
    pub cost_per_result_usd: Option<Decimal>,
    pub active_ads: u64,
    pub active_campaigns: u64,
}

/// Latest cross-account totals for one (user, lens). Exactly one row
/// per pair, replaced on every sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LensSummary {
    pub user_id: String,
    pub lens: Lens,
    pub spend_usd: Decimal,
    pub results: u64,
    pub cost_per_result_usd: Option<Decimal>,
    pub accounts: u64,
    pub active_ads: u64,
    pub active_campaigns: u64,
    pub last_synced_at: DateTime<Utc>,
}

/// Intraday chart point, appended once per sync per lens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LensPoint {
    pub user_id: String,
    pub lens: Lens,
    pub spend_usd: Decimal,
    pub results: u64,
    pub cost_per_result_usd: Option<Decimal>,
    pub captured_at: DateTime<Utc>,
}

// ── Per-user sync context ───────────────────────────────────────────

/// Inputs shared by every lens pass within one user's sync cycle. Built
/// once, after classification, so the aggregators carry no hidden
/// ordering dependency between each other.
pub struct UserContext<'a> {
    pub user_id: &'a str,
    pub token: &'a str,
    pub accounts: &'a [AdAccount],
    pub classifications: &'a ClassificationMap,
    /// Adset id → metadata, across all of the user's accounts.
    pub adsets: &'a HashMap<String, AdsetInfo>,
    /// Campaign id → is ACTIVE.
    pub active_campaigns: &'a HashMap<String, bool>,
    pub rates: &'a RateTable,
    pub now: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lens_order_is_overview_first_sales_last() {
        assert_eq!(LENS_ORDER.first(), Some(&Lens::Overview));
        assert_eq!(LENS_ORDER.last(), Some(&Lens::Sales));
        assert_eq!(LENS_ORDER.len(), 5);
    }

    #[test]
    fn category_mapping() {
        assert_eq!(Lens::Overview.category(), None);
        assert_eq!(Lens::Branding.category(), Some(Category::Awareness));
        assert_eq!(Lens::Sales.category(), Some(Category::Sales));
    }

    #[test]
    fn precedence_heads_match_lens_intent() {
        assert_eq!(Lens::Sales.result_precedence().first(), Some(&ActionKind::Purchase));
        assert_eq!(Lens::Leads.result_precedence().first(), Some(&ActionKind::Lead));
        assert_eq!(
            Lens::Messaging.result_precedence().first(),
            Some(&ActionKind::MessagingStart)
        );
        assert_eq!(
            Lens::Branding.result_precedence().first(),
            Some(&ActionKind::Engagement)
        );
    }
}
