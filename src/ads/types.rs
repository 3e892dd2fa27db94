//! Wire types for the ads-platform Graph API.
//!
//! Listing endpoints return entity metadata with status fields; insight
//! endpoints return spend/impression/click metrics plus a loosely-typed
//! `actions` array. Action types are mapped into the closed [`ActionKind`]
//! enum at the edge so the rest of the pipeline never string-matches.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ── Entity levels ───────────────────────────────────────────────────

/// The four reporting levels of the ads hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityLevel {
    Account,
    Campaign,
    Adset,
    Ad,
}

impl EntityLevel {
    /// Value for the insights `level` query parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Campaign => "campaign",
            Self::Adset => "adset",
            Self::Ad => "ad",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "account" => Some(Self::Account),
            "campaign" => Some(Self::Campaign),
            "adset" => Some(Self::Adset),
            "ad" => Some(Self::Ad),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Action kinds ────────────────────────────────────────────────────

/// Recognized conversion-action kinds, ordered from strongest to weakest
/// commercial signal. Anything the platform reports outside this set lands
/// in [`ActionKind::Unrecognized`] and is kept only for max-fallback counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Purchase,
    Lead,
    MessagingStart,
    Engagement,
    Click,
    View,
    Unrecognized,
}

impl ActionKind {
    /// Map a platform `action_type` string into a kind.
    pub fn from_action_type(action_type: &str) -> Self {
        match action_type {
            "purchase"
            | "omni_purchase"
            | "onsite_web_purchase"
            | "offsite_conversion.fb_pixel_purchase" => Self::Purchase,
            "lead"
            | "leadgen_grouped"
            | "onsite_conversion.lead_grouped"
            | "offsite_conversion.fb_pixel_lead" => Self::Lead,
            "messaging_conversation_started_7d"
            | "onsite_conversion.messaging_conversation_started_7d"
            | "onsite_conversion.messaging_first_reply" => Self::MessagingStart,
            "post_engagement" | "page_engagement" | "post_reaction"
            | "onsite_conversion.post_save" => Self::Engagement,
            "link_click" | "omni_link_click" => Self::Click,
            "video_view" | "landing_page_view" => Self::View,
            _ => Self::Unrecognized,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Lead => "lead",
            Self::MessagingStart => "messaging_start",
            Self::Engagement => "engagement",
            Self::Click => "click",
            Self::View => "view",
            Self::Unrecognized => "unrecognized",
        }
    }
}

/// Result-count precedence used by the performance monitor across all
/// four levels: first kind with a non-zero count wins.
pub const UNIFIED_RESULT_PRECEDENCE: &[ActionKind] = &[
    ActionKind::Purchase,
    ActionKind::Lead,
    ActionKind::MessagingStart,
    ActionKind::Engagement,
    ActionKind::Click,
    ActionKind::View,
];

/// One `{action_type, value}` pair as the platform sends it. Values are
/// string-encoded numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAction {
    pub action_type: String,
    #[serde(default)]
    pub value: String,
}

/// A parsed action: kind plus the original type string and numeric count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionCount {
    pub kind: ActionKind,
    pub raw_type: String,
    pub count: u64,
}

impl ActionCount {
    pub fn from_raw(raw: &RawAction) -> Self {
        Self {
            kind: ActionKind::from_action_type(&raw.action_type),
            raw_type: raw.action_type.clone(),
            count: parse_count(&raw.value),
        }
    }
}

/// Total count across all actions of one kind.
pub fn count_for(actions: &[ActionCount], kind: ActionKind) -> u64 {
    actions.iter().filter(|a| a.kind == kind).map(|a| a.count).sum()
}

/// Walk `precedence` and return the first kind with a non-zero total,
/// together with its count.
pub fn first_nonzero(actions: &[ActionCount], precedence: &[ActionKind]) -> Option<(ActionKind, u64)> {
    precedence.iter().find_map(|&kind| {
        let n = count_for(actions, kind);
        (n > 0).then_some((kind, n))
    })
}

/// Unified result count: precedence first, then the maximum single-action
/// count observed (unrecognized kinds included).
pub fn unified_result_count(actions: &[ActionCount]) -> u64 {
    if let Some((_, n)) = first_nonzero(actions, UNIFIED_RESULT_PRECEDENCE) {
        return n;
    }
    actions.iter().map(|a| a.count).max().unwrap_or(0)
}

fn parse_count(value: &str) -> u64 {
    if let Ok(n) = value.parse::<u64>() {
        return n;
    }
    // Some deployments send "5.0"; round rather than drop.
    value.parse::<f64>().map(|f| f.round().max(0.0) as u64).unwrap_or(0)
}

// ── Listing payloads ────────────────────────────────────────────────

/// An ad account as returned by the `/me/adaccounts` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Prefixed id, e.g. `act_1234`.
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub account_status: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub objective: Option<String>,
}

/// Promoted-object block attached to an adset; only the fields the
/// classifier inspects are kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromotedObject {
    #[serde(default)]
    pub lead_gen_form_id: Option<String>,
    #[serde(default)]
    pub pixel_id: Option<String>,
    #[serde(default)]
    pub custom_event_type: Option<String>,
    #[serde(default)]
    pub page_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdsetInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub optimization_goal: Option<String>,
    #[serde(default)]
    pub destination_type: Option<String>,
    #[serde(default)]
    pub promoted_object: Option<PromotedObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub adset_id: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
}

pub fn is_active(status: Option<&str>) -> bool {
    status == Some("ACTIVE")
}

// ── Insight payloads ────────────────────────────────────────────────

/// One insights row. Numeric metrics arrive string-encoded; the id/name
/// fields present depend on the requested level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsightRow {
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub campaign_name: Option<String>,
    #[serde(default)]
    pub adset_id: Option<String>,
    #[serde(default)]
    pub adset_name: Option<String>,
    #[serde(default)]
    pub ad_id: Option<String>,
    #[serde(default)]
    pub ad_name: Option<String>,
    #[serde(default)]
    pub spend: Option<String>,
    #[serde(default)]
    pub impressions: Option<String>,
    #[serde(default)]
    pub clicks: Option<String>,
    #[serde(default)]
    pub ctr: Option<String>,
    #[serde(default)]
    pub cpc: Option<String>,
    #[serde(default)]
    pub cpm: Option<String>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub actions: Option<Vec<RawAction>>,
    #[serde(default)]
    pub date_start: Option<String>,
    #[serde(default)]
    pub date_stop: Option<String>,
}

impl InsightRow {
    pub fn spend(&self) -> Decimal {
        parse_decimal(self.spend.as_deref()).unwrap_or(Decimal::ZERO)
    }

    pub fn ctr(&self) -> Option<Decimal> {
        parse_decimal(self.ctr.as_deref())
    }

    pub fn cpc(&self) -> Option<Decimal> {
        parse_decimal(self.cpc.as_deref())
    }

    pub fn cpm(&self) -> Option<Decimal> {
        parse_decimal(self.cpm.as_deref())
    }

    /// Parse the actions array, dropping nothing: unrecognized types are
    /// kept under [`ActionKind::Unrecognized`].
    pub fn action_counts(&self) -> Vec<ActionCount> {
        self.actions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(ActionCount::from_raw)
            .collect()
    }

    /// Entity id for a given level, when the row carries one.
    pub fn entity_id(&self, level: EntityLevel) -> Option<&str> {
        match level {
            EntityLevel::Account => self.account_id.as_deref(),
            EntityLevel::Campaign => self.campaign_id.as_deref(),
            EntityLevel::Adset => self.adset_id.as_deref(),
            EntityLevel::Ad => self.ad_id.as_deref(),
        }
    }

    pub fn entity_name(&self, level: EntityLevel) -> Option<&str> {
        match level {
            EntityLevel::Account => None,
            EntityLevel::Campaign => self.campaign_name.as_deref(),
            EntityLevel::Adset => self.adset_name.as_deref(),
            EntityLevel::Ad => self.ad_name.as_deref(),
        }
    }
}

fn parse_decimal(s: Option<&str>) -> Option<Decimal> {
    s.and_then(|v| v.trim().parse().ok())
}

// ── Pagination envelope ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Paged<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub paging: Option<Paging>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub next: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn actions(pairs: &[(&str, &str)]) -> Vec<ActionCount> {
        pairs
            .iter()
            .map(|(t, v)| {
                ActionCount::from_raw(&RawAction {
                    action_type: t.to_string(),
                    value: v.to_string(),
                })
            })
            .collect()
    }

    #[test]
    fn action_type_mapping() {
        assert_eq!(ActionKind::from_action_type("omni_purchase"), ActionKind::Purchase);
        assert_eq!(ActionKind::from_action_type("leadgen_grouped"), ActionKind::Lead);
        assert_eq!(
            ActionKind::from_action_type("onsite_conversion.messaging_conversation_started_7d"),
            ActionKind::MessagingStart
        );
        assert_eq!(ActionKind::from_action_type("link_click"), ActionKind::Click);
        assert_eq!(
            ActionKind::from_action_type("some_future_action"),
            ActionKind::Unrecognized
        );
    }

    #[test]
    fn precedence_picks_first_nonzero() {
        let acts = actions(&[("video_view", "120"), ("lead", "0"), ("link_click", "14")]);
        let (kind, n) = first_nonzero(&acts, UNIFIED_RESULT_PRECEDENCE).unwrap();
        assert_eq!(kind, ActionKind::Click);
        assert_eq!(n, 14);
    }

    #[test]
    fn unified_count_falls_back_to_max() {
        // Nothing in the precedence list has a non-zero count.
        let acts = actions(&[("custom.thing_a", "3"), ("custom.thing_b", "9")]);
        assert_eq!(unified_result_count(&acts), 9);
        assert_eq!(unified_result_count(&[]), 0);
    }

    #[test]
    fn fractional_values_round() {
        let acts = actions(&[("lead", "5.0")]);
        assert_eq!(count_for(&acts, ActionKind::Lead), 5);
    }

    #[test]
    fn insight_row_parses_metrics() {
        let row: InsightRow = serde_json::from_value(serde_json::json!({
            "adset_id": "238000001",
            "adset_name": "MSG - remarketing",
            "spend": "37.00",
            "ctr": "1.85",
            "actions": [{"action_type": "lead", "value": "5"}],
            "date_start": "2026-08-22",
            "date_stop": "2026-08-22"
        }))
        .unwrap();
        assert_eq!(row.spend(), dec!(37.00));
        assert_eq!(row.ctr(), Some(dec!(1.85)));
        assert_eq!(row.entity_id(EntityLevel::Adset), Some("238000001"));
        assert_eq!(unified_result_count(&row.action_counts()), 5);
    }

    #[test]
    fn paged_envelope_with_and_without_next() {
        let page: Paged<AdInfo> = serde_json::from_value(serde_json::json!({
            "data": [{"id": "120001", "status": "ACTIVE"}],
            "paging": {"cursors": {"before": "a", "after": "b"}, "next": "https://example.test/page2"}
        }))
        .unwrap();
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.paging.unwrap().next.as_deref(), Some("https://example.test/page2"));

        let last: Paged<AdInfo> = serde_json::from_value(serde_json::json!({
            "data": []
        }))
        .unwrap();
        assert!(last.paging.is_none());
    }
}
