//! Recommendation engine: rule verdicts, model augmentation, hierarchy.
//!
//! Every monitored row gets a provisional rule-based recommendation. A
//! slot-gated orchestrator then sends a capped candidate set to the
//! model and overlays its verdicts; transport or parse failures fall
//! back to the rules silently.

pub mod features;
pub mod hierarchy;
pub mod orchestrator;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::monitor::{Health, Trend};

pub use orchestrator::RecommendationOrchestrator;

// ── Verdicts and actions ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Improving,
    Stable,
    Scale,
    Worsening,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Improving => "improving",
            Self::Stable => "stable",
            Self::Scale => "scale",
            Self::Worsening => "worsening",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "improving" => Some(Self::Improving),
            "stable" => Some(Self::Stable),
            "scale" => Some(Self::Scale),
            "worsening" => Some(Self::Worsening),
            _ => None,
        }
    }

    /// Action before pause escalation: only `scale` maps to an action.
    pub fn base_action(&self) -> RecAction {
        match self {
            Self::Scale => RecAction::ScaleUp,
            _ => RecAction::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecAction {
    None,
    ScaleUp,
    PauseAd,
    PauseAdset,
    PauseCampaign,
    PauseAccount,
}

impl RecAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ScaleUp => "scale_up",
            Self::PauseAd => "pause_ad",
            Self::PauseAdset => "pause_adset",
            Self::PauseCampaign => "pause_campaign",
            Self::PauseAccount => "pause_account",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "scale_up" => Some(Self::ScaleUp),
            "pause_ad" => Some(Self::PauseAd),
            "pause_adset" => Some(Self::PauseAdset),
            "pause_campaign" => Some(Self::PauseCampaign),
            "pause_account" => Some(Self::PauseAccount),
            _ => None,
        }
    }
}

// ── Rule fallback ───────────────────────────────────────────────────

/// Click-through rate treated as strong for the rule mapping, percent.
const STRONG_CTR: Decimal = dec!(1.5);

const CONF_RULE_STRONG: u8 = 75;
const CONF_RULE_MODERATE: u8 = 65;
const CONF_RULE_WEAK: u8 = 55;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleVerdict {
    pub recommendation: Recommendation,
    pub confidence: u8,
    pub reason: &'static str,
}

/// Deterministic recommendation from trend/health plus volume and CTR.
pub fn rule_recommendation(
    trend: Trend,
    health: Health,
    results: u64,
    ctr: Option<Decimal>,
) -> RuleVerdict {
    if trend == Trend::Improving && results >= 3 {
        return RuleVerdict {
            recommendation: Recommendation::Scale,
            confidence: CONF_RULE_STRONG,
            reason: "Improving cost with repeatable results",
        };
    }
    if trend == Trend::Worsening || health == Health::Bad {
        return RuleVerdict {
            recommendation: Recommendation::Worsening,
            confidence: CONF_RULE_STRONG,
            reason: "Cost and results trending the wrong way",
        };
    }
    if health == Health::Good && ctr.map(|c| c >= STRONG_CTR).unwrap_or(false) {
        return RuleVerdict {
            recommendation: Recommendation::Improving,
            confidence: CONF_RULE_MODERATE,
            reason: "Healthy volume with strong click-through",
        };
    }
    RuleVerdict {
        recommendation: Recommendation::Stable,
        confidence: CONF_RULE_WEAK,
        reason: "No significant movement",
    }
}

// ── Run telemetry ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Error,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "error" => Some(Self::Error),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// One row per user: rate-limit state plus last-run observability.
#[derive(Debug, Clone, PartialEq)]
pub struct AiRunTelemetry {
    pub user_id: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_slot_start: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub candidates: u64,
    pub updated: u64,
}

/// Floor a timestamp to the start of its rate-limit slot.
pub fn slot_start(now: DateTime<Utc>, slot_minutes: i64) -> DateTime<Utc> {
    let slot_secs = slot_minutes * 60;
    let ts = now.timestamp();
    let floored = ts - ts.rem_euclid(slot_secs);
    DateTime::from_timestamp(floored, 0).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn improving_with_volume_scales() {
        let v = rule_recommendation(Trend::Improving, Health::Good, 3, None);
        assert_eq!(v.recommendation, Recommendation::Scale);
        assert_eq!(v.recommendation.base_action(), RecAction::ScaleUp);
    }

    #[test]
    fn improving_without_volume_does_not_scale() {
        let v = rule_recommendation(Trend::Improving, Health::Watch, 2, None);
        assert_eq!(v.recommendation, Recommendation::Stable);
    }

    #[test]
    fn worsening_or_bad_flags_worsening() {
        let v = rule_recommendation(Trend::Worsening, Health::Watch, 10, None);
        assert_eq!(v.recommendation, Recommendation::Worsening);
        let v = rule_recommendation(Trend::Stable, Health::Bad, 0, None);
        assert_eq!(v.recommendation, Recommendation::Worsening);
        assert_eq!(v.recommendation.base_action(), RecAction::None);
    }

    #[test]
    fn good_health_with_strong_ctr_improves() {
        let v = rule_recommendation(Trend::Stable, Health::Good, 8, Some(dec!(2.1)));
        assert_eq!(v.recommendation, Recommendation::Improving);
        let v = rule_recommendation(Trend::Stable, Health::Good, 8, Some(dec!(0.4)));
        assert_eq!(v.recommendation, Recommendation::Stable);
    }

    #[test]
    fn slot_floor_is_half_hour_aligned() {
        let t = Utc.with_ymd_and_hms(2026, 8, 22, 14, 42, 19).unwrap();
        let slot = slot_start(t, 30);
        assert_eq!(slot, Utc.with_ymd_and_hms(2026, 8, 22, 14, 30, 0).unwrap());

        let boundary = Utc.with_ymd_and_hms(2026, 8, 22, 14, 30, 0).unwrap();
        assert_eq!(slot_start(boundary, 30), boundary);
    }

    #[test]
    fn consecutive_calls_within_a_slot_share_the_start() {
        let a = Utc.with_ymd_and_hms(2026, 8, 22, 9, 1, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 8, 22, 9, 29, 59).unwrap();
        assert_eq!(slot_start(a, 30), slot_start(b, 30));
    }
}
