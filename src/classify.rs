//! Classifies sub-campaigns by business intent.
//!
//! Pure functions, no I/O. Each sub-campaign's configuration plus its
//! observed result actions map to one of four categories through a fixed
//! precedence ladder; a stored manual override short-circuits the ladder
//! entirely and is returned verbatim.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ads::types::{ActionCount, ActionKind, AdsetInfo, count_for};

// ── Categories ──────────────────────────────────────────────────────

/// Business-intent category assigned to a sub-campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Sales,
    Leads,
    Messaging,
    Awareness,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sales => "sales",
            Self::Leads => "leads",
            Self::Messaging => "messaging",
            Self::Awareness => "awareness",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "sales" => Some(Self::Sales),
            "leads" => Some(Self::Leads),
            "messaging" => Some(Self::Messaging),
            "awareness" => Some(Self::Awareness),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a classification came from. Manual entries are authoritative
/// and never overwritten by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Auto,
    Manual,
}

impl ClassificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: Category,
    pub source: ClassificationSource,
    pub confidence: u8,
}

/// A previously stored manual classification for a sub-campaign.
#[derive(Debug, Clone, Copy)]
pub struct ManualOverride {
    pub category: Category,
    pub confidence: Option<u8>,
}

/// Sub-campaign id → classification, built once per sync and passed by
/// value into every aggregator.
pub type ClassificationMap = HashMap<String, Classification>;

// ── Signal tables ───────────────────────────────────────────────────

const CONF_DESTINATION: u8 = 96;
const CONF_LEAD_FORM: u8 = 95;
const CONF_OBSERVED: u8 = 93;
const CONF_OBJECTIVE_WEAK: u8 = 70;
const CONF_FALLBACK: u8 = 55;
const CONF_MANUAL_DEFAULT: u8 = 100;

/// Destination types that point an adset at a messaging channel.
const MESSAGING_DESTINATIONS: &[&str] =
    &["MESSENGER", "WHATSAPP", "INSTAGRAM_DIRECT", "MESSAGING_APPS"];

/// Observed-action precedence for step 3: strongest commercial signal
/// first.
const OBSERVED_ACTION_PRECEDENCE: &[(ActionKind, Category)] = &[
    (ActionKind::Purchase, Category::Sales),
    (ActionKind::Lead, Category::Leads),
    (ActionKind::MessagingStart, Category::Messaging),
];

/// Optimization-goal families, each with its own confidence inside the
/// 84–88 band.
const GOAL_FAMILIES: &[(&[&str], Category, u8)] = &[
    (&["OFFSITE_CONVERSIONS", "VALUE", "CONVERSIONS"], Category::Sales, 88),
    (&["LEAD_GENERATION", "QUALITY_LEAD"], Category::Leads, 87),
    (&["CONVERSATIONS", "REPLIES"], Category::Messaging, 86),
    (
        &[
            "REACH",
            "IMPRESSIONS",
            "POST_ENGAGEMENT",
            "PAGE_LIKES",
            "THRUPLAY",
            "AD_RECALL_LIFT",
            "TWO_SECOND_CONTINUOUS_VIDEO_VIEWS",
        ],
        Category::Awareness,
        84,
    ),
];

/// True when the adset's destination type is a messaging channel. The
/// sales lens also uses this to exclude messaging-destination adsets.
pub fn is_messaging_destination(destination_type: Option<&str>) -> bool {
    destination_type
        .map(|d| MESSAGING_DESTINATIONS.contains(&d.to_uppercase().as_str()))
        .unwrap_or(false)
}

// ── Engine ──────────────────────────────────────────────────────────

/// Classify one sub-campaign. First match wins:
///
/// 1. messaging destination type
/// 2. lead-form promoted object
/// 3. observed purchase/lead/messaging-start actions
/// 4. optimization-goal family
/// 5. weak campaign-objective keywords
/// 6. awareness fallback
///
/// A manual override skips all six steps.
pub fn classify(
    manual: Option<&ManualOverride>,
    adset: &AdsetInfo,
    campaign_objective: Option<&str>,
    observed: &[ActionCount],
) -> Classification {
    if let Some(m) = manual {
        return Classification {
            category: m.category,
            source: ClassificationSource::Manual,
            confidence: m.confidence.unwrap_or(CONF_MANUAL_DEFAULT),
        };
    }

    if is_messaging_destination(adset.destination_type.as_deref()) {
        return auto(Category::Messaging, CONF_DESTINATION);
    }

    if adset
        .promoted_object
        .as_ref()
        .and_then(|po| po.lead_gen_form_id.as_deref())
        .is_some()
    {
        return auto(Category::Leads, CONF_LEAD_FORM);
    }

    for &(kind, category) in OBSERVED_ACTION_PRECEDENCE {
        if count_for(observed, kind) > 0 {
            return auto(category, CONF_OBSERVED);
        }
    }

    if let Some(goal) = adset.optimization_goal.as_deref() {
        let goal = goal.to_uppercase();
        for &(goals, category, confidence) in GOAL_FAMILIES {
            if goals.contains(&goal.as_str()) {
                return auto(category, confidence);
            }
        }
    }

    if let Some(objective) = campaign_objective {
        let objective = objective.to_uppercase();
        if objective.contains("MESSAGE") || objective.contains("ENGAGEMENT") {
            return auto(Category::Messaging, CONF_OBJECTIVE_WEAK);
        }
    }

    auto(Category::Awareness, CONF_FALLBACK)
}

fn auto(category: Category, confidence: u8) -> Classification {
    Classification {
        category,
        source: ClassificationSource::Auto,
        confidence,
    }
}

/// Classify every adset of an account in one pass. `campaign_objectives`
/// is keyed by campaign id, `observed` and `overrides` by adset id.
pub fn classify_all(
    adsets: &[AdsetInfo],
    campaign_objectives: &HashMap<String, String>,
    observed: &HashMap<String, Vec<ActionCount>>,
    overrides: &HashMap<String, ManualOverride>,
) -> ClassificationMap {
    let mut map = ClassificationMap::with_capacity(adsets.len());
    for adset in adsets {
        let objective = adset
            .campaign_id
            .as_deref()
            .and_then(|cid| campaign_objectives.get(cid))
            .map(String::as_str);
        let actions = observed.get(&adset.id).map(Vec::as_slice).unwrap_or(&[]);
        let classification = classify(overrides.get(&adset.id), adset, objective, actions);
        map.insert(adset.id.clone(), classification);
    }
    map
}
