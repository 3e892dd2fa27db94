//! Hierarchical recommendation and action derivation.
//!
//! Accounts are never scored directly: their recommendation is the
//! spend-weighted majority of their own campaigns, with an all-worsening
//! short circuit. Pause actions bubble up a level when every child is
//! worsening; scale verdicts map to `scale_up` untouched by the pause
//! rules.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::ads::types::EntityLevel;
use crate::monitor::PerformanceRow;
use crate::recommend::{RecAction, Recommendation};

/// Tie-break order for the weighted majority: most actionable first.
const DERIVE_ORDER: [Recommendation; 4] = [
    Recommendation::Worsening,
    Recommendation::Scale,
    Recommendation::Improving,
    Recommendation::Stable,
];

fn child_level(level: EntityLevel) -> Option<EntityLevel> {
    match level {
        EntityLevel::Account => Some(EntityLevel::Campaign),
        EntityLevel::Campaign => Some(EntityLevel::Adset),
        EntityLevel::Adset => Some(EntityLevel::Ad),
        EntityLevel::Ad => None,
    }
}

fn pause_action(level: EntityLevel) -> RecAction {
    match level {
        EntityLevel::Account => RecAction::PauseAccount,
        EntityLevel::Campaign => RecAction::PauseCampaign,
        EntityLevel::Adset => RecAction::PauseAdset,
        EntityLevel::Ad => RecAction::PauseAd,
    }
}

/// Rewrite account recommendations from their campaigns, then derive
/// every row's action from the final recommendations.
pub fn derive_hierarchy(rows: &mut [PerformanceRow]) {
    // Child indices by (child level, parent entity id). Campaigns carry
    // their account id as parent, so grouping cannot cross accounts.
    let mut children: HashMap<(EntityLevel, String), Vec<usize>> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        if let Some(parent) = &row.parent_id {
            children
                .entry((row.level, parent.clone()))
                .or_default()
                .push(i);
        }
    }

    // Bottom-up recommendation pass for accounts.
    let mut derived = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        if row.level != EntityLevel::Account {
            continue;
        }
        let Some(campaign_idx) = children.get(&(EntityLevel::Campaign, row.entity_id.clone()))
        else {
            continue;
        };
        if campaign_idx.is_empty() {
            continue;
        }
        let campaigns: Vec<&PerformanceRow> = campaign_idx.iter().map(|&j| &rows[j]).collect();
        let (recommendation, confidence) = weighted_majority(&campaigns);
        derived.push((i, recommendation, confidence, campaigns.len()));
    }
    for (i, recommendation, confidence, count) in derived {
        rows[i].recommendation = recommendation;
        rows[i].confidence = confidence;
        rows[i].reason = format!("Weighted from {count} campaigns");
    }

    // Action pass over the final recommendations.
    let actions: Vec<RecAction> = rows
        .iter()
        .map(|row| {
            if row.recommendation == Recommendation::Scale {
                return RecAction::ScaleUp;
            }
            let own_worsening = row.recommendation == Recommendation::Worsening;
            let bubbled = child_level(row.level)
                .and_then(|level| children.get(&(level, row.entity_id.clone())))
                .map(|idx| {
                    !idx.is_empty()
                        && idx
                            .iter()
                            .all(|&j| rows[j].recommendation == Recommendation::Worsening)
                })
                .unwrap_or(false);
            if own_worsening || bubbled {
                pause_action(row.level)
            } else {
                RecAction::None
            }
        })
        .collect();
    for (row, action) in rows.iter_mut().zip(actions) {
        row.action = action;
    }
}

/// Spend-weighted majority over the children. When no child spends,
/// plain counts decide. All-worsening short-circuits.
fn weighted_majority(children: &[&PerformanceRow]) -> (Recommendation, u8) {
    if children
        .iter()
        .all(|c| c.recommendation == Recommendation::Worsening)
    {
        let confidence = children.iter().map(|c| c.confidence).max().unwrap_or(75);
        return (Recommendation::Worsening, confidence);
    }

    let total_spend: Decimal = children.iter().map(|c| c.spend_usd).sum();
    let mut winner = Recommendation::Stable;
    let mut best_weight = Decimal::MIN;
    for rec in DERIVE_ORDER {
        let weight: Decimal = children
            .iter()
            .filter(|c| c.recommendation == rec)
            .map(|c| {
                if total_spend.is_zero() {
                    Decimal::ONE
                } else {
                    c.spend_usd
                }
            })
            .sum();
        if weight > best_weight {
            winner = rec;
            best_weight = weight;
        }
    }

    let confidence = children
        .iter()
        .filter(|c| c.recommendation == winner)
        .map(|c| c.confidence)
        .max()
        .unwrap_or(55);
    (winner, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use crate::monitor::{Health, Trend};

    fn row(
        level: EntityLevel,
        id: &str,
        parent: Option<&str>,
        spend: Decimal,
        rec: Recommendation,
    ) -> PerformanceRow {
        PerformanceRow {
            user_id: "u1".to_string(),
            level,
            entity_id: id.to_string(),
            name: id.to_string(),
            parent_id: parent.map(str::to_string),
            account_id: "act_1".to_string(),
            spend_usd: spend,
            results: 0,
            cost_per_result_usd: None,
            ctr: None,
            cpc: None,
            cpm: None,
            trend: Trend::Stable,
            health: Health::Watch,
            recommendation: rec,
            action: rec.base_action(),
            confidence: 60,
            model: "rule".to_string(),
            reason: String::new(),
            captured_at: Utc::now(),
        }
    }

    fn find<'a>(rows: &'a [PerformanceRow], id: &str) -> &'a PerformanceRow {
        rows.iter().find(|r| r.entity_id == id).unwrap()
    }

    #[test]
    fn account_takes_spend_weighted_majority() {
        let mut rows = vec![
            row(EntityLevel::Account, "act_1", None, dec!(170), Recommendation::Stable),
            row(EntityLevel::Campaign, "c_1", Some("act_1"), dec!(100), Recommendation::Scale),
            row(EntityLevel::Campaign, "c_2", Some("act_1"), dec!(40), Recommendation::Worsening),
            row(EntityLevel::Campaign, "c_3", Some("act_1"), dec!(30), Recommendation::Stable),
        ];
        derive_hierarchy(&mut rows);
        let account = find(&rows, "act_1");
        assert_eq!(account.recommendation, Recommendation::Scale);
        assert_eq!(account.action, RecAction::ScaleUp);
        assert_eq!(account.reason, "Weighted from 3 campaigns");
    }

    #[test]
    fn all_worsening_campaigns_force_the_account() {
        let mut rows = vec![
            row(EntityLevel::Account, "act_1", None, dec!(50), Recommendation::Improving),
            row(EntityLevel::Campaign, "c_1", Some("act_1"), dec!(30), Recommendation::Worsening),
            row(EntityLevel::Campaign, "c_2", Some("act_1"), dec!(20), Recommendation::Worsening),
        ];
        derive_hierarchy(&mut rows);
        let account = find(&rows, "act_1");
        assert_eq!(account.recommendation, Recommendation::Worsening);
        assert_eq!(account.action, RecAction::PauseAccount);
    }

    #[test]
    fn derivation_never_crosses_accounts() {
        // A richer improving campaign in another account must not rescue
        // this one.
        let mut rows = vec![
            row(EntityLevel::Account, "act_1", None, dec!(50), Recommendation::Stable),
            row(EntityLevel::Campaign, "c_1", Some("act_1"), dec!(30), Recommendation::Worsening),
            row(EntityLevel::Campaign, "c_2", Some("act_1"), dec!(20), Recommendation::Worsening),
            row(EntityLevel::Account, "act_2", None, dec!(900), Recommendation::Stable),
            row(EntityLevel::Campaign, "c_9", Some("act_2"), dec!(900), Recommendation::Improving),
        ];
        derive_hierarchy(&mut rows);
        assert_eq!(find(&rows, "act_1").recommendation, Recommendation::Worsening);
        assert_eq!(find(&rows, "act_2").recommendation, Recommendation::Improving);
    }

    #[test]
    fn zero_spend_children_fall_back_to_counts() {
        let mut rows = vec![
            row(EntityLevel::Account, "act_1", None, dec!(0), Recommendation::Worsening),
            row(EntityLevel::Campaign, "c_1", Some("act_1"), dec!(0), Recommendation::Stable),
            row(EntityLevel::Campaign, "c_2", Some("act_1"), dec!(0), Recommendation::Stable),
            row(EntityLevel::Campaign, "c_3", Some("act_1"), dec!(0), Recommendation::Worsening),
        ];
        derive_hierarchy(&mut rows);
        assert_eq!(find(&rows, "act_1").recommendation, Recommendation::Stable);
    }

    #[test]
    fn account_without_campaign_rows_keeps_its_verdict() {
        let mut rows = vec![row(
            EntityLevel::Account,
            "act_1",
            None,
            dec!(10),
            Recommendation::Stable,
        )];
        derive_hierarchy(&mut rows);
        assert_eq!(find(&rows, "act_1").recommendation, Recommendation::Stable);
        assert_eq!(find(&rows, "act_1").action, RecAction::None);
    }

    #[test]
    fn worsening_ad_pauses_itself_only() {
        let mut rows = vec![
            row(EntityLevel::Adset, "as_1", Some("c_1"), dec!(10), Recommendation::Stable),
            row(EntityLevel::Ad, "ad_1", Some("as_1"), dec!(5), Recommendation::Worsening),
            row(EntityLevel::Ad, "ad_2", Some("as_1"), dec!(5), Recommendation::Stable),
        ];
        derive_hierarchy(&mut rows);
        assert_eq!(find(&rows, "ad_1").action, RecAction::PauseAd);
        assert_eq!(find(&rows, "ad_2").action, RecAction::None);
        assert_eq!(find(&rows, "as_1").action, RecAction::None);
    }

    #[test]
    fn pause_bubbles_when_every_child_worsens() {
        let mut rows = vec![
            row(EntityLevel::Adset, "as_1", Some("c_1"), dec!(10), Recommendation::Stable),
            row(EntityLevel::Ad, "ad_1", Some("as_1"), dec!(5), Recommendation::Worsening),
            row(EntityLevel::Ad, "ad_2", Some("as_1"), dec!(5), Recommendation::Worsening),
        ];
        derive_hierarchy(&mut rows);
        assert_eq!(find(&rows, "as_1").action, RecAction::PauseAdset);
    }

    #[test]
    fn childless_adset_never_bubbles() {
        let mut rows = vec![row(
            EntityLevel::Adset,
            "as_1",
            Some("c_1"),
            dec!(10),
            Recommendation::Stable,
        )];
        derive_hierarchy(&mut rows);
        assert_eq!(find(&rows, "as_1").action, RecAction::None);
    }

    #[test]
    fn scale_wins_over_bubbling() {
        let mut rows = vec![
            row(EntityLevel::Adset, "as_1", Some("c_1"), dec!(10), Recommendation::Scale),
            row(EntityLevel::Ad, "ad_1", Some("as_1"), dec!(5), Recommendation::Worsening),
        ];
        derive_hierarchy(&mut rows);
        assert_eq!(find(&rows, "as_1").action, RecAction::ScaleUp);
        assert_eq!(find(&rows, "ad_1").action, RecAction::PauseAd);
    }
}
