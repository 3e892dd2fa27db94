//! Feature vectors for the recommendation model.
//!
//! Each monitored entity's same-day snapshot history plus its current
//! point becomes one feature row: short-lookback spend/result deltas,
//! longer-lookback percentage moves of the cost and rate metrics,
//! cumulative result growth, and intraday cost volatility. Candidate
//! selection then keeps only the rows worth a model's attention, capped
//! by spend.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::ads::types::EntityLevel;
use crate::config::Thresholds;
use crate::monitor::{Health, PerformanceRow, Trend, pct_change};

const SHORT_LOOKBACK_MIN: i64 = 30;
const LONG_LOOKBACK_MIN: i64 = 120;

/// Swings that make an entity a candidate on their own.
const COST_SWING_PCT: Decimal = dec!(12);
const RATE_SWING_PCT: Decimal = dec!(15);
const RESULT_SWING_30M: i64 = 2;

/// Stable key for one entity across the request/response round trip.
pub fn entity_key(level: EntityLevel, entity_id: &str) -> String {
    format!("{}:{}", level.as_str(), entity_id)
}

/// One candidate row as sent to the model.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureVector {
    pub key: String,
    pub level: EntityLevel,
    pub entity_id: String,
    pub name: String,
    pub spend_usd: Decimal,
    pub results: u64,
    pub cost_per_result_usd: Option<Decimal>,
    pub ctr: Option<Decimal>,
    pub trend: Trend,
    pub health: Health,
    pub spend_delta_30m: Decimal,
    pub results_delta_30m: i64,
    pub cost_pct_change_120m: Option<Decimal>,
    pub ctr_pct_change_120m: Option<Decimal>,
    pub cpc_pct_change_120m: Option<Decimal>,
    pub cpm_pct_change_120m: Option<Decimal>,
    pub results_growth_today: u64,
    pub cost_volatility: Option<Decimal>,
}

/// Build one feature row per current entity from its same-day history.
pub fn build_features(
    current: &[PerformanceRow],
    history: &[PerformanceRow],
    now: DateTime<Utc>,
) -> Vec<FeatureVector> {
    let mut series: HashMap<(EntityLevel, &str), Vec<&PerformanceRow>> = HashMap::new();
    for row in history {
        series
            .entry((row.level, row.entity_id.as_str()))
            .or_default()
            .push(row);
    }
    for points in series.values_mut() {
        points.sort_by_key(|r| r.captured_at);
    }

    current
        .iter()
        .map(|row| {
            let hist = series
                .get(&(row.level, row.entity_id.as_str()))
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            build_one(row, hist, now)
        })
        .collect()
}

/// Most recent point at or before the cutoff; the earliest point when
/// the day is younger than the lookback.
fn baseline<'a>(hist: &[&'a PerformanceRow], not_after: DateTime<Utc>) -> Option<&'a PerformanceRow> {
    hist.iter()
        .rev()
        .find(|r| r.captured_at <= not_after)
        .copied()
        .or_else(|| hist.first().copied())
}

fn build_one(row: &PerformanceRow, hist: &[&PerformanceRow], now: DateTime<Utc>) -> FeatureVector {
    let short = baseline(hist, now - Duration::minutes(SHORT_LOOKBACK_MIN));
    let long = baseline(hist, now - Duration::minutes(LONG_LOOKBACK_MIN));

    let pct = |prev: Option<Decimal>, current: Option<Decimal>| match (prev, current) {
        (Some(p), Some(c)) => pct_change(p, c),
        _ => None,
    };

    let costs: Vec<Decimal> = hist
        .iter()
        .filter_map(|r| r.cost_per_result_usd)
        .chain(row.cost_per_result_usd)
        .collect();

    FeatureVector {
        key: entity_key(row.level, &row.entity_id),
        level: row.level,
        entity_id: row.entity_id.clone(),
        name: row.name.clone(),
        spend_usd: row.spend_usd,
        results: row.results,
        cost_per_result_usd: row.cost_per_result_usd,
        ctr: row.ctr,
        trend: row.trend,
        health: row.health,
        spend_delta_30m: short
            .map(|b| row.spend_usd - b.spend_usd)
            .unwrap_or(Decimal::ZERO),
        results_delta_30m: short
            .map(|b| row.results as i64 - b.results as i64)
            .unwrap_or(0),
        cost_pct_change_120m: long
            .and_then(|b| pct(b.cost_per_result_usd, row.cost_per_result_usd)),
        ctr_pct_change_120m: long.and_then(|b| pct(b.ctr, row.ctr)),
        cpc_pct_change_120m: long.and_then(|b| pct(b.cpc, row.cpc)),
        cpm_pct_change_120m: long.and_then(|b| pct(b.cpm, row.cpm)),
        results_growth_today: hist
            .first()
            .map(|b| row.results.saturating_sub(b.results))
            .unwrap_or(0),
        cost_volatility: std_dev(&costs),
    }
}

/// Population standard deviation, `None` below two samples.
fn std_dev(values: &[Decimal]) -> Option<Decimal> {
    if values.len() < 2 {
        return None;
    }
    let n = Decimal::from(values.len());
    let mean = values.iter().copied().sum::<Decimal>() / n;
    let variance = values.iter().map(|v| (*v - mean) * (*v - mean)).sum::<Decimal>() / n;
    variance.sqrt().map(|s| s.round_dp(4))
}

/// Whether this entity earns a model call on its own.
pub fn is_candidate(feature: &FeatureVector, thresholds: &Thresholds) -> bool {
    if feature.level == EntityLevel::Campaign
        && feature.results >= thresholds.sustained_results_min
    {
        return true;
    }
    if feature.health == Health::Bad || feature.trend == Trend::Worsening {
        return true;
    }
    if feature.spend_usd > thresholds.candidate_spend_floor_usd {
        return true;
    }

    let rate_swing = [
        feature.ctr_pct_change_120m,
        feature.cpc_pct_change_120m,
        feature.cpm_pct_change_120m,
    ]
    .iter()
    .any(|d| d.map(|v| v.abs() >= RATE_SWING_PCT).unwrap_or(false));

    feature
        .cost_pct_change_120m
        .map(|v| v.abs() >= COST_SWING_PCT)
        .unwrap_or(false)
        || rate_swing
        || feature.results_delta_30m.abs() >= RESULT_SWING_30M
}

/// Filter to candidates, keep the top `cap` by spend.
pub fn select_candidates(
    mut features: Vec<FeatureVector>,
    thresholds: &Thresholds,
    cap: usize,
) -> Vec<FeatureVector> {
    features.retain(|f| is_candidate(f, thresholds));
    features.sort_by(|a, b| b.spend_usd.cmp(&a.spend_usd));
    features.truncate(cap);
    features
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::recommend::{RecAction, Recommendation};

    fn row(
        level: EntityLevel,
        id: &str,
        spend: Decimal,
        results: u64,
        cost: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> PerformanceRow {
        PerformanceRow {
            user_id: "u1".to_string(),
            level,
            entity_id: id.to_string(),
            name: id.to_string(),
            parent_id: None,
            account_id: "act_1".to_string(),
            spend_usd: spend,
            results,
            cost_per_result_usd: cost,
            ctr: Some(dec!(1.0)),
            cpc: Some(dec!(0.5)),
            cpm: Some(dec!(8)),
            trend: Trend::Stable,
            health: Health::Watch,
            recommendation: Recommendation::Stable,
            action: RecAction::None,
            confidence: 55,
            model: "rule".to_string(),
            reason: String::new(),
            captured_at: at,
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 22, 10 + minute / 60, minute % 60, 0).unwrap()
    }

    #[test]
    fn deltas_use_lookback_baselines() {
        let now = at(180);
        // 10-minute cadence back through the day.
        let history: Vec<PerformanceRow> = vec![
            row(EntityLevel::Campaign, "c_1", dec!(10), 2, Some(dec!(5)), at(0)),
            row(EntityLevel::Campaign, "c_1", dec!(40), 8, Some(dec!(5)), at(60)),
            row(EntityLevel::Campaign, "c_1", dec!(70), 12, Some(dec!(5.8)), at(150)),
        ];
        let current = vec![row(
            EntityLevel::Campaign,
            "c_1",
            dec!(82),
            15,
            Some(dec!(5.5)),
            now,
        )];

        let features = build_features(&current, &history, now);
        assert_eq!(features.len(), 1);
        let f = &features[0];
        assert_eq!(f.key, "campaign:c_1");
        // 30m baseline is the 150-minute point.
        assert_eq!(f.spend_delta_30m, dec!(12));
        assert_eq!(f.results_delta_30m, 3);
        // 120m baseline is the 60-minute point: 5 -> 5.5 is +10%.
        assert_eq!(f.cost_pct_change_120m, Some(dec!(10)));
        assert_eq!(f.results_growth_today, 13);
    }

    #[test]
    fn young_day_falls_back_to_earliest_point() {
        let now = at(15);
        let history = vec![row(
            EntityLevel::Ad,
            "ad_1",
            dec!(3),
            1,
            Some(dec!(3)),
            at(5),
        )];
        let current = vec![row(EntityLevel::Ad, "ad_1", dec!(5), 2, Some(dec!(2.5)), now)];

        let f = &build_features(&current, &history, now)[0];
        assert_eq!(f.spend_delta_30m, dec!(2));
        assert_eq!(f.results_delta_30m, 1);
    }

    #[test]
    fn no_history_yields_flat_deltas() {
        let now = at(0);
        let current = vec![row(EntityLevel::Ad, "ad_1", dec!(5), 2, Some(dec!(2.5)), now)];
        let f = &build_features(&current, &[], now)[0];
        assert_eq!(f.spend_delta_30m, Decimal::ZERO);
        assert_eq!(f.results_delta_30m, 0);
        assert_eq!(f.cost_pct_change_120m, None);
        assert_eq!(f.cost_volatility, None);
    }

    #[test]
    fn volatility_is_population_std_dev() {
        assert_eq!(std_dev(&[dec!(2), dec!(4)]), Some(dec!(1)));
        assert_eq!(std_dev(&[dec!(3)]), None);
        assert_eq!(std_dev(&[]), None);
    }

    fn feature(level: EntityLevel, spend: Decimal, results: u64) -> FeatureVector {
        let now = at(0);
        build_features(&[row(level, "e_1", spend, results, None, now)], &[], now)
            .into_iter()
            .next()
            .unwrap()
    }

    #[test]
    fn sustained_campaign_volume_is_a_candidate() {
        let thresholds = Thresholds::default();
        assert!(is_candidate(
            &feature(EntityLevel::Campaign, dec!(5), 10),
            &thresholds
        ));
        // Same volume on an ad is not sustained-volume grounds.
        assert!(!is_candidate(&feature(EntityLevel::Ad, dec!(5), 10), &thresholds));
    }

    #[test]
    fn spend_floor_is_exclusive() {
        let thresholds = Thresholds::default();
        assert!(!is_candidate(&feature(EntityLevel::Ad, dec!(50), 0), &thresholds));
        assert!(is_candidate(&feature(EntityLevel::Ad, dec!(50.01), 0), &thresholds));
    }

    #[test]
    fn swings_qualify_and_cap_orders_by_spend() {
        let thresholds = Thresholds::default();
        let mut swing = feature(EntityLevel::Ad, dec!(10), 0);
        swing.cost_pct_change_120m = Some(dec!(-12));
        assert!(is_candidate(&swing, &thresholds));

        let mut quiet = feature(EntityLevel::Ad, dec!(10), 0);
        quiet.cost_pct_change_120m = Some(dec!(-11.9));
        assert!(!is_candidate(&quiet, &thresholds));

        let mut big = feature(EntityLevel::Ad, dec!(400), 0);
        big.entity_id = "big".to_string();
        let mut small = feature(EntityLevel::Ad, dec!(60), 0);
        small.entity_id = "small".to_string();
        let picked = select_candidates(vec![small, big], &thresholds, 1);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].entity_id, "big");
    }
}
