//! Slot-gated model augmentation.
//!
//! One run per user per slot: the claim is a conditional update at the
//! storage layer, so two racing syncs resolve to a single model call.
//! The model sees one batched request of candidate feature rows and
//! answers strict JSON; anything else falls back to the rule verdicts
//! already on the rows. Account recommendations and pause/scale actions
//! are derived afterwards either way.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::Thresholds;
use crate::error::{ModelError, Result};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::monitor::PerformanceRow;
use crate::recommend::features::{FeatureVector, build_features, entity_key, select_candidates};
use crate::recommend::hierarchy::derive_hierarchy;
use crate::recommend::{AiRunTelemetry, Recommendation, RunStatus, slot_start};
use crate::store::traits::MetricsStore;

const REASON_MAX_WORDS: usize = 10;

const SYSTEM_PROMPT: &str = "You review intraday paid-ads performance rows and decide, per row, \
     whether the entity is improving, stable, worth scaling, or worsening.\n\n\
     Rules:\n\
     - Judge each row on its own numbers: deltas, volatility, cost per result\n\
     - Prefer stable when the evidence is thin\n\
     - scale is reserved for clear improvement with repeatable volume\n\n\
     Respond with a JSON object:\n\
     {\"items\":[{\"key\":\"<row key>\",\"recommendation\":\"improving|stable|scale|worsening\",\
     \"confidence\":0-100,\"reason\":\"<10 words max>\"}]}\n\n\
     Include every input row's key exactly once. ONLY output the JSON object. No other text.";

pub struct RecommendationOrchestrator {
    store: Arc<dyn MetricsStore>,
    provider: Option<Arc<dyn LlmProvider>>,
    thresholds: Thresholds,
    slot_minutes: i64,
    candidate_cap: usize,
}

impl RecommendationOrchestrator {
    pub fn new(
        store: Arc<dyn MetricsStore>,
        provider: Option<Arc<dyn LlmProvider>>,
        thresholds: Thresholds,
        slot_minutes: i64,
        candidate_cap: usize,
    ) -> Self {
        Self {
            store,
            provider,
            thresholds,
            slot_minutes,
            candidate_cap,
        }
    }

    /// Overlay model verdicts onto the monitor's rows where the slot
    /// allows, then derive account recommendations and actions. Model
    /// failures never propagate; store failures do.
    pub async fn augment(
        &self,
        user_id: &str,
        rows: &mut [PerformanceRow],
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.apply_model(user_id, rows, now).await?;
        derive_hierarchy(rows);
        Ok(())
    }

    async fn apply_model(
        &self,
        user_id: &str,
        rows: &mut [PerformanceRow],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(provider) = self.provider.as_ref() else {
            debug!(user_id, "no model configured, keeping rule verdicts");
            return Ok(());
        };
        if rows.is_empty() {
            return Ok(());
        }

        let slot = slot_start(now, self.slot_minutes);
        if !self.store.try_claim_ai_slot(user_id, slot, now).await? {
            debug!(user_id, slot = %slot, "model slot already claimed, skipping run");
            self.store
                .record_ai_run(&AiRunTelemetry {
                    user_id: user_id.to_string(),
                    last_run_at: None,
                    last_slot_start: None,
                    status: RunStatus::Skipped,
                    error: None,
                    candidates: 0,
                    updated: 0,
                })
                .await?;
            return Ok(());
        }

        let day_start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        let history = self.store.snapshots_since(user_id, day_start).await?;
        let features = build_features(rows, &history, now);
        let candidates = select_candidates(features, &self.thresholds, self.candidate_cap);
        if candidates.is_empty() {
            self.store
                .record_ai_run(&AiRunTelemetry {
                    user_id: user_id.to_string(),
                    last_run_at: Some(now),
                    last_slot_start: Some(slot),
                    status: RunStatus::Ok,
                    error: None,
                    candidates: 0,
                    updated: 0,
                })
                .await?;
            return Ok(());
        }

        let (status, error, updated) = match self.request_verdicts(provider, &candidates).await {
            Ok(verdicts) => {
                let updated = apply_verdicts(rows, &verdicts, provider.model_name());
                info!(
                    user_id,
                    candidates = candidates.len(),
                    updated,
                    "model verdicts applied"
                );
                (RunStatus::Ok, None, updated)
            }
            Err(e) => {
                warn!(user_id, error = %e, "model run failed, keeping rule verdicts");
                (RunStatus::Error, Some(e.to_string()), 0)
            }
        };

        self.store
            .record_ai_run(&AiRunTelemetry {
                user_id: user_id.to_string(),
                last_run_at: Some(now),
                last_slot_start: Some(slot),
                status,
                error,
                candidates: candidates.len() as u64,
                updated,
            })
            .await?;
        Ok(())
    }

    async fn request_verdicts(
        &self,
        provider: &Arc<dyn LlmProvider>,
        candidates: &[FeatureVector],
    ) -> std::result::Result<Vec<Verdict>, ModelError> {
        let payload =
            serde_json::to_string(candidates).map_err(|e| ModelError::InvalidResponse {
                provider: provider.model_name().to_string(),
                reason: format!("candidate serialization: {e}"),
            })?;

        let request = CompletionRequest::new(vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(format!("Candidate rows:\n{payload}")),
        ])
        .with_temperature(0.1)
        .with_max_tokens(4096);

        let response = provider.complete(request).await?;
        parse_verdicts(&response.content, provider.model_name())
    }
}

#[derive(Debug)]
struct Verdict {
    key: String,
    recommendation: Recommendation,
    confidence: u8,
    reason: String,
}

#[derive(Debug, Deserialize)]
struct ModelReply {
    items: Vec<ModelItem>,
}

#[derive(Debug, Deserialize)]
struct ModelItem {
    key: String,
    recommendation: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reason: String,
}

fn parse_verdicts(
    content: &str,
    provider: &str,
) -> std::result::Result<Vec<Verdict>, ModelError> {
    let json = extract_json_object(content);
    let reply: ModelReply =
        serde_json::from_str(&json).map_err(|e| ModelError::InvalidResponse {
            provider: provider.to_string(),
            reason: format!("unparseable verdict JSON: {e}"),
        })?;

    let mut verdicts = Vec::with_capacity(reply.items.len());
    for item in reply.items {
        let Some(recommendation) = Recommendation::from_str_loose(&item.recommendation) else {
            warn!(
                key = %item.key,
                recommendation = %item.recommendation,
                "dropping verdict with unknown recommendation"
            );
            continue;
        };
        verdicts.push(Verdict {
            key: item.key,
            recommendation,
            confidence: normalize_confidence(item.confidence),
            reason: truncate_reason(&item.reason, REASON_MAX_WORDS),
        });
    }
    Ok(verdicts)
}

fn apply_verdicts(rows: &mut [PerformanceRow], verdicts: &[Verdict], model: &str) -> u64 {
    let mut by_key: HashMap<&str, &Verdict> =
        verdicts.iter().map(|v| (v.key.as_str(), v)).collect();

    let mut updated = 0;
    for row in rows.iter_mut() {
        let key = entity_key(row.level, &row.entity_id);
        if let Some(verdict) = by_key.remove(key.as_str()) {
            row.recommendation = verdict.recommendation;
            row.action = verdict.recommendation.base_action();
            row.confidence = verdict.confidence;
            row.reason = verdict.reason.clone();
            row.model = model.to_string();
            updated += 1;
        }
    }
    updated
}

/// Accept either a 0-1 fraction or a 0-100 score.
fn normalize_confidence(raw: f64) -> u8 {
    let scaled = if raw > 0.0 && raw <= 1.0 { raw * 100.0 } else { raw };
    scaled.round().clamp(0.0, 100.0) as u8
}

fn truncate_reason(reason: &str, max_words: usize) -> String {
    let words: Vec<&str> = reason.split_whitespace().collect();
    if words.len() <= max_words {
        words.join(" ")
    } else {
        words[..max_words].join(" ")
    }
}

/// Extract a JSON object from model output that might contain markdown
/// fences or extra text.
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            return trimmed[start..=end].to_string();
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    use crate::ads::types::EntityLevel;
    use crate::error::ModelError;
    use crate::llm::CompletionResponse;
    use crate::monitor::{Health, Trend};
    use crate::recommend::RecAction;
    use crate::store::LibSqlBackend;

    struct StubProvider {
        calls: Arc<AtomicUsize>,
        reply: String,
    }

    #[async_trait]
    impl LlmProvider for StubProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> std::result::Result<CompletionResponse, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CompletionResponse {
                content: self.reply.clone(),
            })
        }

        fn model_name(&self) -> &str {
            "stub"
        }
    }

    fn bad_row(id: &str, at: DateTime<Utc>) -> PerformanceRow {
        PerformanceRow {
            user_id: "u1".to_string(),
            level: EntityLevel::Adset,
            entity_id: id.to_string(),
            name: id.to_string(),
            parent_id: Some("c_1".to_string()),
            account_id: "act_1".to_string(),
            spend_usd: dec!(20),
            results: 0,
            cost_per_result_usd: None,
            ctr: None,
            cpc: None,
            cpm: None,
            trend: Trend::Stable,
            health: Health::Bad,
            recommendation: Recommendation::Worsening,
            action: RecAction::None,
            confidence: 75,
            model: "rule".to_string(),
            reason: "Cost and results trending the wrong way".to_string(),
            captured_at: at,
        }
    }

    fn orchestrator(
        store: Arc<dyn MetricsStore>,
        provider: Arc<dyn LlmProvider>,
    ) -> RecommendationOrchestrator {
        RecommendationOrchestrator::new(
            store,
            Some(provider),
            Thresholds::default(),
            30,
            120,
        )
    }

    #[tokio::test]
    async fn same_slot_invokes_model_once() {
        let store: Arc<dyn MetricsStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(StubProvider {
            calls: calls.clone(),
            reply: r#"{"items":[{"key":"adset:as_1","recommendation":"worsening","confidence":88,"reason":"spend rising with no results"}]}"#
                .to_string(),
        });
        let orch = orchestrator(store.clone(), provider);

        let t1 = Utc.with_ymd_and_hms(2026, 8, 22, 14, 31, 0).unwrap();
        let mut rows = vec![bad_row("as_1", t1)];
        orch.augment("u1", &mut rows, t1).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rows[0].model, "stub");
        assert_eq!(rows[0].confidence, 88);

        // Second run inside the same 30-minute slot is gated off.
        let t2 = t1 + Duration::minutes(10);
        let mut rows2 = vec![bad_row("as_1", t2)];
        orch.augment("u1", &mut rows2, t2).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rows2[0].model, "rule");

        let telemetry = store.get_ai_telemetry("u1").await.unwrap().unwrap();
        assert_eq!(telemetry.status, RunStatus::Skipped);
        assert_eq!(telemetry.last_run_at, Some(t1));

        // The next slot runs again.
        let t3 = t1 + Duration::minutes(30);
        let mut rows3 = vec![bad_row("as_1", t3)];
        orch.augment("u1", &mut rows3, t3).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn garbage_reply_falls_back_to_rules() {
        let store: Arc<dyn MetricsStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let provider = Arc::new(StubProvider {
            calls: Arc::new(AtomicUsize::new(0)),
            reply: "sorry, I cannot help with that".to_string(),
        });
        let orch = orchestrator(store.clone(), provider);

        let now = Utc.with_ymd_and_hms(2026, 8, 22, 9, 5, 0).unwrap();
        let mut rows = vec![bad_row("as_1", now)];
        orch.augment("u1", &mut rows, now).await.unwrap();

        assert_eq!(rows[0].model, "rule");
        assert_eq!(rows[0].recommendation, Recommendation::Worsening);
        let telemetry = store.get_ai_telemetry("u1").await.unwrap().unwrap();
        assert_eq!(telemetry.status, RunStatus::Error);
        assert!(telemetry.error.is_some());
        assert_eq!(telemetry.updated, 0);
    }

    #[tokio::test]
    async fn no_provider_still_derives_hierarchy() {
        let store: Arc<dyn MetricsStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let orch = RecommendationOrchestrator::new(
            store.clone(),
            None,
            Thresholds::default(),
            30,
            120,
        );

        let now = Utc::now();
        let mut rows = vec![bad_row("as_1", now)];
        orch.augment("u1", &mut rows, now).await.unwrap();
        assert_eq!(rows[0].action, RecAction::PauseAdset);
        assert!(store.get_ai_telemetry("u1").await.unwrap().is_none());
    }

    #[test]
    fn json_extraction_handles_fences() {
        let fenced = "Here you go:\n```json\n{\"items\":[]}\n```";
        assert_eq!(extract_json_object(fenced), "{\"items\":[]}");

        let bare = "  {\"items\":[]} ";
        assert_eq!(extract_json_object(bare), "{\"items\":[]}");

        let embedded = "verdicts {\"items\":[]} done";
        assert_eq!(extract_json_object(embedded), "{\"items\":[]}");
    }

    #[test]
    fn parse_drops_unknown_recommendations() {
        let content = r#"{"items":[
            {"key":"ad:a1","recommendation":"scale","confidence":0.9,"reason":"steady gains"},
            {"key":"ad:a2","recommendation":"explode","confidence":50,"reason":"??"}
        ]}"#;
        let verdicts = parse_verdicts(content, "stub").unwrap();
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].recommendation, Recommendation::Scale);
        assert_eq!(verdicts[0].confidence, 90);
    }

    #[test]
    fn reasons_truncate_to_ten_words() {
        let long = "one two three four five six seven eight nine ten eleven twelve";
        assert_eq!(
            truncate_reason(long, REASON_MAX_WORDS),
            "one two three four five six seven eight nine ten"
        );
        assert_eq!(truncate_reason("short reason", REASON_MAX_WORDS), "short reason");
    }

    #[test]
    fn confidence_scales_and_clamps() {
        assert_eq!(normalize_confidence(0.87), 87);
        assert_eq!(normalize_confidence(62.0), 62);
        assert_eq!(normalize_confidence(140.0), 100);
        assert_eq!(normalize_confidence(-3.0), 0);
    }
}
