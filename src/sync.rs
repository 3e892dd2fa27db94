//! Sync orchestration: the per-user pipeline and the all-users batch.
//!
//! Per user, stages run strictly in order: inventory, classification,
//! the five lens passes, monitoring, recommendation, state replacement.
//! Retention prunes all users at once, so it runs once per batch (and
//! after an on-demand run), not inside the per-user pipeline. Writes
//! are not wrapped in a cross-stage transaction; a mid-cycle failure
//! leaves the completed stages' rows in place and the next cycle
//! repairs the rest.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ads::AdsClient;
use crate::ads::types::{ActionCount, AdsetInfo, EntityLevel, is_active};
use crate::classify::{ClassificationMap, classify_all};
use crate::config::AppConfig;
use crate::error::{Result, SyncError};
use crate::fx::{FxProvider, RateTable};
use crate::inventory::{AdAccount, Connection, InventoryLoader};
use crate::lens::{LENS_ORDER, LensAggregator, LensSummary, UserContext};
use crate::llm::LlmProvider;
use crate::monitor::PerformanceMonitor;
use crate::recommend::RecommendationOrchestrator;
use crate::retention::RetentionManager;
use crate::store::traits::{MetricsStore, SubCampaignRow};

/// Outcome of one user's sync: the five lens summaries plus the size of
/// the monitored entity set.
#[derive(Debug, Serialize)]
pub struct UserSyncReport {
    pub user_id: String,
    pub summaries: Vec<LensSummary>,
    pub monitored_entities: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SyncFailure {
    pub user_id: String,
    pub error: String,
}

/// Outcome of one batch run across all stored connections.
#[derive(Debug, Serialize)]
pub struct BatchReport {
    pub processed: u64,
    pub failed: u64,
    pub failures: Vec<SyncFailure>,
    pub completed_at: DateTime<Utc>,
}

/// Everything the lens and monitor passes need about a user's adsets,
/// built once per cycle by the classification phase.
struct ClassifiedInventory {
    classifications: ClassificationMap,
    adsets: HashMap<String, AdsetInfo>,
    active_campaigns: HashMap<String, bool>,
}

pub struct SyncEngine {
    store: Arc<dyn MetricsStore>,
    ads: Arc<AdsClient>,
    fx: FxProvider,
    inventory: InventoryLoader,
    aggregator: LensAggregator,
    monitor: PerformanceMonitor,
    recommender: RecommendationOrchestrator,
    retention: RetentionManager,
}

impl SyncEngine {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn MetricsStore>,
        ads: Arc<AdsClient>,
        fx: FxProvider,
        provider: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        Self {
            inventory: InventoryLoader::new(ads.clone(), store.clone()),
            aggregator: LensAggregator::new(
                ads.clone(),
                store.clone(),
                config.thresholds.clone(),
            ),
            monitor: PerformanceMonitor::new(ads.clone(), store.clone(), config.thresholds.clone()),
            recommender: RecommendationOrchestrator::new(
                store.clone(),
                provider,
                config.thresholds.clone(),
                config.slot_minutes,
                config.candidate_cap,
            ),
            retention: RetentionManager::new(store.clone(), config.retention_days),
            fx,
            store,
            ads,
        }
    }

    /// Sync every stored connection sequentially. Failures are isolated
    /// per user and collected; the batch itself never aborts once the
    /// connection list is in hand.
    pub async fn run_batch(&self) -> Result<BatchReport> {
        let connections = self.store.list_connections().await?;
        let rates = self.fetch_rates().await;
        info!(
            connections = connections.len(),
            has_rates = !rates.is_empty(),
            "batch sync starting"
        );

        let mut processed = 0u64;
        let mut failures = Vec::new();
        for conn in &connections {
            match self.sync_connection(conn, &rates, Utc::now()).await {
                Ok(report) => {
                    processed += 1;
                    debug!(
                        user_id = %conn.user_id,
                        entities = report.monitored_entities,
                        "user sync ok"
                    );
                }
                Err(e) => {
                    warn!(user_id = %conn.user_id, error = %e, "user sync failed, continuing batch");
                    failures.push(SyncFailure {
                        user_id: conn.user_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        // The prune SQL spans every user, so one pass covers the batch.
        self.retention.run(Utc::now()).await?;

        let report = BatchReport {
            processed,
            failed: failures.len() as u64,
            failures,
            completed_at: Utc::now(),
        };
        info!(processed = report.processed, failed = report.failed, "batch sync complete");
        Ok(report)
    }

    /// On-demand sync for one user, with its own rate fetch and
    /// retention pass.
    pub async fn sync_user(&self, user_id: &str) -> Result<UserSyncReport> {
        let conn = self
            .store
            .get_connection(user_id)
            .await?
            .ok_or_else(|| SyncError::NoConnection(user_id.to_string()))?;
        let rates = self.fetch_rates().await;
        let report = self.sync_connection(&conn, &rates, Utc::now()).await?;
        self.retention.run(report.completed_at).await?;
        Ok(report)
    }

    /// Run the full per-user pipeline at a fixed instant.
    pub async fn sync_connection(
        &self,
        conn: &Connection,
        rates: &RateTable,
        now: DateTime<Utc>,
    ) -> Result<UserSyncReport> {
        let accounts = self.inventory.load(conn).await?;
        let inventory = self.classify_inventory(conn, &accounts).await?;

        let ctx = UserContext {
            user_id: &conn.user_id,
            token: conn.access_token.expose_secret(),
            accounts: &accounts,
            classifications: &inventory.classifications,
            adsets: &inventory.adsets,
            active_campaigns: &inventory.active_campaigns,
            rates,
            now,
        };

        let mut summaries = Vec::with_capacity(LENS_ORDER.len());
        for &lens in LENS_ORDER {
            let summary =
                self.aggregator
                    .run(&ctx, lens)
                    .await
                    .map_err(|e| SyncError::StageFailed {
                        user_id: conn.user_id.clone(),
                        stage: format!("lens:{}", lens.as_str()),
                        reason: e.to_string(),
                    })?;
            summaries.push(summary);
        }

        let mut rows = self.monitor.build(&ctx).await?;
        self.recommender.augment(&conn.user_id, &mut rows, now).await?;
        self.store
            .replace_performance_state(&conn.user_id, &rows, now)
            .await?;
        self.store.append_snapshots(&rows).await?;

        info!(user_id = %conn.user_id, entities = rows.len(), "user sync complete");
        Ok(UserSyncReport {
            user_id: conn.user_id.clone(),
            summaries,
            monitored_entities: rows.len() as u64,
            completed_at: now,
        })
    }

    /// List campaigns and adsets across all accounts, classify every
    /// adset, and persist the classifications before any lens runs.
    async fn classify_inventory(
        &self,
        conn: &Connection,
        accounts: &[AdAccount],
    ) -> Result<ClassifiedInventory> {
        let token = conn.access_token.expose_secret();

        let mut all_adsets: Vec<AdsetInfo> = Vec::new();
        let mut adset_accounts: HashMap<String, String> = HashMap::new();
        let mut campaign_objectives: HashMap<String, String> = HashMap::new();
        let mut active_campaigns: HashMap<String, bool> = HashMap::new();
        let mut observed: HashMap<String, Vec<ActionCount>> = HashMap::new();

        for account in accounts {
            let campaigns = self.ads.list_campaigns(token, &account.account_id).await?;
            for campaign in &campaigns {
                if let Some(objective) = &campaign.objective {
                    campaign_objectives.insert(campaign.id.clone(), objective.clone());
                }
                active_campaigns.insert(campaign.id.clone(), is_active(campaign.status.as_deref()));
            }

            let adsets = self.ads.list_adsets(token, &account.account_id).await?;
            for adset in &adsets {
                adset_accounts.insert(adset.id.clone(), account.account_id.clone());
            }
            all_adsets.extend(adsets);

            // Today's adset-level rows carry the observed result actions
            // the classifier's step 3 inspects.
            let insights = self
                .ads
                .insights(token, &account.account_id, EntityLevel::Adset)
                .await?;
            for row in &insights {
                if let Some(adset_id) = row.entity_id(EntityLevel::Adset) {
                    observed.insert(adset_id.to_string(), row.action_counts());
                }
            }
        }

        let overrides = self.store.manual_overrides(&conn.user_id).await?;
        let classifications =
            classify_all(&all_adsets, &campaign_objectives, &observed, &overrides);

        let rows = sub_campaign_rows(&all_adsets, &adset_accounts, &classifications);
        self.store.upsert_sub_campaigns(&conn.user_id, &rows).await?;
        debug!(
            user_id = %conn.user_id,
            adsets = rows.len(),
            overrides = overrides.len(),
            "classification phase complete"
        );

        let adsets = all_adsets.into_iter().map(|a| (a.id.clone(), a)).collect();
        Ok(ClassifiedInventory {
            classifications,
            adsets,
            active_campaigns,
        })
    }

    async fn fetch_rates(&self) -> RateTable {
        match self.fx.fetch().await {
            Ok(table) => table,
            Err(e) => {
                warn!(error = %e, "FX fetch failed, spend stays in original currencies");
                RateTable::empty()
            }
        }
    }
}

fn sub_campaign_rows(
    adsets: &[AdsetInfo],
    adset_accounts: &HashMap<String, String>,
    classifications: &ClassificationMap,
) -> Vec<SubCampaignRow> {
    adsets
        .iter()
        .filter_map(|adset| {
            let classification = classifications.get(&adset.id)?;
            Some(SubCampaignRow {
                adset_id: adset.id.clone(),
                account_id: adset_accounts.get(&adset.id).cloned().unwrap_or_default(),
                campaign_id: adset.campaign_id.clone(),
                name: adset.name.clone(),
                optimization_goal: adset.optimization_goal.clone(),
                destination_type: adset.destination_type.clone(),
                has_lead_form: adset
                    .promoted_object
                    .as_ref()
                    .and_then(|po| po.lead_gen_form_id.as_deref())
                    .is_some(),
                classification: *classification,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::ads::types::PromotedObject;
    use crate::classify::{Category, Classification, ClassificationSource};

    fn adset(id: &str, campaign_id: &str) -> AdsetInfo {
        AdsetInfo {
            id: id.to_string(),
            name: Some(format!("Adset {id}")),
            status: Some("ACTIVE".to_string()),
            campaign_id: Some(campaign_id.to_string()),
            optimization_goal: Some("LEAD_GENERATION".to_string()),
            destination_type: None,
            promoted_object: None,
        }
    }

    #[test]
    fn rows_carry_account_and_lead_form_signal() {
        let mut with_form = adset("as_1", "c_1");
        with_form.promoted_object = Some(PromotedObject {
            lead_gen_form_id: Some("form_9".to_string()),
            pixel_id: None,
            custom_event_type: None,
            page_id: None,
        });
        let plain = adset("as_2", "c_1");

        let adset_accounts = HashMap::from([
            ("as_1".to_string(), "act_1".to_string()),
            ("as_2".to_string(), "act_1".to_string()),
        ]);
        let classification = Classification {
            category: Category::Leads,
            source: ClassificationSource::Auto,
            confidence: 95,
        };
        let classifications: ClassificationMap = HashMap::from([
            ("as_1".to_string(), classification),
            ("as_2".to_string(), classification),
        ]);

        let mut rows = sub_campaign_rows(&[with_form, plain], &adset_accounts, &classifications);
        rows.sort_by(|a, b| a.adset_id.cmp(&b.adset_id));
        assert_eq!(rows.len(), 2);
        assert!(rows[0].has_lead_form);
        assert!(!rows[1].has_lead_form);
        assert_eq!(rows[0].account_id, "act_1");
        assert_eq!(rows[0].classification.category, Category::Leads);
    }

    #[test]
    fn unclassified_adsets_produce_no_rows() {
        let adsets = vec![adset("as_1", "c_1")];
        let rows = sub_campaign_rows(&adsets, &HashMap::new(), &HashMap::new());
        assert!(rows.is_empty());
    }
}
