//! HTTP client for the ads-platform Graph API.
//!
//! All calls are GETs against versioned paths, authenticated with a
//! per-connection access token passed as a query parameter. Listing and
//! insight endpoints paginate via an absolute `paging.next` URL; every
//! paginated fetch is bounded by a max-pages guard so one oversized
//! account cannot stall a batch.

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::ads::types::{
    AccountInfo, AdInfo, AdsetInfo, CampaignInfo, EntityLevel, InsightRow, Paged,
};
use crate::config::AdsConfig;
use crate::error::AdsApiError;

pub struct AdsClient {
    base_url: String,
    api_version: String,
    max_pages: usize,
    page_size: u32,
    timeout: Duration,
    client: reqwest::Client,
}

impl AdsClient {
    pub fn new(config: &AdsConfig) -> Result<Self, AdsApiError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdsApiError::RequestFailed {
                endpoint: "client".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            max_pages: config.max_pages,
            page_size: config.page_size,
            timeout,
            client,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{}/{path}", self.base_url, self.api_version)
    }

    /// List the ad accounts visible to the token's user.
    pub async fn list_ad_accounts(&self, token: &str) -> Result<Vec<AccountInfo>, AdsApiError> {
        let url = format!(
            "{}?fields=id,name,currency,account_status&limit={}&access_token={token}",
            self.api_url("me/adaccounts"),
            self.page_size,
        );
        self.fetch_paged("adaccounts", url).await
    }

    pub async fn list_campaigns(
        &self,
        token: &str,
        account_id: &str,
    ) -> Result<Vec<CampaignInfo>, AdsApiError> {
        let url = format!(
            "{}?fields=id,name,status,objective&limit={}&access_token={token}",
            self.api_url(&format!("{account_id}/campaigns")),
            self.page_size,
        );
        self.fetch_paged("campaigns", url).await
    }

    /// List an account's adsets with the configuration fields the
    /// classifier inspects.
    pub async fn list_adsets(
        &self,
        token: &str,
        account_id: &str,
    ) -> Result<Vec<AdsetInfo>, AdsApiError> {
        let url = format!(
            "{}?fields=id,name,status,campaign_id,optimization_goal,destination_type,promoted_object&limit={}&access_token={token}",
            self.api_url(&format!("{account_id}/adsets")),
            self.page_size,
        );
        self.fetch_paged("adsets", url).await
    }

    pub async fn list_ads(&self, token: &str, account_id: &str) -> Result<Vec<AdInfo>, AdsApiError> {
        let url = format!(
            "{}?fields=id,name,status,adset_id,campaign_id&limit={}&access_token={token}",
            self.api_url(&format!("{account_id}/ads")),
            self.page_size,
        );
        self.fetch_paged("ads", url).await
    }

    /// Fetch today's insight rows for an account at the given level.
    pub async fn insights(
        &self,
        token: &str,
        account_id: &str,
        level: EntityLevel,
    ) -> Result<Vec<InsightRow>, AdsApiError> {
        let url = format!(
            "{}?level={}&date_preset=today&fields={}&limit={}&access_token={token}",
            self.api_url(&format!("{account_id}/insights")),
            level.as_str(),
            insight_fields(level),
            self.page_size,
        );
        self.fetch_paged("insights", url).await
    }

    /// Follow `paging.next` until exhausted or the page cap is hit.
    async fn fetch_paged<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        first_url: String,
    ) -> Result<Vec<T>, AdsApiError> {
        let mut url = first_url;
        let mut out = Vec::new();
        for _ in 0..self.max_pages {
            let page: Paged<T> = self.get_json(endpoint, &url).await?;
            out.extend(page.data);
            match page.paging.and_then(|p| p.next) {
                Some(next) => url = next,
                None => return Ok(out),
            }
        }
        tracing::warn!(
            endpoint,
            max_pages = self.max_pages,
            "pagination cap reached, truncating result set"
        );
        Ok(out)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        url: &str,
    ) -> Result<T, AdsApiError> {
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                AdsApiError::Timeout {
                    endpoint: endpoint.to_string(),
                    timeout: self.timeout,
                }
            } else {
                AdsApiError::RequestFailed {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AdsApiError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<T>().await.map_err(|e| AdsApiError::InvalidResponse {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Insight fields to request at each level. Id/name columns widen as
/// the level narrows.
fn insight_fields(level: EntityLevel) -> &'static str {
    match level {
        EntityLevel::Account => "spend,impressions,clicks,ctr,cpc,cpm,frequency,actions,account_id",
        EntityLevel::Campaign => {
            "spend,impressions,clicks,ctr,cpc,cpm,frequency,actions,campaign_id,campaign_name"
        }
        EntityLevel::Adset => {
            "spend,impressions,clicks,ctr,cpc,cpm,frequency,actions,campaign_id,adset_id,adset_name"
        }
        EntityLevel::Ad => {
            "spend,impressions,clicks,ctr,cpc,cpm,frequency,actions,campaign_id,adset_id,ad_id,ad_name"
        }
    }
}
