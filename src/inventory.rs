//! Connection credentials and ad-account inventory.
//!
//! The token-exchange flow lives outside this service; whatever performs
//! it stores one connection row per user. Account rows are refreshed from
//! the platform on connect and reused from the store on every sync.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};

use crate::ads::AdsClient;
use crate::ads::types::AccountInfo;
use crate::error::Result;
use crate::store::traits::MetricsStore;

/// A stored platform connection for one user.
#[derive(Debug, Clone)]
pub struct Connection {
    pub user_id: String,
    pub access_token: SecretString,
    pub connected_at: DateTime<Utc>,
}

/// One advertising account owned by a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdAccount {
    pub user_id: String,
    /// Platform id, `act_` prefixed.
    pub account_id: String,
    pub name: String,
    pub currency: String,
}

impl AdAccount {
    pub fn from_listing(user_id: &str, info: &AccountInfo) -> Self {
        Self {
            user_id: user_id.to_string(),
            account_id: info.id.clone(),
            name: info.name.clone().unwrap_or_else(|| info.id.clone()),
            currency: info.currency.clone().unwrap_or_else(|| "USD".to_string()),
        }
    }
}

/// Loads the accounts a sync cycle will process.
pub struct InventoryLoader {
    ads: Arc<AdsClient>,
    store: Arc<dyn MetricsStore>,
}

impl InventoryLoader {
    pub fn new(ads: Arc<AdsClient>, store: Arc<dyn MetricsStore>) -> Self {
        Self { ads, store }
    }

    /// Stored account inventory for a user. When the store has none yet,
    /// falls through to a platform refresh so a freshly connected user
    /// syncs without waiting for the next connect event.
    pub async fn load(&self, conn: &Connection) -> Result<Vec<AdAccount>> {
        let stored = self.store.list_ad_accounts(&conn.user_id).await?;
        if !stored.is_empty() {
            return Ok(stored);
        }
        self.refresh(conn).await
    }

    /// Re-list accounts from the platform and replace the stored rows.
    pub async fn refresh(&self, conn: &Connection) -> Result<Vec<AdAccount>> {
        let listed = self
            .ads
            .list_ad_accounts(conn.access_token.expose_secret())
            .await?;
        let accounts: Vec<AdAccount> = listed
            .iter()
            .map(|info| AdAccount::from_listing(&conn.user_id, info))
            .collect();
        self.store.replace_ad_accounts(&conn.user_id, &accounts).await?;
        tracing::info!(
            user_id = %conn.user_id,
            accounts = accounts.len(),
            "refreshed ad-account inventory"
        );
        Ok(accounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_defaults_fill_missing_fields() {
        let info = AccountInfo {
            id: "act_981".to_string(),
            name: None,
            currency: None,
            account_status: Some(1),
        };
        let account = AdAccount::from_listing("u1", &info);
        assert_eq!(account.account_id, "act_981");
        assert_eq!(account.name, "act_981");
        assert_eq!(account.currency, "USD");
    }
}
