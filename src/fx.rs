//! Currency-rate table, fetched once per batch run.
//!
//! The endpoint returns USD-relative rates (units of currency per one
//! USD). Conversion therefore divides: 37.00 PEN at rate 3.7 is 10.00
//! USD. A missing rate leaves the amount unconverted; that is graceful
//! degradation, not an error.

use std::collections::HashMap;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::config::FxConfig;
use crate::error::FxError;

/// Round a USD amount to cents for persistence.
pub fn round_usd(value: Decimal) -> Decimal {
    value.round_dp(2)
}

/// Snapshot of currency → USD-relative rate, shared across one batch.
#[derive(Debug, Clone, Default)]
pub struct RateTable {
    rates: HashMap<String, Decimal>,
}

impl RateTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_rates(rates: HashMap<String, Decimal>) -> Self {
        let rates = rates
            .into_iter()
            .map(|(code, rate)| (code.to_uppercase(), rate))
            .collect();
        Self { rates }
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn rate(&self, currency: &str) -> Option<Decimal> {
        self.rates.get(&currency.to_uppercase()).copied()
    }

    /// Convert an amount to USD. `None` when no usable rate exists.
    pub fn to_usd(&self, amount: Decimal, currency: &str) -> Option<Decimal> {
        if currency.eq_ignore_ascii_case("USD") {
            return Some(round_usd(amount));
        }
        let rate = self.rate(currency)?;
        if rate <= Decimal::ZERO {
            return None;
        }
        Some(round_usd(amount / rate))
    }

    /// Convert, or pass the original amount through unconverted when the
    /// table has no rate for this currency.
    pub fn to_usd_or_original(&self, amount: Decimal, currency: &str) -> Decimal {
        match self.to_usd(amount, currency) {
            Some(usd) => usd,
            None => {
                tracing::warn!(currency, "no FX rate available, leaving spend unconverted");
                round_usd(amount)
            }
        }
    }
}

/// Fetches the rate snapshot from the configured endpoint.
pub struct FxProvider {
    url: String,
    client: reqwest::Client,
}

impl FxProvider {
    pub fn new(config: &FxConfig) -> Result<Self, FxError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| FxError::FetchFailed(e.to_string()))?;
        Ok(Self {
            url: config.url.clone(),
            client,
        })
    }

    pub async fn fetch(&self) -> Result<RateTable, FxError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| FxError::FetchFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FxError::FetchFailed(format!("status {status}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FxError::InvalidResponse(e.to_string()))?;
        parse_rates(&body)
    }
}

/// Accept either `{"rates": {code: rate, ...}}` or a bare flat map.
/// Non-numeric values (status fields and the like) are skipped.
fn parse_rates(body: &serde_json::Value) -> Result<RateTable, FxError> {
    let map = body.get("rates").unwrap_or(body);
    let obj = map
        .as_object()
        .ok_or_else(|| FxError::InvalidResponse("expected a JSON object of rates".to_string()))?;

    let mut rates = HashMap::new();
    for (code, value) in obj {
        if let Some(rate) = value_to_decimal(value) {
            rates.insert(code.to_uppercase(), rate);
        }
    }
    if rates.is_empty() {
        return Err(FxError::InvalidResponse("no numeric rates in response".to_string()));
    }
    Ok(RateTable { rates })
}

fn value_to_decimal(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
