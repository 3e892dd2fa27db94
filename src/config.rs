//! Configuration types, loaded from the environment at startup.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;

use crate::error::ConfigError;

/// Ads-platform client configuration.
#[derive(Debug, Clone)]
pub struct AdsConfig {
    /// Graph API base URL (overridable for tests/stubs).
    pub base_url: String,
    /// API version path segment, e.g. "v19.0".
    pub api_version: String,
    /// Per-call HTTP timeout in seconds.
    pub timeout_secs: u64,
    /// Hard cap on pages followed per paginated call.
    pub max_pages: usize,
    /// Page size requested via the `limit` query parameter.
    pub page_size: u32,
}

impl Default for AdsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.facebook.com".to_string(),
            api_version: "v19.0".to_string(),
            timeout_secs: 30,
            max_pages: 10,
            page_size: 100,
        }
    }
}

/// Currency-rate endpoint configuration.
#[derive(Debug, Clone)]
pub struct FxConfig {
    /// Endpoint returning a flat {code → USD rate} JSON map.
    pub url: String,
    /// Per-call HTTP timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for FxConfig {
    fn default() -> Self {
        Self {
            url: "https://open.er-api.com/v6/latest/USD".to_string(),
            timeout_secs: 15,
        }
    }
}

/// Supported recommendation-model backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelBackend {
    Anthropic,
    OpenAi,
}

/// Recommendation-model configuration.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub backend: ModelBackend,
    pub api_key: SecretString,
    pub model: String,
}

impl ModelConfig {
    /// Build from `ADPULSE_MODEL_*` variables. Returns `None` when no API
    /// key is set — the engine then runs rule-based recommendations only.
    pub fn from_env() -> Option<Self> {
        let (backend, api_key) = if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            (ModelBackend::Anthropic, key)
        } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            (ModelBackend::OpenAi, key)
        } else {
            return None;
        };

        let model = std::env::var("ADPULSE_MODEL").unwrap_or_else(|_| match backend {
            ModelBackend::Anthropic => "claude-sonnet-4-20250514".to_string(),
            ModelBackend::OpenAi => "gpt-4o-mini".to_string(),
        });

        Some(Self {
            backend,
            api_key: SecretString::from(api_key),
            model,
        })
    }
}

/// Decision thresholds for monitoring and candidate selection.
///
/// The monitor thresholds and the per-lens activity floor are deliberately
/// separate knobs; they are tuned independently.
#[derive(Debug, Clone)]
pub struct Thresholds {
    /// Spend at or above this with zero results marks health `bad` (USD).
    pub monitor_min_spend_usd: Decimal,
    /// Cost-per-result at or below this supports health `good` (USD).
    pub monitor_low_cost_usd: Decimal,
    /// Spend floor above which an entity always becomes a model candidate (USD).
    pub candidate_spend_floor_usd: Decimal,
    /// Daily result count a campaign needs to count as sustained volume.
    pub sustained_results_min: u64,
    /// Minimum daily spend for a lens to consider an account active (USD).
    pub lens_active_spend_usd: Decimal,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            monitor_min_spend_usd: dec!(5),
            monitor_low_cost_usd: dec!(10),
            candidate_spend_floor_usd: dec!(50),
            sustained_results_min: 10,
            lens_active_spend_usd: dec!(1),
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the local libSQL database file.
    pub db_path: String,
    /// HTTP listen port for the trigger endpoints.
    pub http_port: u16,
    /// Bearer secret for the sync endpoints. Open access when unset.
    pub sync_secret: Option<String>,
    /// Cron expression for the in-process batch scheduler. Disabled when unset.
    pub sync_cron: Option<String>,
    /// Directory for daily-rotated log files. Stderr only when unset.
    pub log_dir: Option<String>,
    /// Recommendation-model rate-limit slot width, minutes.
    pub slot_minutes: i64,
    /// Cap on the candidate set sent to the model per run.
    pub candidate_cap: usize,
    /// Time-series/snapshot retention window, days.
    pub retention_days: i64,
    pub ads: AdsConfig,
    pub fx: FxConfig,
    pub model: Option<ModelConfig>,
    pub thresholds: Thresholds,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/adpulse.db".to_string(),
            http_port: 8080,
            sync_secret: None,
            sync_cron: None,
            log_dir: None,
            slot_minutes: 30,
            candidate_cap: 120,
            retention_days: 7,
            ads: AdsConfig::default(),
            fx: FxConfig::default(),
            model: None,
            thresholds: Thresholds::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the environment, validating parseable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            db_path: std::env::var("ADPULSE_DB_PATH")
                .unwrap_or_else(|_| "./data/adpulse.db".to_string()),
            http_port: parse_var("ADPULSE_HTTP_PORT", 8080)?,
            sync_secret: std::env::var("ADPULSE_SYNC_SECRET").ok().filter(|s| !s.is_empty()),
            sync_cron: std::env::var("ADPULSE_SYNC_CRON").ok().filter(|s| !s.is_empty()),
            log_dir: std::env::var("ADPULSE_LOG_DIR").ok().filter(|s| !s.is_empty()),
            slot_minutes: parse_var("ADPULSE_AI_SLOT_MINUTES", 30)?,
            candidate_cap: parse_var("ADPULSE_AI_CANDIDATE_CAP", 120)?,
            retention_days: parse_var("ADPULSE_RETENTION_DAYS", 7)?,
            ads: AdsConfig::default(),
            fx: FxConfig::default(),
            model: ModelConfig::from_env(),
            thresholds: Thresholds::default(),
        };

        if let Ok(url) = std::env::var("ADPULSE_ADS_BASE_URL") {
            config.ads.base_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(version) = std::env::var("ADPULSE_ADS_API_VERSION") {
            config.ads.api_version = version;
        }
        config.ads.timeout_secs = parse_var("ADPULSE_ADS_TIMEOUT_SECS", config.ads.timeout_secs)?;
        config.ads.max_pages = parse_var("ADPULSE_ADS_MAX_PAGES", config.ads.max_pages)?;

        if let Ok(url) = std::env::var("ADPULSE_FX_URL") {
            config.fx.url = url;
        }
        config.fx.timeout_secs = parse_var("ADPULSE_FX_TIMEOUT_SECS", config.fx.timeout_secs)?;

        if let Some(ref expr) = config.sync_cron {
            use std::str::FromStr;
            cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
                key: "ADPULSE_SYNC_CRON".to_string(),
                message: e.to_string(),
            })?;
        }

        if config.slot_minutes <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "ADPULSE_AI_SLOT_MINUTES".to_string(),
                message: "must be positive".to_string(),
            });
        }

        Ok(config)
    }
}

/// Parse an env var into `T`, falling back to `default` when unset.
fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("could not parse '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.slot_minutes, 30);
        assert_eq!(config.candidate_cap, 120);
        assert_eq!(config.retention_days, 7);
        assert!(config.sync_secret.is_none());
        assert_eq!(config.ads.max_pages, 10);
    }

    #[test]
    fn threshold_defaults() {
        let t = Thresholds::default();
        assert_eq!(t.monitor_min_spend_usd, dec!(5));
        assert_eq!(t.monitor_low_cost_usd, dec!(10));
        assert!(t.candidate_spend_floor_usd > t.monitor_min_spend_usd);
    }

    #[test]
    fn parse_var_falls_back_when_unset() {
        // SAFETY: test-local variable name, nothing else reads it concurrently.
        unsafe { std::env::remove_var("ADPULSE_TEST_UNSET_VAR") };
        let port: u16 = parse_var("ADPULSE_TEST_UNSET_VAR", 9999).unwrap();
        assert_eq!(port, 9999);
    }
}
