//! Error types for adpulse.

use std::time::Duration;

/// Top-level error type for the sync engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ads API error: {0}")]
    AdsApi(#[from] AdsApiError),

    #[error("FX error: {0}")]
    Fx(#[from] FxError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Ads-platform API errors.
#[derive(Debug, thiserror::Error)]
pub enum AdsApiError {
    #[error("Request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("Request to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("Unexpected response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("Platform rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Currency-rate endpoint errors.
#[derive(Debug, thiserror::Error)]
pub enum FxError {
    #[error("Rate fetch failed: {0}")]
    FetchFailed(String),

    #[error("Rate response could not be parsed: {0}")]
    InvalidResponse(String),
}

/// Recommendation-model errors.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("No model configured")]
    NotConfigured,
}

/// Sync-orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("No connection stored for user {0}")]
    NoConnection(String),

    #[error("User {user_id} sync failed during {stage}: {reason}")]
    StageFailed {
        user_id: String,
        stage: String,
        reason: String,
    },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
