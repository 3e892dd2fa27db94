//! Persistence layer — libSQL-backed storage for connections, lens
//! metrics, performance state, and AI run telemetry.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{MetricsStore, RetentionStats, SubCampaignRow};
