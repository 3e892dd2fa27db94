//! Ads-platform integration: wire types and the Graph API client.

pub mod client;
pub mod types;

pub use client::AdsClient;
