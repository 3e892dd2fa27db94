//! AdPulse — ads-performance metrics sync & classification engine.

pub mod ads;
pub mod classify;
pub mod config;
pub mod error;
pub mod fx;
pub mod http;
pub mod inventory;
pub mod lens;
pub mod llm;
pub mod monitor;
pub mod recommend;
pub mod retention;
pub mod store;
pub mod sync;
