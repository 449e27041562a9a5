// src/lib.rs

pub mod bandwidth; // Batch sizing from a round-trip probe
pub mod cluster;
pub mod config;
pub mod constants;
pub mod driver; // Worker admission, batches, ramp
pub mod error;
pub mod export;
pub mod import; // Table sources and bounded row import
pub mod inventory;
pub mod live_stats;
pub mod loader;
pub mod logging;
pub mod metrics;
pub mod provision;
pub mod randomize;
pub mod retry;
pub mod rules;
pub mod template;

pub use error::{CbError, CbResult};
