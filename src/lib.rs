//! # TF2 Arbitrage
//!
//! Detects and executes cross-marketplace price arbitrage on Team Fortress 2
//! items: buy where an item is listed cheap, sell where buyers bid more.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `market`: Item identities, price feeds, and trading venues
//! - `pricing`: Feed normalization and the concurrent price cache
//! - `strategy`: Opportunity detection, execution, and the pipeline
//! - `ledger`: Durable append-only record of execution attempts
//! - `risk`: Operator alerts and the halt switch
//! - `utils`: Currency conversion helpers

pub mod config;
pub mod ledger;
pub mod market;
pub mod pricing;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
