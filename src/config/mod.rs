//! Configuration management for the arbitrage engine.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Opportunity detection thresholds
    #[serde(default)]
    pub detection: DetectionConfig,
    /// Per-marketplace fee schedule
    #[serde(default)]
    pub fees: FeeConfig,
    /// Execution retry and timeout parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Currency conversion
    #[serde(default)]
    pub currency: CurrencyConfig,
    /// Execution ledger storage
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Marketplace trading API credentials
    #[serde(default)]
    pub marketplace: MarketplaceConfig,
    /// Price feeds, one ingestion task each
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
    /// Item name resolution
    #[serde(default)]
    pub items: ItemsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Minimum net profit in refined metal; opportunities must exceed it
    #[serde(default = "default_min_net_profit")]
    pub min_net_profit: Decimal,
    /// Quotes older than this are ignored
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
}

/// Fees charged by a marketplace on one leg.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFees {
    /// Fixed fee per trade in refined metal
    #[serde(default)]
    pub flat: Decimal,
    /// Proportional fee (0.0-1.0) of the traded price
    #[serde(default)]
    pub rate: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Fees for sources without an explicit entry
    #[serde(default)]
    pub default: SourceFees,
    /// Per-source overrides keyed by source id
    #[serde(default)]
    pub sources: HashMap<String, SourceFees>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum tries per external call (including the first)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff before the first retry
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on backoff
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Timeout applied to every trading API call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrencyConfig {
    /// Price of one Mann Co. Supply Crate Key in refined metal, used until refreshed
    #[serde(default = "default_key_price_ref")]
    pub key_price_ref: Decimal,
    /// backpack.tf API base URL for live key prices; empty disables refreshing
    #[serde(default)]
    pub refresh_url: String,
    /// backpack.tf API key
    #[serde(default)]
    pub api_key: String,
    /// Seconds between key price refreshes
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Path to the SQLite ledger database
    #[serde(default = "default_ledger_path")]
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketplaceConfig {
    /// Trading API base URL
    #[serde(default)]
    pub base_url: String,
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret for signing requests
    #[serde(default)]
    pub api_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Source id stamped on updates that omit one
    pub source: String,
    /// Websocket URL
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemsConfig {
    /// Item name → defindex
    #[serde(default)]
    pub aliases: HashMap<String, u32>,
}

// Default value functions
fn default_min_net_profit() -> Decimal {
    Decimal::new(1, 0) // 1 ref
}

fn default_staleness_secs() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_key_price_ref() -> Decimal {
    Decimal::new(6000, 2) // 60.00 ref
}

fn default_refresh_secs() -> u64 {
    300
}

fn default_ledger_path() -> String {
    "data/ledger.db".to_string()
}

impl DetectionConfig {
    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_secs as i64)
    }
}

impl ExecutionConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl CurrencyConfig {
    pub fn refresh_enabled(&self) -> bool {
        !self.refresh_url.is_empty()
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("TF2ARB"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.detection.min_net_profit >= Decimal::ZERO,
            "min_net_profit must not be negative"
        );

        anyhow::ensure!(
            self.detection.staleness_secs > 0,
            "staleness_secs must be positive"
        );

        anyhow::ensure!(
            self.execution.max_attempts >= 1,
            "max_attempts must be at least 1"
        );

        anyhow::ensure!(
            self.execution.initial_backoff_ms <= self.execution.max_backoff_ms,
            "initial_backoff_ms must be <= max_backoff_ms"
        );

        anyhow::ensure!(
            self.currency.key_price_ref > Decimal::ZERO,
            "key_price_ref must be positive"
        );

        anyhow::ensure!(
            !self.currency.refresh_enabled() || self.currency.refresh_secs > 0,
            "refresh_secs must be positive when refresh_url is set"
        );

        for (source, fees) in
            std::iter::once(("default", &self.fees.default)).chain(
                self.fees
                    .sources
                    .iter()
                    .map(|(name, fees)| (name.as_str(), fees)),
            )
        {
            anyhow::ensure!(
                fees.flat >= Decimal::ZERO
                    && fees.rate >= Decimal::ZERO
                    && fees.rate < Decimal::ONE,
                "fees for {} must be non-negative with rate below 1",
                source
            );
        }

        Ok(())
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_net_profit: default_min_net_profit(),
            staleness_secs: default_staleness_secs(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl Default for CurrencyConfig {
    fn default() -> Self {
        Self {
            key_price_ref: default_key_price_ref(),
            refresh_url: String::new(),
            api_key: String::new(),
            refresh_secs: default_refresh_secs(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}
