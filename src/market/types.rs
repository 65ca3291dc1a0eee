//! Shared domain types for quotes, opportunities, and trade legs.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use super::sku::ItemIdentity;

/// Marketplace identifier (e.g. "backpack.tf").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Side of a standing order on a marketplace.
///
/// `Buy` is a bid: the source will buy the item from us at that price.
/// `Sell` is an ask: we can buy the item from the source at that price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" | "bid" => Ok(Side::Buy),
            "sell" | "ask" => Ok(Side::Sell),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// Canonical price quote produced by the feed normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub item: ItemIdentity,
    pub source: SourceId,
    pub side: Side,
    /// Price in refined metal
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    /// Per-source, monotonically increasing
    pub sequence: u64,
}

impl PriceQuote {
    /// Age of the quote relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }
}

/// Item reference as delivered by a feed, before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawItemRef {
    /// A SKU string such as `5021;6`
    Sku(String),
    /// An item name plus quality, resolved through the alias table
    Named {
        name: String,
        #[serde(default)]
        quality: Option<u8>,
        #[serde(default)]
        craftable: Option<bool>,
        #[serde(default)]
        killstreak: Option<u8>,
        #[serde(default)]
        effect: Option<u32>,
    },
}

impl fmt::Display for RawItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawItemRef::Sku(sku) => f.write_str(sku),
            RawItemRef::Named { name, quality, .. } => match quality {
                Some(q) => write!(f, "{name} (quality {q})"),
                None => f.write_str(name),
            },
        }
    }
}

/// Price as delivered by a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawPrice {
    /// Plain value in refined metal
    Metal(Decimal),
    /// backpack.tf-style currencies object
    Currencies {
        #[serde(default)]
        keys: Decimal,
        #[serde(default)]
        metal: Decimal,
    },
}

/// Raw price update as received from a marketplace feed.
///
/// Every field is optional at the wire level; the normalizer rejects
/// updates that are missing any of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPriceUpdate {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub item: Option<RawItemRef>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub price: Option<RawPrice>,
    /// Unix epoch milliseconds
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub sequence: Option<u64>,
}

/// A detected cross-source arbitrage window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opportunity {
    pub item: ItemIdentity,
    pub buy_source: SourceId,
    pub sell_source: SourceId,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub fees: Decimal,
    pub estimated_net_profit: Decimal,
    pub detected_at: DateTime<Utc>,
    /// Sequence of the ask quote consumed by the buy leg
    pub buy_quote_sequence: u64,
    /// Sequence of the bid quote consumed by the sell leg
    pub sell_quote_sequence: u64,
}

/// Which leg of a two-leg trade an order belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Leg {
    Buy,
    Sell,
    Compensate,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Buy => write!(f, "buy"),
            Leg::Sell => write!(f, "sell"),
            Leg::Compensate => write!(f, "compensate"),
        }
    }
}

/// Idempotency token attached to every order so retries never double-execute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derive the key for one leg of an attempt.
    pub fn for_leg(attempt_id: &str, leg: Leg) -> Self {
        Self(format!("{attempt_id}-{leg}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Order for a single leg, sent to a trading venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegOrder {
    pub key: IdempotencyKey,
    pub leg: Leg,
    pub item: ItemIdentity,
    pub source: SourceId,
    /// Limit price in refined metal
    pub price: Decimal,
}

/// Confirmed execution of a leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegFill {
    pub key: IdempotencyKey,
    pub source: SourceId,
    pub price: Decimal,
    pub order_id: String,
    pub filled_at: DateTime<Utc>,
}
