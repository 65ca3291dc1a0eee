//! Feed normalization: raw marketplace updates into canonical quotes.

use crate::market::{
    ItemResolver, PriceQuote, RawPrice, RawPriceUpdate, ResolveError, Side, SourceId,
};
use super::key_price::KeyPrice;
use crate::utils::to_refined;
use chrono::DateTime;
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Reasons a raw update cannot become a quote. Both are dropped, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuoteError {
    #[error("malformed quote: {0}")]
    MalformedQuote(String),
    #[error("unresolved item {item}: {reason}")]
    UnresolvedItem { item: String, reason: ResolveError },
}

/// Converts raw feed updates into `PriceQuote`s.
pub struct FeedNormalizer {
    resolver: Arc<dyn ItemResolver>,
    key_price: Arc<KeyPrice>,
}

impl FeedNormalizer {
    /// Create a normalizer that converts key-denominated prices at the
    /// current value of `key_price`.
    pub fn new(resolver: Arc<dyn ItemResolver>, key_price: Arc<KeyPrice>) -> Self {
        Self {
            resolver,
            key_price,
        }
    }

    /// Validate and canonicalize a raw update.
    pub fn normalize(&self, raw: &RawPriceUpdate) -> Result<PriceQuote, QuoteError> {
        let source = raw
            .source
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| missing("source"))?;
        let item_ref = raw.item.as_ref().ok_or_else(|| missing("item"))?;
        let side: Side = raw
            .side
            .as_deref()
            .ok_or_else(|| missing("side"))?
            .parse()
            .map_err(QuoteError::MalformedQuote)?;
        let raw_price = raw.price.as_ref().ok_or_else(|| missing("price"))?;
        let timestamp_ms = raw.timestamp.ok_or_else(|| missing("timestamp"))?;
        let sequence = raw.sequence.ok_or_else(|| missing("sequence"))?;

        let price = match raw_price {
            RawPrice::Metal(value) => *value,
            RawPrice::Currencies { keys, metal } => to_refined(*keys, *metal, self.key_price.get()),
        };
        if price <= Decimal::ZERO {
            return Err(QuoteError::MalformedQuote(format!(
                "non-positive price {price}"
            )));
        }

        let timestamp = DateTime::from_timestamp_millis(timestamp_ms).ok_or_else(|| {
            QuoteError::MalformedQuote(format!("timestamp out of range: {timestamp_ms}"))
        })?;

        let item = self
            .resolver
            .resolve(item_ref)
            .map_err(|reason| QuoteError::UnresolvedItem {
                item: item_ref.to_string(),
                reason,
            })?;

        trace!(%item, source, %side, %price, sequence, "Normalized quote");

        Ok(PriceQuote {
            item,
            source: SourceId::new(source),
            side,
            price,
            timestamp,
            sequence,
        })
    }
}

fn missing(field: &str) -> QuoteError {
    QuoteError::MalformedQuote(format!("missing {field}"))
}
