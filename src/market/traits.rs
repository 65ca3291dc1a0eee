//! Collaborator interfaces the engine depends on.
//!
//! The core never talks to a marketplace or item schema directly:
//! - `ItemResolver` maps feed item references to canonical identities
//! - `TradingVenue` places idempotent buy, sell, and compensation orders

use super::types::{IdempotencyKey, ItemIdentity, LegFill, LegOrder, RawItemRef};
use async_trait::async_trait;
use thiserror::Error;

/// Failure to map a raw item reference to an `ItemIdentity`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("invalid SKU {sku}: {reason}")]
    InvalidSku { sku: String, reason: String },
    #[error("unknown item name: {0}")]
    UnknownName(String),
}

/// Errors returned by a trading venue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VenueError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("order rejected: {0}")]
    Rejected(String),
}

impl VenueError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VenueError::Timeout | VenueError::RateLimited | VenueError::Transport(_)
        )
    }
}

/// Resolves feed item references to canonical identities.
#[cfg_attr(test, mockall::automock)]
pub trait ItemResolver: Send + Sync {
    fn resolve(&self, raw: &RawItemRef) -> Result<ItemIdentity, ResolveError>;
}

/// Marketplace trading collaborator.
///
/// Every order carries an idempotency key supplied by the coordinator. A
/// venue must treat a repeated key as the same order and return the original
/// fill instead of executing twice.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradingVenue: Send + Sync {
    /// Buy the item from the order's source at or below the limit price.
    async fn place_buy(&self, order: &LegOrder) -> Result<LegFill, VenueError>;

    /// Sell the held item into the order's source at or above the limit price.
    async fn place_sell(&self, order: &LegOrder) -> Result<LegFill, VenueError>;

    /// Undo an unmatched buy (relist or revert the held item).
    async fn compensate(&self, order: &LegOrder) -> Result<LegFill, VenueError>;

    /// Look up a previously submitted order by idempotency key.
    async fn order_status(&self, key: &IdempotencyKey) -> Result<Option<LegFill>, VenueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(VenueError::Timeout.is_transient());
        assert!(VenueError::RateLimited.is_transient());
        assert!(VenueError::Transport("reset".into()).is_transient());
        assert!(!VenueError::Rejected("insufficient funds".into()).is_transient());
    }
}
