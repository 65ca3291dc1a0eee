//! Paper trading venue.
//!
//! Fills every order immediately at its limit price, keeps an inventory of
//! bought items and deduplicates orders by idempotency key. Failures can be
//! scripted per leg for exercising retry and compensation paths.

use super::traits::{TradingVenue, VenueError};
use super::types::*;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct PaperState {
    fills: HashMap<IdempotencyKey, LegFill>,
    /// Units held per item
    inventory: HashMap<ItemIdentity, u32>,
    /// Calls received per key, duplicates included
    calls: HashMap<IdempotencyKey, u32>,
    /// One-shot failures, consumed in order
    scripted: HashMap<Leg, VecDeque<VenueError>>,
    /// Failures returned on every call
    persistent: HashMap<Leg, VenueError>,
    /// Refined spent on buys minus refined received from sells and relists
    net_spent: Decimal,
}

/// Simulated trading venue for paper trading and tests.
#[derive(Clone)]
pub struct PaperVenue {
    state: Arc<RwLock<PaperState>>,
    order_id_counter: Arc<AtomicU64>,
    /// Artificial delay before every order
    latency: Option<Duration>,
}

impl Default for PaperVenue {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperVenue {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(PaperState::default())),
            order_id_counter: Arc::new(AtomicU64::new(1)),
            latency: None,
        }
    }

    /// Delay every order by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next call for `leg` with `error`. Repeated calls queue up.
    pub async fn fail_next(&self, leg: Leg, error: VenueError) {
        self.state
            .write()
            .await
            .scripted
            .entry(leg)
            .or_default()
            .push_back(error);
    }

    /// Fail every call for `leg`.
    pub async fn fail_always(&self, leg: Leg, error: VenueError) {
        self.state.write().await.persistent.insert(leg, error);
    }

    /// Number of calls received with `key`.
    pub async fn calls(&self, key: &IdempotencyKey) -> u32 {
        self.state.read().await.calls.get(key).copied().unwrap_or(0)
    }

    /// Number of distinct orders filled for `leg`.
    pub async fn filled(&self, leg: Leg) -> usize {
        let suffix = format!("-{leg}");
        self.state
            .read()
            .await
            .fills
            .keys()
            .filter(|k| k.as_str().ends_with(&suffix))
            .count()
    }

    pub async fn inventory(&self, item: &ItemIdentity) -> u32 {
        self.state.read().await.inventory.get(item).copied().unwrap_or(0)
    }

    /// Realized profit across all fills so far.
    pub async fn realized_profit(&self) -> Decimal {
        -self.state.read().await.net_spent
    }

    async fn execute(&self, order: &LegOrder) -> Result<LegFill, VenueError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.write().await;
        *state.calls.entry(order.key.clone()).or_default() += 1;

        if let Some(existing) = state.fills.get(&order.key) {
            debug!(key = %order.key, "Duplicate order, returning existing fill");
            return Ok(existing.clone());
        }

        let scripted = state
            .scripted
            .get_mut(&order.leg)
            .and_then(|queue| queue.pop_front());
        if let Some(err) = scripted.or_else(|| state.persistent.get(&order.leg).cloned()) {
            debug!(key = %order.key, error = %err, "Scripted paper failure");
            return Err(err);
        }

        match order.leg {
            Leg::Buy => {
                *state.inventory.entry(order.item.clone()).or_default() += 1;
                state.net_spent += order.price;
            }
            Leg::Sell | Leg::Compensate => {
                let held = state.inventory.entry(order.item.clone()).or_default();
                if *held == 0 {
                    return Err(VenueError::Rejected(format!(
                        "{} not in inventory",
                        order.item
                    )));
                }
                *held -= 1;
                state.net_spent -= order.price;
            }
        }

        let fill = LegFill {
            key: order.key.clone(),
            source: order.source.clone(),
            price: order.price,
            order_id: format!(
                "paper-{}",
                self.order_id_counter.fetch_add(1, Ordering::SeqCst)
            ),
            filled_at: Utc::now(),
        };
        state.fills.insert(order.key.clone(), fill.clone());

        info!(
            key = %order.key,
            leg = %order.leg,
            item = %order.item,
            source = %order.source,
            price = %order.price,
            order_id = %fill.order_id,
            "[PAPER] Order filled"
        );

        Ok(fill)
    }
}

#[async_trait]
impl TradingVenue for PaperVenue {
    async fn place_buy(&self, order: &LegOrder) -> Result<LegFill, VenueError> {
        self.execute(order).await
    }

    async fn place_sell(&self, order: &LegOrder) -> Result<LegFill, VenueError> {
        self.execute(order).await
    }

    async fn compensate(&self, order: &LegOrder) -> Result<LegFill, VenueError> {
        self.execute(order).await
    }

    async fn order_status(&self, key: &IdempotencyKey) -> Result<Option<LegFill>, VenueError> {
        Ok(self.state.read().await.fills.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(attempt: &str, leg: Leg) -> LegOrder {
        LegOrder {
            key: IdempotencyKey::for_leg(attempt, leg),
            leg,
            item: ItemIdentity::new(5021, 6),
            source: SourceId::new("scrap.tf"),
            price: match leg {
                Leg::Buy => dec!(58),
                _ => dec!(60),
            },
        }
    }

    #[tokio::test]
    async fn test_buy_then_sell_tracks_inventory_and_profit() {
        let venue = PaperVenue::new();
        let item = ItemIdentity::new(5021, 6);

        venue.place_buy(&order("a", Leg::Buy)).await.unwrap();
        assert_eq!(venue.inventory(&item).await, 1);

        venue.place_sell(&order("a", Leg::Sell)).await.unwrap();
        assert_eq!(venue.inventory(&item).await, 0);
        assert_eq!(venue.realized_profit().await, dec!(2));
    }

    #[tokio::test]
    async fn test_duplicate_key_executes_once() {
        let venue = PaperVenue::new();
        let buy = order("a", Leg::Buy);

        let first = venue.place_buy(&buy).await.unwrap();
        let second = venue.place_buy(&buy).await.unwrap();

        assert_eq!(first.order_id, second.order_id);
        assert_eq!(venue.calls(&buy.key).await, 2);
        assert_eq!(venue.filled(Leg::Buy).await, 1);
        assert_eq!(venue.inventory(&buy.item).await, 1);
    }

    #[tokio::test]
    async fn test_sell_without_inventory_is_rejected() {
        let venue = PaperVenue::new();
        let err = venue.place_sell(&order("a", Leg::Sell)).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let venue = PaperVenue::new();
        venue.fail_next(Leg::Buy, VenueError::Timeout).await;
        venue.fail_next(Leg::Buy, VenueError::RateLimited).await;

        let buy = order("a", Leg::Buy);
        assert_eq!(venue.place_buy(&buy).await, Err(VenueError::Timeout));
        assert_eq!(venue.place_buy(&buy).await, Err(VenueError::RateLimited));
        assert!(venue.place_buy(&buy).await.is_ok());
        assert_eq!(venue.order_status(&buy.key).await.unwrap().unwrap().price, dec!(58));
    }

    #[tokio::test]
    async fn test_order_status_unknown_key() {
        let venue = PaperVenue::new();
        let key = IdempotencyKey::for_leg("missing", Leg::Sell);
        assert_eq!(venue.order_status(&key).await, Ok(None));
    }
}
