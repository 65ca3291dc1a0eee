//! Opportunity detector for cross-source price windows.

use super::fees::FeeSchedule;
use crate::config::DetectionConfig;
use crate::market::{ItemIdentity, Opportunity, PriceQuote, Side};
use crate::pricing::PriceCache;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

/// A buy/sell quote pair that clears the profit threshold.
struct Candidate<'a> {
    ask: &'a PriceQuote,
    bid: &'a PriceQuote,
    fees: Decimal,
    net_profit: Decimal,
    /// Combined smoothed latency of both sources, when tracked
    latency_ms: Option<f64>,
}

impl Candidate<'_> {
    /// Ordering where `Greater` is the preferred candidate.
    fn rank(&self, other: &Self) -> Ordering {
        self.net_profit
            .cmp(&other.net_profit)
            .then_with(|| {
                let mine = self.latency_ms.unwrap_or(f64::INFINITY);
                let theirs = other.latency_ms.unwrap_or(f64::INFINITY);
                theirs.partial_cmp(&mine).unwrap_or(Ordering::Equal)
            })
            .then_with(|| other.ask.source.cmp(&self.ask.source))
            .then_with(|| other.bid.source.cmp(&self.bid.source))
    }
}

/// Evaluates cached quotes for buy-low / sell-high windows between sources.
///
/// Read-only over the cache; produces candidates and nothing else.
pub struct OpportunityDetector {
    cache: Arc<PriceCache>,
    fees: FeeSchedule,
    config: DetectionConfig,
}

impl OpportunityDetector {
    pub fn new(cache: Arc<PriceCache>, fees: FeeSchedule, config: DetectionConfig) -> Self {
        Self {
            cache,
            fees,
            config,
        }
    }

    /// Evaluate an item against the current time.
    pub fn evaluate(&self, item: &ItemIdentity) -> Option<Opportunity> {
        self.evaluate_at(item, Utc::now())
    }

    /// Evaluate an item as of `now`.
    ///
    /// Buys at the ask of one source and sells into the bid of another.
    /// Net profit is `sell - buy - fees` and must exceed the configured
    /// minimum. Quotes older than the staleness window are treated as absent.
    pub fn evaluate_at(&self, item: &ItemIdentity, now: DateTime<Utc>) -> Option<Opportunity> {
        let quotes = self.cache.quotes(item);
        let staleness = self.config.staleness();

        let (fresh, stale): (Vec<&PriceQuote>, Vec<&PriceQuote>) =
            quotes.iter().partition(|q| q.age(now) <= staleness);
        if !stale.is_empty() {
            trace!(%item, stale = stale.len(), "Ignoring stale quotes");
        }

        let asks = fresh.iter().filter(|q| q.side == Side::Sell);
        let mut best: Option<Candidate<'_>> = None;
        let mut below_threshold = 0usize;

        for ask in asks {
            for bid in fresh.iter().filter(|q| q.side == Side::Buy) {
                if ask.source == bid.source {
                    continue;
                }

                let fees = self.fees.fees(&ask.source, &bid.source, ask.price, bid.price);
                let net_profit = bid.price - ask.price - fees;
                if net_profit <= self.config.min_net_profit {
                    below_threshold += 1;
                    continue;
                }

                let candidate = Candidate {
                    ask,
                    bid,
                    fees,
                    net_profit,
                    latency_ms: self.cache.latency().combined_ms(&ask.source, &bid.source),
                };

                let replace = best
                    .as_ref()
                    .map_or(true, |current| candidate.rank(current) == Ordering::Greater);
                if replace {
                    best = Some(candidate);
                }
            }
        }

        let Some(best) = best else {
            trace!(%item, below_threshold, "No opportunity");
            return None;
        };

        let opportunity = Opportunity {
            item: item.clone(),
            buy_source: best.ask.source.clone(),
            sell_source: best.bid.source.clone(),
            buy_price: best.ask.price,
            sell_price: best.bid.price,
            fees: best.fees,
            estimated_net_profit: best.net_profit,
            detected_at: now,
            buy_quote_sequence: best.ask.sequence,
            sell_quote_sequence: best.bid.sequence,
        };

        debug!(
            %item,
            buy_source = %opportunity.buy_source,
            sell_source = %opportunity.sell_source,
            buy_price = %opportunity.buy_price,
            sell_price = %opportunity.sell_price,
            net_profit = %opportunity.estimated_net_profit,
            "Opportunity detected"
        );

        Some(opportunity)
    }
}
