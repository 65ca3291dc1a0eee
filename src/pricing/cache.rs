//! Concurrent price cache keyed by item.
//!
//! Holds the current quote per (item, source, side). Each item owns its own
//! lock, so writers for different items never contend, while updates for the
//! same item are applied one at a time. Change notifications are sent while
//! that item's lock is held, which keeps them ordered per item.

use super::latency::LatencyTracker;
use crate::market::{ItemIdentity, PriceQuote, Side, SourceId};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

/// Capacity of the all-items change channel.
const CHANGE_CHANNEL_CAPACITY: usize = 4096;

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Quote became current. `best_changed` is true if it moved the best bid or ask.
    Applied { best_changed: bool },
    /// Sequence was not newer than the highest seen for this key; dropped.
    Stale { current_sequence: u64 },
}

/// Notification that an item's best bid or ask changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceChange {
    pub item: ItemIdentity,
    /// Per-item change counter
    pub version: u64,
}

/// A quote consumed by an executed trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedQuote {
    pub source: SourceId,
    pub side: Side,
    pub sequence: u64,
}

#[derive(Debug, Default)]
struct QuoteSlot {
    /// Highest sequence ever applied; survives invalidation
    high_water: u64,
    current: Option<PriceQuote>,
}

/// Identity of a best quote, used to detect best-price changes.
type BestKey = Option<(SourceId, rust_decimal::Decimal, u64)>;

struct ItemBook {
    slots: HashMap<(SourceId, Side), QuoteSlot>,
    version: u64,
    notifier: watch::Sender<u64>,
}

impl ItemBook {
    fn new() -> Self {
        let (notifier, _) = watch::channel(0);
        Self {
            slots: HashMap::new(),
            version: 0,
            notifier,
        }
    }

    fn current(&self) -> impl Iterator<Item = &PriceQuote> {
        self.slots.values().filter_map(|slot| slot.current.as_ref())
    }

    fn best_bid(&self) -> Option<&PriceQuote> {
        self.current()
            .filter(|q| q.side == Side::Buy)
            .max_by(|a, b| a.price.cmp(&b.price).then_with(|| b.source.cmp(&a.source)))
    }

    fn best_ask(&self) -> Option<&PriceQuote> {
        self.current()
            .filter(|q| q.side == Side::Sell)
            .min_by(|a, b| a.price.cmp(&b.price).then_with(|| a.source.cmp(&b.source)))
    }

    fn best_keys(&self) -> (BestKey, BestKey) {
        let key = |q: &PriceQuote| (q.source.clone(), q.price, q.sequence);
        (self.best_bid().map(key), self.best_ask().map(key))
    }
}

/// Latest known quotes per (item, source, side).
pub struct PriceCache {
    books: DashMap<ItemIdentity, Arc<Mutex<ItemBook>>>,
    changes: broadcast::Sender<PriceChange>,
    latency: LatencyTracker,
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceCache {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            books: DashMap::new(),
            changes,
            latency: LatencyTracker::new(),
        }
    }

    fn book(&self, item: &ItemIdentity) -> Option<Arc<Mutex<ItemBook>>> {
        self.books.get(item).map(|entry| entry.value().clone())
    }

    fn get_or_create(&self, item: &ItemIdentity) -> Arc<Mutex<ItemBook>> {
        self.books
            .entry(item.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ItemBook::new())))
            .clone()
    }

    /// Apply a quote if its sequence is newer than any seen for its key.
    pub fn upsert(&self, quote: PriceQuote) -> UpsertOutcome {
        let book = self.get_or_create(&quote.item);
        let mut book = book.lock();

        let key = (quote.source.clone(), quote.side);
        let high_water = book.slots.get(&key).map(|s| s.high_water);
        if let Some(current_sequence) = high_water.filter(|hw| quote.sequence <= *hw) {
            trace!(
                item = %quote.item,
                source = %quote.source,
                sequence = quote.sequence,
                current_sequence,
                "Dropping stale quote"
            );
            return UpsertOutcome::Stale { current_sequence };
        }

        let received_latency = (Utc::now() - quote.timestamp).num_milliseconds();
        self.latency.record(&quote.source, received_latency);

        let before = book.best_keys();
        let item = quote.item.clone();
        let slot = book.slots.entry(key).or_default();
        slot.high_water = quote.sequence;
        slot.current = Some(quote);
        let best_changed = book.best_keys() != before;

        if best_changed {
            self.notify(&item, &mut book);
        }

        UpsertOutcome::Applied { best_changed }
    }

    /// Remove quotes consumed by a settled trade, unless a fresher quote already replaced them.
    pub fn invalidate(&self, item: &ItemIdentity, consumed: &[ConsumedQuote]) {
        let Some(book) = self.book(item) else {
            return;
        };
        let mut book = book.lock();
        let before = book.best_keys();

        for c in consumed {
            if let Some(slot) = book.slots.get_mut(&(c.source.clone(), c.side)) {
                if slot.current.as_ref().is_some_and(|q| q.sequence == c.sequence) {
                    slot.current = None;
                    debug!(
                        %item,
                        source = %c.source,
                        side = %c.side,
                        sequence = c.sequence,
                        "Invalidated consumed quote"
                    );
                }
            }
        }

        if book.best_keys() != before {
            self.notify(item, &mut book);
        }
    }

    fn notify(&self, item: &ItemIdentity, book: &mut ItemBook) {
        book.version += 1;
        book.notifier.send_replace(book.version);
        // No subscribers is fine
        let _ = self.changes.send(PriceChange {
            item: item.clone(),
            version: book.version,
        });
    }

    /// Highest current bid across all sources.
    pub fn best_bid(&self, item: &ItemIdentity) -> Option<PriceQuote> {
        let book = self.book(item)?;
        let best = book.lock().best_bid().cloned();
        best
    }

    /// Lowest current ask across all sources.
    pub fn best_ask(&self, item: &ItemIdentity) -> Option<PriceQuote> {
        let book = self.book(item)?;
        let best = book.lock().best_ask().cloned();
        best
    }

    /// Snapshot of all current quotes for an item.
    pub fn quotes(&self, item: &ItemIdentity) -> Vec<PriceQuote> {
        let Some(book) = self.book(item) else {
            return Vec::new();
        };
        let quotes = book.lock().current().cloned().collect();
        quotes
    }

    /// Current quote for a specific key.
    pub fn quote(&self, item: &ItemIdentity, source: &SourceId, side: Side) -> Option<PriceQuote> {
        let book = self.book(item)?;
        let quote = book
            .lock()
            .slots
            .get(&(source.clone(), side))
            .and_then(|slot| slot.current.clone());
        quote
    }

    /// Watch an item's change counter; it advances whenever the best bid or ask changes.
    pub fn subscribe(&self, item: &ItemIdentity) -> watch::Receiver<u64> {
        let book = self.get_or_create(item);
        let rx = book.lock().notifier.subscribe();
        rx
    }

    /// Receive change notifications for every item.
    pub fn subscribe_all(&self) -> broadcast::Receiver<PriceChange> {
        self.changes.subscribe()
    }

    pub fn latency(&self) -> &LatencyTracker {
        &self.latency
    }

    /// Number of items with a book.
    pub fn item_count(&self) -> usize {
        self.books.len()
    }

    /// Items that currently have a book.
    pub fn items(&self) -> Vec<ItemIdentity> {
        self.books.iter().map(|entry| entry.key().clone()).collect()
    }
}
