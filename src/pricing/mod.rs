//! Price ingestion and caching.
//!
//! - Normalizing raw feed updates into canonical quotes
//! - Holding the current quote per (item, source, side)
//! - Tracking per-source delivery latency
//! - Holding the live key price used for currency conversion

mod cache;
mod key_price;
mod latency;
mod normalizer;

pub use cache::{ConsumedQuote, PriceCache, PriceChange, UpsertOutcome};
pub use key_price::KeyPrice;
pub use latency::LatencyTracker;
pub use normalizer::{FeedNormalizer, QuoteError};
