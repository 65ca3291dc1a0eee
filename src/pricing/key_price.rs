//! Live key-to-refined exchange rate.

use parking_lot::RwLock;
use rust_decimal::Decimal;

/// Price of one key in refined metal, shared between the feed normalizer
/// and the refresh task.
#[derive(Debug)]
pub struct KeyPrice {
    value: RwLock<Decimal>,
}

impl KeyPrice {
    pub fn new(initial: Decimal) -> Self {
        Self {
            value: RwLock::new(initial),
        }
    }

    pub fn get(&self) -> Decimal {
        *self.value.read()
    }

    /// Replace the current price and return the previous one.
    ///
    /// Non-positive prices are refused and leave the current value in place.
    pub fn set(&self, price: Decimal) -> Option<Decimal> {
        if price <= Decimal::ZERO {
            return None;
        }
        Some(std::mem::replace(&mut *self.value.write(), price))
    }
}
