//! Append-only execution ledger.
//!
//! Every state transition of an execution attempt is written here before the
//! coordinator acts on it, so a restart can rebuild what was in flight:
//! - Durable append of attempt snapshots
//! - Replay in sequence order
//! - Outcome summary for the status command

mod memory;
mod sqlite;

pub use memory::MemoryLedgerStore;
pub use sqlite::SqliteLedgerStore;

use crate::strategy::{AttemptState, ExecutionAttempt};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt entry at sequence {sequence}: {reason}")]
    Corrupt { sequence: u64, reason: String },

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Immutable snapshot of an attempt at one state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Ledger-wide, strictly increasing
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub attempt: ExecutionAttempt,
}

/// Durable storage for ledger entries.
///
/// Implementations must be append-only: no entry is ever changed or removed.
/// `append` returns only after the entry is durable.
pub trait LedgerStore: Send + Sync {
    fn append(&self, entry: &LedgerEntry) -> LedgerResult<u64>;

    /// All entries in sequence order.
    fn replay(&self) -> LedgerResult<Vec<LedgerEntry>>;

    /// Verify the store can accept writes.
    fn health_check(&self) -> LedgerResult<()>;
}

/// Aggregated outcomes across all attempts in the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub attempts: usize,
    pub settled: usize,
    pub failed: usize,
    /// Failed attempts whose bought item was relisted
    pub compensated: usize,
    /// Attempts not yet terminal
    pub open: usize,
    pub realized_profit: Decimal,
    /// Failed attempts still holding bought inventory
    pub compensation_failures: Vec<ExecutionAttempt>,
}

/// Sequencing front-end over a [`LedgerStore`].
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    last_sequence: Mutex<u64>,
}

impl Ledger {
    /// Open over a store, continuing after its highest sequence.
    pub fn open(store: Arc<dyn LedgerStore>) -> LedgerResult<Self> {
        let last = store.replay()?.last().map_or(0, |e| e.sequence);
        debug!(last_sequence = last, "Ledger opened");
        Ok(Self {
            store,
            last_sequence: Mutex::new(last),
        })
    }

    /// Append a snapshot of `attempt`, returning its sequence number.
    pub fn record(&self, attempt: &ExecutionAttempt) -> LedgerResult<u64> {
        // Held across the append so sequence order matches commit order
        let mut last = self.last_sequence.lock();
        let entry = LedgerEntry {
            sequence: *last + 1,
            recorded_at: Utc::now(),
            attempt: attempt.clone(),
        };
        let sequence = self.store.append(&entry)?;
        *last = sequence;

        debug!(
            sequence,
            attempt_id = %attempt.id,
            item = %attempt.opportunity.item,
            state = %attempt.state,
            "Ledger entry appended"
        );
        Ok(sequence)
    }

    pub fn replay(&self) -> LedgerResult<Vec<LedgerEntry>> {
        self.store.replay()
    }

    pub fn health_check(&self) -> LedgerResult<()> {
        self.store.health_check()
    }

    /// Latest snapshot of every attempt, in order of first appearance.
    pub fn latest_attempts(&self) -> LedgerResult<Vec<ExecutionAttempt>> {
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, ExecutionAttempt> = HashMap::new();

        for entry in self.store.replay()? {
            let id = entry.attempt.id.clone();
            if latest.insert(id.clone(), entry.attempt).is_none() {
                order.push(id);
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|id| latest.remove(&id))
            .collect())
    }

    pub fn summary(&self) -> LedgerResult<LedgerSummary> {
        let mut summary = LedgerSummary::default();

        for attempt in self.latest_attempts()? {
            summary.attempts += 1;
            match attempt.state {
                AttemptState::Settled => {
                    summary.settled += 1;
                    summary.realized_profit += attempt.realized_profit().unwrap_or_default();
                }
                AttemptState::Failed => {
                    summary.failed += 1;
                    if attempt.compensation_fill.is_some() {
                        summary.compensated += 1;
                    } else if attempt.buy_fill.is_some() && attempt.sell_fill.is_none() {
                        summary.compensation_failures.push(attempt);
                    }
                }
                _ => summary.open += 1,
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{IdempotencyKey, Leg, LegFill};
    use crate::strategy::attempt::tests::opportunity;
    use rust_decimal_macros::dec;

    fn fill(attempt: &ExecutionAttempt, leg: Leg, price: Decimal) -> LegFill {
        LegFill {
            key: IdempotencyKey::for_leg(&attempt.id, leg),
            source: attempt.order(leg).source,
            price,
            order_id: format!("order-{leg}"),
            filled_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_assigns_increasing_sequences() {
        let ledger = Ledger::open(Arc::new(MemoryLedgerStore::new())).unwrap();
        let mut attempt = ExecutionAttempt::new(opportunity());

        assert_eq!(ledger.record(&attempt).unwrap(), 1);
        attempt.transition(AttemptState::BuyPending).unwrap();
        assert_eq!(ledger.record(&attempt).unwrap(), 2);

        let entries = ledger.replay().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].attempt.state, AttemptState::Claimed);
        assert_eq!(entries[1].attempt.state, AttemptState::BuyPending);
    }

    #[test]
    fn test_reopen_continues_sequence() {
        let store = Arc::new(MemoryLedgerStore::new());
        let attempt = ExecutionAttempt::new(opportunity());
        Ledger::open(store.clone()).unwrap().record(&attempt).unwrap();

        let reopened = Ledger::open(store).unwrap();
        assert_eq!(reopened.record(&attempt).unwrap(), 2);
    }

    #[test]
    fn test_latest_attempts_keeps_last_state() {
        let ledger = Ledger::open(Arc::new(MemoryLedgerStore::new())).unwrap();
        let mut a = ExecutionAttempt::new(opportunity());
        let b = ExecutionAttempt::new(opportunity());

        ledger.record(&a).unwrap();
        ledger.record(&b).unwrap();
        a.transition(AttemptState::Failed).unwrap();
        ledger.record(&a).unwrap();

        let latest = ledger.latest_attempts().unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].id, a.id);
        assert_eq!(latest[0].state, AttemptState::Failed);
        assert_eq!(latest[1].state, AttemptState::Claimed);
    }

    #[test]
    fn test_summary_counts_outcomes() {
        let ledger = Ledger::open(Arc::new(MemoryLedgerStore::new())).unwrap();

        let mut settled = ExecutionAttempt::new(opportunity());
        settled.buy_fill = Some(fill(&settled, Leg::Buy, dec!(100)));
        settled.sell_fill = Some(fill(&settled, Leg::Sell, dec!(130)));
        for s in [AttemptState::BuyPending, AttemptState::SellPending, AttemptState::Settled] {
            settled.transition(s).unwrap();
        }
        ledger.record(&settled).unwrap();

        let mut stranded = ExecutionAttempt::new(opportunity());
        stranded.buy_fill = Some(fill(&stranded, Leg::Buy, dec!(100)));
        for s in [
            AttemptState::BuyPending,
            AttemptState::SellPending,
            AttemptState::Compensating,
            AttemptState::Failed,
        ] {
            stranded.transition(s).unwrap();
        }
        ledger.record(&stranded).unwrap();

        ledger.record(&ExecutionAttempt::new(opportunity())).unwrap();

        let summary = ledger.summary().unwrap();
        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.settled, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.open, 1);
        assert_eq!(summary.compensated, 0);
        assert_eq!(summary.realized_profit, dec!(20));
        assert_eq!(summary.compensation_failures.len(), 1);
        assert_eq!(summary.compensation_failures[0].id, stranded.id);
    }

    #[test]
    fn test_failed_append_does_not_advance_sequence() {
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = Ledger::open(store.clone()).unwrap();
        let attempt = ExecutionAttempt::new(opportunity());

        store.fail_next_appends(1);
        assert!(ledger.record(&attempt).is_err());
        assert_eq!(ledger.record(&attempt).unwrap(), 1);
    }
}
