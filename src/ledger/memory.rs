//! In-memory ledger store with fault injection.

use super::{LedgerEntry, LedgerError, LedgerResult, LedgerStore};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Ledger store backed by a `Vec`, for tests and paper trading.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    entries: Mutex<Vec<LedgerEntry>>,
    /// Remaining appends to fail
    fail_appends: AtomicUsize,
    /// Fail once when the store holds exactly this many entries
    fail_at: Mutex<Option<usize>>,
    unhealthy: AtomicBool,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with existing entries, as if written before a restart.
    pub fn with_entries(entries: Vec<LedgerEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            ..Self::default()
        }
    }

    /// Fail the next `count` appends.
    pub fn fail_next_appends(&self, count: usize) {
        self.fail_appends.store(count, Ordering::SeqCst);
    }

    /// Fail the append that would become entry number `index` (zero-based), once.
    pub fn fail_append_at(&self, index: usize) {
        *self.fail_at.lock() = Some(index);
    }

    /// Make health checks fail until cleared.
    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl LedgerStore for MemoryLedgerStore {
    fn append(&self, entry: &LedgerEntry) -> LedgerResult<u64> {
        let injected = self
            .fail_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(LedgerError::Unavailable("injected append failure".into()));
        }

        let mut entries = self.entries.lock();
        let mut fail_at = self.fail_at.lock();
        if *fail_at == Some(entries.len()) {
            *fail_at = None;
            return Err(LedgerError::Unavailable("injected append failure".into()));
        }
        drop(fail_at);

        if let Some(last) = entries.last() {
            if entry.sequence <= last.sequence {
                return Err(LedgerError::Corrupt {
                    sequence: entry.sequence,
                    reason: format!("not after last sequence {}", last.sequence),
                });
            }
        }
        entries.push(entry.clone());
        Ok(entry.sequence)
    }

    fn replay(&self) -> LedgerResult<Vec<LedgerEntry>> {
        Ok(self.entries.lock().clone())
    }

    fn health_check(&self) -> LedgerResult<()> {
        if self.unhealthy.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("store marked unhealthy".into()));
        }
        Ok(())
    }
}
