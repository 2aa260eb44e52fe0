use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use pulse_core::{AppError, AppResult};

use super::{IdempotencyLedger, LedgerEntry};

/// Process-local ledger for tests/dev.
///
/// Check-and-insert happens under one lock, which gives the same
/// first-claim-wins guarantee as a unique index.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    entries: Mutex<HashMap<(String, String), LedgerEntry>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims made by `consumer`, in no particular order.
    pub fn entries_for(&self, consumer: &str) -> Vec<LedgerEntry> {
        self.lock()
            .values()
            .filter(|e| e.consumer == consumer)
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), LedgerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryLedger {
    async fn insert(&self, entry: &LedgerEntry) -> AppResult<()> {
        let mut entries = self.lock();
        match entries.entry((entry.consumer.clone(), entry.idempotency_key.clone())) {
            Entry::Occupied(_) => Err(AppError::duplicate_event(
                &entry.consumer,
                &entry.idempotency_key,
            )),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                Ok(())
            }
        }
    }

    async fn contains(&self, consumer: &str, idempotency_key: &str) -> AppResult<bool> {
        Ok(self
            .lock()
            .contains_key(&(consumer.to_string(), idempotency_key.to_string())))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
