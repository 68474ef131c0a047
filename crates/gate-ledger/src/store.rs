//! Almacenamiento append-only de entradas de ledger.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::entry::{LedgerEntry, PeriodTotals};
use crate::error::LedgerError;

/// Las implementaciones nunca modifican ni borran entradas. `append` rechaza
/// un `(ref, idempotency_key)` ya visto.
pub trait LedgerStore: Send + Sync {
    fn append(&self, entry: LedgerEntry) -> Result<LedgerEntry, LedgerError>;
    fn list(&self, reference: &str) -> Result<Vec<LedgerEntry>, LedgerError>;
    fn balance(&self, reference: &str) -> Result<i64, LedgerError>;
    fn totals_since(&self, reference: &str, since: DateTime<Utc>) -> Result<PeriodTotals, LedgerError>;
}

fn overflow(reference: &str) -> LedgerError {
    LedgerError::Overflow { reference: reference.to_string() }
}

#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    entries: DashMap<String, Vec<LedgerEntry>>,
    keys: Mutex<HashSet<(String, String)>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn append(&self, entry: LedgerEntry) -> Result<LedgerEntry, LedgerError> {
        if let Some(key) = &entry.idempotency_key {
            let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
            if !keys.insert((entry.reference.clone(), key.clone())) {
                return Err(LedgerError::DuplicateIdempotencyKey { reference: entry.reference.clone(),
                                                                  key: key.clone() });
            }
        }
        self.entries.entry(entry.reference.clone()).or_default().push(entry.clone());
        Ok(entry)
    }

    fn list(&self, reference: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.entries.get(reference).map(|v| v.clone()).unwrap_or_default())
    }

    fn balance(&self, reference: &str) -> Result<i64, LedgerError> {
        let Some(v) = self.entries.get(reference) else {
            return Ok(0);
        };
        v.iter()
         .try_fold(0i64, |acc, e| acc.checked_add(e.delta))
         .ok_or_else(|| overflow(reference))
    }

    fn totals_since(&self, reference: &str, since: DateTime<Utc>) -> Result<PeriodTotals, LedgerError> {
        let mut totals = PeriodTotals::default();
        if let Some(v) = self.entries.get(reference) {
            for e in v.iter().filter(|e| e.timestamp >= since) {
                let next = if e.delta < 0 {
                    e.delta.checked_neg().and_then(|d| totals.usage.checked_add(d)).map(|u| (u, totals.credits))
                } else {
                    totals.credits.checked_add(e.delta).map(|c| (totals.usage, c))
                };
                let (usage, credits) = next.ok_or_else(|| overflow(reference))?;
                totals.usage = usage;
                totals.credits = credits;
            }
        }
        Ok(totals)
    }
}
