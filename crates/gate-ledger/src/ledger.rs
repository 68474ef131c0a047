use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::Value;

use crate::entry::LedgerEntry;
use crate::error::LedgerError;
use crate::store::LedgerStore;

pub type NowFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Ledger append-only: el saldo de un ref es la suma de sus deltas.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    now: NowFn,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_clock(store, Arc::new(Utc::now))
    }

    pub fn with_clock(store: Arc<dyn LedgerStore>, now: NowFn) -> Self {
        Self { store, now }
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.now)()
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn get_balance(&self, reference: &str) -> Result<i64, LedgerError> {
        self.store.balance(reference)
    }

    pub fn entries(&self, reference: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.store.list(reference)
    }

    /// Escribe una entrada nueva. No valida cuotas, eso es de `BillingManager`;
    /// sí rechaza una entrada que deje el saldo fuera de rango.
    pub fn record(&self,
                  reference: &str,
                  delta: i64,
                  reason: &str,
                  metadata: Value,
                  idempotency_key: Option<String>)
                  -> Result<LedgerEntry, LedgerError> {
        if reference.trim().is_empty() {
            return Err(LedgerError::EmptyRef);
        }
        let balance = self.store.balance(reference)?;
        if balance.checked_add(delta).is_none() {
            warn!("ledger:overflow ref={reference} balance={balance} delta={delta}");
            return Err(LedgerError::Overflow { reference: reference.to_string() });
        }
        let entry = LedgerEntry::new(reference, delta, reason, self.now()).with_metadata(metadata)
                                                                          .with_idempotency_key(idempotency_key);
        let entry = self.store.append(entry)?;
        debug!("ledger:append ref={} delta={} reason={}", entry.reference, entry.delta, entry.reason);
        Ok(entry)
    }
}
