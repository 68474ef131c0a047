//! `LedgerStore` sobre `ledger_entries`. Sólo INSERT y SELECT: las entradas
//! nunca se modifican. La unicidad de `(reference, idempotency_key)` la
//! garantiza un índice parcial.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text, Timestamptz};
use gate_ledger::{LedgerEntry, LedgerError, LedgerStore, PeriodTotals};
use log::{debug, warn};
use serde_json::Value;
use uuid::Uuid;

use super::{with_retry, ConnectionProvider};
use crate::error::PersistenceError;
use crate::schema::ledger_entries;

#[derive(Insertable, Queryable, Debug)]
#[diesel(table_name = ledger_entries)]
struct LedgerRow {
    id: Uuid,
    ts: DateTime<Utc>,
    reference: String,
    delta: i64,
    reason: String,
    metadata: Value,
    idempotency_key: Option<String>,
}

impl From<&LedgerEntry> for LedgerRow {
    fn from(e: &LedgerEntry) -> Self {
        Self { id: e.id,
               ts: e.timestamp,
               reference: e.reference.clone(),
               delta: e.delta,
               reason: e.reason.clone(),
               metadata: e.metadata.clone(),
               idempotency_key: e.idempotency_key.clone() }
    }
}

impl From<LedgerRow> for LedgerEntry {
    fn from(r: LedgerRow) -> Self {
        Self { id: r.id,
               timestamp: r.ts,
               reference: r.reference,
               delta: r.delta,
               reason: r.reason,
               metadata: r.metadata,
               idempotency_key: r.idempotency_key }
    }
}

#[derive(QueryableByName, Debug)]
struct BalanceRow {
    #[diesel(sql_type = BigInt)]
    balance: i64,
}

#[derive(QueryableByName, Debug)]
struct TotalsRow {
    #[diesel(sql_type = BigInt)]
    usage: i64,
    #[diesel(sql_type = BigInt)]
    credits: i64,
}

/// Las sumas se hacen en NUMERIC; el cast a BIGINT falla si no caben.
fn with_overflow<T>(reference: &str, res: Result<T, PersistenceError>) -> Result<T, LedgerError> {
    match res {
        Err(PersistenceError::OutOfRange(msg)) => {
            warn!("ledger:overflow ref={reference} ({msg})");
            Err(LedgerError::Overflow { reference: reference.to_string() })
        }
        other => Ok(other?),
    }
}

pub struct PgLedgerStore<P: ConnectionProvider> {
    provider: P,
}

impl<P: ConnectionProvider> PgLedgerStore<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

impl<P: ConnectionProvider> LedgerStore for PgLedgerStore<P> {
    fn append(&self, entry: LedgerEntry) -> Result<LedgerEntry, LedgerError> {
        let row = LedgerRow::from(&entry);
        let res = with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::insert_into(ledger_entries::table).values(&row)
                                                      .execute(&mut conn)
                                                      .map_err(PersistenceError::from)
        });
        match res {
            Ok(_) => {
                debug!("ledger:append ref={} delta={} id={}", entry.reference, entry.delta, entry.id);
                Ok(entry)
            }
            Err(PersistenceError::UniqueViolation(msg)) => {
                warn!("ledger:duplicate ref={} key={:?} ({msg})", entry.reference, entry.idempotency_key);
                Err(LedgerError::DuplicateIdempotencyKey { reference: entry.reference.clone(),
                                                           key: entry.idempotency_key.clone().unwrap_or_default() })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, reference: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows: Vec<LedgerRow> = with_retry(|| {
            let mut conn = self.provider.connection()?;
            ledger_entries::table.filter(ledger_entries::reference.eq(reference))
                                 .order((ledger_entries::ts.asc(), ledger_entries::id.asc()))
                                 .load(&mut conn)
                                 .map_err(PersistenceError::from)
        })?;
        Ok(rows.into_iter().map(LedgerEntry::from).collect())
    }

    fn balance(&self, reference: &str) -> Result<i64, LedgerError> {
        let row: BalanceRow = with_overflow(reference, with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::sql_query("SELECT COALESCE(SUM(delta), 0)::BIGINT AS balance FROM ledger_entries WHERE reference = $1")
                .bind::<Text, _>(reference)
                .get_result(&mut conn)
                .map_err(PersistenceError::from)
        }))?;
        Ok(row.balance)
    }

    fn totals_since(&self, reference: &str, since: DateTime<Utc>) -> Result<PeriodTotals, LedgerError> {
        let row: TotalsRow = with_overflow(reference, with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::sql_query("SELECT COALESCE(SUM(-delta) FILTER (WHERE delta < 0), 0)::BIGINT AS usage, \
                                      COALESCE(SUM(delta) FILTER (WHERE delta > 0), 0)::BIGINT AS credits \
                               FROM ledger_entries WHERE reference = $1 AND ts >= $2")
                .bind::<Text, _>(reference)
                .bind::<Timestamptz, _>(since)
                .get_result(&mut conn)
                .map_err(PersistenceError::from)
        }))?;
        Ok(PeriodTotals { usage: row.usage,
                          credits: row.credits })
    }
}
