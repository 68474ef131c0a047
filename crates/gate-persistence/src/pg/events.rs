//! `EventStore` sobre la tabla `run_events`.
//!
//! `seq` es denso por run (0, 1, 2, ...) igual que el backend en memoria, así
//! que el replay no distingue backends. Dos appends concurrentes al mismo run
//! chocan en la PK `(run_id, seq)`; el perdedor se reintenta.

use chrono::{DateTime, Utc};
use diesel::dsl::max;
use diesel::prelude::*;
use gate_core::{EventLevel, EventStore, FlowEngineError, RunEvent, RunEventKind};
use log::{debug, error};
use serde_json::Value;
use uuid::Uuid;

use super::{with_retry, ConnectionProvider};
use crate::error::PersistenceError;
use crate::schema::run_events;

#[derive(Insertable, Debug)]
#[diesel(table_name = run_events)]
struct NewEventRow<'a> {
    run_id: Uuid,
    seq: i64,
    level: &'a str,
    kind_name: &'a str,
    kind: &'a Value,
}

#[derive(Queryable, Debug)]
struct EventRow {
    run_id: Uuid,
    seq: i64,
    level: String,
    _kind_name: String,
    kind: Value,
    ts: DateTime<Utc>,
}

impl TryFrom<EventRow> for RunEvent {
    type Error = PersistenceError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let level = EventLevel::parse(&row.level).ok_or_else(|| {
                                                      PersistenceError::Corrupt(format!("level `{}`", row.level))
                                                  })?;
        let kind: RunEventKind = serde_json::from_value(row.kind).map_err(|e| {
                                                                     PersistenceError::Corrupt(format!("run_id={} seq={} {e}",
                                                                                                       row.run_id, row.seq))
                                                                 })?;
        Ok(RunEvent { seq: row.seq as u64,
                      run_id: row.run_id,
                      level,
                      kind,
                      ts: row.ts })
    }
}

pub struct PgEventStore<P: ConnectionProvider> {
    provider: P,
}

impl<P: ConnectionProvider> PgEventStore<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

impl<P: ConnectionProvider> EventStore for PgEventStore<P> {
    fn append_with_level(&self,
                         run_id: Uuid,
                         level: EventLevel,
                         kind: RunEventKind)
                         -> Result<RunEvent, FlowEngineError> {
        let payload =
            serde_json::to_value(&kind).map_err(|e| FlowEngineError::Internal(format!("serialize event: {e}")))?;
        let kind_name = kind.name();
        debug!("append:start run_id={run_id} kind={kind_name}");
        let (seq, ts): (i64, DateTime<Utc>) = with_retry(|| {
            let mut conn = self.provider.connection()?;
            conn.build_transaction()
                .read_write()
                .run(|tx| {
                    let last: Option<i64> = run_events::table.filter(run_events::run_id.eq(run_id))
                                                             .select(max(run_events::seq))
                                                             .first(tx)?;
                    let row = NewEventRow { run_id,
                                            seq: last.map_or(0, |s| s + 1),
                                            level: level.as_str(),
                                            kind_name,
                                            kind: &payload };
                    diesel::insert_into(run_events::table).values(&row)
                                                          .returning((run_events::seq, run_events::ts))
                                                          .get_result(tx)
                })
                .map_err(|e| match PersistenceError::from(e) {
                    // otro writer tomó el mismo seq
                    PersistenceError::UniqueViolation(_) => PersistenceError::SerializationConflict,
                    other => other,
                })
        }).map_err(|e| {
              error!("append:error run_id={run_id} kind={kind_name} err={e}");
              e
          })?;
        debug!("append:done run_id={run_id} seq={seq}");
        Ok(RunEvent { seq: seq as u64,
                      run_id,
                      level,
                      kind,
                      ts })
    }

    fn list(&self, run_id: Uuid) -> Result<Vec<RunEvent>, FlowEngineError> {
        let rows: Vec<EventRow> = with_retry(|| {
            let mut conn = self.provider.connection()?;
            run_events::table.filter(run_events::run_id.eq(run_id))
                             .order(run_events::seq.asc())
                             .load(&mut conn)
                             .map_err(PersistenceError::from)
        })?;
        let events = rows.into_iter()
                         .map(RunEvent::try_from)
                         .collect::<Result<Vec<_>, _>>()?;
        debug!("list:done run_id={run_id} count={}", events.len());
        Ok(events)
    }
}
