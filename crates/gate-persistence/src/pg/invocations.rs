//! `InvocationStore` sobre la tabla `invocations`.
//!
//! `claim` es un único `UPDATE ... WHERE status = 'queued' RETURNING *`, así
//! que entre réplicas sólo una entrega pasa la invocación a `running`.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use gate_adapters::{AdapterError, Invocation, InvocationStatus, InvocationStore};
use log::debug;
use serde_json::Value;
use uuid::Uuid;

use super::{with_retry, ConnectionProvider};
use crate::error::PersistenceError;
use crate::schema::invocations;

#[derive(Insertable, Queryable, Debug)]
#[diesel(table_name = invocations)]
struct InvocationRow {
    id: Uuid,
    post_id: String,
    agent_id: String,
    status: String,
    cost: i64,
    trace_id: String,
    reference: String,
    text: String,
    panel: String,
    result: Option<Value>,
    degraded: bool,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<&Invocation> for InvocationRow {
    fn from(i: &Invocation) -> Self {
        Self { id: i.id,
               post_id: i.post_id.clone(),
               agent_id: i.agent_id.clone(),
               status: i.status.as_str().to_string(),
               cost: i.cost,
               trace_id: i.trace_id.clone(),
               reference: i.reference.clone(),
               text: i.text.clone(),
               panel: i.panel.clone(),
               result: i.result.clone(),
               degraded: i.degraded,
               error: i.error.clone(),
               created_at: i.created_at,
               updated_at: i.updated_at }
    }
}

impl TryFrom<InvocationRow> for Invocation {
    type Error = PersistenceError;

    fn try_from(r: InvocationRow) -> Result<Self, Self::Error> {
        let status = InvocationStatus::parse(&r.status).ok_or_else(|| {
                                                           PersistenceError::Corrupt(format!("invocation={} status={}",
                                                                                             r.id, r.status))
                                                       })?;
        Ok(Invocation { id: r.id,
                        post_id: r.post_id,
                        agent_id: r.agent_id,
                        status,
                        cost: r.cost,
                        trace_id: r.trace_id,
                        reference: r.reference,
                        text: r.text,
                        panel: r.panel,
                        result: r.result,
                        degraded: r.degraded,
                        error: r.error,
                        created_at: r.created_at,
                        updated_at: r.updated_at })
    }
}

pub struct PgInvocationStore<P: ConnectionProvider> {
    provider: P,
}

impl<P: ConnectionProvider> std::fmt::Debug for PgInvocationStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgInvocationStore").finish_non_exhaustive()
    }
}

impl<P: ConnectionProvider> PgInvocationStore<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

impl<P: ConnectionProvider> InvocationStore for PgInvocationStore<P> {
    fn insert(&self, invocation: &Invocation) -> Result<(), AdapterError> {
        let row = InvocationRow::from(invocation);
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::insert_into(invocations::table).values(&row)
                                                   .execute(&mut conn)
                                                   .map_err(PersistenceError::from)
        })?;
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<Invocation>, AdapterError> {
        let row: Option<InvocationRow> = with_retry(|| {
            let mut conn = self.provider.connection()?;
            invocations::table.find(id)
                              .first(&mut conn)
                              .optional()
                              .map_err(PersistenceError::from)
        })?;
        Ok(row.map(Invocation::try_from).transpose()?)
    }

    fn list_by_post(&self, post_id: &str) -> Result<Vec<Invocation>, AdapterError> {
        let rows: Vec<InvocationRow> = with_retry(|| {
            let mut conn = self.provider.connection()?;
            invocations::table.filter(invocations::post_id.eq(post_id))
                              .order((invocations::created_at.asc(), invocations::id.asc()))
                              .load(&mut conn)
                              .map_err(PersistenceError::from)
        })?;
        Ok(rows.into_iter().map(Invocation::try_from).collect::<Result<Vec<_>, _>>()?)
    }

    fn claim(&self, id: Uuid) -> Result<Option<Invocation>, AdapterError> {
        let now = Utc::now();
        let row: Option<InvocationRow> = with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::update(invocations::table.filter(invocations::id.eq(id))
                                             .filter(invocations::status.eq(InvocationStatus::Queued.as_str())))
                .set((invocations::status.eq(InvocationStatus::Running.as_str()), invocations::updated_at.eq(now)))
                .get_result(&mut conn)
                .optional()
                .map_err(PersistenceError::from)
        })?;
        if row.is_none() {
            debug!("invocation:claim id={id} lost");
        }
        Ok(row.map(Invocation::try_from).transpose()?)
    }

    fn save(&self, invocation: &Invocation) -> Result<(), AdapterError> {
        let touched = with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::update(invocations::table.find(invocation.id))
                .set((invocations::status.eq(invocation.status.as_str()),
                      invocations::result.eq(&invocation.result),
                      invocations::degraded.eq(invocation.degraded),
                      invocations::error.eq(&invocation.error),
                      invocations::updated_at.eq(invocation.updated_at)))
                .execute(&mut conn)
                .map_err(PersistenceError::from)
        })?;
        if touched == 0 {
            return Err(AdapterError::Store(format!("invocation {} not found", invocation.id)));
        }
        Ok(())
    }
}
