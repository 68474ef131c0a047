//! `JobStream` sobre Postgres: `flow_jobs` guarda los mensajes,
//! `flow_job_groups` el cursor de cada grupo y `flow_job_pending` la lista de
//! pendientes (entregados sin ack).
//!
//! Diesel es síncrono; cada operación corre en `spawn_blocking` con una
//! conexión del pool. `read_group` bloquea sondeando cada `poll_interval`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use gate_worker::{JobStream, StreamMessage, WorkerError};
use log::debug;
use serde_json::Value;
use tokio::time::Instant;

use super::{with_retry, PgPool};
use crate::error::PersistenceError;
use crate::schema::{flow_job_groups, flow_job_pending, flow_jobs};

#[derive(Insertable, Debug)]
#[diesel(table_name = flow_job_pending)]
struct NewPendingRow<'a> {
    stream: &'a str,
    group_name: &'a str,
    message_id: i64,
    consumer: &'a str,
    deliveries: i32,
    delivered_at: chrono::DateTime<Utc>,
}

#[derive(Clone)]
pub struct PgJobStream {
    pool: PgPool,
    poll_interval: Duration,
}

impl std::fmt::Debug for PgJobStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgJobStream")
         .field("poll_interval", &self.poll_interval)
         .finish_non_exhaustive()
    }
}

fn no_group(stream: &str, group: &str) -> WorkerError {
    WorkerError::Stream(format!("NOGROUP no group `{group}` on stream `{stream}`"))
}

fn parse_id(id: &str) -> Result<i64, WorkerError> {
    id.parse().map_err(|_| WorkerError::Stream(format!("invalid message id `{id}`")))
}

/// El cursor del grupo; `NotFound` si el grupo no existe.
fn group_cursor(conn: &mut PgConnection, stream: &str, group: &str, lock: bool) -> QueryResult<i64> {
    let q = flow_job_groups::table.filter(flow_job_groups::stream.eq(stream))
                                  .filter(flow_job_groups::group_name.eq(group))
                                  .select(flow_job_groups::last_delivered);
    if lock {
        q.for_update().first(conn)
    } else {
        q.first(conn)
    }
}

impl PgJobStream {
    pub fn new(pool: PgPool) -> Self {
        Self { pool,
               poll_interval: Duration::from_millis(100) }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Corre `f` fuera del runtime con una conexión del pool y reintentos.
    async fn blocking<T, F>(&self, f: F) -> Result<T, PersistenceError>
        where T: Send + 'static,
              F: Fn(&mut PgConnection) -> Result<T, PersistenceError> + Send + 'static
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            with_retry(|| {
                let mut conn = pool.get()
                                   .map_err(|e| PersistenceError::TransientIo(format!("pool error: {e}")))?;
                f(&mut conn)
            })
        }).await
          .map_err(|e| PersistenceError::Unknown(format!("blocking task: {e}")))?
    }

    async fn take_new(&self,
                      stream: &str,
                      group: &str,
                      consumer: &str,
                      count: usize)
                      -> Result<Vec<StreamMessage>, WorkerError> {
        let (s, g, c) = (stream.to_string(), group.to_string(), consumer.to_string());
        let rows = self.blocking(move |conn| {
                           conn.build_transaction()
                               .read_write()
                               .run(|tx| {
                                   let cursor = group_cursor(tx, &s, &g, true)?;
                                   let rows: Vec<(i64, Value)> =
                                       flow_jobs::table.filter(flow_jobs::stream.eq(&s))
                                                       .filter(flow_jobs::id.gt(cursor))
                                                       .order(flow_jobs::id.asc())
                                                       .limit(count as i64)
                                                       .select((flow_jobs::id, flow_jobs::payload))
                                                       .load(tx)?;
                                   if let Some((last, _)) = rows.last() {
                                       diesel::update(flow_job_groups::table.filter(flow_job_groups::stream.eq(&s))
                                                                            .filter(flow_job_groups::group_name.eq(&g)))
                                           .set(flow_job_groups::last_delivered.eq(*last))
                                           .execute(tx)?;
                                       let now = Utc::now();
                                       let pending: Vec<NewPendingRow<'_>> =
                                           rows.iter()
                                               .map(|(id, _)| NewPendingRow { stream: &s,
                                                                              group_name: &g,
                                                                              message_id: *id,
                                                                              consumer: &c,
                                                                              deliveries: 1,
                                                                              delivered_at: now })
                                               .collect();
                                       diesel::insert_into(flow_job_pending::table).values(&pending).execute(tx)?;
                                   }
                                   Ok::<_, diesel::result::Error>(rows)
                               })
                               .map_err(PersistenceError::from)
                       })
                       .await
                       .map_err(|e| match e {
                           PersistenceError::NotFound => no_group(stream, group),
                           other => other.into(),
                       })?;
        Ok(rows.into_iter()
               .map(|(id, payload)| StreamMessage { id: id.to_string(),
                                                    payload,
                                                    deliveries: 1 })
               .collect())
    }
}

#[async_trait]
impl JobStream for PgJobStream {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), WorkerError> {
        let (s, g) = (stream.to_string(), group.to_string());
        self.blocking(move |conn| {
                diesel::insert_into(flow_job_groups::table).values((flow_job_groups::stream.eq(&s),
                                                                    flow_job_groups::group_name.eq(&g),
                                                                    flow_job_groups::last_delivered.eq(0i64)))
                                                           .on_conflict_do_nothing()
                                                           .execute(conn)
                                                           .map_err(PersistenceError::from)
            })
            .await?;
        Ok(())
    }

    async fn append(&self, stream: &str, payload: Value) -> Result<String, WorkerError> {
        let s = stream.to_string();
        let id: i64 = self.blocking(move |conn| {
                              diesel::insert_into(flow_jobs::table).values((flow_jobs::stream.eq(&s),
                                                                            flow_jobs::payload.eq(&payload)))
                                                                   .returning(flow_jobs::id)
                                                                   .get_result(conn)
                                                                   .map_err(PersistenceError::from)
                          })
                          .await?;
        debug!("pg-stream:append stream={stream} id={id}");
        Ok(id.to_string())
    }

    async fn read_group(&self,
                        stream: &str,
                        group: &str,
                        consumer: &str,
                        count: usize,
                        block: Duration)
                        -> Result<Vec<StreamMessage>, WorkerError> {
        let deadline = Instant::now() + block;
        loop {
            let msgs = self.take_new(stream, group, consumer, count).await?;
            let now = Instant::now();
            if !msgs.is_empty() || now >= deadline {
                return Ok(msgs);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), WorkerError> {
        let message_id = parse_id(id)?;
        let (s, g) = (stream.to_string(), group.to_string());
        self.blocking(move |conn| {
                diesel::delete(flow_job_pending::table.filter(flow_job_pending::stream.eq(&s))
                                                      .filter(flow_job_pending::group_name.eq(&g))
                                                      .filter(flow_job_pending::message_id.eq(message_id)))
                    .execute(conn)
                    .map_err(PersistenceError::from)
            })
            .await?;
        Ok(())
    }

    async fn claim_idle(&self,
                        stream: &str,
                        group: &str,
                        consumer: &str,
                        min_idle: Duration,
                        count: usize)
                        -> Result<Vec<StreamMessage>, WorkerError> {
        let (s, g, c) = (stream.to_string(), group.to_string(), consumer.to_string());
        let min_idle = chrono::Duration::from_std(min_idle).unwrap_or_else(|_| chrono::Duration::zero());
        let claimed = self.blocking(move |conn| {
                              conn.build_transaction()
                                  .read_write()
                                  .run(|tx| {
                                      group_cursor(tx, &s, &g, false)?;
                                      let now = Utc::now();
                                      let idle: Vec<(i64, i32)> =
                                          flow_job_pending::table.filter(flow_job_pending::stream.eq(&s))
                                                                 .filter(flow_job_pending::group_name.eq(&g))
                                                                 .filter(flow_job_pending::delivered_at.le(now - min_idle))
                                                                 .order(flow_job_pending::message_id.asc())
                                                                 .limit(count as i64)
                                                                 .select((flow_job_pending::message_id,
                                                                          flow_job_pending::deliveries))
                                                                 .for_update()
                                                                 .skip_locked()
                                                                 .load(tx)?;
                                      if idle.is_empty() {
                                          return Ok::<_, diesel::result::Error>(Vec::new());
                                      }
                                      let ids: Vec<i64> = idle.iter().map(|(id, _)| *id).collect();
                                      diesel::update(flow_job_pending::table.filter(flow_job_pending::stream.eq(&s))
                                                                            .filter(flow_job_pending::group_name.eq(&g))
                                                                            .filter(flow_job_pending::message_id.eq_any(ids.clone())))
                                          .set((flow_job_pending::consumer.eq(&c),
                                                flow_job_pending::delivered_at.eq(now),
                                                flow_job_pending::deliveries.eq(flow_job_pending::deliveries + 1)))
                                          .execute(tx)?;
                                      let payloads: HashMap<i64, Value> =
                                          flow_jobs::table.filter(flow_jobs::id.eq_any(ids))
                                                          .select((flow_jobs::id, flow_jobs::payload))
                                                          .load::<(i64, Value)>(tx)?
                                                          .into_iter()
                                                          .collect();
                                      Ok(idle.into_iter()
                                             .filter_map(|(id, deliveries)| {
                                                 payloads.get(&id).map(|p| StreamMessage { id: id.to_string(),
                                                                                          payload: p.clone(),
                                                                                          deliveries:
                                                                                              (deliveries + 1) as u32 })
                                             })
                                             .collect())
                                  })
                                  .map_err(PersistenceError::from)
                          })
                          .await
                          .map_err(|e| match e {
                              PersistenceError::NotFound => no_group(stream, group),
                              other => other.into(),
                          })?;
        if !claimed.is_empty() {
            debug!("pg-stream:claim stream={stream} group={group} consumer={consumer} count={}", claimed.len());
        }
        Ok(claimed)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, WorkerError> {
        let (s, g) = (stream.to_string(), group.to_string());
        let n: i64 = self.blocking(move |conn| {
                             group_cursor(conn, &s, &g, false)?;
                             flow_job_pending::table.filter(flow_job_pending::stream.eq(&s))
                                                    .filter(flow_job_pending::group_name.eq(&g))
                                                    .count()
                                                    .get_result(conn)
                                                    .map_err(PersistenceError::from)
                         })
                         .await
                         .map_err(|e| match e {
                             PersistenceError::NotFound => no_group(stream, group),
                             other => other.into(),
                         })?;
        Ok(n as usize)
    }
}
