//! Stream en memoria con grupos de consumidores, para tests y despliegues de
//! un solo proceso.
//!
//! Un mensaje que todos los grupos ya recibieron y confirmaron se descarta.
//! Un stream sin grupos (p. ej. el de dead letters) lo conserva todo.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::WorkerError;
use crate::stream::{JobStream, StreamMessage};

#[derive(Debug)]
struct Pending {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Último seq entregado al grupo.
    last_delivered: u64,
    pending: BTreeMap<u64, Pending>,
}

impl GroupState {
    /// Mayor seq que el grupo ya no puede volver a pedir.
    fn settled_up_to(&self) -> u64 {
        match self.pending.keys().next() {
            Some(first) => first.saturating_sub(1).min(self.last_delivered),
            None => self.last_delivered,
        }
    }
}

#[derive(Debug, Default)]
struct StreamState {
    /// Ordenado por seq.
    entries: Vec<(u64, Value)>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn trim(&mut self) -> usize {
        let Some(floor) = self.groups.values().map(GroupState::settled_up_to).min() else {
            return 0;
        };
        let cut = self.entries.partition_point(|(seq, _)| *seq <= floor);
        self.entries.drain(..cut);
        cut
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStream {
    streams: Mutex<HashMap<String, StreamState>>,
    notify: Notify,
}

fn format_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_id(id: &str) -> Result<u64, WorkerError> {
    id.split('-')
      .next()
      .and_then(|s| s.parse().ok())
      .ok_or_else(|| WorkerError::Stream(format!("invalid message id `{id}`")))
}

fn no_group(stream: &str, group: &str) -> WorkerError {
    WorkerError::Stream(format!("NOGROUP no group `{group}` on stream `{stream}`"))
}

impl InMemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamState>> {
        self.streams.lock().unwrap_or_else(|e| {
                               warn!("stream: lock poisoned, recovering");
                               e.into_inner()
                           })
    }

    /// Mensajes retenidos: los que algún grupo todavía no recibió o no
    /// confirmó.
    pub fn len(&self, stream: &str) -> usize {
        self.lock().get(stream).map_or(0, |s| s.entries.len())
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    fn take_new(&self, stream: &str, group: &str, consumer: &str, count: usize) -> Result<Vec<StreamMessage>, WorkerError> {
        let mut streams = self.lock();
        let state = streams.get_mut(stream).ok_or_else(|| no_group(stream, group))?;
        let StreamState { entries, groups, .. } = state;
        let g = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
        let now = Instant::now();
        let mut out = Vec::new();
        let start = entries.partition_point(|(seq, _)| *seq <= g.last_delivered);
        for (seq, payload) in entries[start..].iter().take(count) {
            g.last_delivered = *seq;
            g.pending.insert(*seq,
                             Pending { consumer: consumer.to_string(),
                                       delivered_at: now,
                                       deliveries: 1 });
            out.push(StreamMessage { id: format_id(*seq),
                                     payload: payload.clone(),
                                     deliveries: 1 });
        }
        Ok(out)
    }
}

#[async_trait]
impl JobStream for InMemoryStream {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), WorkerError> {
        let mut streams = self.lock();
        streams.entry(stream.to_string())
               .or_default()
               .groups
               .entry(group.to_string())
               .or_default();
        Ok(())
    }

    async fn append(&self, stream: &str, payload: Value) -> Result<String, WorkerError> {
        let id = {
            let mut streams = self.lock();
            let state = streams.entry(stream.to_string()).or_default();
            state.next_seq += 1;
            let seq = state.next_seq;
            state.entries.push((seq, payload));
            format_id(seq)
        };
        self.notify.notify_waiters();
        debug!("stream:append stream={stream} id={id}");
        Ok(id)
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
            // registrado antes de mirar, para no perder un append intermedio
            let notified = self.notify.notified();
            let msgs = self.take_new(stream, group, consumer, count)?;
            let now = Instant::now();
            if !msgs.is_empty() || now >= deadline {
                return Ok(msgs);
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return self.take_new(stream, group, consumer, count);
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), WorkerError> {
        let seq = parse_id(id)?;
        let mut streams = self.lock();
        let state = streams.get_mut(stream).ok_or_else(|| no_group(stream, group))?;
        let g = state.groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
        if g.pending.remove(&seq).is_some() {
            let trimmed = state.trim();
            if trimmed > 0 {
                debug!("stream:trim stream={stream} trimmed={trimmed} retained={}", state.entries.len());
            }
        }
        Ok(())
    }

    async fn claim_idle(&self,
                        stream: &str,
                        group: &str,
                        consumer: &str,
                        min_idle: Duration,
                        count: usize)
                        -> Result<Vec<StreamMessage>, WorkerError> {
        let mut streams = self.lock();
        let state = streams.get_mut(stream).ok_or_else(|| no_group(stream, group))?;
        let StreamState { entries, groups, .. } = state;
        let g = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;
        let now = Instant::now();
        let mut out = Vec::new();
        for (seq, p) in g.pending.iter_mut() {
            if out.len() >= count {
                break;
            }
            if now.saturating_duration_since(p.delivered_at) < min_idle {
                continue;
            }
            let Some((_, payload)) = entries.iter().find(|(s, _)| s == seq) else {
                continue;
            };
            p.consumer = consumer.to_string();
            p.delivered_at = now;
            p.deliveries += 1;
            out.push(StreamMessage { id: format_id(*seq),
                                     payload: payload.clone(),
                                     deliveries: p.deliveries });
        }
        Ok(out)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, WorkerError> {
        let streams = self.lock();
        streams.get(stream)
               .and_then(|s| s.groups.get(group))
               .map(|g| g.pending.len())
               .ok_or_else(|| no_group(stream, group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn each_message_goes_to_one_consumer() {
        let s = InMemoryStream::new();
        s.ensure_group("jobs", "g").await.unwrap();
        s.append("jobs", json!(1)).await.unwrap();
        s.append("jobs", json!(2)).await.unwrap();
        let a = s.read_group("jobs", "g", "a", 1, Duration::ZERO).await.unwrap();
        let b = s.read_group("jobs", "g", "b", 10, Duration::ZERO).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_ne!(a[0].id, b[0].id);
        assert_eq!(s.pending_count("jobs", "g").await.unwrap(), 2);
        s.ack("jobs", "g", &a[0].id).await.unwrap();
        assert_eq!(s.pending_count("jobs", "g").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn acked_messages_are_trimmed_once_every_group_is_done() {
        let s = InMemoryStream::new();
        s.ensure_group("jobs", "a").await.unwrap();
        s.ensure_group("jobs", "b").await.unwrap();
        for i in 0..3 {
            s.append("jobs", json!(i)).await.unwrap();
        }
        let a = s.read_group("jobs", "a", "c1", 10, Duration::ZERO).await.unwrap();
        for m in &a {
            s.ack("jobs", "a", &m.id).await.unwrap();
        }
        // el grupo b todavía no los recibió
        assert_eq!(s.len("jobs"), 3);

        let b = s.read_group("jobs", "b", "c2", 10, Duration::ZERO).await.unwrap();
        s.ack("jobs", "b", &b[1].id).await.unwrap();
        assert_eq!(s.len("jobs"), 3);
        s.ack("jobs", "b", &b[0].id).await.unwrap();
        assert_eq!(s.len("jobs"), 1);
        s.ack("jobs", "b", &b[2].id).await.unwrap();
        assert!(s.is_empty("jobs"));

        // los seq siguen creciendo tras el recorte
        let id = s.append("jobs", json!(3)).await.unwrap();
        assert_eq!(id, "4-0");
        let next = s.read_group("jobs", "a", "c1", 10, Duration::ZERO).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].payload, json!(3));
    }

    #[tokio::test]
    async fn unacked_messages_survive_for_reclaim() {
        let s = InMemoryStream::new();
        s.ensure_group("jobs", "g").await.unwrap();
        s.append("jobs", json!("x")).await.unwrap();
        s.append("jobs", json!("y")).await.unwrap();
        let got = s.read_group("jobs", "g", "c1", 10, Duration::ZERO).await.unwrap();
        s.ack("jobs", "g", &got[1].id).await.unwrap();
        assert_eq!(s.len("jobs"), 2);
        let reclaimed = s.claim_idle("jobs", "g", "c2", Duration::ZERO, 10).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].payload, json!("x"));
        assert_eq!(reclaimed[0].deliveries, 2);
    }

    #[tokio::test]
    async fn unknown_group_is_an_error() {
        let s = InMemoryStream::new();
        assert!(s.read_group("jobs", "g", "a", 1, Duration::ZERO).await.is_err());
    }
}
