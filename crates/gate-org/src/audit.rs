//! Log de auditoría con retención configurable.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type NowFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub target: String,
    #[serde(default)]
    pub before: Value,
    #[serde(default)]
    pub after: Value,
    pub trace_id: Option<String>,
    pub ts: DateTime<Utc>,
}

pub struct AuditLog {
    events: RwLock<Vec<AuditEvent>>,
    now: NowFn,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(now: NowFn) -> Self {
        Self { events: RwLock::new(Vec::new()),
               now }
    }

    pub fn record(&self,
                  actor: &str,
                  action: &str,
                  target: &str,
                  before: Value,
                  after: Value,
                  trace_id: Option<&str>)
                  -> AuditEvent {
        let event = AuditEvent { id: Uuid::new_v4(),
                                 actor: actor.to_string(),
                                 action: action.to_string(),
                                 target: target.to_string(),
                                 before,
                                 after,
                                 trace_id: trace_id.map(str::to_string),
                                 ts: (self.now)() };
        match self.events.write() {
            Ok(mut events) => events.push(event.clone()),
            Err(e) => error!("audit: lock poisoned on record: {e}"),
        }
        info!("audit:{action} actor={actor} target={target} trace={}", trace_id.unwrap_or("-"));
        event
    }

    fn read(&self) -> Vec<AuditEvent> {
        match self.events.read() {
            Ok(events) => events.clone(),
            Err(e) => {
                error!("audit: lock poisoned on read: {e}");
                Vec::new()
            }
        }
    }

    pub fn by_trace(&self, trace_id: &str) -> Vec<AuditEvent> {
        self.read()
            .into_iter()
            .filter(|e| e.trace_id.as_deref() == Some(trace_id))
            .collect()
    }

    /// Más recientes primero.
    pub fn list(&self, limit: usize) -> Vec<AuditEvent> {
        self.read().into_iter().rev().take(limit).collect()
    }

    /// Elimina los eventos más viejos que `retention`; devuelve cuántos.
    pub fn prune_expired(&self, retention: Duration) -> usize {
        let cutoff = (self.now)() - retention;
        match self.events.write() {
            Ok(mut events) => {
                let before = events.len();
                events.retain(|e| e.ts >= cutoff);
                let removed = before - events.len();
                if removed > 0 {
                    info!("audit:prune removed={removed} cutoff={cutoff}");
                }
                removed
            }
            Err(e) => {
                error!("audit: lock poisoned on prune: {e}");
                0
            }
        }
    }
}
