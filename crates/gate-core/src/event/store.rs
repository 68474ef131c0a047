use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use super::{EventLevel, RunEvent, RunEventKind};
use crate::errors::FlowEngineError;

/// Almacenamiento de eventos append-only.
pub trait EventStore: Send + Sync {
    /// Agrega un evento y devuelve el evento completo (con seq y ts).
    fn append_with_level(&self,
                         run_id: Uuid,
                         level: EventLevel,
                         kind: RunEventKind)
                         -> Result<RunEvent, FlowEngineError>;

    /// Lista eventos de un run (orden ascendente por seq).
    fn list(&self, run_id: Uuid) -> Result<Vec<RunEvent>, FlowEngineError>;

    /// Agrega con el nivel por defecto del kind.
    fn append_kind(&self, run_id: Uuid, kind: RunEventKind) -> Result<RunEvent, FlowEngineError> {
        let level = kind.default_level();
        self.append_with_level(run_id, level, kind)
    }
}

impl<T: EventStore + ?Sized> EventStore for std::sync::Arc<T> {
    fn append_with_level(&self,
                         run_id: Uuid,
                         level: EventLevel,
                         kind: RunEventKind)
                         -> Result<RunEvent, FlowEngineError> {
        (**self).append_with_level(run_id, level, kind)
    }

    fn list(&self, run_id: Uuid) -> Result<Vec<RunEvent>, FlowEngineError> {
        (**self).list(run_id)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: DashMap<Uuid, Vec<RunEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn append_with_level(&self,
                         run_id: Uuid,
                         level: EventLevel,
                         kind: RunEventKind)
                         -> Result<RunEvent, FlowEngineError> {
        let mut vec = self.inner.entry(run_id).or_default();
        let seq = vec.len() as u64;
        let ev = RunEvent { seq,
                            run_id,
                            level,
                            kind,
                            ts: Utc::now() };
        vec.push(ev.clone());
        Ok(ev)
    }

    fn list(&self, run_id: Uuid) -> Result<Vec<RunEvent>, FlowEngineError> {
        Ok(self.inner.get(&run_id).map(|v| v.clone()).unwrap_or_default())
    }
}
