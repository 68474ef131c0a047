//! Registro de invocaciones directas de agentes y su almacenamiento.
//!
//! El paso `queued -> running` lo hace `claim` de forma atómica: sólo una
//! entrega gana, las demás ven `None`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl InvocationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InvocationStatus::Queued => "queued",
            InvocationStatus::Running => "running",
            InvocationStatus::Done => "done",
            InvocationStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(InvocationStatus::Queued),
            "running" => Some(InvocationStatus::Running),
            "done" => Some(InvocationStatus::Done),
            "error" => Some(InvocationStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub id: Uuid,
    pub post_id: String,
    pub agent_id: String,
    pub status: InvocationStatus,
    pub cost: i64,
    pub trace_id: String,
    /// Ref de facturación a la que se cargó el coste.
    #[serde(rename = "ref")]
    pub reference: String,
    pub text: String,
    pub panel: String,
    pub result: Option<Value>,
    pub degraded: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub trait InvocationStore: Send + Sync + std::fmt::Debug {
    fn insert(&self, invocation: &Invocation) -> Result<(), AdapterError>;

    fn get(&self, id: Uuid) -> Result<Option<Invocation>, AdapterError>;

    /// Invocaciones de un post, en orden de creación.
    fn list_by_post(&self, post_id: &str) -> Result<Vec<Invocation>, AdapterError>;

    /// Pasa `queued -> running` y devuelve la invocación tomada. `None` si no
    /// existe o ya no estaba en `queued`.
    fn claim(&self, id: Uuid) -> Result<Option<Invocation>, AdapterError>;

    /// Reescribe estado, resultado y error.
    fn save(&self, invocation: &Invocation) -> Result<(), AdapterError>;
}

#[derive(Debug, Default)]
pub struct InMemoryInvocationStore {
    items: DashMap<Uuid, Invocation>,
}

impl InMemoryInvocationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InvocationStore for InMemoryInvocationStore {
    fn insert(&self, invocation: &Invocation) -> Result<(), AdapterError> {
        self.items.insert(invocation.id, invocation.clone());
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<Invocation>, AdapterError> {
        Ok(self.items.get(&id).map(|i| i.clone()))
    }

    fn list_by_post(&self, post_id: &str) -> Result<Vec<Invocation>, AdapterError> {
        let mut out: Vec<Invocation> = self.items
                                           .iter()
                                           .filter(|e| e.post_id == post_id)
                                           .map(|e| e.value().clone())
                                           .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    fn claim(&self, id: Uuid) -> Result<Option<Invocation>, AdapterError> {
        let Some(mut entry) = self.items.get_mut(&id) else {
            return Ok(None);
        };
        if entry.status != InvocationStatus::Queued {
            return Ok(None);
        }
        entry.status = InvocationStatus::Running;
        entry.updated_at = Utc::now();
        Ok(Some(entry.clone()))
    }

    fn save(&self, invocation: &Invocation) -> Result<(), AdapterError> {
        match self.items.get_mut(&invocation.id) {
            Some(mut entry) => {
                *entry = invocation.clone();
                Ok(())
            }
            None => Err(AdapterError::Store(format!("invocation {} not found", invocation.id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(post_id: &str) -> Invocation {
        let now = Utc::now();
        Invocation { id: Uuid::new_v4(),
                     post_id: post_id.into(),
                     agent_id: "tag".into(),
                     status: InvocationStatus::Queued,
                     cost: 1,
                     trace_id: "t".into(),
                     reference: "acme".into(),
                     text: "hello".into(),
                     panel: String::new(),
                     result: None,
                     degraded: false,
                     error: None,
                     created_at: now,
                     updated_at: now }
    }

    #[test]
    fn claim_wins_only_once() {
        let store = InMemoryInvocationStore::new();
        let inv = queued("p1");
        store.insert(&inv).unwrap();
        assert_eq!(store.claim(inv.id).unwrap().unwrap().status, InvocationStatus::Running);
        assert!(store.claim(inv.id).unwrap().is_none());
        assert!(store.claim(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn status_names_round_trip() {
        for s in [InvocationStatus::Queued, InvocationStatus::Running, InvocationStatus::Done, InvocationStatus::Error] {
            assert_eq!(InvocationStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(InvocationStatus::parse("paused"), None);
    }
}
