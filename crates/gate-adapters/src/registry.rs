use std::collections::BTreeMap;
use std::sync::Arc;

use crate::agent::{AgentKind, BackendAdapter, NhaAdapter};
use crate::backend::{CompletionBackend, LexiconBackend};
use crate::error::AdapterError;

/// Registro de agentes indexado por `AgentKind`, construido al arrancar.
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<AgentKind, Arc<dyn NhaAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Todos los agentes sobre un mismo backend.
    pub fn with_backend(backend: Arc<dyn CompletionBackend>) -> Self {
        let mut reg = Self::new();
        for kind in AgentKind::ALL {
            reg.register(Arc::new(BackendAdapter::new(kind, backend.clone())));
        }
        reg
    }

    pub fn lexicon() -> Self {
        Self::with_backend(Arc::new(LexiconBackend))
    }

    pub fn register(&mut self, adapter: Arc<dyn NhaAdapter>) -> &mut Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn get(&self, kind: AgentKind) -> Option<&Arc<dyn NhaAdapter>> {
        self.adapters.get(&kind)
    }

    /// Resuelve por nombre (`"sentiment"`, `"tag"`, ...).
    pub fn resolve(&self, name: &str) -> Result<&Arc<dyn NhaAdapter>, AdapterError> {
        AgentKind::parse(name).and_then(|k| self.adapters.get(&k))
                              .ok_or_else(|| AdapterError::UnknownAgent(name.to_string()))
    }

    pub fn agents(&self) -> Vec<AgentKind> {
        self.adapters.keys().copied().collect()
    }
}
