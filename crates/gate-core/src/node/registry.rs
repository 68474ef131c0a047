use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Connector, NodeKind};

/// Mapa `NodeKind -> connector` construido al arrancar.
#[derive(Debug, Clone, Default)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<NodeKind, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: NodeKind, connector: Arc<dyn Connector>) -> &mut Self {
        self.connectors.insert(kind, connector);
        self
    }

    pub fn with(mut self, kind: NodeKind, connector: Arc<dyn Connector>) -> Self {
        self.register(kind, connector);
        self
    }

    pub fn get(&self, kind: NodeKind) -> Option<Arc<dyn Connector>> {
        self.connectors.get(&kind).cloned()
    }

    /// Tipos sin connector registrado.
    pub fn missing_kinds(&self) -> Vec<NodeKind> {
        NodeKind::ALL.iter().copied().filter(|k| !self.connectors.contains_key(k)).collect()
    }
}
