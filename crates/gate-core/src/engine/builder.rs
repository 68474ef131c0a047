//! Builder para `FlowEngine`.
//!
//! ```ignore
//! let engine = FlowEngine::in_memory()
//!     .with_builtin_connectors(Duration::from_secs(5))
//!     .connector(NodeKind::NhaInvoke, Arc::new(NhaInvokeConnector::new(..)))
//!     .observer(metrics.clone())
//!     .build();
//! ```

use std::sync::Arc;
use std::time::Duration;

use gate_guard::GuardConfig;

use super::core::FlowEngine;
use super::observer::NodeObserver;
use crate::event::EventStore;
use crate::node::builtin::{DelayConnector, EmitConnector, FilterConnector, MapConnector, TriggerConnector};
use crate::node::{Connector, ConnectorRegistry, NodeKind};
use crate::repo::{FlowCatalog, InMemoryFlowCatalog, RunRepository};

pub struct FlowEngineBuilder<E: EventStore, R: RunRepository> {
    event_store: E,
    repository: R,
    catalog: Option<Arc<dyn FlowCatalog>>,
    registry: ConnectorRegistry,
    observers: Vec<Arc<dyn NodeObserver>>,
    guard_config: GuardConfig,
}

impl<E: EventStore, R: RunRepository> FlowEngineBuilder<E, R> {
    pub fn new(event_store: E, repository: R) -> Self {
        Self { event_store,
               repository,
               catalog: None,
               registry: ConnectorRegistry::new(),
               observers: Vec::new(),
               guard_config: GuardConfig::default() }
    }

    pub fn catalog(mut self, catalog: Arc<dyn FlowCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn connector(mut self, kind: NodeKind, connector: Arc<dyn Connector>) -> Self {
        self.registry.register(kind, connector);
        self
    }

    pub fn registry(mut self, registry: ConnectorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Registra trigger, filtro, mapper, delay (con tope `delay_cap`) y emit.
    pub fn with_builtin_connectors(self, delay_cap: Duration) -> Self {
        self.connector(NodeKind::Trigger, Arc::new(TriggerConnector))
            .connector(NodeKind::Filter, Arc::new(FilterConnector))
            .connector(NodeKind::Map, Arc::new(MapConnector))
            .connector(NodeKind::Delay, Arc::new(DelayConnector::new(delay_cap)))
            .connector(NodeKind::Emit, Arc::new(EmitConnector))
    }

    pub fn observer(mut self, observer: Arc<dyn NodeObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Límites del `Guard` creado para cada run.
    pub fn guard_config(mut self, config: GuardConfig) -> Self {
        self.guard_config = config;
        self
    }

    pub fn build(self) -> FlowEngine<E, R> {
        let catalog = self.catalog
                          .unwrap_or_else(|| Arc::new(InMemoryFlowCatalog::new()));
        let missing = self.registry.missing_kinds();
        if !missing.is_empty() {
            log::warn!("engine:build connectors missing for {:?}", missing);
        }
        FlowEngine::from_parts(self.event_store,
                               self.repository,
                               catalog,
                               self.registry,
                               self.observers,
                               self.guard_config)
    }
}
