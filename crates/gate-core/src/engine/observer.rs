use std::time::Duration;

use uuid::Uuid;

use crate::model::{FlowRun, NodeStatus};

/// Resumen de una ejecución de nodo, emitido siempre (éxito, fallo o salto).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeReport {
    pub run_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub tenant: String,
    pub panel: String,
    pub status: NodeStatus,
    pub duration: Duration,
}

/// Punto de extensión para métricas: el engine notifica cada nodo y cada run
/// terminado.
pub trait NodeObserver: Send + Sync + std::fmt::Debug {
    fn on_node(&self, report: &NodeReport);

    fn on_run_finished(&self, _run: &FlowRun) {}
}
