use std::sync::Arc;

use gate_guard::Guard;
use serde_json::Value;
use uuid::Uuid;

use super::RunMode;

/// Contexto de ejecución entregado a cada `Connector::run`.
///
/// El `guard` es propio del run: se crea al iniciar la ejecución y se
/// descarta al terminar, de modo que los contadores nunca cruzan tenants.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub flow_id: Uuid,
    pub version: u32,
    pub trace_id: String,
    pub mode: RunMode,
    pub trigger: Value,
    pub tenant: String,
    pub panel: String,
    pub guard: Arc<Guard>,
}

impl RunContext {
    pub fn is_dry(&self) -> bool {
        self.mode.is_dry()
    }
}
