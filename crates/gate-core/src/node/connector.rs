//! Contrato uniforme de connector.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::event::EventLevel;
use crate::model::{NodeSpec, RunContext};

/// Outputs acumulados del run, en orden de ejecución. Siempre contiene
/// `trigger` como primera clave.
pub type OutputMap = IndexMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorLog {
    pub level: EventLevel,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl ConnectorLog {
    pub fn info(message: impl Into<String>, data: Value) -> Self {
        Self { level: EventLevel::Info,
               message: message.into(),
               data }
    }

    pub fn warn(message: impl Into<String>, data: Value) -> Self {
        Self { level: EventLevel::Warn,
               message: message.into(),
               data }
    }
}

/// Resultado de un connector. `ok == false` hace fallar el run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorOutcome {
    pub ok: bool,
    pub output: Value,
    #[serde(default)]
    pub logs: Vec<ConnectorLog>,
    /// Sólo `Logic.Filter`: cuando es true, todos los dependientes
    /// transitivos del nodo se marcan `skipped`.
    #[serde(default)]
    pub gate_closed: bool,
}

impl ConnectorOutcome {
    pub fn ok(output: Value) -> Self {
        Self { ok: true,
               output,
               logs: Vec::new(),
               gate_closed: false }
    }

    pub fn failed(output: Value) -> Self {
        Self { ok: false,
               output,
               logs: Vec::new(),
               gate_closed: false }
    }

    pub fn with_log(mut self, log: ConnectorLog) -> Self {
        self.logs.push(log);
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorError {
    /// Parámetros del nodo inválidos.
    #[error("invalid params: {0}")]
    InvalidParams(String),
    /// El guard del run rechazó la llamada (presupuesto, dedupe, breaker).
    #[error("rejected by guard: {0}")]
    Rejected(String),
    /// Cuota de billing agotada.
    #[error("quota exceeded: {0}")]
    Quota(String),
    #[error("timed out after {0} ms")]
    Timeout(u64),
    #[error("connector failure: {0}")]
    Failure(String),
}

#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// `params` ya viene con las plantillas resueltas.
    async fn run(&self,
                 node: &NodeSpec,
                 params: &Value,
                 outputs: &OutputMap,
                 ctx: &RunContext)
                 -> Result<ConnectorOutcome, ConnectorError>;
}
