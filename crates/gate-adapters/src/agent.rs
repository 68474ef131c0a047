//! Agentes NHA: un conjunto cerrado de tareas acotadas detrás de
//! `process(input) -> result`.

use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::backend::CompletionBackend;
use crate::error::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Sentiment,
    Summarize,
    Tag,
    Transcribe,
}

impl AgentKind {
    pub const ALL: [AgentKind; 4] = [AgentKind::Sentiment, AgentKind::Summarize, AgentKind::Tag, AgentKind::Transcribe];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Sentiment => "sentiment",
            AgentKind::Summarize => "summarize",
            AgentKind::Tag => "tag",
            AgentKind::Transcribe => "transcribe",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Coste por invocación en la moneda interna.
    pub fn default_cost(self) -> i64 {
        match self {
            AgentKind::Sentiment => 1,
            AgentKind::Tag => 1,
            AgentKind::Summarize => 3,
            AgentKind::Transcribe => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentInput {
    pub text: String,
    #[serde(default)]
    pub params: Value,
}

impl AgentInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(),
               params: Value::Null }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent: AgentKind,
    pub output: Value,
    /// true cuando el backend falló y `output` es la salida de respaldo.
    pub degraded: bool,
    pub cost: i64,
}

impl AgentResult {
    /// Salida del agente más `agent` y `degraded`, tal como la ven los nodos.
    pub fn to_output(&self) -> Value {
        let mut out = match &self.output {
            Value::Object(map) => map.clone(),
            other => {
                let mut m = serde_json::Map::new();
                m.insert("result".into(), other.clone());
                m
            }
        };
        out.insert("agent".into(), json!(self.agent.as_str()));
        out.insert("degraded".into(), json!(self.degraded));
        Value::Object(out)
    }
}

#[async_trait]
pub trait NhaAdapter: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> AgentKind;

    fn cost(&self) -> i64 {
        self.kind().default_cost()
    }

    /// Rechaza la entrada antes de gastar nada en ella. Todos los agentes
    /// salvo `transcribe` necesitan texto.
    fn validate(&self, input: &AgentInput) -> Result<(), AdapterError> {
        let kind = self.kind();
        if input.text.trim().is_empty() && kind != AgentKind::Transcribe {
            return Err(AdapterError::InvalidInput(format!("{} needs non-empty text", kind.as_str())));
        }
        Ok(())
    }

    /// Nunca falla por el upstream: en ese caso devuelve la salida degradada.
    /// Sólo la entrada inválida es error.
    async fn process(&self, input: &AgentInput) -> Result<AgentResult, AdapterError>;
}

/// Salida determinista cuando el backend no responde.
pub fn fallback_output(kind: AgentKind, input: &AgentInput) -> Value {
    match kind {
        AgentKind::Sentiment => json!({ "label": "neutral", "score": 0.5 }),
        AgentKind::Summarize => {
            let summary: String = input.text.chars().take(200).collect();
            json!({ "summary": summary })
        }
        AgentKind::Tag => json!({ "tags": [] }),
        AgentKind::Transcribe => json!({ "text": "", "language": "und" }),
    }
}

/// Adapter genérico sobre un `CompletionBackend`.
#[derive(Debug, Clone)]
pub struct BackendAdapter {
    kind: AgentKind,
    cost: i64,
    backend: Arc<dyn CompletionBackend>,
}

impl BackendAdapter {
    pub fn new(kind: AgentKind, backend: Arc<dyn CompletionBackend>) -> Self {
        Self { kind,
               cost: kind.default_cost(),
               backend }
    }

    pub fn with_cost(mut self, cost: i64) -> Self {
        self.cost = cost;
        self
    }
}

#[async_trait]
impl NhaAdapter for BackendAdapter {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn cost(&self) -> i64 {
        self.cost
    }

    async fn process(&self, input: &AgentInput) -> Result<AgentResult, AdapterError> {
        self.validate(input)?;
        match self.backend.complete(self.kind, input).await {
            Ok(output) => Ok(AgentResult { agent: self.kind,
                                           output,
                                           degraded: false,
                                           cost: self.cost }),
            Err(e) => {
                warn!("adapter:{} degraded backend={} err={e}", self.kind.as_str(), self.backend.name());
                Ok(AgentResult { agent: self.kind,
                                 output: fallback_output(self.kind, input),
                                 degraded: true,
                                 cost: self.cost })
            }
        }
    }
}
