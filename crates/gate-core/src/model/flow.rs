//! Definición declarativa de un flow: nodos, aristas y versión.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

fn empty_params() -> Value {
    Value::Object(Default::default())
}

/// Un nodo del DAG. `type` elige el connector; `if` es una condición
/// opcional evaluada contra los outputs acumulados.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default = "empty_params")]
    pub params: Value,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, params: Value) -> Self {
        Self { id: id.into(),
               node_type: node_type.into(),
               params,
               condition: None }
    }

    pub fn with_condition(mut self, cond: impl Into<String>) -> Self {
        self.condition = Some(cond.into());
        self
    }
}

/// Arista `from -> to`: `to` depende de `from`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
}

impl EdgeSpec {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self { from: from.into(), to: to.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlowSpec {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

impl FlowSpec {
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Una versión inmutable de un flow. Cada edición crea una versión nueva;
/// `active` se conmuta por separado y aplica al flow completo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: Uuid,
    pub name: String,
    pub tenant: String,
    pub panel: String,
    pub version: u32,
    pub spec: FlowSpec,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
