//! Tipos de evento de un run y estructura `RunEvent`.
//!
//! Rol en el flujo:
//! - Cada ejecución del `FlowEngine` emite eventos a un `EventStore`
//!   append-only.
//! - `FlowRun` y `NodeCache` se reconstruyen por replay de estos eventos.
//! - `RunEventKind` es el contrato observable del motor; la vista plana
//!   `{run_id, level, node_id, message, data, ts}` se deriva de él.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::model::RunMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(EventLevel::Debug),
            "info" => Some(EventLevel::Info),
            "warn" | "warning" => Some(EventLevel::Warn),
            "error" => Some(EventLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunEventKind {
    /// Primer evento de todo run: fija flow, versión, modo y trigger.
    RunQueued {
        flow_id: Uuid,
        version: u32,
        mode: RunMode,
        trigger: Value,
        trace_id: String,
        tenant: String,
        panel: String,
    },
    RunStarted,
    NodeStarted { node_id: String, node_type: String, cache_id: Uuid },
    NodeFinished {
        node_id: String,
        cache_id: Uuid,
        output: Value,
        duration_ms: u64,
    },
    /// El nodo no se ejecutó (condición falsa o gate cerrado aguas arriba).
    NodeSkipped {
        node_id: String,
        node_type: String,
        cache_id: Uuid,
        reason: String,
    },
    NodeFailed {
        node_id: String,
        cache_id: Uuid,
        error: String,
        output: Option<Value>,
        duration_ms: u64,
    },
    /// Línea de log emitida por un connector (o por `Util.Emit`).
    NodeLog { node_id: Option<String>, message: String, data: Value },
    RunCompleted { outputs_hash: String },
    RunFailed { node_id: Option<String>, error: String },
    RunCanceled { reason: Option<String> },
}

impl RunEventKind {
    pub fn default_level(&self) -> EventLevel {
        match self {
            RunEventKind::NodeFailed { .. } | RunEventKind::RunFailed { .. } => EventLevel::Error,
            RunEventKind::RunCanceled { .. } => EventLevel::Warn,
            RunEventKind::NodeLog { .. } => EventLevel::Info,
            RunEventKind::NodeStarted { .. } | RunEventKind::NodeSkipped { .. } => EventLevel::Debug,
            _ => EventLevel::Info,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunEventKind::RunQueued { .. } => "run_queued",
            RunEventKind::RunStarted => "run_started",
            RunEventKind::NodeStarted { .. } => "node_started",
            RunEventKind::NodeFinished { .. } => "node_finished",
            RunEventKind::NodeSkipped { .. } => "node_skipped",
            RunEventKind::NodeFailed { .. } => "node_failed",
            RunEventKind::NodeLog { .. } => "node_log",
            RunEventKind::RunCompleted { .. } => "run_completed",
            RunEventKind::RunFailed { .. } => "run_failed",
            RunEventKind::RunCanceled { .. } => "run_canceled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: u64,
    pub run_id: Uuid,
    pub level: EventLevel,
    pub kind: RunEventKind,
    pub ts: DateTime<Utc>,
}

/// Vista plana de un evento, tal como la expone `GET /flow-runs/{id}/events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEventView {
    pub seq: u64,
    pub run_id: Uuid,
    pub level: EventLevel,
    pub node_id: Option<String>,
    pub message: String,
    pub data: Value,
    pub ts: DateTime<Utc>,
}

impl RunEvent {
    pub fn node_id(&self) -> Option<&str> {
        match &self.kind {
            RunEventKind::NodeStarted { node_id, .. }
            | RunEventKind::NodeFinished { node_id, .. }
            | RunEventKind::NodeSkipped { node_id, .. }
            | RunEventKind::NodeFailed { node_id, .. } => Some(node_id),
            RunEventKind::NodeLog { node_id, .. } | RunEventKind::RunFailed { node_id, .. } => node_id.as_deref(),
            _ => None,
        }
    }

    pub fn view(&self) -> RunEventView {
        let (message, data) = match &self.kind {
            RunEventKind::RunQueued { flow_id, version, mode, .. } => {
                ("run queued".to_string(), json!({"flow_id": flow_id, "version": version, "mode": mode}))
            }
            RunEventKind::RunStarted => ("run started".to_string(), Value::Null),
            RunEventKind::NodeStarted { node_type, .. } => {
                ("node started".to_string(), json!({"type": node_type}))
            }
            RunEventKind::NodeFinished { output, duration_ms, .. } => {
                ("node finished".to_string(), json!({"output": output, "duration_ms": duration_ms}))
            }
            RunEventKind::NodeSkipped { reason, .. } => ("node skipped".to_string(), json!({"reason": reason})),
            RunEventKind::NodeFailed { error, duration_ms, .. } => {
                (format!("node failed: {error}"), json!({"duration_ms": duration_ms}))
            }
            RunEventKind::NodeLog { message, data, .. } => (message.clone(), data.clone()),
            RunEventKind::RunCompleted { outputs_hash } => {
                ("run completed".to_string(), json!({"outputs_hash": outputs_hash}))
            }
            RunEventKind::RunFailed { error, .. } => (format!("run failed: {error}"), Value::Null),
            RunEventKind::RunCanceled { reason } => ("run canceled".to_string(), json!({"reason": reason})),
        };
        RunEventView { seq: self.seq,
                       run_id: self.run_id,
                       level: self.level,
                       node_id: self.node_id().map(str::to_string),
                       message,
                       data,
                       ts: self.ts }
    }
}
