//! Connectors sin dependencias externas: trigger, filtro, mapper, delay y
//! emit. Los que hablan con agentes, retrieval o comentarios viven en
//! `gate-adapters`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Connector, ConnectorError, ConnectorLog, ConnectorOutcome, OutputMap};
use crate::condition;
use crate::constants::DEFAULT_DELAY_CAP_MS;
use crate::event::EventLevel;
use crate::model::{NodeSpec, RunContext};

/// Devuelve el payload que originó el run.
#[derive(Debug, Default)]
pub struct TriggerConnector;

#[async_trait]
impl Connector for TriggerConnector {
    async fn run(&self,
                 _node: &NodeSpec,
                 _params: &Value,
                 _outputs: &OutputMap,
                 ctx: &RunContext)
                 -> Result<ConnectorOutcome, ConnectorError> {
        Ok(ConnectorOutcome::ok(ctx.trigger.clone()))
    }
}

/// `Logic.Filter`: evalúa `params.condition`. Si es falsa, cierra el gate y
/// el engine salta todos los dependientes.
#[derive(Debug, Default)]
pub struct FilterConnector;

#[async_trait]
impl Connector for FilterConnector {
    async fn run(&self,
                 node: &NodeSpec,
                 params: &Value,
                 outputs: &OutputMap,
                 _ctx: &RunContext)
                 -> Result<ConnectorOutcome, ConnectorError> {
        // la condición se lee del spec sin renderizar: contiene paths, no plantillas
        let cond = node.params
                       .get("condition")
                       .or_else(|| params.get("condition"))
                       .and_then(Value::as_str)
                       .ok_or_else(|| ConnectorError::InvalidParams("`condition` is required".into()))?;
        let passed =
            condition::evaluate(cond, outputs).map_err(|e| ConnectorError::InvalidParams(e.to_string()))?;
        let mut outcome = ConnectorOutcome::ok(json!({ "passed": passed }));
        outcome.gate_closed = !passed;
        Ok(outcome)
    }
}

/// `Transform.Map`: proyecta `params.fields` (ya renderizado). Sin `fields`
/// devuelve los params completos.
#[derive(Debug, Default)]
pub struct MapConnector;

#[async_trait]
impl Connector for MapConnector {
    async fn run(&self,
                 _node: &NodeSpec,
                 params: &Value,
                 _outputs: &OutputMap,
                 _ctx: &RunContext)
                 -> Result<ConnectorOutcome, ConnectorError> {
        let out = match params.get("fields") {
            Some(fields @ Value::Object(_)) => fields.clone(),
            Some(_) => return Err(ConnectorError::InvalidParams("`fields` must be an object".into())),
            None => params.clone(),
        };
        Ok(ConnectorOutcome::ok(out))
    }
}

/// `Util.Delay`: duerme `params.ms`, acotado por `cap`.
#[derive(Debug)]
pub struct DelayConnector {
    cap: Duration,
}

impl DelayConnector {
    pub fn new(cap: Duration) -> Self {
        Self { cap }
    }
}

impl Default for DelayConnector {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_DELAY_CAP_MS))
    }
}

#[async_trait]
impl Connector for DelayConnector {
    async fn run(&self,
                 _node: &NodeSpec,
                 params: &Value,
                 _outputs: &OutputMap,
                 _ctx: &RunContext)
                 -> Result<ConnectorOutcome, ConnectorError> {
        let requested = match params.get("ms") {
            None => 0,
            Some(v) => v.as_u64()
                        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                        .ok_or_else(|| ConnectorError::InvalidParams("`ms` must be a non-negative integer".into()))?,
        };
        let cap_ms = self.cap.as_millis() as u64;
        let slept = requested.min(cap_ms);
        tokio::time::sleep(Duration::from_millis(slept)).await;
        let mut outcome = ConnectorOutcome::ok(json!({ "slept_ms": slept }));
        if requested > cap_ms {
            outcome = outcome.with_log(ConnectorLog::warn("delay capped",
                                                          json!({"requested_ms": requested, "cap_ms": cap_ms})));
        }
        Ok(outcome)
    }
}

/// `Util.Emit`: escribe un `RunEvent` con `params.message` / `level` / `data`.
#[derive(Debug, Default)]
pub struct EmitConnector;

#[async_trait]
impl Connector for EmitConnector {
    async fn run(&self,
                 _node: &NodeSpec,
                 params: &Value,
                 _outputs: &OutputMap,
                 _ctx: &RunContext)
                 -> Result<ConnectorOutcome, ConnectorError> {
        let message = params.get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("event")
                            .to_string();
        let level = params.get("level")
                          .and_then(Value::as_str)
                          .and_then(EventLevel::parse)
                          .unwrap_or(EventLevel::Info);
        let data = params.get("data").cloned().unwrap_or(Value::Null);
        let log = ConnectorLog { level,
                                 message: message.clone(),
                                 data: data.clone() };
        Ok(ConnectorOutcome::ok(json!({ "emitted": true, "message": message, "data": data })).with_log(log))
    }
}
