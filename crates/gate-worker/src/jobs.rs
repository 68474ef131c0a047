//! Esquemas de mensajes de cola y handlers.

use std::sync::Arc;

use async_trait::async_trait;
use gate_core::{classify_error, ErrorClass, EventStore, FlowEngine, RunMode, RunRepository};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::WorkerError;

pub const FLOW_JOBS_STREAM: &str = "flow_jobs";
pub const INVOCATION_JOBS_STREAM: &str = "invocation_jobs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowJob {
    pub run_id: Uuid,
    pub flow_id: Uuid,
    pub version: u32,
    pub mode: RunMode,
    pub trace_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationJob {
    pub invocation_id: Uuid,
    pub post_id: String,
    pub agent_id: String,
    pub trace_id: String,
}

/// Resultado terminal de un job: el worker hace ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub status: String,
}

impl JobOutcome {
    pub fn new(status: impl Into<String>) -> Self {
        Self { status: status.into() }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync + std::fmt::Debug {
    async fn handle(&self, payload: &Value) -> Result<JobOutcome, WorkerError>;
}

pub fn decode<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T, WorkerError> {
    serde_json::from_value(payload.clone()).map_err(|e| WorkerError::InvalidPayload(e.to_string()))
}

/// Ejecuta el run referenciado. Un run ya terminal vuelve sin re-ejecutarse,
/// así que las reentregas son inocuas.
pub struct FlowJobHandler<E: EventStore, R: RunRepository> {
    engine: Arc<FlowEngine<E, R>>,
}

impl<E: EventStore, R: RunRepository> FlowJobHandler<E, R> {
    pub fn new(engine: Arc<FlowEngine<E, R>>) -> Self {
        Self { engine }
    }
}

impl<E: EventStore, R: RunRepository> std::fmt::Debug for FlowJobHandler<E, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowJobHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<E, R> JobHandler for FlowJobHandler<E, R>
    where E: EventStore + 'static,
          R: RunRepository + 'static
{
    async fn handle(&self, payload: &Value) -> Result<JobOutcome, WorkerError> {
        let job: FlowJob = decode(payload)?;
        match self.engine.execute(job.run_id).await {
            Ok(run) => {
                info!("worker:flow run={} status={} trace={}", run.id, run.status.as_str(), job.trace_id);
                Ok(JobOutcome::new(run.status.as_str()))
            }
            Err(e) => match classify_error(&e) {
                ErrorClass::Transient => Err(WorkerError::Transient(e.to_string())),
                _ => Err(WorkerError::Permanent(e.to_string())),
            },
        }
    }
}
