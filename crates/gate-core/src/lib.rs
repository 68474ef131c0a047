//! gate-core: orquestador DAG de flows.
//!
//! - `model`: Flow / FlowRun / NodeCache y el contexto de ejecución.
//! - `event`: log append-only de `RunEvent`, fuente de verdad de los runs.
//! - `repo`: replay del log y catálogo de flows versionados.
//! - `node`: tipos de nodo, contrato `Connector` y registro.
//! - `injection` / `condition`: plantillas `{{path}}` y condiciones `if`.
//! - `engine`: validación, orden topológico y ejecución.
pub mod condition;
pub mod constants;
pub mod engine;
pub mod errors;
pub mod event;
pub mod hashing;
pub mod injection;
pub mod model;
pub mod node;
pub mod repo;

pub use engine::{plan, ExecutionPlan, FlowEngine, FlowEngineBuilder, NodeObserver, NodeReport};
pub use errors::{classify_error, ErrorClass, FlowEngineError};
pub use event::{EventLevel, EventStore, InMemoryEventStore, RunEvent, RunEventKind, RunEventView};
pub use model::{EdgeSpec, Flow, FlowRun, FlowSpec, NodeCache, NodeSpec, NodeStatus, RunContext, RunMode, RunStatus};
pub use node::{Connector, ConnectorError, ConnectorLog, ConnectorOutcome, ConnectorRegistry, NodeKind, OutputMap};
pub use repo::{validate_definition, FlowCatalog, InMemoryFlowCatalog, ReplayRunRepository, RunInstance,
               RunRepository};
