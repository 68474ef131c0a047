//! Core FlowEngine implementation

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gate_guard::{Guard, GuardConfig, GuardState};
use log::{debug, info, warn};
use serde_json::{json, Value};
use uuid::Uuid;

use super::builder::FlowEngineBuilder;
use super::observer::{NodeObserver, NodeReport};
use super::plan::{plan, ExecutionPlan};
use crate::condition;
use crate::constants::ENGINE_VERSION;
use crate::errors::FlowEngineError;
use crate::event::{EventStore, InMemoryEventStore, RunEvent, RunEventKind};
use crate::hashing::hash_value;
use crate::injection::render_params;
use crate::model::{FlowRun, NodeSpec, NodeStatus, RunContext, RunMode};
use crate::node::{ConnectorRegistry, NodeKind, OutputMap};
use crate::repo::{FlowCatalog, ReplayRunRepository, RunInstance, RunRepository};

/// Motor de ejecución de flows DAG.
///
/// El log de eventos es la fuente de verdad: `FlowRun` y `NodeCache` se
/// reconstruyen por replay en cada operación, por lo que `execute` puede
/// reanudarse tras una caída y no re-ejecuta nodos ya completados.
pub struct FlowEngine<E, R>
    where E: EventStore,
          R: RunRepository
{
    event_store: E,
    repository: R,
    catalog: Arc<dyn FlowCatalog>,
    registry: ConnectorRegistry,
    observers: Vec<Arc<dyn NodeObserver>>,
    guard_config: GuardConfig,
}

impl<E, R> std::fmt::Debug for FlowEngine<E, R>
    where E: EventStore,
          R: RunRepository
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
         .field("registry", &self.registry)
         .field("observers", &self.observers.len())
         .field("guard_config", &self.guard_config)
         .finish()
    }
}

impl FlowEngine<InMemoryEventStore, ReplayRunRepository> {
    /// Builder con stores en memoria.
    pub fn in_memory() -> FlowEngineBuilder<InMemoryEventStore, ReplayRunRepository> {
        FlowEngineBuilder::new(InMemoryEventStore::new(), ReplayRunRepository::new())
    }
}

impl<E, R> FlowEngine<E, R>
    where E: EventStore,
          R: RunRepository
{
    #[inline]
    pub fn builder(event_store: E, repository: R) -> FlowEngineBuilder<E, R> {
        FlowEngineBuilder::new(event_store, repository)
    }

    pub(crate) fn from_parts(event_store: E,
                             repository: R,
                             catalog: Arc<dyn FlowCatalog>,
                             registry: ConnectorRegistry,
                             observers: Vec<Arc<dyn NodeObserver>>,
                             guard_config: GuardConfig)
                             -> Self {
        Self { event_store,
               repository,
               catalog,
               registry,
               observers,
               guard_config }
    }

    pub fn catalog(&self) -> &Arc<dyn FlowCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    pub fn event_store(&self) -> &E {
        &self.event_store
    }

    /// Crea un run `queued` para `flow_id` (última versión si `version` es
    /// `None`). Los runs live exigen un flow activo; los dry no.
    pub fn enqueue(&self,
                   flow_id: Uuid,
                   version: Option<u32>,
                   mode: RunMode,
                   trigger: Value,
                   trace_id: Option<String>)
                   -> Result<FlowRun, FlowEngineError> {
        let flow = match version {
            Some(v) => self.catalog.get_version(flow_id, v)?,
            None => self.catalog.get(flow_id)?,
        };
        if mode == RunMode::Live && !flow.active {
            return Err(FlowEngineError::FlowInactive(flow_id));
        }
        let run_id = Uuid::new_v4();
        let trace_id = trace_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.event_store.append_kind(run_id,
                                     RunEventKind::RunQueued { flow_id,
                                                               version: flow.version,
                                                               mode,
                                                               trigger,
                                                               trace_id: trace_id.clone(),
                                                               tenant: flow.tenant.clone(),
                                                               panel: flow.panel.clone() })?;
        info!("engine:enqueue run={run_id} flow={flow_id} version={} mode={mode:?} trace={trace_id}",
              flow.version);
        Ok(self.load_run(run_id)?.run)
    }

    /// Encola y ejecuta en el mismo task.
    pub async fn run(&self, flow_id: Uuid, mode: RunMode, trigger: Value) -> Result<FlowRun, FlowEngineError> {
        let run = self.enqueue(flow_id, None, mode, trigger, None)?;
        self.execute(run.id).await
    }

    /// Reconstruye el estado de un run.
    pub fn load_run(&self, run_id: Uuid) -> Result<RunInstance, FlowEngineError> {
        let events = self.event_store.list(run_id)?;
        self.repository
            .load(run_id, &events)
            .ok_or(FlowEngineError::RunNotFound(run_id))
    }

    pub fn list_events(&self, run_id: Uuid) -> Result<Vec<RunEvent>, FlowEngineError> {
        let events = self.event_store.list(run_id)?;
        if events.is_empty() {
            return Err(FlowEngineError::RunNotFound(run_id));
        }
        Ok(events)
    }

    /// Cancela un run no terminal. Un run en curso se detiene antes del
    /// siguiente nodo.
    pub fn cancel(&self, run_id: Uuid, reason: Option<String>) -> Result<FlowRun, FlowEngineError> {
        let instance = self.load_run(run_id)?;
        if instance.run.status.is_terminal() {
            return Err(FlowEngineError::RunTerminal(run_id));
        }
        self.event_store.append_kind(run_id, RunEventKind::RunCanceled { reason })?;
        info!("engine:cancel run={run_id}");
        Ok(self.load_run(run_id)?.run)
    }

    /// Ejecuta (o reanuda) un run.
    ///
    /// Idempotente: un run ya terminal se devuelve sin tocar. Es la frontera
    /// de deduplicación frente a entregas repetidas de la cola.
    pub async fn execute(&self, run_id: Uuid) -> Result<FlowRun, FlowEngineError> {
        let instance = self.load_run(run_id)?;
        if instance.run.status.is_terminal() {
            debug!("engine:execute run={run_id} already {}", instance.run.status.as_str());
            return Ok(instance.run);
        }
        let flow = self.catalog.get_version(instance.run.flow_id, instance.run.version)?;
        let plan = match plan(&flow.spec) {
            Ok(p) => p,
            Err(e) => {
                self.event_store
                    .append_kind(run_id, RunEventKind::RunFailed { node_id: None, error: e.to_string() })?;
                return self.finish(run_id);
            }
        };
        if instance.run.status == crate::model::RunStatus::Queued {
            self.event_store.append_kind(run_id, RunEventKind::RunStarted)?;
        }

        let guard = Arc::new(Guard::new(self.guard_config.clone()));
        guard.set_state(GuardState::RunningTools);
        let ctx = RunContext { run_id,
                               flow_id: flow.id,
                               version: flow.version,
                               trace_id: instance.run.trace_id.clone(),
                               mode: instance.run.mode,
                               trigger: instance.run.trigger.clone(),
                               tenant: instance.run.tenant.clone(),
                               panel: instance.run.panel.clone(),
                               guard: guard.clone() };
        let mut outputs = instance.outputs.clone();
        let mut gated = closed_gates(&instance, &plan);

        for node_id in &plan.order {
            if self.is_canceled(run_id)? {
                info!("engine:execute run={run_id} canceled before node={node_id}");
                return self.finish(run_id);
            }
            if instance.node_status(node_id).is_some_and(NodeStatus::is_completed) {
                continue;
            }
            let Some(node) = flow.spec.node(node_id) else {
                continue;
            };
            if gated.contains(node_id) {
                self.skip(&ctx, node, "gate_closed")?;
                continue;
            }
            if let Some(cond) = &node.condition {
                match condition::evaluate(cond, &outputs) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.skip(&ctx, node, "condition_false")?;
                        continue;
                    }
                    Err(e) => {
                        self.event_store.append_kind(run_id,
                                                     RunEventKind::RunFailed { node_id: Some(node.id.clone()),
                                                                               error: e.to_string() })?;
                        return self.finish(run_id);
                    }
                }
            }
            match self.run_node(&ctx, node, &outputs).await? {
                NodeResult::Success { output, gate_closed } => {
                    if gate_closed {
                        gated.extend(plan.transitive_dependents(node_id));
                    }
                    outputs.insert(node_id.clone(), output);
                }
                NodeResult::Failed(error) => {
                    self.event_store.append_kind(run_id,
                                                 RunEventKind::RunFailed { node_id: Some(node.id.clone()),
                                                                           error })?;
                    guard.set_state(GuardState::Final);
                    return self.finish(run_id);
                }
            }
        }

        let outputs_json: serde_json::Map<String, Value> =
            outputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let outputs_hash = hash_value(&json!({ "engine_version": ENGINE_VERSION, "outputs": outputs_json }));
        self.event_store.append_kind(run_id, RunEventKind::RunCompleted { outputs_hash })?;
        guard.set_state(GuardState::Final);
        self.finish(run_id)
    }

    async fn run_node(&self,
                      ctx: &RunContext,
                      node: &NodeSpec,
                      outputs: &OutputMap)
                      -> Result<NodeResult, FlowEngineError> {
        let run_id = ctx.run_id;
        let connector = match NodeKind::parse(&node.node_type).and_then(|k| self.registry.get(k)) {
            Some(c) => c,
            None => {
                warn!("engine:node run={run_id} node={} no connector for type={}", node.id, node.node_type);
                return Ok(NodeResult::Failed(FlowEngineError::UnknownNodeType(node.node_type.clone()).to_string()));
            }
        };
        let cache_id = Uuid::new_v4();
        self.event_store.append_kind(run_id,
                                     RunEventKind::NodeStarted { node_id: node.id.clone(),
                                                                 node_type: node.node_type.clone(),
                                                                 cache_id })?;
        let params = render_params(&node.params, outputs);
        let started = Instant::now();
        let result = connector.run(node, &params, outputs, ctx).await;
        let duration = started.elapsed();
        let duration_ms = duration.as_millis() as u64;

        match result {
            Ok(outcome) => {
                for log in &outcome.logs {
                    self.event_store.append_with_level(run_id,
                                                       log.level,
                                                       RunEventKind::NodeLog { node_id: Some(node.id.clone()),
                                                                               message: log.message.clone(),
                                                                               data: log.data.clone() })?;
                }
                if outcome.ok {
                    self.event_store.append_kind(run_id,
                                                 RunEventKind::NodeFinished { node_id: node.id.clone(),
                                                                              cache_id,
                                                                              output: outcome.output.clone(),
                                                                              duration_ms })?;
                    self.notify(ctx, node, NodeStatus::Success, duration);
                    debug!("engine:node run={run_id} node={} ok duration_ms={duration_ms}", node.id);
                    Ok(NodeResult::Success { output: outcome.output,
                                             gate_closed: outcome.gate_closed })
                } else {
                    let error = outcome.output
                                       .get("error")
                                       .and_then(Value::as_str)
                                       .map(str::to_string)
                                       .unwrap_or_else(|| "connector returned ok=false".to_string());
                    self.event_store.append_kind(run_id,
                                                 RunEventKind::NodeFailed { node_id: node.id.clone(),
                                                                            cache_id,
                                                                            error: error.clone(),
                                                                            output: Some(outcome.output),
                                                                            duration_ms })?;
                    self.notify(ctx, node, NodeStatus::Failed, duration);
                    warn!("engine:node run={run_id} node={} failed: {error}", node.id);
                    Ok(NodeResult::Failed(error))
                }
            }
            Err(e) => {
                let error = e.to_string();
                self.event_store.append_kind(run_id,
                                             RunEventKind::NodeFailed { node_id: node.id.clone(),
                                                                        cache_id,
                                                                        error: error.clone(),
                                                                        output: Some(json!({ "error": error })),
                                                                        duration_ms })?;
                self.notify(ctx, node, NodeStatus::Failed, duration);
                warn!("engine:node run={run_id} node={} error: {error}", node.id);
                Ok(NodeResult::Failed(error))
            }
        }
    }

    fn skip(&self, ctx: &RunContext, node: &NodeSpec, reason: &str) -> Result<(), FlowEngineError> {
        self.event_store.append_kind(ctx.run_id,
                                     RunEventKind::NodeSkipped { node_id: node.id.clone(),
                                                                 node_type: node.node_type.clone(),
                                                                 cache_id: Uuid::new_v4(),
                                                                 reason: reason.to_string() })?;
        self.notify(ctx, node, NodeStatus::Skipped, Duration::ZERO);
        debug!("engine:node run={} node={} skipped reason={reason}", ctx.run_id, node.id);
        Ok(())
    }

    fn is_canceled(&self, run_id: Uuid) -> Result<bool, FlowEngineError> {
        Ok(self.event_store
               .list(run_id)?
               .iter()
               .any(|e| matches!(e.kind, RunEventKind::RunCanceled { .. })))
    }

    fn notify(&self, ctx: &RunContext, node: &NodeSpec, status: NodeStatus, duration: Duration) {
        if self.observers.is_empty() {
            return;
        }
        let report = NodeReport { run_id: ctx.run_id,
                                  node_id: node.id.clone(),
                                  node_type: node.node_type.clone(),
                                  tenant: ctx.tenant.clone(),
                                  panel: ctx.panel.clone(),
                                  status,
                                  duration };
        for o in &self.observers {
            o.on_node(&report);
        }
    }

    fn finish(&self, run_id: Uuid) -> Result<FlowRun, FlowEngineError> {
        let run = self.load_run(run_id)?.run;
        info!("engine:finish run={run_id} status={} trace={}", run.status.as_str(), run.trace_id);
        for o in &self.observers {
            o.on_run_finished(&run);
        }
        Ok(run)
    }
}

enum NodeResult {
    Success { output: Value, gate_closed: bool },
    Failed(String),
}

/// Dependientes de filtros que ya cerraron su gate en una ejecución previa
/// (reanudación).
fn closed_gates(instance: &RunInstance, plan: &ExecutionPlan) -> HashSet<String> {
    let mut gated = HashSet::new();
    for n in &instance.nodes {
        let closed = n.status == NodeStatus::Success
                     && NodeKind::parse(&n.node_type) == Some(NodeKind::Filter)
                     && n.output.as_ref().and_then(|o| o.get("passed")).and_then(Value::as_bool) == Some(false);
        if closed {
            gated.extend(plan.transitive_dependents(&n.node_id));
        }
    }
    gated
}
