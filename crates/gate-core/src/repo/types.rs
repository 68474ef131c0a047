//! Estado reconstruido de un run (`RunInstance`) a partir de su log.
//!
//! El repositorio aplica un replay lineal: consume eventos en orden y
//! proyecta `FlowRun` + `NodeCache`. El estado del run es monótono: una vez
//! terminal, eventos posteriores no lo cambian.
use uuid::Uuid;

use crate::constants::TRIGGER_KEY;
use crate::event::{RunEvent, RunEventKind};
use crate::model::{FlowRun, NodeCache, NodeStatus, RunStatus};
use crate::node::OutputMap;

#[derive(Debug, Clone, PartialEq)]
pub struct RunInstance {
    pub run: FlowRun,
    /// Una entrada por ejecución de nodo, en orden de inicio.
    pub nodes: Vec<NodeCache>,
    /// `trigger` + outputs de los nodos con éxito.
    pub outputs: OutputMap,
}

impl RunInstance {
    pub fn node(&self, node_id: &str) -> Option<&NodeCache> {
        self.nodes.iter().rev().find(|n| n.node_id == node_id)
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.node(node_id).map(|n| n.status)
    }
}

/// Trait para reconstruir (`replay`) el estado de un run.
pub trait RunRepository: Send + Sync {
    /// `None` si el log no empieza con `RunQueued`.
    fn load(&self, run_id: Uuid, events: &[RunEvent]) -> Option<RunInstance>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayRunRepository;

impl ReplayRunRepository {
    pub fn new() -> Self {
        Self
    }
}

impl RunRepository for ReplayRunRepository {
    fn load(&self, run_id: Uuid, events: &[RunEvent]) -> Option<RunInstance> {
        let first = events.first()?;
        let mut run = match &first.kind {
            RunEventKind::RunQueued { flow_id,
                                      version,
                                      mode,
                                      trigger,
                                      trace_id,
                                      tenant,
                                      panel, } => FlowRun { id: run_id,
                                                            flow_id: *flow_id,
                                                            version: *version,
                                                            status: RunStatus::Queued,
                                                            mode: *mode,
                                                            trigger: trigger.clone(),
                                                            trace_id: trace_id.clone(),
                                                            tenant: tenant.clone(),
                                                            panel: panel.clone(),
                                                            created_at: first.ts,
                                                            started_at: None,
                                                            finished_at: None,
                                                            error: None },
            _ => return None,
        };
        let mut nodes: Vec<NodeCache> = Vec::new();
        let mut outputs = OutputMap::new();
        outputs.insert(TRIGGER_KEY.to_string(), run.trigger.clone());

        for ev in &events[1..] {
            match &ev.kind {
                RunEventKind::RunQueued { .. } | RunEventKind::NodeLog { .. } => {}
                RunEventKind::RunStarted => {
                    if run.status == RunStatus::Queued {
                        run.status = RunStatus::Running;
                        run.started_at = Some(ev.ts);
                    }
                }
                RunEventKind::NodeStarted { node_id, node_type, cache_id } => {
                    nodes.push(NodeCache { id: *cache_id,
                                           run_id,
                                           node_id: node_id.clone(),
                                           node_type: node_type.clone(),
                                           status: NodeStatus::Running,
                                           output: None,
                                           started_at: Some(ev.ts),
                                           finished_at: None,
                                           duration_ms: None,
                                           error: None });
                }
                RunEventKind::NodeFinished { node_id,
                                             cache_id,
                                             output,
                                             duration_ms, } => {
                    if let Some(slot) = nodes.iter_mut().find(|n| n.id == *cache_id) {
                        slot.status = NodeStatus::Success;
                        slot.output = Some(output.clone());
                        slot.finished_at = Some(ev.ts);
                        slot.duration_ms = Some(*duration_ms);
                    }
                    outputs.insert(node_id.clone(), output.clone());
                }
                RunEventKind::NodeSkipped { node_id,
                                            node_type,
                                            cache_id,
                                            reason, } => {
                    nodes.push(NodeCache { id: *cache_id,
                                           run_id,
                                           node_id: node_id.clone(),
                                           node_type: node_type.clone(),
                                           status: NodeStatus::Skipped,
                                           output: None,
                                           started_at: Some(ev.ts),
                                           finished_at: Some(ev.ts),
                                           duration_ms: Some(0),
                                           error: Some(reason.clone()) });
                }
                RunEventKind::NodeFailed { cache_id,
                                           error,
                                           output,
                                           duration_ms,
                                           .. } => {
                    if let Some(slot) = nodes.iter_mut().find(|n| n.id == *cache_id) {
                        slot.status = NodeStatus::Failed;
                        slot.output = output.clone();
                        slot.finished_at = Some(ev.ts);
                        slot.duration_ms = Some(*duration_ms);
                        slot.error = Some(error.clone());
                    }
                }
                RunEventKind::RunCompleted { .. } => finish(&mut run, RunStatus::Success, None, ev),
                RunEventKind::RunFailed { error, .. } => finish(&mut run, RunStatus::Failed, Some(error.clone()), ev),
                RunEventKind::RunCanceled { reason } => finish(&mut run, RunStatus::Canceled, reason.clone(), ev),
            }
        }
        Some(RunInstance { run, nodes, outputs })
    }
}

fn finish(run: &mut FlowRun, status: RunStatus, error: Option<String>, ev: &RunEvent) {
    if run.status.is_terminal() {
        return;
    }
    run.status = status;
    run.error = error;
    run.finished_at = Some(ev.ts);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventStore, InMemoryEventStore};
    use crate::model::RunMode;
    use serde_json::json;

    fn queued(store: &InMemoryEventStore, run_id: Uuid) {
        store.append_kind(run_id,
                         RunEventKind::RunQueued { flow_id: Uuid::new_v4(),
                                                   version: 1,
                                                   mode: RunMode::Live,
                                                   trigger: json!({"text": "hi"}),
                                                   trace_id: "t".into(),
                                                   tenant: "acme".into(),
                                                   panel: "support".into() })
             .unwrap();
    }

    #[test]
    fn replay_projects_nodes_and_outputs() {
        let store = InMemoryEventStore::new();
        let run_id = Uuid::new_v4();
        queued(&store, run_id);
        let cache_id = Uuid::new_v4();
        store.append_kind(run_id, RunEventKind::RunStarted).unwrap();
        store.append_kind(run_id,
                         RunEventKind::NodeStarted { node_id: "n1".into(),
                                                     node_type: "Transform.Map".into(),
                                                     cache_id })
             .unwrap();
        store.append_kind(run_id,
                         RunEventKind::NodeFinished { node_id: "n1".into(),
                                                      cache_id,
                                                      output: json!({"x": 1}),
                                                      duration_ms: 3 })
             .unwrap();
        let inst = ReplayRunRepository.load(run_id, &store.list(run_id).unwrap()).unwrap();
        assert_eq!(inst.run.status, RunStatus::Running);
        assert_eq!(inst.node_status("n1"), Some(NodeStatus::Success));
        assert_eq!(inst.outputs.keys().collect::<Vec<_>>(), vec!["trigger", "n1"]);
    }

    #[test]
    fn terminal_status_is_not_overwritten() {
        let store = InMemoryEventStore::new();
        let run_id = Uuid::new_v4();
        queued(&store, run_id);
        store.append_kind(run_id, RunEventKind::RunCompleted { outputs_hash: "h".into() })
             .unwrap();
        store.append_kind(run_id, RunEventKind::RunCanceled { reason: None }).unwrap();
        let inst = ReplayRunRepository.load(run_id, &store.list(run_id).unwrap()).unwrap();
        assert_eq!(inst.run.status, RunStatus::Success);
    }

    #[test]
    fn log_without_queued_event_is_not_a_run() {
        let store = InMemoryEventStore::new();
        let run_id = Uuid::new_v4();
        store.append_kind(run_id, RunEventKind::RunStarted).unwrap();
        assert!(ReplayRunRepository.load(run_id, &store.list(run_id).unwrap()).is_none());
    }
}
