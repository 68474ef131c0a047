use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gate_core::{EdgeSpec, FlowEngine, FlowSpec, InMemoryEventStore, NodeSpec, ReplayRunRepository, RunEventKind,
                RunMode, RunStatus};
use gate_worker::{FlowJob, FlowJobHandler, FlowWorker, InMemoryStream, JobHandler, JobOutcome, JobStream,
                  WorkerConfig, WorkerError, FLOW_JOBS_STREAM};
use serde_json::{json, Value};
use tokio::sync::watch;

type Engine = FlowEngine<InMemoryEventStore, ReplayRunRepository>;

fn engine() -> Arc<Engine> {
    Arc::new(FlowEngine::in_memory().with_builtin_connectors(Duration::from_millis(5)).build())
}

fn config(consumer: &str) -> WorkerConfig {
    let mut cfg = WorkerConfig::new(FLOW_JOBS_STREAM, "workers", consumer);
    cfg.block = Duration::from_millis(20);
    cfg.min_idle = Duration::ZERO;
    cfg.max_deliveries = 3;
    cfg.retry_backoff = Duration::from_millis(5);
    cfg
}

fn job_for(engine: &Engine) -> FlowJob {
    let spec = FlowSpec { nodes: vec![NodeSpec::new("t", "Trigger", json!({})),
                                      NodeSpec::new("m", "Transform.Map", json!({"fields": {"v": "{{t.v}}"}}))],
                          edges: vec![EdgeSpec::new("t", "m")] };
    let flow = engine.catalog().create("w", "acme", "ops", spec).unwrap();
    engine.catalog().set_active(flow.id, true).unwrap();
    let run = engine.enqueue(flow.id, None, RunMode::Live, json!({"v": 7}), None).unwrap();
    FlowJob { run_id: run.id,
              flow_id: run.flow_id,
              version: run.version,
              mode: run.mode,
              trace_id: run.trace_id }
}

#[derive(Debug, Default)]
struct Flaky {
    calls: AtomicU32,
}

#[async_trait]
impl JobHandler for Flaky {
    async fn handle(&self, _payload: &Value) -> Result<JobOutcome, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(WorkerError::Transient("db unavailable".into()))
    }
}

#[tokio::test]
async fn flow_job_is_executed_and_acked() {
    let engine = engine();
    let stream = Arc::new(InMemoryStream::new());
    let job = job_for(&engine);
    let worker = FlowWorker::new(config("w1"), stream.clone(), Arc::new(FlowJobHandler::new(engine.clone())));
    stream.ensure_group(FLOW_JOBS_STREAM, "workers").await.unwrap();
    stream.append(FLOW_JOBS_STREAM, serde_json::to_value(&job).unwrap()).await.unwrap();

    let stats = worker.poll_once().await.unwrap();
    assert_eq!((stats.received, stats.acked), (1, 1));
    assert_eq!(stream.pending_count(FLOW_JOBS_STREAM, "workers").await.unwrap(), 0);
    let inst = engine.load_run(job.run_id).unwrap();
    assert_eq!(inst.run.status, RunStatus::Success);
    assert_eq!(inst.outputs.get("m"), Some(&json!({"v": 7})));
}

#[tokio::test]
async fn redelivered_job_does_not_rerun_nodes() {
    let engine = engine();
    let stream = Arc::new(InMemoryStream::new());
    let job = job_for(&engine);
    let worker = FlowWorker::new(config("w1"), stream.clone(), Arc::new(FlowJobHandler::new(engine.clone())));
    stream.ensure_group(FLOW_JOBS_STREAM, "workers").await.unwrap();
    let payload = serde_json::to_value(&job).unwrap();
    stream.append(FLOW_JOBS_STREAM, payload.clone()).await.unwrap();
    stream.append(FLOW_JOBS_STREAM, payload).await.unwrap();

    let stats = worker.poll_once().await.unwrap();
    assert_eq!(stats.acked, 2);
    let started = engine.list_events(job.run_id)
                        .unwrap()
                        .iter()
                        .filter(|e| matches!(e.kind, RunEventKind::NodeStarted { .. }))
                        .count();
    assert_eq!(started, 2);
}

#[tokio::test]
async fn transient_errors_are_reclaimed_then_dead_lettered() {
    let stream = Arc::new(InMemoryStream::new());
    let handler = Arc::new(Flaky::default());
    let w1 = FlowWorker::new(config("w1"), stream.clone(), handler.clone());
    let w2 = FlowWorker::new(config("w2"), stream.clone(), handler.clone());
    stream.ensure_group(FLOW_JOBS_STREAM, "workers").await.unwrap();
    stream.append(FLOW_JOBS_STREAM, json!({"run_id": "x"})).await.unwrap();

    let first = w1.poll_once().await.unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(stream.pending_count(FLOW_JOBS_STREAM, "workers").await.unwrap(), 1);

    // otro consumidor reclama el pendiente (entregas 2 y 3)
    assert_eq!(w2.poll_once().await.unwrap().retried, 1);
    assert_eq!(w1.poll_once().await.unwrap().retried, 1);
    let last = w2.poll_once().await.unwrap();
    assert_eq!(last.dead_lettered, 1);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert_eq!(stream.pending_count(FLOW_JOBS_STREAM, "workers").await.unwrap(), 0);
    assert_eq!(stream.len("flow_jobs:dead"), 1);
}

#[tokio::test]
async fn unknown_run_is_permanent_and_acked() {
    let engine = engine();
    let stream = Arc::new(InMemoryStream::new());
    let worker = FlowWorker::new(config("w1"), stream.clone(), Arc::new(FlowJobHandler::new(engine)));
    stream.ensure_group(FLOW_JOBS_STREAM, "workers").await.unwrap();
    let ghost = FlowJob { run_id: uuid::Uuid::new_v4(),
                          flow_id: uuid::Uuid::new_v4(),
                          version: 1,
                          mode: RunMode::Live,
                          trace_id: "t".into() };
    stream.append(FLOW_JOBS_STREAM, serde_json::to_value(&ghost).unwrap()).await.unwrap();
    stream.append(FLOW_JOBS_STREAM, json!({"not": "a job"})).await.unwrap();
    let stats = worker.poll_once().await.unwrap();
    assert_eq!(stats.dead_lettered, 2);
    assert_eq!(stream.pending_count(FLOW_JOBS_STREAM, "workers").await.unwrap(), 0);
}

#[tokio::test]
async fn run_loop_drains_and_stops_on_shutdown() {
    let engine = engine();
    let stream = Arc::new(InMemoryStream::new());
    let job = job_for(&engine);
    let worker = Arc::new(FlowWorker::new(config("w1"),
                                          stream.clone(),
                                          Arc::new(FlowJobHandler::new(engine.clone()))));
    let (tx, rx) = watch::channel(false);
    let handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run(rx).await })
    };
    // el grupo lo crea el propio worker al arrancar
    tokio::time::sleep(Duration::from_millis(10)).await;
    stream.append(FLOW_JOBS_STREAM, serde_json::to_value(&job).unwrap()).await.unwrap();
    for _ in 0..100 {
        if engine.load_run(job.run_id).unwrap().run.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    let total = handle.await.unwrap().unwrap();
    assert_eq!(total.acked, 1);
    assert_eq!(engine.load_run(job.run_id).unwrap().run.status, RunStatus::Success);
}
