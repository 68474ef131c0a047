mod test_support;

use std::sync::Arc;
use std::time::Duration;

use gate_core::{EdgeSpec, EventStore, FlowEngine, FlowSpec, NodeSpec, ReplayRunRepository, RunEventKind, RunMode,
                RunStatus};
use gate_persistence::{PgEventStore, PoolProvider};
use serde_json::json;
use test_support::with_pool;
use uuid::Uuid;

#[test]
fn seq_is_dense_per_run_and_replays_in_order() {
    with_pool(|pool| {
        let store = PgEventStore::new(PoolProvider::new(pool.clone()));
        let run_id = Uuid::new_v4();
        let a = store.append_kind(run_id, RunEventKind::RunStarted).unwrap();
        let b = store.append_kind(run_id,
                                  RunEventKind::NodeLog { node_id: Some("n".into()),
                                                          message: "hola".into(),
                                                          data: json!({"k": 1}) })
                     .unwrap();
        let c = store.append_kind(run_id, RunEventKind::RunCanceled { reason: None }).unwrap();
        assert_eq!((a.seq, b.seq, c.seq), (0, 1, 2));

        let listed = store.list(run_id).unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[1].kind, b.kind);
        assert_eq!(listed[2].level, gate_core::EventLevel::Warn);
        assert!(store.list(Uuid::new_v4()).unwrap().is_empty());
    });
}

#[test]
fn concurrent_appends_keep_a_total_order() {
    with_pool(|pool| {
        let store = Arc::new(PgEventStore::new(PoolProvider::new(pool.clone())));
        let run_id = Uuid::new_v4();
        let handles: Vec<_> = (0..4).map(|i| {
                                        let store = store.clone();
                                        std::thread::spawn(move || {
                                            store.append_kind(run_id,
                                                              RunEventKind::NodeLog { node_id: None,
                                                                                      message: format!("t{i}"),
                                                                                      data: json!(null) })
                                        })
                                    })
                                    .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }
        let seqs: Vec<u64> = store.list(run_id).unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    });
}

#[tokio::test]
async fn engine_runs_on_postgres_events() {
    let Some(store) = with_pool(|pool| PgEventStore::new(PoolProvider::new(pool.clone()))) else {
        return;
    };
    let engine = FlowEngine::builder(store, ReplayRunRepository::new()).with_builtin_connectors(Duration::from_millis(5))
                                                                       .build();
    let spec = FlowSpec { nodes: vec![NodeSpec::new("t", "Trigger", json!({})),
                                      NodeSpec::new("m", "Transform.Map", json!({"fields": {"x": "{{t.x}}"}}))],
                          edges: vec![EdgeSpec::new("t", "m")] };
    let flow = engine.catalog().create("pg", "acme", "ops", spec).unwrap();
    engine.catalog().set_active(flow.id, true).unwrap();
    let run = engine.enqueue(flow.id, None, RunMode::Live, json!({"x": 3}), None).unwrap();
    let done = engine.execute(run.id).await.unwrap();
    assert_eq!(done.status, RunStatus::Success);

    let inst = engine.load_run(run.id).unwrap();
    assert_eq!(inst.outputs.get("m"), Some(&json!({"x": 3})));
}
