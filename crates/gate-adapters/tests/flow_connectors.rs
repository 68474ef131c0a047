use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gate_adapters::{AdapterError, AdapterRegistry, AgentInput, AgentKind, AgentResult, CommentPostConnector,
                    CommentSink, InMemoryCommentSink, KnowledgeStore, NhaAdapter, NhaInvokeConnector,
                    RagQueryConnector};
use gate_core::{Connector, ConnectorError, EdgeSpec, FlowEngine, FlowSpec, InMemoryEventStore, NodeKind, NodeSpec,
                NodeStatus, OutputMap, ReplayRunRepository, RunContext, RunMode, RunStatus};
use gate_guard::{Guard, GuardConfig};
use gate_ledger::{BillingManager, InMemoryLedgerStore, Ledger, QuotaLimits};
use gate_metrics::{DimensionKind, MetricsCollector};
use serde_json::{json, Value};

type Engine = FlowEngine<InMemoryEventStore, ReplayRunRepository>;

struct Fixture {
    engine: Engine,
    billing: Arc<BillingManager>,
    comments: Arc<InMemoryCommentSink>,
    knowledge: Arc<KnowledgeStore>,
    metrics: Arc<MetricsCollector>,
}

fn fixture(limits: QuotaLimits) -> Fixture {
    let billing = Arc::new(BillingManager::new(Ledger::new(Arc::new(InMemoryLedgerStore::new())), limits));
    let comments = Arc::new(InMemoryCommentSink::new());
    let knowledge = Arc::new(KnowledgeStore::default());
    let metrics = Arc::new(MetricsCollector::default());
    let invoke = NhaInvokeConnector::new(Arc::new(AdapterRegistry::lexicon())).with_billing(billing.clone())
                                                                              .with_metrics(metrics.clone());
    let engine = FlowEngine::in_memory().with_builtin_connectors(Duration::from_millis(10))
                                        .connector(NodeKind::NhaInvoke, Arc::new(invoke))
                                        .connector(NodeKind::RagQuery, Arc::new(RagQueryConnector::new(knowledge.clone())))
                                        .connector(NodeKind::CommentPost,
                                                   Arc::new(CommentPostConnector::new(comments.clone())))
                                        .build();
    Fixture { engine,
              billing,
              comments,
              knowledge,
              metrics }
}

fn limits(soft: i64, hard: i64) -> QuotaLimits {
    QuotaLimits { soft_limit: soft,
                  hard_limit: hard }
}

fn active_flow(engine: &Engine, spec: FlowSpec) -> uuid::Uuid {
    let flow = engine.catalog().create("flow", "acme", "support", spec).unwrap();
    engine.catalog().set_active(flow.id, true).unwrap();
    flow.id
}

fn sentiment(id: &str) -> NodeSpec {
    NodeSpec::new(id,
                  "Action.NHA.Invoke",
                  json!({"agent": "sentiment", "text": "{{trigger.text}}"}))
}

#[tokio::test]
async fn sentiment_node_produces_label() {
    let f = fixture(QuotaLimits::default());
    let flow_id = active_flow(&f.engine,
                              FlowSpec { nodes: vec![sentiment("n1")],
                                         edges: vec![] });
    let run = f.engine.run(flow_id, RunMode::Live, json!({"text": "great product"})).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    let inst = f.engine.load_run(run.id).unwrap();
    let n1 = inst.node("n1").unwrap();
    assert_eq!(n1.status, NodeStatus::Success);
    let out = n1.output.as_ref().unwrap();
    assert_eq!(out["label"], "positive");
    assert_eq!(out["cost"], 1);
    assert_eq!(f.billing.get_balance("acme").unwrap(), -1);
    let snap = f.metrics.snapshot();
    assert_eq!(snap.get(DimensionKind::Agent, "sentiment").unwrap().requests, 1);
    assert_eq!(snap.get(DimensionKind::Panel, "support").unwrap().requests, 1);
}

#[tokio::test]
async fn low_score_skips_conditioned_node() {
    let f = fixture(QuotaLimits::default());
    let spec = FlowSpec { nodes: vec![sentiment("n1"),
                                      NodeSpec::new("n2",
                                                    "Action.Comment.Post",
                                                    json!({"post_id": "p1", "body": "{{n1.label}}"}))
                                      .with_condition("n1.score > 0.9")],
                          edges: vec![EdgeSpec::new("n1", "n2")] };
    let flow_id = active_flow(&f.engine, spec);
    let run = f.engine.run(flow_id, RunMode::Live, json!({"text": "the product"})).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    let inst = f.engine.load_run(run.id).unwrap();
    assert_eq!(inst.node("n1").unwrap().output.as_ref().unwrap()["score"], 0.5);
    assert_eq!(inst.node_status("n2"), Some(NodeStatus::Skipped));
    assert!(f.comments.list("p1").await.unwrap().is_empty());
}

#[tokio::test]
async fn live_run_posts_comment_and_dry_run_does_not_persist() {
    let f = fixture(QuotaLimits::default());
    let spec = FlowSpec { nodes: vec![sentiment("n1"),
                                      NodeSpec::new("reply",
                                                    "Action.Comment.Post",
                                                    json!({"post_id": "{{trigger.post_id}}",
                                                           "body": "Sentiment: {{n1.label}}",
                                                           "author": "sentiment"}))],
                          edges: vec![EdgeSpec::new("n1", "reply")] };
    let flow_id = active_flow(&f.engine, spec);
    let trigger = json!({"text": "awesome support", "post_id": "post-7"});

    let dry = f.engine.run(flow_id, RunMode::Dry, trigger.clone()).await.unwrap();
    assert_eq!(dry.status, RunStatus::Success);
    assert!(f.comments.list("post-7").await.unwrap().is_empty());
    assert_eq!(f.billing.get_balance("acme").unwrap(), 0);
    let dry_out = f.engine.load_run(dry.id).unwrap().node("reply").unwrap().output.clone().unwrap();
    assert_eq!(dry_out["dry"], true);

    let live = f.engine.run(flow_id, RunMode::Live, trigger).await.unwrap();
    assert_eq!(live.status, RunStatus::Success);
    let thread = f.comments.list("post-7").await.unwrap();
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].body, "Sentiment: positive");
    assert_eq!(thread[0].trace_id, live.trace_id);
}

#[tokio::test]
async fn hard_limit_fails_the_node_without_charging() {
    let f = fixture(limits(1, 2));
    f.billing.debit("acme", 2, "earlier", Value::Null, None).unwrap();
    let flow_id = active_flow(&f.engine,
                              FlowSpec { nodes: vec![sentiment("n1")],
                                         edges: vec![] });
    let run = f.engine.run(flow_id, RunMode::Live, json!({"text": "great"})).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("quota exceeded"));
    assert_eq!(f.billing.get_balance("acme").unwrap(), -2);
}

#[tokio::test]
async fn guard_budget_rejects_ninth_call_in_a_run() {
    let f = fixture(QuotaLimits::default());
    let nodes: Vec<NodeSpec> = (0..9).map(|i| sentiment(&format!("s{i}"))).collect();
    let edges: Vec<EdgeSpec> = (1..9).map(|i| EdgeSpec::new(format!("s{}", i - 1), format!("s{i}"))).collect();
    let flow_id = active_flow(&f.engine, FlowSpec { nodes, edges });
    let run = f.engine.run(flow_id, RunMode::Dry, json!({"text": "good"})).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("tool_budget_exceeded"));
    let inst = f.engine.load_run(run.id).unwrap();
    assert_eq!(inst.node_status("s7"), Some(NodeStatus::Success));
    assert_eq!(inst.node_status("s8"), Some(NodeStatus::Failed));
}

#[tokio::test]
async fn fan_out_runs_agents_behind_the_barrier() {
    let f = fixture(QuotaLimits::default());
    let spec = FlowSpec { nodes: vec![NodeSpec::new("multi",
                                                    "Action.NHA.Invoke",
                                                    json!({"agents": ["sentiment", "tag"],
                                                           "text": "{{trigger.text}}"}))],
                          edges: vec![] };
    let flow_id = active_flow(&f.engine, spec);
    let run = f.engine
               .run(flow_id, RunMode::Live, json!({"text": "billing invoice billing great"}))
               .await
               .unwrap();
    assert_eq!(run.status, RunStatus::Success);
    let out = f.engine.load_run(run.id).unwrap().node("multi").unwrap().output.clone().unwrap();
    assert_eq!(out["results"]["sentiment"]["label"], "positive");
    assert_eq!(out["results"]["tag"]["tags"][0], "billing");
    assert_eq!(f.billing.get_balance("acme").unwrap(), -2);
}

#[tokio::test]
async fn rag_query_reads_flow_panel() {
    let f = fixture(QuotaLimits::default());
    f.knowledge.ingest("support", "refunds are processed in five days").await.unwrap();
    f.knowledge.ingest("support", "password reset link expires").await.unwrap();
    let spec = FlowSpec { nodes: vec![NodeSpec::new("rag",
                                                    "Action.RAG.Query",
                                                    json!({"q": "{{trigger.q}}", "k": 1}))],
                          edges: vec![] };
    let flow_id = active_flow(&f.engine, spec);
    let run = f.engine.run(flow_id, RunMode::Live, json!({"q": "refunds processed"})).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    let out = f.engine.load_run(run.id).unwrap().node("rag").unwrap().output.clone().unwrap();
    assert_eq!(out["panel"], "support");
    assert_eq!(out["hits"][0]["text"], "refunds are processed in five days");
    assert_eq!(out["degraded"], true);
}

/// Agente cuyo `process` siempre falla después de validar.
#[derive(Debug)]
struct BrokenSentiment;

#[async_trait]
impl NhaAdapter for BrokenSentiment {
    fn kind(&self) -> AgentKind {
        AgentKind::Sentiment
    }

    async fn process(&self, input: &AgentInput) -> Result<AgentResult, AdapterError> {
        self.validate(input)?;
        Err(AdapterError::Upstream("socket closed".into()))
    }
}

fn run_context() -> RunContext {
    RunContext { run_id: uuid::Uuid::new_v4(),
                 flow_id: uuid::Uuid::new_v4(),
                 version: 1,
                 trace_id: "trace".into(),
                 mode: RunMode::Live,
                 trigger: json!({}),
                 tenant: "acme".into(),
                 panel: "support".into(),
                 guard: Arc::new(Guard::new(GuardConfig::default())) }
}

#[tokio::test]
async fn adapter_failure_is_a_connector_failure_seen_by_the_guard() {
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(BrokenSentiment));
    let metrics = Arc::new(MetricsCollector::default());
    let connector = NhaInvokeConnector::new(Arc::new(registry)).with_metrics(metrics.clone());
    let ctx = run_context();
    let params = json!({ "agent": "sentiment", "text": "fine" });
    let err = connector.run(&sentiment("n1"), &params, &OutputMap::new(), &ctx).await.unwrap_err();
    assert!(matches!(err, ConnectorError::Failure(ref m) if m.contains("socket closed")));

    let snap = ctx.guard.snapshot();
    let breaker = snap.breakers.iter().find(|b| b.tool == "sentiment").unwrap();
    assert_eq!(breaker.failures, 1);
    assert_eq!(metrics.snapshot().get(DimensionKind::Agent, "sentiment").unwrap().errors, 1);
}

#[tokio::test]
async fn empty_text_is_invalid_params_and_costs_nothing() {
    let billing = Arc::new(BillingManager::new(Ledger::new(Arc::new(InMemoryLedgerStore::new())),
                                               QuotaLimits::default()));
    let metrics = Arc::new(MetricsCollector::default());
    let connector = NhaInvokeConnector::new(Arc::new(AdapterRegistry::lexicon())).with_billing(billing.clone())
                                                                                .with_metrics(metrics.clone());
    let ctx = run_context();
    let params = json!({ "agent": "sentiment", "text": "  " });
    let err = connector.run(&sentiment("n1"), &params, &OutputMap::new(), &ctx).await.unwrap_err();
    assert!(matches!(err, ConnectorError::InvalidParams(_)));
    assert!(ctx.guard.snapshot().breakers.is_empty());
    assert!(metrics.snapshot().get(DimensionKind::Agent, "sentiment").is_none());
    assert_eq!(billing.get_balance("acme").unwrap(), 0);
}
