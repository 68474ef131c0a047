//! Connectors de flow que hablan con agentes, retrieval y comentarios.
//!
//! Todos pasan por el guard del run antes de llamar afuera. En modo dry no
//! se cobra ni se persiste nada.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use gate_core::{Connector, ConnectorError, ConnectorLog, ConnectorOutcome, NodeSpec, OutputMap, RunContext};
use gate_guard::{GuardError, SubagentTask};
use gate_ledger::{BillingManager, LedgerError};
use gate_metrics::MetricsCollector;
use log::{debug, info};
use serde_json::{json, Map, Value};

use crate::agent::AgentInput;
use crate::comments::{Comment, CommentSink};
use crate::knowledge::KnowledgeStore;
use crate::registry::AdapterRegistry;

fn text_param(params: &Value, key: &str) -> Option<String> {
    match params.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn rejected(e: GuardError) -> ConnectorError {
    ConnectorError::Rejected(format!("{} ({})", e, e.code()))
}

/// `Action.NHA.Invoke`: un agente (`params.agent`) o varios en paralelo
/// (`params.agents`, vía la barrera del guard).
#[derive(Debug, Clone)]
pub struct NhaInvokeConnector {
    registry: Arc<AdapterRegistry>,
    billing: Option<Arc<BillingManager>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl NhaInvokeConnector {
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self { registry,
               billing: None,
               metrics: None }
    }

    pub fn with_billing(mut self, billing: Arc<BillingManager>) -> Self {
        self.billing = Some(billing);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Cobra al tenant del run. La clave de idempotencia ata el cobro al
    /// nodo: reanudar un run no cobra dos veces.
    fn charge(&self, node: &NodeSpec, ctx: &RunContext, agent: &str, cost: i64) -> Result<(), ConnectorError> {
        let Some(billing) = self.billing.as_ref() else {
            return Ok(());
        };
        if ctx.is_dry() || cost <= 0 {
            return Ok(());
        }
        let key = format!("{}:{}:{agent}", ctx.run_id, node.id);
        let meta = json!({ "run_id": ctx.run_id, "node_id": node.id, "trace_id": ctx.trace_id });
        match billing.debit(&ctx.tenant, cost, &format!("nha:{agent}"), meta, Some(key)) {
            Ok(_) => Ok(()),
            Err(LedgerError::DuplicateIdempotencyKey { .. }) => {
                debug!("nha:invoke already charged run={} node={}", ctx.run_id, node.id);
                Ok(())
            }
            Err(e @ LedgerError::QuotaExceeded { .. }) => Err(ConnectorError::Quota(e.to_string())),
            Err(e) => Err(ConnectorError::Failure(e.to_string())),
        }
    }

    fn observe(&self, agent: &str, ctx: &RunContext, elapsed: Duration, ok: bool) {
        if let Some(m) = self.metrics.as_ref() {
            m.record_agent_call(agent, &ctx.panel, elapsed, ok);
        }
    }

    async fn invoke_one(&self,
                        node: &NodeSpec,
                        params: &Value,
                        ctx: &RunContext,
                        agent: &str)
                        -> Result<ConnectorOutcome, ConnectorError> {
        let adapter = self.registry
                          .resolve(agent)
                          .map_err(|e| ConnectorError::InvalidParams(e.to_string()))?
                          .clone();
        let text = text_param(params, "text").unwrap_or_default();
        let input = AgentInput { text,
                                 params: params.clone() };
        adapter.validate(&input).map_err(|e| ConnectorError::InvalidParams(e.to_string()))?;
        ctx.guard.check_tool_call(agent, &input.text, params, Some(&node.id)).map_err(rejected)?;
        self.charge(node, ctx, agent, adapter.cost())?;

        let started = Instant::now();
        let result = {
            let _depth = ctx.guard.enter_depth().map_err(rejected)?;
            adapter.process(&input).await
        };
        let elapsed = started.elapsed();
        let result = match result {
            Ok(r) => r,
            Err(e) => {
                self.observe(agent, ctx, elapsed, false);
                ctx.guard.record_tool_failure(agent, false);
                return Err(ConnectorError::Failure(e.to_string()));
            }
        };
        self.observe(agent, ctx, elapsed, !result.degraded);

        let mut output = result.to_output();
        if let Value::Object(map) = &mut output {
            map.insert("cost".into(), json!(if ctx.is_dry() { 0 } else { result.cost }));
        }
        let mut outcome = ConnectorOutcome::ok(output);
        if result.degraded {
            ctx.guard.record_tool_failure(agent, false);
            outcome = outcome.with_log(ConnectorLog::warn("agent degraded", json!({ "agent": agent })));
        }
        Ok(outcome)
    }

    async fn invoke_many(&self,
                         node: &NodeSpec,
                         params: &Value,
                         ctx: &RunContext,
                         agents: &[String])
                         -> Result<ConnectorOutcome, ConnectorError> {
        let text = text_param(params, "text").unwrap_or_default();
        let mut tasks = Vec::with_capacity(agents.len());
        for agent in agents {
            let adapter = self.registry
                              .resolve(agent)
                              .map_err(|e| ConnectorError::InvalidParams(e.to_string()))?
                              .clone();
            let input = AgentInput { text: text.clone(),
                                     params: params.clone() };
            adapter.validate(&input).map_err(|e| ConnectorError::InvalidParams(e.to_string()))?;
            ctx.guard.check_tool_call(agent, &text, params, Some(&node.id)).map_err(rejected)?;
            self.charge(node, ctx, agent, adapter.cost())?;
            tasks.push(SubagentTask::new(agent.clone(), async move {
                           adapter.process(&input)
                                  .await
                                  .map(|r| r.to_output())
                                  .map_err(|e| e.to_string())
                       }));
        }
        let timeout = params.get("timeout_ms").and_then(Value::as_u64).map(Duration::from_millis);
        let started = Instant::now();
        let results = match ctx.guard.run_subagents_with_barrier(tasks, timeout).await {
            Ok(r) => r,
            Err(GuardError::BarrierTimeout { timeout_ms }) => {
                for agent in agents {
                    self.observe(agent, ctx, started.elapsed(), false);
                }
                return Err(ConnectorError::Timeout(timeout_ms));
            }
            Err(e) => return Err(rejected(e)),
        };
        let elapsed = started.elapsed();

        let mut merged = Map::new();
        let mut failures = Map::new();
        let mut any_degraded = false;
        for (agent, res) in agents.iter().zip(results) {
            match res {
                Ok(out) => {
                    let degraded = out.get("degraded").and_then(Value::as_bool).unwrap_or(false);
                    if degraded {
                        ctx.guard.record_tool_failure(agent, false);
                    }
                    any_degraded |= degraded;
                    self.observe(agent, ctx, elapsed, !degraded);
                    merged.insert(agent.clone(), out);
                }
                Err(e) => {
                    self.observe(agent, ctx, elapsed, false);
                    failures.insert(agent.clone(), json!(e));
                }
            }
        }
        if !failures.is_empty() {
            return Ok(ConnectorOutcome::failed(json!({ "results": merged,
                                                       "errors": failures,
                                                       "error": "sub-agent failure" })));
        }
        Ok(ConnectorOutcome::ok(json!({ "results": merged, "degraded": any_degraded })))
    }
}

#[async_trait]
impl Connector for NhaInvokeConnector {
    async fn run(&self,
                 node: &NodeSpec,
                 params: &Value,
                 _outputs: &OutputMap,
                 ctx: &RunContext)
                 -> Result<ConnectorOutcome, ConnectorError> {
        if let Some(list) = params.get("agents").and_then(Value::as_array) {
            let agents: Vec<String> = list.iter().filter_map(Value::as_str).map(str::to_string).collect();
            if agents.is_empty() {
                return Err(ConnectorError::InvalidParams("`agents` must list agent names".into()));
            }
            return self.invoke_many(node, params, ctx, &agents).await;
        }
        let agent = params.get("agent")
                          .and_then(Value::as_str)
                          .ok_or_else(|| ConnectorError::InvalidParams("`agent` is required".into()))?;
        self.invoke_one(node, params, ctx, agent).await
    }
}

/// `Action.RAG.Query`: `params.q`, `params.k` (3) y `params.panel` (panel del
/// flow por defecto).
#[derive(Debug, Clone)]
pub struct RagQueryConnector {
    store: Arc<KnowledgeStore>,
}

impl RagQueryConnector {
    pub const TOOL: &'static str = "rag.query";

    pub fn new(store: Arc<KnowledgeStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Connector for RagQueryConnector {
    async fn run(&self,
                 node: &NodeSpec,
                 params: &Value,
                 _outputs: &OutputMap,
                 ctx: &RunContext)
                 -> Result<ConnectorOutcome, ConnectorError> {
        let q = text_param(params, "q").ok_or_else(|| ConnectorError::InvalidParams("`q` is required".into()))?;
        let k = params.get("k").and_then(Value::as_u64).unwrap_or(3) as usize;
        let panel = params.get("panel")
                          .and_then(Value::as_str)
                          .unwrap_or(&ctx.panel)
                          .to_string();
        ctx.guard.check_tool_call(Self::TOOL, &q, params, Some(&node.id)).map_err(rejected)?;
        let result = self.store
                         .query(&panel, &q, k)
                         .await
                         .map_err(|e| ConnectorError::InvalidParams(e.to_string()))?;
        let output = serde_json::to_value(&result).map_err(|e| ConnectorError::Failure(e.to_string()))?;
        let mut outcome = ConnectorOutcome::ok(output);
        if result.degraded {
            outcome = outcome.with_log(ConnectorLog::warn("retrieval degraded: hash embeddings",
                                                          json!({ "panel": panel })));
        }
        Ok(outcome)
    }
}

/// `Action.Comment.Post`: publica `params.body` en el hilo `params.post_id`.
/// En modo dry sólo deja un log.
#[derive(Debug, Clone)]
pub struct CommentPostConnector {
    sink: Arc<dyn CommentSink>,
}

impl CommentPostConnector {
    pub fn new(sink: Arc<dyn CommentSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Connector for CommentPostConnector {
    async fn run(&self,
                 _node: &NodeSpec,
                 params: &Value,
                 _outputs: &OutputMap,
                 ctx: &RunContext)
                 -> Result<ConnectorOutcome, ConnectorError> {
        let post_id = text_param(params, "post_id").ok_or_else(|| {
                                                        ConnectorError::InvalidParams("`post_id` is required".into())
                                                    })?;
        let body =
            text_param(params, "body").ok_or_else(|| ConnectorError::InvalidParams("`body` is required".into()))?;
        let author = params.get("author").and_then(Value::as_str).unwrap_or("nha");

        if ctx.is_dry() {
            return Ok(ConnectorOutcome::ok(json!({ "posted": false, "dry": true, "post_id": post_id, "body": body }))
                      .with_log(ConnectorLog::info("dry run: comment not persisted",
                                                   json!({ "post_id": post_id }))));
        }
        let comment = self.sink
                          .post(Comment::new(post_id, author, body, ctx.trace_id.clone()))
                          .await
                          .map_err(|e| ConnectorError::Failure(e.to_string()))?;
        info!("comment:post post={} comment={} trace={}", comment.post_id, comment.id, ctx.trace_id);
        Ok(ConnectorOutcome::ok(json!({ "posted": true, "comment_id": comment.id, "post_id": comment.post_id })))
    }
}
