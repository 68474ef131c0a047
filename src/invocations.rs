//! Invocación directa de agentes sobre un post.
//!
//! Cada agente pedido genera una `Invocation` en `queued`, se cobra con la
//! clave `inv:{id}`, se procesa y deja un comentario en el hilo del post. En
//! modo asíncrono el procesamiento lo hace el worker de `invocation_jobs`;
//! una invocación que ya no está en `queued` se salta, así que las
//! reentregas no cobran ni comentan dos veces.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use gate_adapters::{AdapterError, AdapterRegistry, AgentInput, AgentKind, Comment, CommentSink, InvocationStore};
use gate_ledger::{BillingManager, LedgerError, QuotaStatus};
use gate_metrics::{DimensionKind, MetricsCollector};
use gate_worker::{decode, InvocationJob, JobHandler, JobOutcome, JobStream, WorkerError, INVOCATION_JOBS_STREAM};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::errors::ApiError;

pub use gate_adapters::{Invocation, InvocationStatus};

/// Agentes usados cuando la petición no nombra ninguno.
pub const DEFAULT_AGENTS: [AgentKind; 3] = [AgentKind::Sentiment, AgentKind::Summarize, AgentKind::Tag];

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Post {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub panel: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InvokeRequest {
    pub post: Post,
    #[serde(default)]
    pub agents: Vec<String>,
    /// Tenant u org a facturar; `public` si se omite.
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
    /// Encola las invocaciones en vez de procesarlas en la petición.
    #[serde(default, rename = "async")]
    pub defer: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvokeResponse {
    pub post_id: String,
    pub invocations: Vec<Invocation>,
    pub ledger_delta: i64,
    pub trace_id: String,
    /// El uso quedó sobre el límite blando.
    pub quota_warning: bool,
}

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invocation {0} not found")]
    NotFound(Uuid),
    #[error("circuit open for agent `{0}`")]
    CircuitOpen(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Queue(#[from] WorkerError),
}

impl From<InvocationError> for ApiError {
    fn from(e: InvocationError) -> Self {
        match e {
            InvocationError::Validation(msg) => ApiError::validation(msg),
            InvocationError::NotFound(_) => ApiError::not_found(e.to_string()),
            InvocationError::CircuitOpen(_) => ApiError::unavailable("circuit_open", e.to_string()),
            InvocationError::Adapter(inner) => inner.into(),
            InvocationError::Ledger(inner) => inner.into(),
            InvocationError::Queue(inner) => inner.into(),
        }
    }
}

/// Texto corto publicado como comentario según la salida del agente.
fn comment_body(agent: &str, output: &Value) -> String {
    let detail = if let Some(label) = output.get("label").and_then(Value::as_str) {
        match output.get("score").and_then(Value::as_f64) {
            Some(score) => format!("{label} ({score:.2})"),
            None => label.to_string(),
        }
    } else if let Some(summary) = output.get("summary").and_then(Value::as_str) {
        summary.to_string()
    } else if let Some(tags) = output.get("tags").and_then(Value::as_array) {
        tags.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(", ")
    } else if let Some(text) = output.get("text").and_then(Value::as_str) {
        text.to_string()
    } else {
        output.to_string()
    };
    format!("[{agent}] {detail}")
}

#[derive(Debug)]
pub struct InvocationService {
    adapters: Arc<AdapterRegistry>,
    billing: Arc<BillingManager>,
    comments: Arc<dyn CommentSink>,
    metrics: Arc<MetricsCollector>,
    stream: Arc<dyn JobStream>,
    store: Arc<dyn InvocationStore>,
}

impl InvocationService {
    pub fn new(adapters: Arc<AdapterRegistry>,
               billing: Arc<BillingManager>,
               comments: Arc<dyn CommentSink>,
               metrics: Arc<MetricsCollector>,
               stream: Arc<dyn JobStream>,
               store: Arc<dyn InvocationStore>)
               -> Self {
        Self { adapters,
               billing,
               comments,
               metrics,
               stream,
               store }
    }

    pub fn get(&self, id: Uuid) -> Result<Invocation, InvocationError> {
        self.store.get(id)?.ok_or(InvocationError::NotFound(id))
    }

    /// Invocaciones de un post, en orden de creación.
    pub fn list_by_post(&self, post_id: &str) -> Result<Vec<Invocation>, InvocationError> {
        Ok(self.store.list_by_post(post_id)?)
    }

    fn resolve_agents(&self, requested: &[String]) -> Result<Vec<AgentKind>, InvocationError> {
        if requested.is_empty() {
            return Ok(DEFAULT_AGENTS.to_vec());
        }
        let mut kinds = Vec::with_capacity(requested.len());
        for name in requested {
            let kind = self.adapters.resolve(name)?.kind();
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(kinds)
    }

    /// Rechaza el lote completo si su coste total cruzaría el límite duro,
    /// antes de crear ninguna invocación.
    fn preflight_quota(&self, reference: &str, total: i64) -> Result<(), InvocationError> {
        let usage = self.billing.monthly_usage(reference)?;
        let limits = self.billing.limits_for(reference);
        let over = usage.checked_add(total).map_or(true, |after| after > limits.hard_limit);
        if usage >= limits.hard_limit || over {
            return Err(LedgerError::QuotaExceeded { reference: reference.to_string(),
                                                    usage,
                                                    amount: total,
                                                    hard_limit: limits.hard_limit }.into());
        }
        Ok(())
    }

    fn create(&self,
              post: &Post,
              reference: &str,
              agent: AgentKind,
              cost: i64,
              trace_id: &str)
              -> Result<Invocation, InvocationError> {
        let now = Utc::now();
        let inv = Invocation { id: Uuid::new_v4(),
                               post_id: post.id.clone(),
                               agent_id: agent.as_str().to_string(),
                               status: InvocationStatus::Queued,
                               cost,
                               trace_id: trace_id.to_string(),
                               reference: reference.to_string(),
                               text: post.text.clone(),
                               panel: post.panel.clone().unwrap_or_default(),
                               result: None,
                               degraded: false,
                               error: None,
                               created_at: now,
                               updated_at: now };
        self.store.insert(&inv)?;
        Ok(inv)
    }

    fn charge(&self, inv: &Invocation) -> Result<bool, InvocationError> {
        let meta = json!({ "invocation_id": inv.id, "post_id": inv.post_id, "trace_id": inv.trace_id });
        match self.billing.debit(&inv.reference,
                                 inv.cost,
                                 &format!("nha:{}", inv.agent_id),
                                 meta,
                                 Some(format!("inv:{}", inv.id)))
        {
            Ok(outcome) => Ok(outcome.warning),
            Err(LedgerError::DuplicateIdempotencyKey { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn finish(&self, mut inv: Invocation, f: impl FnOnce(&mut Invocation)) -> Result<Invocation, InvocationError> {
        f(&mut inv);
        inv.updated_at = Utc::now();
        self.store.save(&inv)?;
        Ok(inv)
    }

    /// Saca de `queued` las invocaciones de un lote que no pudo completarse.
    /// Las que ya estaban cobradas reciben un crédito `refund:inv:{id}`; las
    /// que un worker ya tomó se dejan como están.
    fn abort_batch(&self, invocations: &[Invocation], charged: usize, cause: &InvocationError) {
        for (idx, inv) in invocations.iter().enumerate() {
            let claimed = match self.store.claim(inv.id) {
                Ok(Some(claimed)) => claimed,
                Ok(None) => continue,
                Err(e) => {
                    warn!("invocation:abort claim failed id={} err={e}", inv.id);
                    continue;
                }
            };
            if idx < charged {
                let meta = json!({ "invocation_id": inv.id, "post_id": inv.post_id, "trace_id": inv.trace_id });
                match self.billing.credit(&inv.reference,
                                          inv.cost,
                                          &format!("refund:nha:{}", inv.agent_id),
                                          meta,
                                          Some(format!("refund:inv:{}", inv.id)))
                {
                    Ok(_) | Err(LedgerError::DuplicateIdempotencyKey { .. }) => {}
                    Err(e) => warn!("invocation:refund failed id={} ref={} err={e}", inv.id, inv.reference),
                }
            }
            let aborted = self.finish(claimed, |i| {
                                  i.status = InvocationStatus::Error;
                                  i.error = Some(format!("batch aborted: {cause}"));
                              });
            if let Err(e) = aborted {
                warn!("invocation:abort save failed id={} err={e}", inv.id);
            }
        }
        warn!("invocation:batch aborted invocations={} refunded={charged} err={cause}",
              invocations.len());
    }

    async fn enqueue(&self, inv: &Invocation) -> Result<(), InvocationError> {
        let job = InvocationJob { invocation_id: inv.id,
                                  post_id: inv.post_id.clone(),
                                  agent_id: inv.agent_id.clone(),
                                  trace_id: inv.trace_id.clone() };
        let payload = serde_json::to_value(&job).map_err(|e| InvocationError::Validation(e.to_string()))?;
        self.stream.append(INVOCATION_JOBS_STREAM, payload).await?;
        Ok(())
    }

    /// Procesa una invocación en `queued`. Devuelve `None` si ya la tomó
    /// otra entrega.
    pub async fn process(&self, id: Uuid) -> Result<Option<Invocation>, InvocationError> {
        let Some(inv) = self.store.claim(id)? else {
            if self.store.get(id)?.is_none() {
                return Err(InvocationError::NotFound(id));
            }
            info!("invocation:skip id={id} already processed");
            return Ok(None);
        };

        let adapter = self.adapters.resolve(&inv.agent_id)?.clone();
        let input = AgentInput { text: inv.text.clone(),
                                 params: json!({ "post_id": inv.post_id }) };
        let started = Instant::now();
        let result = adapter.process(&input).await;
        let elapsed = started.elapsed();

        let done = match result {
            Ok(res) => {
                self.metrics.record_agent_call(&inv.agent_id, &inv.panel, elapsed, !res.degraded);
                let output = res.to_output();
                let body = comment_body(&inv.agent_id, &output);
                let comment = Comment::new(inv.post_id.clone(), inv.agent_id.clone(), body, inv.trace_id.clone());
                if let Err(e) = self.comments.post(comment).await {
                    warn!("invocation:comment failed id={id} err={e}");
                }
                self.finish(inv, |i| {
                        i.status = InvocationStatus::Done;
                        i.degraded = res.degraded;
                        i.result = Some(output);
                    })?
            }
            Err(e) => {
                // una entrada inválida no dice nada de la salud del agente
                if !matches!(e, AdapterError::InvalidInput(_)) {
                    self.metrics.record_agent_call(&inv.agent_id, &inv.panel, elapsed, false);
                }
                warn!("invocation:error id={id} agent={} err={e}", inv.agent_id);
                self.finish(inv, |i| {
                        i.status = InvocationStatus::Error;
                        i.error = Some(e.to_string());
                    })?
            }
        };
        info!("invocation:done id={id} agent={} status={} trace={}",
              done.agent_id,
              done.status.as_str(),
              done.trace_id);
        Ok(Some(done))
    }

    /// Crea, cobra y procesa (o encola) una invocación por agente. Si un cobro
    /// o el encolado fallan a mitad de lote, el lote se aborta y los cobros
    /// ya hechos se devuelven.
    pub async fn invoke(&self, req: InvokeRequest) -> Result<InvokeResponse, InvocationError> {
        if req.post.id.trim().is_empty() {
            return Err(InvocationError::Validation("post.id is required".into()));
        }
        if req.post.text.trim().is_empty() {
            return Err(InvocationError::Validation("post.text is required".into()));
        }
        let agents = self.resolve_agents(&req.agents)?;
        for kind in &agents {
            if self.metrics.is_breaker_open(DimensionKind::Agent, kind.as_str()) {
                return Err(InvocationError::CircuitOpen(kind.as_str().to_string()));
            }
        }
        let reference = req.reference.clone().unwrap_or_else(|| "public".to_string());
        let mut costs = Vec::with_capacity(agents.len());
        for kind in &agents {
            costs.push(self.adapters.resolve(kind.as_str())?.cost());
        }
        let total = costs.iter().try_fold(0i64, |acc, c| acc.checked_add(*c))
                         .ok_or(LedgerError::Overflow { reference: reference.clone() })?;
        self.preflight_quota(&reference, total)?;

        let trace_id = Uuid::new_v4().to_string();
        let mut batch: Vec<Invocation> = Vec::with_capacity(agents.len());
        let mut warning = false;
        for (kind, cost) in agents.iter().zip(costs) {
            let inv = match self.create(&req.post, &reference, *kind, cost, &trace_id) {
                Ok(inv) => inv,
                Err(e) => {
                    let charged = batch.len();
                    self.abort_batch(&batch, charged, &e);
                    return Err(e);
                }
            };
            batch.push(inv);
            match self.charge(&batch[batch.len() - 1]) {
                Ok(w) => warning |= w,
                Err(e) => {
                    let charged = batch.len() - 1;
                    self.abort_batch(&batch, charged, &e);
                    return Err(e);
                }
            }
        }

        let invocations = if req.defer {
            for inv in &batch {
                if let Err(e) = self.enqueue(inv).await {
                    self.abort_batch(&batch, batch.len(), &e);
                    return Err(e);
                }
            }
            batch
        } else {
            let mut out = Vec::with_capacity(batch.len());
            for inv in batch {
                out.push(match self.process(inv.id).await? {
                             Some(done) => done,
                             None => self.get(inv.id)?,
                         });
            }
            out
        };
        let ledger_delta = -invocations.iter().map(|i| i.cost).sum::<i64>();
        info!("invocation:batch post={} agents={} delta={ledger_delta} trace={trace_id}",
              req.post.id,
              invocations.len());
        Ok(InvokeResponse { post_id: req.post.id,
                            invocations,
                            ledger_delta,
                            trace_id,
                            quota_warning: warning })
    }

    pub fn quota_status(&self, reference: &str) -> Result<QuotaStatus, InvocationError> {
        Ok(self.billing.quota_status(reference)?)
    }
}

/// Consumidor de `invocation_jobs`.
#[derive(Debug)]
pub struct InvocationJobHandler {
    service: Arc<InvocationService>,
}

impl InvocationJobHandler {
    pub fn new(service: Arc<InvocationService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl JobHandler for InvocationJobHandler {
    async fn handle(&self, payload: &Value) -> Result<JobOutcome, WorkerError> {
        let job: InvocationJob = decode(payload)?;
        match self.service.process(job.invocation_id).await {
            Ok(Some(inv)) => Ok(JobOutcome::new(inv.status.as_str())),
            Ok(None) => Ok(JobOutcome::new("skipped")),
            Err(InvocationError::Ledger(LedgerError::Store(e))) => Err(WorkerError::Transient(e)),
            Err(InvocationError::Adapter(AdapterError::Store(e))) => Err(WorkerError::Transient(e)),
            Err(e) => Err(WorkerError::Permanent(e.to_string())),
        }
    }
}
