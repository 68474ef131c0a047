//! Chat con contexto del panel.
//!
//! Cada sesión tiene su propio `Guard`: presupuestos, dedupe y breaker no se
//! comparten entre conversaciones. Un turno consulta el knowledge store del
//! panel y luego un agente, y sólo responde si el guard llega a `Final`.
//!
//! Una sesión sin turnos durante `session_ttl` se descarta, junto con su
//! guard; volver a usar su id abre una sesión nueva.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use gate_adapters::{AdapterError, AdapterRegistry, AgentInput, KnowledgeHit, KnowledgeStore};
use gate_guard::{Guard, GuardConfig, GuardSnapshot, GuardState};
use gate_metrics::MetricsCollector;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::ApiError;

const RAG_TOOL: &str = "rag.query";
const DEFAULT_AGENT: &str = "summarize";
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub panel: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default = "default_k")]
    pub k: usize,
}

fn default_k() -> usize {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub session_id: String,
    pub reply: String,
    pub agent: String,
    pub output: Value,
    pub context: Vec<KnowledgeHit>,
    pub degraded: bool,
    pub trace_id: String,
    pub guard: GuardSnapshot,
}

#[derive(Debug)]
struct Session {
    guard: Arc<Guard>,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct ChatService {
    guard_config: GuardConfig,
    session_ttl: Duration,
    sessions: DashMap<String, Session>,
    knowledge: Arc<KnowledgeStore>,
    adapters: Arc<AdapterRegistry>,
    metrics: Arc<MetricsCollector>,
}

impl ChatService {
    pub fn new(guard_config: GuardConfig,
               knowledge: Arc<KnowledgeStore>,
               adapters: Arc<AdapterRegistry>,
               metrics: Arc<MetricsCollector>)
               -> Self {
        Self { guard_config,
               session_ttl: DEFAULT_SESSION_TTL,
               sessions: DashMap::new(),
               knowledge,
               adapters,
               metrics }
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    fn guard_for(&self, session_id: &str, now: Instant) -> Arc<Guard> {
        let fresh = || Arc::new(Guard::new(self.guard_config.clone()));
        let mut session = self.sessions
                              .entry(session_id.to_string())
                              .or_insert_with(|| Session { guard: fresh(),
                                                           last_seen: now });
        if now.saturating_duration_since(session.last_seen) > self.session_ttl {
            debug!("chat:session expired session={session_id}");
            session.guard = fresh();
        }
        session.last_seen = now;
        session.guard.clone()
    }

    /// Descarta las sesiones sin actividad en más de `session_ttl` a `now`.
    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| now.saturating_duration_since(s.last_seen) <= self.session_ttl);
        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            info!("chat:sessions evicted={evicted} remaining={}", self.sessions.len());
        }
        evicted
    }

    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn end_session(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatReply, ApiError> {
        let message = req.message.trim();
        if message.is_empty() {
            return Err(ApiError::validation("message is required"));
        }
        let session_id = req.session_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let trace_id = Uuid::new_v4().to_string();
        let panel = req.panel.clone().unwrap_or_default();
        let agent_name = req.agent.as_deref().unwrap_or(DEFAULT_AGENT);
        let adapter = self.adapters.resolve(agent_name)?.clone();
        let guard = self.guard_for(&session_id, Instant::now());
        let fail = |e: ApiError| {
            guard.set_state(GuardState::Idle);
            e.with_trace(trace_id.clone())
        };

        guard.set_state(GuardState::Routing);
        let params = json!({ "panel": panel, "k": req.k });
        guard.set_state(GuardState::RunningTools);

        let mut context = Vec::new();
        let mut degraded = false;
        if !panel.is_empty() {
            guard.check_tool_call(RAG_TOOL, message, &params, Some(&session_id))
                 .map_err(|e| fail(e.into()))?;
            let result = self.knowledge.query(&panel, message, req.k).await.map_err(|e| fail(e.into()))?;
            degraded |= result.degraded;
            context = result.hits;
        }

        guard.check_tool_call(adapter.kind().as_str(), message, &params, Some(&session_id))
             .map_err(|e| fail(e.into()))?;
        let mut text = message.to_string();
        for hit in &context {
            text.push('\n');
            text.push_str(&hit.text);
        }
        let input = AgentInput { text,
                                 params: params.clone() };
        let started = Instant::now();
        let result = {
            let _depth = guard.enter_depth().map_err(|e| fail(e.into()))?;
            adapter.process(&input).await
        };
        let elapsed = started.elapsed();
        let result = match result {
            Ok(r) => r,
            Err(e) => {
                if !matches!(e, AdapterError::InvalidInput(_)) {
                    self.metrics.record_agent_call(agent_name, &panel, elapsed, false);
                    guard.record_tool_failure(agent_name, false);
                }
                return Err(fail(e.into()));
            }
        };
        self.metrics.record_agent_call(agent_name, &panel, elapsed, !result.degraded);
        if result.degraded {
            guard.record_tool_failure(agent_name, false);
        }
        degraded |= result.degraded;

        guard.set_state(GuardState::Join);
        guard.set_state(GuardState::Final);
        if !guard.can_send_output() {
            return Err(ApiError::internal("guard did not reach final state").with_trace(trace_id));
        }
        let output = result.to_output();
        let reply = reply_text(&output, message);
        let snapshot = guard.snapshot();
        guard.set_state(GuardState::Idle);
        debug!("chat:turn session={session_id} agent={agent_name} hits={}", context.len());
        info!("chat:reply session={session_id} trace={trace_id} degraded={degraded}");
        Ok(ChatReply { session_id,
                       reply,
                       agent: agent_name.to_string(),
                       output,
                       context,
                       degraded,
                       trace_id,
                       guard: snapshot })
    }
}

fn reply_text(output: &Value, message: &str) -> String {
    for key in ["summary", "text"] {
        if let Some(s) = output.get(key).and_then(Value::as_str).filter(|s| !s.is_empty()) {
            return s.to_string();
        }
    }
    if let Some(label) = output.get("label").and_then(Value::as_str) {
        return format!("sentiment: {label}");
    }
    if let Some(tags) = output.get("tags").and_then(Value::as_array) {
        let tags: Vec<&str> = tags.iter().filter_map(Value::as_str).collect();
        return format!("tags: {}", tags.join(", "));
    }
    message.to_string()
}
