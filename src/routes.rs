//! Superficie HTTP del gateway.
//!
//! La identidad del actor viaja en `x-actor-id`. La autorización por rol
//! sólo aplica cuando la ref/tenant es el id de una organización existente;
//! cualquier otra ref es un tenant no gestionado.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use gate_adapters::CommentSink;
use gate_core::{FlowCatalog, FlowRun, FlowSpec, RunEventView, RunInstance, RunMode};
use gate_ledger::{apply_payment_webhook, WebhookOutcome};
use gate_metrics::{evaluate, prometheus};
use gate_org::{Permission, Role};
use gate_worker::{FlowJob, JobStream, FLOW_JOBS_STREAM};
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::chat::ChatRequest;
use crate::errors::ApiError;
use crate::invocations::InvokeRequest;
use crate::state::AppState;

pub const ACTOR_HEADER: &str = "x-actor-id";
pub const SIGNATURE_HEADER: &str = "x-signature";

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new().route("/healthz", get(healthz))
                 .route("/chat", post(chat))
                 .route("/chat/sessions/:id", delete(end_chat_session))
                 .route("/rag/query", post(rag_query))
                 .route("/rag/documents", post(rag_ingest))
                 .route("/nha/invoke", post(nha_invoke))
                 .route("/invocations", get(list_invocations))
                 .route("/ledger/balance", get(ledger_balance))
                 .route("/flows", post(create_flow).get(list_flows))
                 .route("/flows/:id", get(get_flow).put(update_flow))
                 .route("/flows/:id/activate", post(activate_flow))
                 .route("/flows/:id/deactivate", post(deactivate_flow))
                 .route("/flows/:id/run", post(run_flow))
                 .route("/flow-runs/:id", get(get_run))
                 .route("/flow-runs/:id/events", get(run_events))
                 .route("/flow-runs/:id/cancel", post(cancel_run))
                 .route("/metrics", get(metrics_text))
                 .route("/metrics/snapshot", get(metrics_snapshot))
                 .route("/orgs", post(create_org))
                 .route("/orgs/accept-invite", post(accept_invite))
                 .route("/orgs/:id", get(get_org))
                 .route("/orgs/:id/invites", post(invite))
                 .route("/orgs/:id/members", get(list_members))
                 .route("/orgs/:id/members/:user/role", post(change_role))
                 .route("/orgs/:id/members/:user", delete(remove_member))
                 .route("/billing/balance/:org", get(billing_balance))
                 .route("/billing/credit", post(billing_credit))
                 .route("/billing/webhook/payment", post(payment_webhook))
                 .route("/audit", get(audit))
                 .route("/privacy/export", post(privacy_export))
                 .route("/privacy/deletion", post(privacy_deletion))
                 .route("/privacy/jobs/:id", get(privacy_job))
                 .route("/privacy/jobs/:id/advance", post(privacy_advance))
                 .with_state(state)
}

fn actor(headers: &HeaderMap) -> Option<String> {
    headers.get(ACTOR_HEADER)
           .and_then(|v| v.to_str().ok())
           .map(str::trim)
           .filter(|v| !v.is_empty())
           .map(str::to_string)
}

fn require_actor(headers: &HeaderMap) -> ApiResult<String> {
    actor(headers).ok_or_else(|| ApiError::forbidden(format!("missing {ACTOR_HEADER} header")))
}

/// Exige `permission` si `reference` es una organización conocida.
fn authorize(state: &AppState, headers: &HeaderMap, reference: &str, permission: Permission) -> ApiResult<()> {
    let Ok(org_id) = Uuid::parse_str(reference) else {
        return Ok(());
    };
    if state.orgs.get_org(org_id).is_err() {
        return Ok(());
    }
    let user = require_actor(headers)?;
    state.orgs.check_permission(&user, org_id, permission)?;
    Ok(())
}

fn require_orchestrator(state: &AppState) -> ApiResult<()> {
    if state.config.orchestrator_enabled {
        Ok(())
    } else {
        Err(ApiError::unavailable("orchestrator_disabled", "flow orchestration is disabled"))
    }
}

fn run_view(inst: &RunInstance) -> Value {
    json!({ "run": inst.run, "nodes": inst.nodes, "outputs": inst.outputs })
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok",
                 "orchestrator": state.config.orchestrator_enabled,
                 "agents": state.adapters.agents().iter().map(|a| a.as_str()).collect::<Vec<_>>() }))
}

async fn chat(State(state): State<Arc<AppState>>, Json(req): Json<ChatRequest>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.chat.chat(req).await?))
}

async fn end_chat_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    if !state.chat.end_session(&id) {
        return Err(ApiError::not_found(format!("chat session {id} not found")));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct RagQueryBody {
    panel: String,
    q: String,
    #[serde(default = "default_k")]
    k: usize,
}

fn default_k() -> usize {
    3
}

async fn rag_query(State(state): State<Arc<AppState>>, Json(body): Json<RagQueryBody>) -> ApiResult<impl IntoResponse> {
    if body.panel.trim().is_empty() {
        return Err(ApiError::validation("panel is required"));
    }
    let started = std::time::Instant::now();
    let result = state.knowledge.query(&body.panel, &body.q, body.k.max(1)).await?;
    state.metrics.record(gate_metrics::DimensionKind::Panel, &body.panel, started.elapsed(), true);
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct RagIngestBody {
    panel: String,
    text: String,
}

async fn rag_ingest(State(state): State<Arc<AppState>>,
                    Json(body): Json<RagIngestBody>)
                    -> ApiResult<impl IntoResponse> {
    if body.panel.trim().is_empty() || body.text.trim().is_empty() {
        return Err(ApiError::validation("panel and text are required"));
    }
    let doc = state.knowledge.ingest(&body.panel, &body.text).await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

async fn nha_invoke(State(state): State<Arc<AppState>>,
                    headers: HeaderMap,
                    Json(req): Json<InvokeRequest>)
                    -> ApiResult<impl IntoResponse> {
    if let Some(reference) = req.reference.as_deref() {
        authorize(&state, &headers, reference, Permission::InvokeAgents)?;
    }
    Ok(Json(state.invocations.invoke(req).await?))
}

async fn list_invocations(State(state): State<Arc<AppState>>,
                          Query(q): Query<HashMap<String, String>>)
                          -> ApiResult<impl IntoResponse> {
    let post_id = q.get("post_id")
                   .filter(|p| !p.is_empty())
                   .ok_or_else(|| ApiError::validation("post_id is required"))?;
    let comments = state.comments.list(post_id).await?;
    let invocations = state.invocations.list_by_post(post_id)?;
    Ok(Json(json!({ "post_id": post_id,
                    "invocations": invocations,
                    "comments": comments })))
}

async fn ledger_balance(State(state): State<Arc<AppState>>,
                        headers: HeaderMap,
                        Query(q): Query<HashMap<String, String>>)
                        -> ApiResult<impl IntoResponse> {
    let reference = q.get("ref")
                     .filter(|r| !r.is_empty())
                     .ok_or_else(|| ApiError::validation("ref is required"))?;
    authorize(&state, &headers, reference, Permission::ViewBilling)?;
    let balance = state.billing.get_balance(reference)?;
    Ok(Json(json!({ "ref": reference, "balance": balance })))
}

#[derive(Debug, Deserialize)]
struct CreateFlowBody {
    name: String,
    tenant: String,
    #[serde(default)]
    panel: String,
    spec: FlowSpec,
    #[serde(default)]
    active: bool,
}

async fn create_flow(State(state): State<Arc<AppState>>,
                     headers: HeaderMap,
                     Json(body): Json<CreateFlowBody>)
                     -> ApiResult<impl IntoResponse> {
    if body.name.trim().is_empty() || body.tenant.trim().is_empty() {
        return Err(ApiError::validation("name and tenant are required"));
    }
    authorize(&state, &headers, &body.tenant, Permission::EditFlows)?;
    let catalog = state.engine.catalog();
    let mut flow = catalog.create(&body.name, &body.tenant, &body.panel, body.spec)?;
    if body.active {
        flow = catalog.set_active(flow.id, true)?;
    }
    info!("http:flow created id={} tenant={} version={}", flow.id, flow.tenant, flow.version);
    Ok((StatusCode::CREATED, Json(flow)))
}

async fn list_flows(State(state): State<Arc<AppState>>,
                    Query(q): Query<HashMap<String, String>>)
                    -> ApiResult<impl IntoResponse> {
    let flows = state.engine.catalog().list(q.get("tenant").map(String::as_str))?;
    Ok(Json(flows))
}

async fn get_flow(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.catalog().get(id)?))
}

#[derive(Debug, Deserialize)]
struct UpdateFlowBody {
    spec: FlowSpec,
}

async fn update_flow(State(state): State<Arc<AppState>>,
                     headers: HeaderMap,
                     Path(id): Path<Uuid>,
                     Json(body): Json<UpdateFlowBody>)
                     -> ApiResult<impl IntoResponse> {
    let current = state.engine.catalog().get(id)?;
    authorize(&state, &headers, &current.tenant, Permission::EditFlows)?;
    Ok(Json(state.engine.catalog().update_spec(id, body.spec)?))
}

async fn set_flow_active(state: &AppState, headers: &HeaderMap, id: Uuid, active: bool) -> ApiResult<Json<Value>> {
    let current = state.engine.catalog().get(id)?;
    authorize(state, headers, &current.tenant, Permission::EditFlows)?;
    let flow = state.engine.catalog().set_active(id, active)?;
    let actor = actor(headers).unwrap_or_else(|| "anonymous".into());
    state.audit.record(&actor,
                       if active { "flow.activate" } else { "flow.deactivate" },
                       &id.to_string(),
                       json!({ "active": current.active }),
                       json!({ "active": flow.active }),
                       None);
    Ok(Json(json!(flow)))
}

async fn activate_flow(State(state): State<Arc<AppState>>,
                       headers: HeaderMap,
                       Path(id): Path<Uuid>)
                       -> ApiResult<impl IntoResponse> {
    set_flow_active(&state, &headers, id, true).await
}

async fn deactivate_flow(State(state): State<Arc<AppState>>,
                         headers: HeaderMap,
                         Path(id): Path<Uuid>)
                         -> ApiResult<impl IntoResponse> {
    set_flow_active(&state, &headers, id, false).await
}

#[derive(Debug, Default, Deserialize)]
struct RunFlowBody {
    #[serde(default)]
    mode: RunMode,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    version: Option<u32>,
    /// Ejecuta en la petición en vez de encolar. Los dry-run siempre
    /// se ejecutan en línea.
    #[serde(default)]
    wait: bool,
}

async fn run_flow(State(state): State<Arc<AppState>>,
                  headers: HeaderMap,
                  Path(id): Path<Uuid>,
                  Json(body): Json<RunFlowBody>)
                  -> ApiResult<impl IntoResponse> {
    require_orchestrator(&state)?;
    let flow = state.engine.catalog().get(id)?;
    authorize(&state, &headers, &flow.tenant, Permission::RunFlows)?;
    let trigger = if body.input.is_null() { json!({}) } else { body.input };
    let run: FlowRun = state.engine.enqueue(id, body.version, body.mode, trigger, None)?;

    if body.wait || body.mode.is_dry() {
        state.engine
             .execute(run.id)
             .await
             .map_err(|e| ApiError::from(e).with_trace(run.trace_id.clone()))?;
        let inst = state.engine.load_run(run.id)?;
        return Ok((StatusCode::OK, Json(run_view(&inst))));
    }

    let job = FlowJob { run_id: run.id,
                        flow_id: run.flow_id,
                        version: run.version,
                        mode: run.mode,
                        trace_id: run.trace_id.clone() };
    let payload = serde_json::to_value(&job).map_err(|e| ApiError::internal(e.to_string()))?;
    state.stream
         .append(FLOW_JOBS_STREAM, payload)
         .await
         .map_err(|e| ApiError::from(e).with_trace(run.trace_id.clone()))?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "run": run }))))
}

async fn get_run(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let inst = state.engine.load_run(id)?;
    Ok(Json(run_view(&inst)))
}

async fn run_events(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let events: Vec<RunEventView> = state.engine.list_events(id)?.iter().map(|e| e.view()).collect();
    Ok(Json(events))
}

#[derive(Debug, Default, Deserialize)]
struct CancelBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn cancel_run(State(state): State<Arc<AppState>>,
                    headers: HeaderMap,
                    Path(id): Path<Uuid>,
                    body: Bytes)
                    -> ApiResult<impl IntoResponse> {
    let inst = state.engine.load_run(id)?;
    authorize(&state, &headers, &inst.run.tenant, Permission::RunFlows)?;
    let reason = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<CancelBody>(&body).map_err(|e| ApiError::validation(e.to_string()))?
                                                   .reason
    };
    Ok(Json(state.engine.cancel(id, reason)?))
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = prometheus::render(&state.metrics.snapshot());
    ([(header::CONTENT_TYPE, prometheus::CONTENT_TYPE)], body)
}

async fn metrics_snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();
    let slo = evaluate(&snapshot, &state.config.slo);
    Json(json!({ "snapshot": snapshot, "slo": slo }))
}

#[derive(Debug, Deserialize)]
struct CreateOrgBody {
    name: String,
}

async fn create_org(State(state): State<Arc<AppState>>,
                    headers: HeaderMap,
                    Json(body): Json<CreateOrgBody>)
                    -> ApiResult<impl IntoResponse> {
    let creator = require_actor(&headers)?;
    let org = state.orgs.create_org(&body.name, &creator)?;
    Ok((StatusCode::CREATED, Json(org)))
}

async fn get_org(State(state): State<Arc<AppState>>,
                 headers: HeaderMap,
                 Path(id): Path<Uuid>)
                 -> ApiResult<impl IntoResponse> {
    let user = require_actor(&headers)?;
    let org = state.orgs.get_org(id)?;
    let role = state.orgs
                    .role_of(id, &user)
                    .ok_or_else(|| ApiError::forbidden(format!("`{user}` is not a member of {id}")))?;
    Ok(Json(json!({ "org": org, "role": role })))
}

#[derive(Debug, Deserialize)]
struct InviteBody {
    email: String,
    role: String,
}

fn parse_role(role: &str) -> ApiResult<Role> {
    Role::parse(role).ok_or_else(|| ApiError::validation(format!("unknown role `{role}`")))
}

async fn invite(State(state): State<Arc<AppState>>,
                headers: HeaderMap,
                Path(id): Path<Uuid>,
                Json(body): Json<InviteBody>)
                -> ApiResult<impl IntoResponse> {
    let actor = require_actor(&headers)?;
    let invite = state.orgs.invite(id, &actor, &body.email, parse_role(&body.role)?)?;
    Ok((StatusCode::CREATED, Json(invite)))
}

#[derive(Debug, Deserialize)]
struct AcceptBody {
    token: String,
}

async fn accept_invite(State(state): State<Arc<AppState>>,
                       headers: HeaderMap,
                       Json(body): Json<AcceptBody>)
                       -> ApiResult<impl IntoResponse> {
    let user = require_actor(&headers)?;
    Ok(Json(state.orgs.accept_invite(&body.token, &user)?))
}

async fn list_members(State(state): State<Arc<AppState>>,
                      headers: HeaderMap,
                      Path(id): Path<Uuid>)
                      -> ApiResult<impl IntoResponse> {
    let actor = require_actor(&headers)?;
    Ok(Json(state.orgs.list_members(id, &actor)?))
}

#[derive(Debug, Deserialize)]
struct RoleBody {
    role: String,
}

async fn change_role(State(state): State<Arc<AppState>>,
                     headers: HeaderMap,
                     Path((id, user)): Path<(Uuid, String)>,
                     Json(body): Json<RoleBody>)
                     -> ApiResult<impl IntoResponse> {
    let actor = require_actor(&headers)?;
    Ok(Json(state.orgs.change_role(id, &actor, &user, parse_role(&body.role)?)?))
}

async fn remove_member(State(state): State<Arc<AppState>>,
                       headers: HeaderMap,
                       Path((id, user)): Path<(Uuid, String)>)
                       -> ApiResult<impl IntoResponse> {
    let actor = require_actor(&headers)?;
    Ok(Json(state.orgs.remove_member(id, &actor, &user)?))
}

async fn billing_balance(State(state): State<Arc<AppState>>,
                         headers: HeaderMap,
                         Path(org): Path<String>)
                         -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, &org, Permission::ViewBilling)?;
    Ok(Json(state.billing.usage_report(&org)?))
}

#[derive(Debug, Deserialize)]
struct CreditBody {
    #[serde(rename = "ref")]
    reference: String,
    amount: i64,
    #[serde(default = "default_credit_reason")]
    reason: String,
    #[serde(default)]
    idempotency_key: Option<String>,
}

fn default_credit_reason() -> String {
    "manual_credit".to_string()
}

async fn billing_credit(State(state): State<Arc<AppState>>,
                        headers: HeaderMap,
                        Json(body): Json<CreditBody>)
                        -> ApiResult<impl IntoResponse> {
    authorize(&state, &headers, &body.reference, Permission::ManageBilling)?;
    let actor = actor(&headers).unwrap_or_else(|| "anonymous".into());
    let before = state.billing.get_balance(&body.reference)?;
    let entry = state.billing.credit(&body.reference,
                                     body.amount,
                                     &body.reason,
                                     json!({ "actor": actor }),
                                     body.idempotency_key)?;
    let balance = state.billing.get_balance(&body.reference)?;
    state.audit.record(&actor,
                       "billing.credit",
                       &body.reference,
                       json!({ "balance": before }),
                       json!({ "balance": balance }),
                       None);
    Ok((StatusCode::CREATED, Json(json!({ "entry": entry, "balance": balance }))))
}

async fn payment_webhook(State(state): State<Arc<AppState>>,
                         headers: HeaderMap,
                         body: Bytes)
                         -> ApiResult<impl IntoResponse> {
    let signature = headers.get(SIGNATURE_HEADER)
                           .and_then(|v| v.to_str().ok())
                           .ok_or_else(|| ApiError::new(StatusCode::FORBIDDEN,
                                                        "invalid_signature",
                                                        format!("missing {SIGNATURE_HEADER} header")))?;
    let outcome = apply_payment_webhook(&state.billing, state.config.webhook_secret.as_bytes(), &body, signature)?;
    let body = match outcome {
        WebhookOutcome::Credited(entry) => json!({ "status": "credited", "entry": entry }),
        WebhookOutcome::Duplicate => json!({ "status": "duplicate" }),
        WebhookOutcome::Ignored => json!({ "status": "ignored" }),
    };
    Ok(Json(body))
}

async fn audit(State(state): State<Arc<AppState>>, Query(q): Query<HashMap<String, String>>) -> impl IntoResponse {
    let events = match q.get("trace_id") {
        Some(trace) => state.audit.by_trace(trace),
        None => {
            let limit = q.get("limit").and_then(|l| l.parse().ok()).unwrap_or(100);
            state.audit.list(limit)
        }
    };
    Json(events)
}

#[derive(Debug, Deserialize)]
struct PrivacyBody {
    org_id: Uuid,
    subject: String,
}

async fn privacy_export(State(state): State<Arc<AppState>>,
                        headers: HeaderMap,
                        Json(body): Json<PrivacyBody>)
                        -> ApiResult<impl IntoResponse> {
    let actor = require_actor(&headers)?;
    state.orgs.check_permission(&actor, body.org_id, Permission::ManagePrivacy)?;
    let job = state.privacy.request_export(body.org_id, &body.subject, &actor)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn privacy_deletion(State(state): State<Arc<AppState>>,
                          headers: HeaderMap,
                          Json(body): Json<PrivacyBody>)
                          -> ApiResult<impl IntoResponse> {
    let actor = require_actor(&headers)?;
    state.orgs.check_permission(&actor, body.org_id, Permission::ManagePrivacy)?;
    let job = state.privacy.request_deletion(body.org_id, &body.subject, &actor)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn privacy_job(State(state): State<Arc<AppState>>,
                     headers: HeaderMap,
                     Path(id): Path<Uuid>)
                     -> ApiResult<impl IntoResponse> {
    let actor = require_actor(&headers)?;
    let job = state.privacy.get(id)?;
    state.orgs.check_permission(&actor, job.org_id, Permission::ManagePrivacy)?;
    Ok(Json(job))
}

async fn privacy_advance(State(state): State<Arc<AppState>>,
                         headers: HeaderMap,
                         Path(id): Path<Uuid>)
                         -> ApiResult<impl IntoResponse> {
    let actor = require_actor(&headers)?;
    let job = state.privacy.get(id)?;
    state.orgs.check_permission(&actor, job.org_id, Permission::ManagePrivacy)?;
    Ok(Json(state.privacy.advance(id)?))
}
