use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use gate_ledger::QuotaLimits;
use gate_worker::{FlowJobHandler, FlowWorker, JobStream, WorkerConfig, FLOW_JOBS_STREAM};
use nha_gateway::{router, AppState, GatewayConfig, Stores};
use serde_json::{json, Value};
use tower::ServiceExt;

fn app_with(config: GatewayConfig) -> (Router, Arc<AppState>) {
    let state = Arc::new(AppState::in_memory(config));
    (router(state.clone()), state)
}

fn app() -> (Router, Arc<AppState>) {
    app_with(GatewayConfig::default())
}

async fn call(app: &Router, method: &str, uri: &str, actor: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(actor) = actor {
        req = req.header("x-actor-id", actor);
    }
    let req = match body {
        Some(b) => req.header(header::CONTENT_TYPE, "application/json")
                      .body(Body::from(b.to_string()))
                      .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn invoke_sentiment_charges_and_comments() {
    let (app, _) = app();
    let (status, body) = call(&app,
                              "POST",
                              "/nha/invoke",
                              None,
                              Some(json!({ "post": { "id": "p1", "text": "great product" },
                                           "agents": ["sentiment"],
                                           "ref": "acme" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["post_id"], json!("p1"));
    assert_eq!(body["ledger_delta"], json!(-1));
    assert_eq!(body["invocations"][0]["status"], json!("done"));
    assert_eq!(body["invocations"][0]["result"]["label"], json!("positive"));
    assert!(body["trace_id"].as_str().is_some());

    let (_, balance) = call(&app, "GET", "/ledger/balance?ref=acme", None, None).await;
    assert_eq!(balance["balance"], json!(-1));
    let (_, listed) = call(&app, "GET", "/invocations?post_id=p1", None, None).await;
    assert_eq!(listed["invocations"].as_array().unwrap().len(), 1);
    assert_eq!(listed["comments"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn invoke_over_hard_limit_is_payment_required() {
    let mut config = GatewayConfig::default();
    config.quota = QuotaLimits { soft_limit: 1,
                                 hard_limit: 2 };
    let (app, _) = app_with(config);
    let (status, body) = call(&app,
                              "POST",
                              "/nha/invoke",
                              None,
                              Some(json!({ "post": { "id": "p2", "text": "long text to summarize" },
                                           "agents": ["summarize"],
                                           "ref": "acme" }))).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], json!("quota_exceeded"));
    let (_, balance) = call(&app, "GET", "/ledger/balance?ref=acme", None, None).await;
    assert_eq!(balance["balance"], json!(0));
}

fn sentiment_flow() -> Value {
    json!({
        "name": "triage",
        "tenant": "acme",
        "panel": "reviews",
        "active": true,
        "spec": {
            "nodes": [
                { "id": "n1", "type": "Action.NHA.Invoke",
                  "params": { "agent": "sentiment", "text": "{{trigger.text}}" } },
                { "id": "n2", "type": "Util.Emit", "params": {}, "if": "n1.score > 0.9" }
            ],
            "edges": [ { "from": "n1", "to": "n2" } ]
        }
    })
}

#[tokio::test]
async fn flow_run_skips_node_with_false_condition() {
    let (app, _) = app();
    let (status, flow) = call(&app, "POST", "/flows", None, Some(sentiment_flow())).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = flow["id"].as_str().unwrap().to_string();

    let (status, result) = call(&app,
                                "POST",
                                &format!("/flows/{id}/run"),
                                None,
                                Some(json!({ "mode": "live", "input": { "text": "the parcel arrived" }, "wait": true }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["run"]["status"], json!("success"));
    let nodes = result["nodes"].as_array().unwrap();
    let status_of = |id: &str| nodes.iter().rev().find(|n| n["node_id"] == json!(id)).unwrap()["status"].clone();
    assert_eq!(status_of("n1"), json!("success"));
    assert_eq!(status_of("n2"), json!("skipped"));
    assert_eq!(result["outputs"]["n1"]["label"], json!("neutral"));

    let run_id = result["run"]["id"].as_str().unwrap();
    let (status, events) = call(&app, "GET", &format!("/flow-runs/{run_id}/events"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(events.as_array().unwrap().len() >= 4);
}

#[tokio::test]
async fn queued_flow_run_is_executed_by_the_worker() {
    let (app, state) = app();
    let (_, flow) = call(&app, "POST", "/flows", None, Some(sentiment_flow())).await;
    let id = flow["id"].as_str().unwrap().to_string();
    let (status, queued) = call(&app,
                                "POST",
                                &format!("/flows/{id}/run"),
                                None,
                                Some(json!({ "input": { "text": "great" } }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(queued["run"]["status"], json!("queued"));

    let mut cfg = WorkerConfig::new(FLOW_JOBS_STREAM, "workers", "test");
    cfg.block = std::time::Duration::from_millis(10);
    let worker = FlowWorker::new(cfg, state.stream.clone(), Arc::new(FlowJobHandler::new(state.engine.clone())));
    state.stream.ensure_group(FLOW_JOBS_STREAM, "workers").await.unwrap();
    let stats = worker.poll_once().await.unwrap();
    assert_eq!(stats.acked, 1);

    let run_id = queued["run"]["id"].as_str().unwrap();
    let (_, run) = call(&app, "GET", &format!("/flow-runs/{run_id}"), None, None).await;
    assert_eq!(run["run"]["status"], json!("success"));
}

#[tokio::test]
async fn disabled_orchestrator_rejects_runs() {
    let mut config = GatewayConfig::default();
    config.orchestrator_enabled = false;
    let (app, _) = app_with(config);
    let (_, flow) = call(&app, "POST", "/flows", None, Some(sentiment_flow())).await;
    let id = flow["id"].as_str().unwrap().to_string();
    let (status, body) = call(&app, "POST", &format!("/flows/{id}/run"), None, Some(json!({}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], json!("orchestrator_disabled"));
}

#[tokio::test]
async fn metrics_are_exposed_as_prometheus_text() {
    let (app, _) = app();
    call(&app,
         "POST",
         "/nha/invoke",
         None,
         Some(json!({ "post": { "id": "p3", "text": "good" }, "agents": ["sentiment"] }))).await;
    let res = app.clone()
                 .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
                 .await
                 .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_TYPE], gate_metrics::prometheus::CONTENT_TYPE);
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("nha_requests_total{dimension=\"agent\",name=\"sentiment\"} 1"));
}

#[tokio::test]
async fn org_roles_gate_billing_and_keep_last_admin() {
    let (app, _) = app();
    let (status, org) = call(&app, "POST", "/orgs", Some("alice"), Some(json!({ "name": "Acme" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    let org_id = org["id"].as_str().unwrap().to_string();

    let (status, invite) = call(&app,
                                "POST",
                                &format!("/orgs/{org_id}/invites"),
                                Some("alice"),
                                Some(json!({ "email": "bob@example.com", "role": "viewer" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    let token = invite["token"].as_str().unwrap();
    let (status, _) = call(&app, "POST", "/orgs/accept-invite", Some("bob"), Some(json!({ "token": token }))).await;
    assert_eq!(status, StatusCode::OK);

    let credit = json!({ "ref": org_id, "amount": 100 });
    let (status, body) = call(&app, "POST", "/billing/credit", Some("bob"), Some(credit.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], json!("permission_denied"));
    let (status, _) = call(&app, "POST", "/billing/credit", Some("alice"), Some(credit)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = call(&app,
                              "POST",
                              &format!("/orgs/{org_id}/members/alice/role"),
                              Some("alice"),
                              Some(json!({ "role": "viewer" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("last_admin"));
    let (_, members) = call(&app, "GET", &format!("/orgs/{org_id}/members"), Some("alice"), None).await;
    assert_eq!(members.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn payment_webhook_requires_valid_signature() {
    let mut config = GatewayConfig::default();
    config.webhook_secret = "whsec_test".into();
    let (app, _) = app_with(config);
    let payload = json!({ "id": "evt_1", "type": "payment.succeeded", "org_id": "acme", "amount": 50 }).to_string();

    let send = |signature: String| {
        let app = app.clone();
        let payload = payload.clone();
        async move {
            let req = Request::builder().method("POST")
                                        .uri("/billing/webhook/payment")
                                        .header("x-signature", signature)
                                        .body(Body::from(payload))
                                        .unwrap();
            let res = app.oneshot(req).await.unwrap();
            let status = res.status();
            let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
            (status, serde_json::from_slice::<Value>(&bytes).unwrap())
        }
    };

    let (status, _) = send("deadbeef".into()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let good = gate_ledger::sign(b"whsec_test", payload.as_bytes());
    let (status, body) = send(good.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("credited"));
    let (_, body) = send(good).await;
    assert_eq!(body["status"], json!("duplicate"));

    let (_, balance) = call(&app, "GET", "/ledger/balance?ref=acme", None, None).await;
    assert_eq!(balance["balance"], json!(50));
}

#[tokio::test]
async fn unknown_run_is_not_found() {
    let (app, _) = app();
    let (status, body) = call(&app, "GET", &format!("/flow-runs/{}", uuid::Uuid::new_v4()), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], json!("not_found"));
}

#[tokio::test]
async fn replicas_sharing_stores_see_each_others_flows_and_runs() {
    let stores = Stores::in_memory();
    let a = Arc::new(AppState::new(GatewayConfig::default(), stores.clone()));
    let b = Arc::new(AppState::new(GatewayConfig::default(), stores));
    let app_a = router(a.clone());
    let app_b = router(b.clone());

    let (_, flow) = call(&app_a, "POST", "/flows", None, Some(sentiment_flow())).await;
    let id = flow["id"].as_str().unwrap().to_string();
    let (status, seen) = call(&app_b, "GET", &format!("/flows/{id}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(seen["active"], json!(true));

    let (status, queued) = call(&app_a,
                                "POST",
                                &format!("/flows/{id}/run"),
                                None,
                                Some(json!({ "input": { "text": "great" } }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let mut cfg = WorkerConfig::new(FLOW_JOBS_STREAM, "workers", "replica-b");
    cfg.block = std::time::Duration::from_millis(10);
    b.stream.ensure_group(FLOW_JOBS_STREAM, "workers").await.unwrap();
    let worker = FlowWorker::new(cfg, b.stream.clone(), Arc::new(FlowJobHandler::new(b.engine.clone())));
    assert_eq!(worker.poll_once().await.unwrap().acked, 1);

    let run_id = queued["run"]["id"].as_str().unwrap();
    let (_, run) = call(&app_a, "GET", &format!("/flow-runs/{run_id}"), None, None).await;
    assert_eq!(run["run"]["status"], json!("success"));
}

#[tokio::test]
async fn deeply_nested_condition_is_rejected() {
    let (app, _) = app();
    let mut flow = sentiment_flow();
    flow["spec"]["nodes"][1]["if"] = json!(format!("{}true{}", "(".repeat(10_000), ")".repeat(10_000)));
    let (status, body) = call(&app, "POST", "/flows", None, Some(flow)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("validation"));
}

#[tokio::test]
async fn empty_text_in_a_flow_does_not_open_the_agent_breaker() {
    let mut config = GatewayConfig::default();
    config.metrics.min_samples = 1;
    let (app, _) = app_with(config);
    let (_, flow) = call(&app, "POST", "/flows", None, Some(sentiment_flow())).await;
    let id = flow["id"].as_str().unwrap().to_string();
    let (status, result) = call(&app,
                                "POST",
                                &format!("/flows/{id}/run"),
                                None,
                                Some(json!({ "mode": "live", "input": { "text": "" }, "wait": true }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["run"]["status"], json!("failed"));

    let (status, body) = call(&app,
                              "POST",
                              "/nha/invoke",
                              None,
                              Some(json!({ "post": { "id": "p9", "text": "great" }, "agents": ["sentiment"] }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["invocations"][0]["status"], json!("done"));
}

#[tokio::test]
async fn credit_past_the_balance_range_is_a_validation_error() {
    let (app, _) = app();
    let (status, _) = call(&app, "POST", "/billing/credit", None, Some(json!({ "ref": "whale", "amount": i64::MAX }))).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = call(&app, "POST", "/billing/credit", None, Some(json!({ "ref": "whale", "amount": 1 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("validation"));
    let (_, balance) = call(&app, "GET", "/ledger/balance?ref=whale", None, None).await;
    assert_eq!(balance["balance"], json!(i64::MAX));
}

#[tokio::test]
async fn unreachable_completion_upstream_degrades_invocations() {
    let mut config = GatewayConfig::default();
    config.upstream.completion_url = Some("http://127.0.0.1:9/agents".into());
    config.upstream.timeout = std::time::Duration::from_millis(500);
    let (app, _) = app_with(config);
    let (status, body) = call(&app,
                              "POST",
                              "/nha/invoke",
                              None,
                              Some(json!({ "post": { "id": "p10", "text": "great product" },
                                           "agents": ["sentiment"] }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["invocations"][0]["degraded"], json!(true));
    assert_eq!(body["invocations"][0]["result"]["label"], json!("neutral"));
}

#[tokio::test]
async fn ended_chat_session_is_gone() {
    let (app, _) = app();
    let (status, _) = call(&app, "POST", "/chat", None, Some(json!({ "session_id": "s1", "message": "hello" }))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "DELETE", "/chat/sessions/s1", None, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, "DELETE", "/chat/sessions/s1", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
