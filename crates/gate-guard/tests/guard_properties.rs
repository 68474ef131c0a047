use std::sync::Arc;
use std::time::Duration;

use gate_guard::{Guard, GuardConfig, GuardError, GuardState, ManualClock, SubagentTask};
use serde_json::json;

fn guard_with_clock() -> (Arc<ManualClock>, Guard) {
    let clock = Arc::new(ManualClock::new());
    (clock.clone(), Guard::with_clock(GuardConfig::default(), clock))
}

#[test]
fn ninth_call_within_ttl_is_rejected_then_allowed_after_ttl() {
    let clock = Arc::new(ManualClock::new());
    let cfg = GuardConfig { max_iterations: 100,
                            ..GuardConfig::default() };
    let g = Guard::with_clock(cfg, clock.clone());
    for i in 0..8 {
        assert!(g.allow_tool_call("sentiment", &format!("p{i}"), &json!({}), None), "call {i}");
    }
    let err = g.check_tool_call("sentiment", "p8", &json!({}), None).unwrap_err();
    assert_eq!(err,
               GuardError::BudgetExceeded { tool: "sentiment".into(),
                                            budget: 8 });
    clock.advance(Duration::from_secs(60));
    assert!(g.allow_tool_call("sentiment", "p9", &json!({}), None));
}

#[test]
fn identical_call_allowed_once_per_dedup_window() {
    let (clock, g) = guard_with_clock();
    let params = json!({"lang": "es"});
    assert!(g.allow_tool_call("summarize", "hola", &params, Some("post-1")));
    clock.advance(Duration::from_secs(4));
    assert!(!g.allow_tool_call("summarize", "hola", &params, Some("post-1")));
    clock.advance(Duration::from_secs(2));
    assert!(g.allow_tool_call("summarize", "hola", &params, Some("post-1")));
}

#[test]
fn breaker_opens_after_three_failures_only_for_that_tool() {
    let (_clock, g) = guard_with_clock();
    for _ in 0..2 {
        g.record_tool_failure("transcribe", false);
    }
    assert!(!g.is_circuit_open("transcribe"));
    g.record_tool_failure("transcribe", false);
    assert!(g.is_circuit_open("transcribe"));
    assert!(!g.is_circuit_open("tag"));
    assert_eq!(g.check_tool_call("transcribe", "x", &json!({}), None),
               Err(GuardError::CircuitOpen { tool: "transcribe".into() }));
    assert!(g.allow_tool_call("tag", "x", &json!({}), None));
}

#[test]
fn breaker_opens_after_two_timeouts() {
    let (_clock, g) = guard_with_clock();
    g.record_tool_failure("summarize", true);
    assert!(!g.is_circuit_open("summarize"));
    g.record_tool_failure("summarize", true);
    assert!(g.is_circuit_open("summarize"));
}

#[test]
fn failures_outside_breaker_window_do_not_accumulate() {
    let (clock, g) = guard_with_clock();
    g.record_tool_failure("tag", false);
    g.record_tool_failure("tag", false);
    clock.advance(Duration::from_secs(61));
    g.record_tool_failure("tag", false);
    assert!(!g.is_circuit_open("tag"));
}

#[test]
fn depth_three_succeeds_fourth_fails() {
    let (_clock, g) = guard_with_clock();
    let s1 = g.enter_depth().unwrap();
    let s2 = g.enter_depth().unwrap();
    let s3 = g.enter_depth().unwrap();
    assert_eq!(s3.depth(), 3);
    assert_eq!(g.enter_depth().unwrap_err(), GuardError::DepthExceeded { max: 3 });
    drop(s3);
    drop(s2);
    drop(s1);
    assert_eq!(g.current_depth(), 0);
}

#[tokio::test]
async fn depth_returns_to_zero_when_inner_work_errors() {
    let (_clock, g) = guard_with_clock();
    let res: Result<Result<(), String>, GuardError> =
        g.with_depth(|| async { Err("inner failure".to_string()) }).await;
    assert!(matches!(res, Ok(Err(_))));
    assert_eq!(g.current_depth(), 0);
}

#[test]
fn depth_returns_to_zero_after_panic() {
    let g = Arc::new(Guard::new(GuardConfig::default()));
    let g2 = g.clone();
    let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
                  let _scope = g2.enter_depth().unwrap();
                  panic!("boom");
              }));
    assert!(res.is_err());
    assert_eq!(g.current_depth(), 0);
}

#[tokio::test]
async fn barrier_timeout_records_timeouts_and_ends_final() {
    let g = Guard::new(GuardConfig::default());
    let tasks = vec![SubagentTask::new("summarize", async {
                         tokio::time::sleep(Duration::from_secs(5)).await;
                         Ok(json!("late"))
                     }),
                     SubagentTask::new("summarize", async {
                         tokio::time::sleep(Duration::from_secs(5)).await;
                         Ok(json!("late"))
                     }),];
    let err = g.run_subagents_with_barrier(tasks, Some(Duration::from_millis(20)))
               .await
               .unwrap_err();
    assert_eq!(err, GuardError::BarrierTimeout { timeout_ms: 20 });
    assert_eq!(g.state(), GuardState::Final);
    assert!(g.can_send_output());
    assert!(g.is_circuit_open("summarize"));
}

#[test]
fn snapshot_reports_open_breakers() {
    let (_clock, g) = guard_with_clock();
    for _ in 0..3 {
        g.record_tool_failure("tag", false);
    }
    g.set_state(GuardState::RunningTools);
    let snap = g.snapshot();
    assert_eq!(snap.state, GuardState::RunningTools);
    assert_eq!(snap.breakers.len(), 1);
    assert!(snap.breakers[0].open);
    assert_eq!(snap.breakers[0].failures, 3);
}
