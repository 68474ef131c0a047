//! Barrera de sub-agentes: fan-out concurrente con timeout.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use log::{info, warn};
use serde_json::Value;
use tokio::task::JoinSet;

use crate::error::GuardError;
use crate::guard::{Guard, GuardState};

pub type SubagentFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

/// Una tarea de sub-agente: el nombre de la herramienta que la ejecuta y su
/// future. El nombre se usa para imputar fallos y timeouts al breaker.
pub struct SubagentTask {
    pub tool: String,
    pub future: SubagentFuture,
}

impl SubagentTask {
    pub fn new<F>(tool: impl Into<String>, fut: F) -> Self
        where F: Future<Output = Result<Value, String>> + Send + 'static
    {
        Self { tool: tool.into(),
               future: Box::pin(fut) }
    }
}

impl std::fmt::Debug for SubagentTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubagentTask").field("tool", &self.tool).finish()
    }
}

impl Guard {
    /// Ejecuta `tasks` en paralelo y espera a todas hasta `timeout`
    /// (por defecto `GuardConfig::barrier_timeout`).
    ///
    /// Los resultados conservan el orden de entrada. Un `Err` de una tarea
    /// cuenta como fallo de su herramienta. Si vence el timeout se aborta lo
    /// pendiente, se imputa un timeout a la herramienta de cada tarea y se
    /// devuelve `BarrierTimeout`. En ambos casos el guard termina en `Final`.
    pub async fn run_subagents_with_barrier(&self,
                                            tasks: Vec<SubagentTask>,
                                            timeout: Option<Duration>)
                                            -> Result<Vec<Result<Value, String>>, GuardError> {
        let timeout = self.barrier_timeout(timeout);
        self.set_state(GuardState::Join);

        let tools: Vec<String> = tasks.iter().map(|t| t.tool.clone()).collect();
        let mut slots: Vec<Option<Result<Value, String>>> = vec![None; tasks.len()];
        let mut set = JoinSet::new();
        for (idx, task) in tasks.into_iter().enumerate() {
            let fut = task.future;
            set.spawn(async move { (idx, fut.await) });
        }

        let outcome = tokio::time::timeout(timeout, async {
                          while let Some(joined) = set.join_next().await {
                              match joined {
                                  Ok((idx, res)) => slots[idx] = Some(res),
                                  Err(e) => warn!("guard:barrier task join error: {e}"),
                              }
                          }
                      }).await;

        let result = match outcome {
            Ok(()) => {
                let mut results = Vec::with_capacity(slots.len());
                for (idx, slot) in slots.into_iter().enumerate() {
                    let res = slot.unwrap_or_else(|| Err("sub-agent task panicked".to_string()));
                    if res.is_err() {
                        self.record_tool_failure(&tools[idx], false);
                    }
                    results.push(res);
                }
                Ok(results)
            }
            Err(_) => {
                set.abort_all();
                for tool in &tools {
                    self.record_tool_failure(tool, true);
                }
                let timeout_ms = timeout.as_millis() as u64;
                info!("guard:barrier timeout tasks={} timeout_ms={timeout_ms}", tools.len());
                Err(GuardError::BarrierTimeout { timeout_ms })
            }
        };

        self.set_state(GuardState::Final);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardConfig;
    use serde_json::json;

    #[tokio::test]
    async fn results_keep_input_order() {
        let g = Guard::new(GuardConfig::default());
        let tasks = vec![SubagentTask::new("a", async {
                             tokio::time::sleep(Duration::from_millis(20)).await;
                             Ok(json!(1))
                         }),
                         SubagentTask::new("b", async { Ok(json!(2)) }),];
        let out = g.run_subagents_with_barrier(tasks, None).await.unwrap();
        assert_eq!(out, vec![Ok(json!(1)), Ok(json!(2))]);
        assert!(g.can_send_output());
    }

    #[tokio::test]
    async fn task_error_counts_as_tool_failure() {
        let g = Guard::new(GuardConfig::default());
        let tasks = (0..3).map(|_| SubagentTask::new("tag", async { Err("boom".to_string()) }))
                          .collect();
        let out = g.run_subagents_with_barrier(tasks, None).await.unwrap();
        assert!(out.iter().all(|r| r.is_err()));
        assert!(g.is_circuit_open("tag"));
    }
}
