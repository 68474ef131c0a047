use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Motivos de rechazo del guard.
///
/// Ninguno es fatal para el proceso: el nodo o la petición que los recibe
/// los reporta como salida de error.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardError {
    #[error("circuit open for tool `{tool}`")]
    CircuitOpen { tool: String },
    #[error("tool `{tool}` exhausted its budget of {budget} calls")]
    BudgetExceeded { tool: String, budget: u32 },
    #[error("duplicate call to tool `{tool}` within dedup window")]
    Duplicate { tool: String },
    #[error("iteration cap of {cap} reached")]
    IterationCap { cap: u32 },
    #[error("recursion depth exceeded (max {max})")]
    DepthExceeded { max: usize },
    #[error("sub-agent barrier timed out after {timeout_ms} ms")]
    BarrierTimeout { timeout_ms: u64 },
}

impl GuardError {
    /// Código corto estable, útil para métricas y respuestas JSON.
    pub fn code(&self) -> &'static str {
        match self {
            GuardError::CircuitOpen { .. } => "circuit_open",
            GuardError::BudgetExceeded { .. } => "tool_budget_exceeded",
            GuardError::Duplicate { .. } => "duplicate_call",
            GuardError::IterationCap { .. } => "iteration_cap",
            GuardError::DepthExceeded { .. } => "depth_exceeded",
            GuardError::BarrierTimeout { .. } => "barrier_timeout",
        }
    }
}
