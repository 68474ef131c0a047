//! Errores del orquestador.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum FlowEngineError {
    #[error("invalid flow spec: {0}")]
    InvalidSpec(String),
    #[error("dependency cycle through node `{0}`")]
    CycleDetected(String),
    #[error("unknown node type `{0}`")]
    UnknownNodeType(String),
    #[error("flow {0} not found")]
    FlowNotFound(Uuid),
    #[error("flow {flow_id} has no version {version}")]
    FlowVersionNotFound { flow_id: Uuid, version: u32 },
    #[error("flow {0} is not active")]
    FlowInactive(Uuid),
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("run {0} already terminal")]
    RunTerminal(Uuid),
    #[error("condition error: {0}")]
    Condition(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("internal: {0}")]
    Internal(String),
}

/// Clasificación gruesa de errores para el worker y la capa HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Petición o spec inválida: no se reintenta.
    Validation,
    /// Recurso inexistente.
    NotFound,
    /// Fallo de infraestructura que puede resolverse reintentando.
    Transient,
    /// Resto de errores definitivos.
    Permanent,
}

pub fn classify_error(err: &FlowEngineError) -> ErrorClass {
    match err {
        FlowEngineError::InvalidSpec(_)
        | FlowEngineError::CycleDetected(_)
        | FlowEngineError::UnknownNodeType(_)
        | FlowEngineError::Condition(_)
        | FlowEngineError::FlowInactive(_) => ErrorClass::Validation,
        FlowEngineError::FlowNotFound(_)
        | FlowEngineError::FlowVersionNotFound { .. }
        | FlowEngineError::RunNotFound(_) => ErrorClass::NotFound,
        FlowEngineError::Store(_) => ErrorClass::Transient,
        FlowEngineError::RunTerminal(_) | FlowEngineError::Internal(_) => ErrorClass::Permanent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_transient() {
        assert_eq!(classify_error(&FlowEngineError::Store("conn reset".into())), ErrorClass::Transient);
        assert_eq!(classify_error(&FlowEngineError::CycleDetected("a".into())), ErrorClass::Validation);
    }
}
