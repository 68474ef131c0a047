use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("unknown agent `{0}`")]
    UnknownAgent(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Fallo del backend de completado; el adapter responde con su salida
    /// degradada.
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("comment sink error: {0}")]
    Sink(String),
    #[error("invocation store error: {0}")]
    Store(String),
}
