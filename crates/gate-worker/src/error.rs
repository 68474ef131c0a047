use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// El mensaje queda sin ack para que otra entrega lo reintente.
    #[error("transient: {0}")]
    Transient(String),
    /// Reintentar no cambia nada: se hace ack y se registra.
    #[error("permanent: {0}")]
    Permanent(String),
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
    #[error("stream error: {0}")]
    Stream(String),
}

impl WorkerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkerError::Transient(_) | WorkerError::Stream(_))
    }
}
