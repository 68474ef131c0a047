//! Abstracción de stream durable con grupos de consumidores.
//!
//! Semántica: cada mensaje nuevo se entrega a un único consumidor del grupo
//! y queda en la lista de pendientes hasta su `ack`. `claim_idle` transfiere
//! pendientes que llevan más de `min_idle` sin ack a otro consumidor.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub id: String,
    pub payload: Value,
    /// Número de entregas, contando la actual.
    pub deliveries: u32,
}

#[async_trait]
pub trait JobStream: Send + Sync + std::fmt::Debug {
    /// Crea el grupo si no existe. Idempotente.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), WorkerError>;

    async fn append(&self, stream: &str, payload: Value) -> Result<String, WorkerError>;

    /// Hasta `count` mensajes nuevos; espera como mucho `block` si no hay.
    async fn read_group(&self,
                        stream: &str,
                        group: &str,
                        consumer: &str,
                        count: usize,
                        block: Duration)
                        -> Result<Vec<StreamMessage>, WorkerError>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), WorkerError>;

    async fn claim_idle(&self,
                        stream: &str,
                        group: &str,
                        consumer: &str,
                        min_idle: Duration,
                        count: usize)
                        -> Result<Vec<StreamMessage>, WorkerError>;

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, WorkerError>;
}
