use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerError {
    #[error("invalid amount {0}: must be positive")]
    InvalidAmount(i64),
    #[error("ref must not be empty")]
    EmptyRef,
    /// Uso mensual en o sobre el límite duro (o lo superaría).
    #[error("quota exceeded for `{reference}`: usage {usage} + {amount} exceeds hard limit {hard_limit}")]
    QuotaExceeded { reference: String, usage: i64, amount: i64, hard_limit: i64 },
    #[error("duplicate idempotency key `{key}` for `{reference}`")]
    DuplicateIdempotencyKey { reference: String, key: String },
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),
    /// El saldo o los totales del ref no caben en un i64.
    #[error("ledger arithmetic overflow for `{reference}`")]
    Overflow { reference: String },
    #[error("store error: {0}")]
    Store(String),
}
