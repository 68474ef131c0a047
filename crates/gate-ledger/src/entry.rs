use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Movimiento inmutable de la moneda interna. `delta < 0` es consumo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "ref")]
    pub reference: String,
    pub delta: i64,
    pub reason: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl LedgerEntry {
    pub fn new(reference: impl Into<String>, delta: i64, reason: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self { id: Uuid::new_v4(),
               timestamp,
               reference: reference.into(),
               delta,
               reason: reason.into(),
               metadata: Value::Null,
               idempotency_key: None }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }
}

/// Sumas de un ref desde un instante.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeriodTotals {
    /// Suma de `-delta` de las entradas negativas (uso).
    pub usage: i64,
    /// Suma de las entradas positivas.
    pub credits: i64,
}
