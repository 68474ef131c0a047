use serde::{Deserialize, Serialize};

use crate::collector::{DimensionKind, MetricsSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SloTargets {
    pub p95_ms: f64,
    pub max_error_rate: f64,
}

impl Default for SloTargets {
    fn default() -> Self {
        Self { p95_ms: 2000.0,
               max_error_rate: 0.05 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloReport {
    pub kind: DimensionKind,
    pub name: String,
    pub p95_ms: f64,
    pub error_rate: f64,
    pub latency_ok: bool,
    pub errors_ok: bool,
}

impl SloReport {
    pub fn met(&self) -> bool {
        self.latency_ok && self.errors_ok
    }
}

/// Evalúa cada dimensión con muestras contra los objetivos.
pub fn evaluate(snapshot: &MetricsSnapshot, targets: &SloTargets) -> Vec<SloReport> {
    snapshot.dimensions
            .iter()
            .filter(|d| d.requests > 0)
            .map(|d| SloReport { kind: d.kind,
                                 name: d.name.clone(),
                                 p95_ms: d.p95_ms,
                                 error_rate: d.error_rate,
                                 latency_ok: d.p95_ms <= targets.p95_ms,
                                 errors_ok: d.error_rate <= targets.max_error_rate })
            .collect()
}
