//! gate-metrics: contadores, percentiles y breaker derivado por agente,
//! panel y tipo de nodo, con exposición Prometheus y evaluación de SLO.
pub mod collector;
pub mod prometheus;
pub mod slo;

pub use collector::{percentile, DimensionKind, DimensionSnapshot, MetricsCollector, MetricsConfig, MetricsSnapshot};
pub use slo::{evaluate, SloReport, SloTargets};
