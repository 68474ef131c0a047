//! Colector de métricas por dimensión (agente, panel, tipo de nodo).
//!
//! Un único mutex protege todo el estado del colector. Las latencias se
//! guardan en una ventana acotada (las últimas `max_samples`) y los
//! percentiles se calculan ordenando esa ventana. El breaker derivado se
//! abre cuando la tasa de error en la ventana temporal supera el umbral y la
//! ventana tiene al menos `min_samples` resultados.
//! Es estado de sólo lectura: no bloquea llamadas, sólo las señala.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use gate_core::{FlowRun, NodeObserver, NodeReport, NodeStatus, RunStatus};
use log::warn;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Agent,
    Panel,
    NodeType,
}

impl DimensionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DimensionKind::Agent => "agent",
            DimensionKind::Panel => "panel",
            DimensionKind::NodeType => "node_type",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub max_samples: usize,
    pub error_window: Duration,
    /// Tasa de error (0..1) por encima de la cual el breaker se abre.
    pub error_threshold: f64,
    /// Muestras mínimas en la ventana antes de poder abrir el breaker.
    pub min_samples: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { max_samples: 1000,
               error_window: Duration::from_secs(180),
               error_threshold: 0.05,
               min_samples: 20 }
    }
}

#[derive(Debug, Default)]
struct DimStats {
    requests: u64,
    errors: u64,
    skipped: u64,
    latencies_ms: VecDeque<f64>,
    outcomes: VecDeque<(Instant, bool)>,
}

#[derive(Debug, Default)]
struct Inner {
    dims: BTreeMap<(DimensionKind, String), DimStats>,
    runs: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSnapshot {
    pub kind: DimensionKind,
    pub name: String,
    pub requests: u64,
    pub errors: u64,
    pub skipped: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    /// Tasa de error en la ventana temporal.
    pub error_rate: f64,
    pub breaker_open: bool,
    /// Latencias de la ventana (para buckets y `_sum`).
    #[serde(skip)]
    pub samples_ms: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub dimensions: Vec<DimensionSnapshot>,
    pub runs: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn get(&self, kind: DimensionKind, name: &str) -> Option<&DimensionSnapshot> {
        self.dimensions.iter().find(|d| d.kind == kind && d.name == name)
    }

    pub fn of_kind(&self, kind: DimensionKind) -> impl Iterator<Item = &DimensionSnapshot> {
        self.dimensions.iter().filter(move |d| d.kind == kind)
    }
}

/// Percentil por rango más cercano sobre una muestra ordenada.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    config: MetricsConfig,
    inner: Mutex<Inner>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        Self { config,
               inner: Mutex::new(Inner::default()) }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| {
                             warn!("metrics: lock poisoned, recovering");
                             e.into_inner()
                         })
    }

    pub fn record(&self, kind: DimensionKind, name: &str, latency: Duration, ok: bool) {
        self.record_at(kind, name, latency, ok, Instant::now());
    }

    pub fn record_at(&self, kind: DimensionKind, name: &str, latency: Duration, ok: bool, at: Instant) {
        let max = self.config.max_samples;
        let window = self.config.error_window;
        let mut inner = self.lock();
        let stats = inner.dims.entry((kind, name.to_string())).or_default();
        stats.requests += 1;
        if !ok {
            stats.errors += 1;
        }
        stats.latencies_ms.push_back(latency.as_nanos() as f64 / 1_000_000.0);
        while stats.latencies_ms.len() > max {
            stats.latencies_ms.pop_front();
        }
        stats.outcomes.push_back((at, ok));
        while let Some((ts, _)) = stats.outcomes.front() {
            if at.saturating_duration_since(*ts) > window {
                stats.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    /// Invocación de agente: cuenta para el agente y para el panel.
    pub fn record_agent_call(&self, agent: &str, panel: &str, latency: Duration, ok: bool) {
        self.record(DimensionKind::Agent, agent, latency, ok);
        if !panel.is_empty() {
            self.record(DimensionKind::Panel, panel, latency, ok);
        }
    }

    pub fn record_skipped(&self, kind: DimensionKind, name: &str) {
        let mut inner = self.lock();
        inner.dims.entry((kind, name.to_string())).or_default().skipped += 1;
    }

    pub fn record_run(&self, status: RunStatus) {
        let mut inner = self.lock();
        *inner.runs.entry(status.as_str().to_string()).or_default() += 1;
    }

    pub fn is_breaker_open(&self, kind: DimensionKind, name: &str) -> bool {
        self.snapshot().get(kind, name).is_some_and(|d| d.breaker_open)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> MetricsSnapshot {
        let inner = self.lock();
        let dimensions = inner.dims
                              .iter()
                              .map(|((kind, name), s)| {
                                  let mut sorted: Vec<f64> = s.latencies_ms.iter().copied().collect();
                                  sorted.sort_by(|a, b| a.total_cmp(b));
                                  let recent: Vec<bool> = s.outcomes
                                                           .iter()
                                                           .filter(|(ts, _)| {
                                                               now.saturating_duration_since(*ts)
                                                               <= self.config.error_window
                                                           })
                                                           .map(|(_, ok)| *ok)
                                                           .collect();
                                  let error_rate = if recent.is_empty() {
                                      0.0
                                  } else {
                                      recent.iter().filter(|ok| !**ok).count() as f64 / recent.len() as f64
                                  };
                                  DimensionSnapshot { kind: *kind,
                                                      name: name.clone(),
                                                      requests: s.requests,
                                                      errors: s.errors,
                                                      skipped: s.skipped,
                                                      p50_ms: percentile(&sorted, 0.50),
                                                      p95_ms: percentile(&sorted, 0.95),
                                                      error_rate,
                                                      breaker_open: recent.len() >= self.config.min_samples
                                                                    && error_rate > self.config.error_threshold,
                                                      samples_ms: sorted }
                              })
                              .collect();
        MetricsSnapshot { dimensions,
                          runs: inner.runs.clone() }
    }
}

impl NodeObserver for MetricsCollector {
    fn on_node(&self, report: &NodeReport) {
        match report.status {
            NodeStatus::Skipped => self.record_skipped(DimensionKind::NodeType, &report.node_type),
            NodeStatus::Success => self.record(DimensionKind::NodeType, &report.node_type, report.duration, true),
            _ => self.record(DimensionKind::NodeType, &report.node_type, report.duration, false),
        }
    }

    fn on_run_finished(&self, run: &FlowRun) {
        self.record_run(run.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_use_nearest_rank() {
        let v: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert_eq!(percentile(&v, 0.5), 50.0);
        assert_eq!(percentile(&v, 0.95), 95.0);
        assert_eq!(percentile(&[7.0], 0.95), 7.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn sample_window_is_bounded() {
        let m = MetricsCollector::new(MetricsConfig { max_samples: 10,
                                                      ..MetricsConfig::default() });
        for i in 0..25 {
            m.record(DimensionKind::Agent, "tag", Duration::from_millis(i), true);
        }
        let snap = m.snapshot();
        let d = snap.get(DimensionKind::Agent, "tag").unwrap();
        assert_eq!(d.requests, 25);
        assert_eq!(d.samples_ms.len(), 10);
        assert_eq!(d.samples_ms[0], 15.0);
    }

    #[test]
    fn single_failure_does_not_open_breaker() {
        let m = MetricsCollector::default();
        m.record(DimensionKind::Agent, "sentiment", Duration::from_millis(3), false);
        let snap = m.snapshot();
        let d = snap.get(DimensionKind::Agent, "sentiment").unwrap();
        assert_eq!(d.error_rate, 1.0);
        assert!(!d.breaker_open);
        assert!(!m.is_breaker_open(DimensionKind::Agent, "sentiment"));

        let eager = MetricsCollector::new(MetricsConfig { min_samples: 1,
                                                          ..MetricsConfig::default() });
        eager.record(DimensionKind::Agent, "sentiment", Duration::from_millis(3), false);
        assert!(eager.is_breaker_open(DimensionKind::Agent, "sentiment"));
    }
}
