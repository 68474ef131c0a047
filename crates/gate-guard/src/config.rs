//! Límites del guard.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuración inmutable de un `Guard`.
///
/// Los valores por defecto reproducen los límites operativos del gateway:
/// 8 llamadas por herramienta cada 60s, dedupe de 5s, 10 iteraciones,
/// profundidad 3 y breaker tras 3 fallos o 2 timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardConfig {
    pub default_tool_budget: u32,
    #[serde(with = "duration_ms")]
    pub tool_ttl: Duration,
    /// Overrides de presupuesto por nombre de herramienta.
    #[serde(default)]
    pub tool_budgets: HashMap<String, u32>,
    #[serde(with = "duration_ms")]
    pub dedup_window: Duration,
    pub max_iterations: u32,
    pub max_depth: usize,
    pub breaker_failure_threshold: u32,
    pub breaker_timeout_threshold: u32,
    /// Ventana en la que se acumulan fallos antes de reiniciar el conteo.
    #[serde(with = "duration_ms")]
    pub breaker_window: Duration,
    /// Tiempo que el circuito permanece abierto desde el último fallo.
    #[serde(with = "duration_ms")]
    pub breaker_cooldown: Duration,
    #[serde(with = "duration_ms")]
    pub barrier_timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self { default_tool_budget: 8,
               tool_ttl: Duration::from_secs(60),
               tool_budgets: HashMap::new(),
               dedup_window: Duration::from_secs(5),
               max_iterations: 10,
               max_depth: 3,
               breaker_failure_threshold: 3,
               breaker_timeout_threshold: 2,
               breaker_window: Duration::from_secs(60),
               breaker_cooldown: Duration::from_secs(30),
               barrier_timeout: Duration::from_secs(30) }
    }
}

impl GuardConfig {
    /// Presupuesto efectivo para `tool` (override o default).
    pub fn budget_for(&self, tool: &str) -> u32 {
        self.tool_budgets.get(tool).copied().unwrap_or(self.default_tool_budget)
    }

    pub fn with_tool_budget(mut self, tool: impl Into<String>, budget: u32) -> Self {
        self.tool_budgets.insert(tool.into(), budget);
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_override_takes_precedence() {
        let cfg = GuardConfig::default().with_tool_budget("transcribe", 2);
        assert_eq!(cfg.budget_for("transcribe"), 2);
        assert_eq!(cfg.budget_for("sentiment"), 8);
    }

    #[test]
    fn durations_serialize_as_millis() {
        let cfg = GuardConfig::default();
        let v = serde_json::to_value(&cfg).unwrap();
        assert_eq!(v["dedup_window"], 5000);
        let back: GuardConfig = serde_json::from_value(v).unwrap();
        assert_eq!(back, cfg);
    }
}
