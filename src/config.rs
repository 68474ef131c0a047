//! Configuración del gateway.
//!
//! Se lee de variables `GATEWAY_*` (y `.env`, cargado una sola vez). Todo
//! tiene default salvo el secreto del webhook en producción. Un valor que no
//! parsea es un `ConfigError`, nunca se ignora en silencio.
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use gate_guard::GuardConfig;
use gate_ledger::QuotaLimits;
use gate_metrics::{MetricsConfig, SloTargets};
use once_cell::sync::Lazy;

use crate::errors::ConfigError;

static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenvy::dotenv();
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub group: String,
    pub consumer: String,
    pub batch: usize,
    pub block: Duration,
    pub max_deliveries: u32,
}

/// Backends remotos. Sin URL el agente usa el backend léxico y el
/// conocimiento el embedding por hash.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamSettings {
    pub completion_url: Option<String>,
    pub embedding_url: Option<String>,
    pub token: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    pub environment: Environment,
    pub persistence: Persistence,
    /// Con `false` las rutas de ejecución de flows responden 503.
    pub orchestrator_enabled: bool,
    /// Corre los consumidores de la cola dentro del proceso HTTP.
    pub inline_worker: bool,
    pub worker: WorkerSettings,
    pub guard: GuardConfig,
    pub quota: QuotaLimits,
    pub delay_cap: Duration,
    pub webhook_secret: String,
    pub audit_retention: chrono::Duration,
    pub metrics: MetricsConfig,
    pub slo: SloTargets,
    /// Inactividad tras la cual se descarta una sesión de chat.
    pub chat_session_ttl: Duration,
    pub upstream: UpstreamSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
               environment: Environment::Development,
               persistence: Persistence::Memory,
               orchestrator_enabled: true,
               inline_worker: true,
               worker: WorkerSettings { group: "flow-workers".into(),
                                        consumer: format!("gateway-{}", std::process::id()),
                                        batch: 10,
                                        block: Duration::from_millis(2000),
                                        max_deliveries: 5 },
               guard: GuardConfig::default(),
               quota: QuotaLimits::default(),
               delay_cap: Duration::from_secs(5),
               webhook_secret: String::new(),
               audit_retention: chrono::Duration::days(90),
               metrics: MetricsConfig::default(),
               slo: SloTargets::default(),
               chat_session_ttl: Duration::from_secs(30 * 60),
               upstream: UpstreamSettings { completion_url: None,
                                            embedding_url: None,
                                            token: None,
                                            timeout: Duration::from_secs(10) } }
    }
}

struct Vars<F: Fn(&str) -> Option<String>> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T, ConfigError> {
        match self.raw(name) {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid { name: name.to_string(),
                                                                     value: v }),
            None => Ok(default),
        }
    }

    fn flag(&self, name: &str, default: bool) -> Result<bool, ConfigError> {
        match self.raw(name) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => Ok(true),
                "0" | "false" | "off" | "no" => Ok(false),
                _ => Err(ConfigError::Invalid { name: name.to_string(),
                                                value: v }),
            },
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Lazy::force(&DOTENV_LOADED);
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Igual que `from_env` pero con una fuente de variables arbitraria.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, ConfigError> {
        let vars = Vars { lookup };
        let d = Self::default();

        let environment = match vars.raw("GATEWAY_ENV").as_deref() {
            None | Some("development") | Some("dev") => Environment::Development,
            Some("production") | Some("prod") => Environment::Production,
            Some(other) => {
                return Err(ConfigError::Invalid { name: "GATEWAY_ENV".into(),
                                                  value: other.to_string() })
            }
        };
        let persistence = match vars.raw("GATEWAY_PERSISTENCE").as_deref() {
            None | Some("memory") => Persistence::Memory,
            Some("postgres") => Persistence::Postgres,
            Some(other) => {
                return Err(ConfigError::Invalid { name: "GATEWAY_PERSISTENCE".into(),
                                                  value: other.to_string() })
            }
        };

        let worker = WorkerSettings { group: vars.raw("GATEWAY_WORKER_GROUP").unwrap_or(d.worker.group),
                                      consumer: vars.raw("GATEWAY_WORKER_CONSUMER").unwrap_or(d.worker.consumer),
                                      batch: vars.parse("GATEWAY_WORKER_BATCH", d.worker.batch)?,
                                      block: Duration::from_millis(vars.parse("GATEWAY_WORKER_BLOCK_MS", 2000u64)?),
                                      max_deliveries: vars.parse("GATEWAY_WORKER_MAX_DELIVERIES",
                                                                 d.worker.max_deliveries)? };
        if worker.batch == 0 {
            return Err(ConfigError::Invalid { name: "GATEWAY_WORKER_BATCH".into(),
                                              value: "0".into() });
        }

        let mut guard = d.guard.clone();
        guard.default_tool_budget = vars.parse("GATEWAY_GUARD_TOOL_BUDGET", guard.default_tool_budget)?;
        guard.tool_ttl = Duration::from_secs(vars.parse("GATEWAY_GUARD_TOOL_TTL_SECS", guard.tool_ttl.as_secs())?);
        guard.max_iterations = vars.parse("GATEWAY_GUARD_MAX_ITERATIONS", guard.max_iterations)?;
        guard.max_depth = vars.parse("GATEWAY_GUARD_MAX_DEPTH", guard.max_depth)?;
        guard.barrier_timeout =
            Duration::from_millis(vars.parse("GATEWAY_GUARD_BARRIER_TIMEOUT_MS", guard.barrier_timeout.as_millis() as u64)?);

        let quota = QuotaLimits { soft_limit: vars.parse("GATEWAY_QUOTA_SOFT", d.quota.soft_limit)?,
                                  hard_limit: vars.parse("GATEWAY_QUOTA_HARD", d.quota.hard_limit)? };
        if quota.soft_limit > quota.hard_limit {
            return Err(ConfigError::Inconsistent(format!("soft limit {} above hard limit {}",
                                                         quota.soft_limit, quota.hard_limit)));
        }

        let metrics = MetricsConfig { max_samples: vars.parse("GATEWAY_METRICS_MAX_SAMPLES", d.metrics.max_samples)?,
                                      error_window: Duration::from_secs(vars.parse("GATEWAY_METRICS_WINDOW_SECS",
                                                                                   d.metrics.error_window.as_secs())?),
                                      error_threshold: vars.parse("GATEWAY_METRICS_ERROR_THRESHOLD",
                                                                  d.metrics.error_threshold)?,
                                      min_samples: vars.parse("GATEWAY_METRICS_MIN_SAMPLES", d.metrics.min_samples)? };
        let slo = SloTargets { p95_ms: vars.parse("GATEWAY_SLO_P95_MS", d.slo.p95_ms)?,
                               max_error_rate: vars.parse("GATEWAY_SLO_MAX_ERROR_RATE", d.slo.max_error_rate)? };

        let upstream = UpstreamSettings { completion_url: vars.raw("GATEWAY_COMPLETION_URL"),
                                          embedding_url: vars.raw("GATEWAY_EMBEDDING_URL"),
                                          token: vars.raw("GATEWAY_UPSTREAM_TOKEN"),
                                          timeout: Duration::from_millis(vars.parse("GATEWAY_UPSTREAM_TIMEOUT_MS",
                                                                                    d.upstream.timeout.as_millis()
                                                                                    as u64)?) };
        for url in [&upstream.completion_url, &upstream.embedding_url].into_iter().flatten() {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid { name: "GATEWAY_COMPLETION_URL/GATEWAY_EMBEDDING_URL".into(),
                                                  value: url.clone() });
            }
        }

        let webhook_secret = vars.raw("GATEWAY_WEBHOOK_SECRET").unwrap_or_default();
        if environment == Environment::Production && webhook_secret.is_empty() {
            return Err(ConfigError::Missing("GATEWAY_WEBHOOK_SECRET".into()));
        }

        Ok(Self { bind: vars.parse("GATEWAY_BIND", d.bind)?,
                  environment,
                  persistence,
                  orchestrator_enabled: vars.flag("GATEWAY_ORCHESTRATOR_ENABLED", d.orchestrator_enabled)?,
                  inline_worker: vars.flag("GATEWAY_INLINE_WORKER", d.inline_worker)?,
                  worker,
                  guard,
                  quota,
                  delay_cap: Duration::from_millis(vars.parse("GATEWAY_DELAY_CAP_MS", d.delay_cap.as_millis() as u64)?),
                  webhook_secret,
                  audit_retention: chrono::Duration::days(vars.parse("GATEWAY_AUDIT_RETENTION_DAYS", 90i64)?),
                  metrics,
                  slo,
                  chat_session_ttl: Duration::from_secs(vars.parse("GATEWAY_CHAT_SESSION_TTL_SECS",
                                                                   d.chat_session_ttl.as_secs())?),
                  upstream })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(pairs: &[(&str, &str)]) -> Result<GatewayConfig, ConfigError> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        GatewayConfig::from_lookup(move |k| map.get(k).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let cfg = from(&[]).unwrap();
        assert_eq!(cfg.environment, Environment::Development);
        assert_eq!(cfg.persistence, Persistence::Memory);
        assert_eq!(cfg.guard.default_tool_budget, 8);
        assert_eq!(cfg.worker.max_deliveries, 5);
        assert!(cfg.orchestrator_enabled);
        assert!(cfg.upstream.completion_url.is_none());
    }

    #[test]
    fn upstream_urls_and_timeout() {
        let cfg = from(&[("GATEWAY_COMPLETION_URL", "https://llm.internal/v1/agents"),
                         ("GATEWAY_EMBEDDING_URL", "http://embed:8000/embed"),
                         ("GATEWAY_UPSTREAM_TIMEOUT_MS", "1500")]).unwrap();
        assert_eq!(cfg.upstream.completion_url.as_deref(), Some("https://llm.internal/v1/agents"));
        assert_eq!(cfg.upstream.embedding_url.as_deref(), Some("http://embed:8000/embed"));
        assert_eq!(cfg.upstream.timeout, Duration::from_millis(1500));
        assert!(matches!(from(&[("GATEWAY_COMPLETION_URL", "llm.internal")]), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn overrides_and_flags() {
        let cfg = from(&[("GATEWAY_BIND", "127.0.0.1:9000"),
                         ("GATEWAY_ORCHESTRATOR_ENABLED", "off"),
                         ("GATEWAY_GUARD_TOOL_BUDGET", "2"),
                         ("GATEWAY_QUOTA_SOFT", "5"),
                         ("GATEWAY_QUOTA_HARD", "10")]).unwrap();
        assert_eq!(cfg.bind.port(), 9000);
        assert!(!cfg.orchestrator_enabled);
        assert_eq!(cfg.guard.default_tool_budget, 2);
        assert_eq!(cfg.quota, QuotaLimits { soft_limit: 5, hard_limit: 10 });
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(matches!(from(&[("GATEWAY_WORKER_BATCH", "ten")]), Err(ConfigError::Invalid { .. })));
        assert!(matches!(from(&[("GATEWAY_INLINE_WORKER", "maybe")]), Err(ConfigError::Invalid { .. })));
        assert!(matches!(from(&[("GATEWAY_QUOTA_SOFT", "20"), ("GATEWAY_QUOTA_HARD", "10")]),
                         Err(ConfigError::Inconsistent(_))));
        assert!(matches!(from(&[("GATEWAY_ENV", "production")]), Err(ConfigError::Missing(_))));
    }
}
