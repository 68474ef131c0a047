//! Guard de sesión.
//!
//! Reglas de `check_tool_call`, en este orden:
//! 1. circuito abierto para la herramienta → rechazo;
//! 2. presupuesto de la ventana TTL agotado → rechazo;
//! 3. llamada idéntica `(tool, prompt, params, parent_id)` dentro de la
//!    ventana de dedupe → rechazo;
//! 4. tope global de iteraciones alcanzado → rechazo;
//! 5. en otro caso se registra la llamada y se permite.
//!
//! Las llamadas rechazadas no consumen presupuesto ni iteraciones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::clock::{Clock, SystemClock};
use crate::config::GuardConfig;
use crate::error::GuardError;

/// Máquina de estados de salida. Sólo `Final` habilita la respuesta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardState {
    Idle,
    Routing,
    RunningTools,
    Join,
    Final,
}

#[derive(Debug, Clone, Copy)]
struct ToolWindow {
    count: u32,
    window_start: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
struct BreakerRecord {
    failures: u32,
    timeouts: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
struct GuardInner {
    state: GuardState,
    iterations: u32,
    windows: HashMap<String, ToolWindow>,
    recent_calls: HashMap<String, Instant>,
    breakers: HashMap<String, BreakerRecord>,
}

/// Vista serializable del breaker de una herramienta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub tool: String,
    pub failures: u32,
    pub timeouts: u32,
    pub open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardSnapshot {
    pub state: GuardState,
    pub depth: usize,
    pub iterations: u32,
    pub breakers: Vec<BreakerSnapshot>,
}

#[derive(Debug)]
pub struct Guard {
    config: GuardConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<GuardInner>,
    depth: AtomicUsize,
}

impl Guard {
    pub fn new(config: GuardConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: GuardConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config,
               clock,
               inner: Mutex::new(GuardInner { state: GuardState::Idle,
                                              iterations: 0,
                                              windows: HashMap::new(),
                                              recent_calls: HashMap::new(),
                                              breakers: HashMap::new() }),
               depth: AtomicUsize::new(0) }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> Instant {
        self.clock.now()
    }

    fn lock(&self) -> MutexGuard<'_, GuardInner> {
        // Un panic dentro de una sección crítica no invalida los contadores.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Vista booleana de `check_tool_call`.
    pub fn allow_tool_call(&self, tool: &str, prompt: &str, params: &Value, parent_id: Option<&str>) -> bool {
        self.check_tool_call(tool, prompt, params, parent_id).is_ok()
    }

    pub fn check_tool_call(&self,
                           tool: &str,
                           prompt: &str,
                           params: &Value,
                           parent_id: Option<&str>)
                           -> Result<(), GuardError> {
        let now = self.now();
        let mut inner = self.lock();

        if Self::breaker_open(&self.config, &mut inner, tool, now) {
            debug!("guard:reject tool={tool} reason=circuit_open");
            return Err(GuardError::CircuitOpen { tool: tool.to_string() });
        }

        let budget = self.config.budget_for(tool);
        let ttl = self.config.tool_ttl;
        let window = inner.windows
                          .entry(tool.to_string())
                          .or_insert(ToolWindow { count: 0, window_start: now });
        if now.duration_since(window.window_start) >= ttl {
            window.count = 0;
            window.window_start = now;
        }
        if window.count >= budget {
            debug!("guard:reject tool={tool} reason=budget count={} budget={budget}", window.count);
            return Err(GuardError::BudgetExceeded { tool: tool.to_string(),
                                                    budget });
        }

        let dedup_window = self.config.dedup_window;
        inner.recent_calls
             .retain(|_, seen| now.duration_since(*seen) < dedup_window);
        let key = call_key(tool, prompt, params, parent_id);
        if inner.recent_calls.contains_key(&key) {
            debug!("guard:reject tool={tool} reason=duplicate");
            return Err(GuardError::Duplicate { tool: tool.to_string() });
        }

        if inner.iterations >= self.config.max_iterations {
            warn!("guard:reject tool={tool} reason=iteration_cap cap={}", self.config.max_iterations);
            return Err(GuardError::IterationCap { cap: self.config.max_iterations });
        }

        if let Some(w) = inner.windows.get_mut(tool) {
            w.count += 1;
        }
        inner.recent_calls.insert(key, now);
        inner.iterations += 1;
        Ok(())
    }

    /// Registra un fallo (o timeout) de `tool` para el circuit breaker.
    pub fn record_tool_failure(&self, tool: &str, is_timeout: bool) {
        let now = self.now();
        let window = self.config.breaker_window;
        let mut inner = self.lock();
        let rec = inner.breakers.entry(tool.to_string()).or_default();
        if let Some(last) = rec.last_failure {
            if now.duration_since(last) >= window {
                *rec = BreakerRecord::default();
            }
        }
        if is_timeout {
            rec.timeouts += 1;
        } else {
            rec.failures += 1;
        }
        rec.last_failure = Some(now);
        debug!("guard:failure tool={tool} timeout={is_timeout} failures={} timeouts={}",
               rec.failures,
               rec.timeouts);
    }

    pub fn is_circuit_open(&self, tool: &str) -> bool {
        let now = self.now();
        let mut inner = self.lock();
        Self::breaker_open(&self.config, &mut inner, tool, now)
    }

    fn breaker_open(config: &GuardConfig, inner: &mut GuardInner, tool: &str, now: Instant) -> bool {
        let Some(rec) = inner.breakers.get_mut(tool) else {
            return false;
        };
        let tripped = rec.failures >= config.breaker_failure_threshold
                      || rec.timeouts >= config.breaker_timeout_threshold;
        if !tripped {
            return false;
        }
        match rec.last_failure {
            Some(last) if now.duration_since(last) < config.breaker_cooldown => true,
            _ => {
                // cool-down cumplido: el circuito se cierra solo
                *rec = BreakerRecord::default();
                false
            }
        }
    }

    /// Incrementa la profundidad de recursión. Preferir `enter_depth`, que
    /// garantiza el decremento.
    pub fn increment_depth(&self) -> Result<usize, GuardError> {
        let max = self.config.max_depth;
        self.depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| if d < max { Some(d + 1) } else { None })
            .map(|prev| prev + 1)
            .map_err(|_| GuardError::DepthExceeded { max })
    }

    pub fn decrement_depth(&self) {
        let _ = self.depth
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1));
    }

    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Abre un scope de profundidad; al soltarlo (éxito, error o unwind)
    /// la profundidad vuelve a su valor anterior.
    pub fn enter_depth(&self) -> Result<DepthScope<'_>, GuardError> {
        let depth = self.increment_depth()?;
        Ok(DepthScope { guard: self, depth })
    }

    /// Ejecuta `f` un nivel más abajo.
    pub async fn with_depth<F, Fut, T>(&self, f: F) -> Result<T, GuardError>
        where F: FnOnce() -> Fut,
              Fut: std::future::Future<Output = T>
    {
        let _scope = self.enter_depth()?;
        Ok(f().await)
    }

    pub fn current_iterations(&self) -> u32 {
        self.lock().iterations
    }

    pub fn state(&self) -> GuardState {
        self.lock().state
    }

    pub fn set_state(&self, state: GuardState) {
        let mut inner = self.lock();
        debug!("guard:state {:?} -> {:?}", inner.state, state);
        inner.state = state;
    }

    pub fn can_send_output(&self) -> bool {
        self.state() == GuardState::Final
    }

    pub fn snapshot(&self) -> GuardSnapshot {
        let now = self.now();
        let depth = self.current_depth();
        let mut inner = self.lock();
        let tools: Vec<String> = inner.breakers.keys().cloned().collect();
        let mut breakers = Vec::with_capacity(tools.len());
        for tool in tools {
            let open = Self::breaker_open(&self.config, &mut inner, &tool, now);
            let rec = inner.breakers.get(&tool).copied().unwrap_or_default();
            breakers.push(BreakerSnapshot { tool,
                                            failures: rec.failures,
                                            timeouts: rec.timeouts,
                                            open });
        }
        breakers.sort_by(|a, b| a.tool.cmp(&b.tool));
        GuardSnapshot { state: inner.state,
                        depth,
                        iterations: inner.iterations,
                        breakers }
    }

    pub(crate) fn barrier_timeout(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(self.config.barrier_timeout)
    }
}

/// Scope RAII de profundidad devuelto por `Guard::enter_depth`.
#[derive(Debug)]
pub struct DepthScope<'a> {
    guard: &'a Guard,
    depth: usize,
}

impl DepthScope<'_> {
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Drop for DepthScope<'_> {
    fn drop(&mut self) {
        self.guard.decrement_depth();
    }
}

fn call_key(tool: &str, prompt: &str, params: &Value, parent_id: Option<&str>) -> String {
    let mut h = Sha256::new();
    h.update(tool.as_bytes());
    h.update([0u8]);
    h.update(prompt.as_bytes());
    h.update([0u8]);
    // serde_json::Map ordena claves: la serialización es canónica
    h.update(params.to_string().as_bytes());
    h.update([0u8]);
    h.update(parent_id.unwrap_or("").as_bytes());
    h.finalize().iter().map(|b| format!("{b:02x}")).collect()
}
