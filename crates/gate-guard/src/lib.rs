//! gate-guard: protección de bucles y presupuesto para invocaciones de agentes.
//!
//! Un `Guard` vive exactamente lo que dura una sesión (una conversación de
//! chat o un `FlowRun`). Todos sus contadores son locales a la instancia: no
//! existe estado global compartido entre tenants. Los llamadores construyen un
//! guard nuevo por sesión y lo pasan por contexto.
//!
//! Módulos:
//! - `config`: límites por defecto y overrides por herramienta.
//! - `clock`: fuente de tiempo inyectable (tests deterministas).
//! - `guard`: presupuesto por herramienta, dedupe, circuit breaker, profundidad.
//! - `barrier`: ejecución concurrente de sub-agentes con timeout.

pub mod barrier;
pub mod clock;
pub mod config;
pub mod error;
pub mod guard;

pub use barrier::SubagentTask;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GuardConfig;
pub use error::GuardError;
pub use guard::{BreakerSnapshot, DepthScope, Guard, GuardSnapshot, GuardState};
