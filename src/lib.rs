//! NHA Gateway
//!
//! Servicio HTTP multi-tenant para invocar agentes no humanos (NHA):
//! - `invocations` y `chat` para invocación directa y conversacional.
//! - `routes` expone flows, billing, organizaciones, auditoría y métricas.
//! - `state` arma el engine, el ledger y los colectores una sola vez.
//!
//! El binario `nha-gateway` (en `main.rs`) sólo hace el cableado de arranque.

pub mod chat;
pub mod config;
pub mod errors;
pub mod invocations;
pub mod routes;
pub mod state;

pub use config::{GatewayConfig, Persistence};
pub use errors::{ApiError, ConfigError};
pub use routes::router;
pub use state::{AppState, Engine, Stores};
