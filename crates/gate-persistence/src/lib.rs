//! gate-persistence
//!
//! Implementaciones Postgres (Diesel + r2d2) de los stores del gateway:
//! - `PgEventStore`: eventos de run append-only, orden total por `(run_id, seq)`.
//! - `PgLedgerStore`: ledger append-only con claves de idempotencia únicas.
//! - `PgJobStream`: stream de jobs con grupos de consumidores y pendientes.
//! - `PgFlowCatalog`: definiciones de flow versionadas, compartidas entre réplicas.
//! - `PgInvocationStore`: invocaciones directas con `claim` atómico.
//!
//! El pool aplica las migraciones embebidas al construirse.

pub mod config;
pub mod error;
pub mod migrations;
pub mod pg;
pub mod schema;

pub use config::{init_dotenv, DbConfig};
pub use error::PersistenceError;
pub use pg::{build_pool, build_pool_from_env, with_retry, ConnectionProvider, PgEventStore, PgFlowCatalog,
             PgInvocationStore, PgJobStream, PgLedgerStore, PgPool, PoolProvider};
