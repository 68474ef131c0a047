#![allow(dead_code)]

use gate_persistence::{build_pool, DbConfig, PgPool};
use once_cell::sync::Lazy;

pub static TEST_POOL: Lazy<Option<PgPool>> = Lazy::new(|| {
    if std::env::var("DATABASE_URL").is_err() {
        return None;
    }
    let cfg = DbConfig::from_env().ok()?;
    match build_pool(&cfg.url, 1, 2) {
        Ok(p) => Some(p),
        Err(e) => {
            eprintln!("No se pudo construir pool de test: {e}");
            None
        }
    }
});

pub fn with_pool<F, R>(f: F) -> Option<R>
    where F: FnOnce(&PgPool) -> R
{
    match TEST_POOL.as_ref() {
        Some(p) => Some(f(p)),
        None => {
            eprintln!("skip (no DATABASE_URL)");
            None
        }
    }
}

/// Sufijo único para aislar refs y streams entre ejecuciones.
pub fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}
