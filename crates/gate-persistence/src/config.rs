//! Configuración de conexión desde variables de entorno (`DATABASE_URL` y
//! tamaños de pool opcionales).

use std::env;

use dotenvy::dotenv;
use once_cell::sync::Lazy;

use crate::error::PersistenceError;

// .env se carga una sola vez; si no existe se ignora
static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenv();
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
}

fn parse_u32(name: &str, default: u32) -> Result<u32, PersistenceError> {
    match env::var(name) {
        Ok(v) => v.trim()
                  .parse()
                  .map_err(|_| PersistenceError::Config(format!("{name} inválido: `{v}`"))),
        Err(_) => Ok(default),
    }
}

impl DbConfig {
    pub fn from_env() -> Result<Self, PersistenceError> {
        init_dotenv();
        let url = env::var("DATABASE_URL").map_err(|_| PersistenceError::Config("DATABASE_URL no definido".into()))?;
        let min_connections = parse_u32("DATABASE_MIN_CONNECTIONS", 2)?;
        let max_connections = parse_u32("DATABASE_MAX_CONNECTIONS", 16)?;
        Ok(Self { url,
                  min_connections,
                  max_connections })
    }
}

/// Fuerza la carga de .env desde binarios que leen otras variables antes.
pub fn init_dotenv() {
    Lazy::force(&DOTENV_LOADED);
}
