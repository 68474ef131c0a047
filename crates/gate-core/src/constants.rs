//! Constantes del orquestador.

/// Versión lógica del motor. Entra en el hash de outputs de `RunCompleted`.
pub const ENGINE_VERSION: &str = "G1.0";

/// Clave bajo la que el payload del trigger es visible en el mapa de outputs
/// y en las plantillas (`{{trigger.text}}`).
pub const TRIGGER_KEY: &str = "trigger";

/// Tope por defecto de `Util.Delay` fuera de producción.
pub const DEFAULT_DELAY_CAP_MS: u64 = 5_000;
