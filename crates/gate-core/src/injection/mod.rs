//! Inyección de outputs previos en los parámetros de un nodo.

mod template;

pub use template::{lookup_path, render_params, render_text};
