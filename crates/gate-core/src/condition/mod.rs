//! Condiciones `if` de nodo: comparaciones, operadores lógicos y paths con
//! puntos. No hay llamadas a funciones ni acceso a nada fuera del mapa de
//! outputs del run.

mod lexer;
mod parser;

pub use lexer::MAX_CONDITION_LEN;
pub use parser::{evaluate, parse, truthy, CmpOp, Expr, MAX_NESTING};
