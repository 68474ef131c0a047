//! Tipos de nodo, contrato de connector y registro.

pub mod builtin;
mod connector;
mod kind;
mod registry;

pub use connector::{Connector, ConnectorError, ConnectorLog, ConnectorOutcome, OutputMap};
pub use kind::NodeKind;
pub use registry::ConnectorRegistry;
