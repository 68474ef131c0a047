mod catalog;
mod types;

pub use catalog::{validate_definition, FlowCatalog, InMemoryFlowCatalog};
pub use types::{ReplayRunRepository, RunInstance, RunRepository};
