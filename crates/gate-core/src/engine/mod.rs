//! Orquestador: plan, ejecución y observadores.

mod builder;
mod core;
mod observer;
mod plan;

pub use builder::FlowEngineBuilder;
pub use core::FlowEngine;
pub use observer::{NodeObserver, NodeReport};
pub use plan::{plan, ExecutionPlan};
