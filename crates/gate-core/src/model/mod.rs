mod context;
mod flow;
mod run;

pub use context::RunContext;
pub use flow::{EdgeSpec, Flow, FlowSpec, NodeSpec};
pub use run::{FlowRun, NodeCache, NodeStatus, RunMode, RunStatus};
