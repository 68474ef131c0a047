//! gate-worker: consumo at-least-once de jobs con grupos de consumidores.
//!
//! El worker hace ack sólo ante resultados terminales; los errores
//! transitorios quedan pendientes y se reclaman con `claim_idle`. La
//! deduplicación real la hace el engine (un run terminal no se re-ejecuta).
pub mod error;
pub mod jobs;
pub mod memory;
pub mod stream;
pub mod worker;

pub use error::WorkerError;
pub use jobs::{decode, FlowJob, FlowJobHandler, InvocationJob, JobHandler, JobOutcome, FLOW_JOBS_STREAM,
               INVOCATION_JOBS_STREAM};
pub use memory::InMemoryStream;
pub use stream::{JobStream, StreamMessage};
pub use worker::{FlowWorker, PollStats, WorkerConfig};
