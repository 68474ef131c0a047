//! gate-adapters: agentes NHA, almacén de conocimiento, hilo de comentarios
//! y los connectors de flow que los usan.
//!
//! - `agent` / `backend` / `registry`: `process(input) -> result` por agente,
//!   con salida degradada cuando el backend falla.
//! - `knowledge`: ingest/query por panel con similitud coseno.
//! - `comments`: destino de las respuestas en el hilo de un post.
//! - `http`: backend de completado y embedder remotos.
//! - `invocation`: registro de invocaciones directas y su store.
//! - `connectors`: `Action.NHA.Invoke`, `Action.RAG.Query`,
//!   `Action.Comment.Post`.
pub mod agent;
pub mod backend;
pub mod comments;
pub mod connectors;
pub mod error;
pub mod http;
pub mod invocation;
pub mod knowledge;
pub mod registry;

pub use agent::{fallback_output, AgentInput, AgentKind, AgentResult, BackendAdapter, NhaAdapter};
pub use backend::{lexicon_sentiment, CompletionBackend, LexiconBackend};
pub use comments::{Comment, CommentSink, InMemoryCommentSink};
pub use connectors::{CommentPostConnector, NhaInvokeConnector, RagQueryConnector};
pub use error::AdapterError;
pub use http::{HttpCompletionBackend, HttpEmbedder, UpstreamConfig};
pub use invocation::{InMemoryInvocationStore, Invocation, InvocationStatus, InvocationStore};
pub use knowledge::{cosine_similarity, Embedder, HashEmbedder, KnowledgeDocument, KnowledgeHit, KnowledgeStore,
                    QueryResult};
pub use registry::AdapterRegistry;
