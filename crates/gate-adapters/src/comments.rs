use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AdapterError;

/// Respuesta publicada en el hilo de un post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub post_id: String,
    /// Id del agente autor.
    pub author: String,
    pub body: String,
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn new(post_id: impl Into<String>,
               author: impl Into<String>,
               body: impl Into<String>,
               trace_id: impl Into<String>)
               -> Self {
        Self { id: Uuid::new_v4(),
               post_id: post_id.into(),
               author: author.into(),
               body: body.into(),
               trace_id: trace_id.into(),
               created_at: Utc::now() }
    }
}

#[async_trait]
pub trait CommentSink: Send + Sync + std::fmt::Debug {
    async fn post(&self, comment: Comment) -> Result<Comment, AdapterError>;

    async fn list(&self, post_id: &str) -> Result<Vec<Comment>, AdapterError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCommentSink {
    threads: DashMap<String, Vec<Comment>>,
}

impl InMemoryCommentSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CommentSink for InMemoryCommentSink {
    async fn post(&self, comment: Comment) -> Result<Comment, AdapterError> {
        if comment.post_id.is_empty() {
            return Err(AdapterError::Sink("post_id is required".into()));
        }
        self.threads.entry(comment.post_id.clone()).or_default().push(comment.clone());
        Ok(comment)
    }

    async fn list(&self, post_id: &str) -> Result<Vec<Comment>, AdapterError> {
        Ok(self.threads.get(post_id).map(|t| t.clone()).unwrap_or_default())
    }
}
