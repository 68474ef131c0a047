//! Almacén de conocimiento por panel con búsqueda por similitud coseno.
//!
//! Si el `Embedder` configurado falla se usa el embedding por hash y el
//! documento (o la consulta) queda marcado `degraded`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AdapterError;

#[async_trait]
pub trait Embedder: Send + Sync + std::fmt::Debug {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AdapterError>;

    /// Embeddings sin semántica: todo lo que producen sale `degraded`.
    fn is_degraded(&self) -> bool {
        false
    }
}

/// Embedding determinista: cada token suma en el bucket que indica su hash
/// blake3. Sin semántica, sólo solapamiento léxico.
#[derive(Debug, Clone, Copy)]
pub struct HashEmbedder {
    pub dims: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self { dims: 256 }
    }
}

impl HashEmbedder {
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dims.max(1)];
        let len = v.len();
        for token in text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let h = blake3::hash(token.to_lowercase().as_bytes());
            let b = h.as_bytes();
            let idx = u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as usize % len;
            v[idx] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AdapterError> {
        Ok(self.embed_sync(text))
    }

    fn is_degraded(&self) -> bool {
        true
    }
}

/// 0.0 para vectores nulos o de distinta dimensión.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: Uuid,
    pub panel: String,
    pub text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeHit {
    pub id: Uuid,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub panel: String,
    pub hits: Vec<KnowledgeHit>,
    /// true si la consulta o algún resultado usó el embedding por hash.
    pub degraded: bool,
}

#[derive(Debug)]
pub struct KnowledgeStore {
    embedder: Arc<dyn Embedder>,
    fallback: HashEmbedder,
    docs: DashMap<String, Vec<KnowledgeDocument>>,
}

impl Default for KnowledgeStore {
    fn default() -> Self {
        Self::new(Arc::new(HashEmbedder::default()))
    }
}

impl KnowledgeStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder,
               fallback: HashEmbedder::default(),
               docs: DashMap::new() }
    }

    pub fn with_fallback_dims(mut self, dims: usize) -> Self {
        self.fallback = HashEmbedder { dims };
        self
    }

    async fn embed(&self, text: &str) -> (Vec<f32>, bool) {
        match self.embedder.embed(text).await {
            Ok(v) => (v, self.embedder.is_degraded()),
            Err(e) => {
                warn!("rag:embed degraded err={e}");
                (self.fallback.embed_sync(text), true)
            }
        }
    }

    pub async fn ingest(&self, panel: &str, text: &str) -> Result<KnowledgeDocument, AdapterError> {
        if text.trim().is_empty() {
            return Err(AdapterError::InvalidInput("empty document".into()));
        }
        let (embedding, degraded) = self.embed(text).await;
        let doc = KnowledgeDocument { id: Uuid::new_v4(),
                                      panel: panel.to_string(),
                                      text: text.to_string(),
                                      embedding,
                                      degraded,
                                      created_at: Utc::now() };
        self.docs.entry(panel.to_string()).or_default().push(doc.clone());
        debug!("rag:ingest panel={panel} doc={} degraded={degraded}", doc.id);
        Ok(doc)
    }

    pub async fn query(&self, panel: &str, q: &str, k: usize) -> Result<QueryResult, AdapterError> {
        if q.trim().is_empty() {
            return Err(AdapterError::InvalidInput("empty query".into()));
        }
        let (qv, mut degraded) = self.embed(q).await;
        let docs = self.docs.get(panel);
        let mut scored: Vec<(f32, &KnowledgeDocument)> = match docs.as_ref() {
            Some(docs) => docs.iter().map(|d| (cosine_similarity(&qv, &d.embedding), d)).collect(),
            None => Vec::new(),
        };
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        let hits: Vec<KnowledgeHit> = scored.into_iter()
                                            .take(k)
                                            .map(|(score, d)| {
                                                degraded |= d.degraded;
                                                KnowledgeHit { id: d.id,
                                                               text: d.text.clone(),
                                                               score }
                                            })
                                            .collect();
        Ok(QueryResult { panel: panel.to_string(),
                         hits,
                         degraded })
    }

    pub fn count(&self, panel: &str) -> usize {
        self.docs.get(panel).map_or(0, |d| d.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_edges() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn hash_embedding_is_deterministic() {
        let e = HashEmbedder { dims: 32 };
        assert_eq!(e.embed_sync("Refund policy"), e.embed_sync("refund POLICY"));
    }
}
