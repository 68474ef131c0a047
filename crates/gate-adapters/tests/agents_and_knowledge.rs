use std::sync::Arc;

use async_trait::async_trait;
use gate_adapters::{AdapterError, AdapterRegistry, AgentInput, AgentKind, CompletionBackend, Embedder,
                    KnowledgeStore};
use serde_json::{json, Value};

#[derive(Debug)]
struct DownBackend;

#[async_trait]
impl CompletionBackend for DownBackend {
    fn name(&self) -> &str {
        "down"
    }

    async fn complete(&self, _kind: AgentKind, _input: &AgentInput) -> Result<Value, AdapterError> {
        Err(AdapterError::Upstream("503 from provider".into()))
    }
}

#[derive(Debug)]
struct DownEmbedder;

#[async_trait]
impl Embedder for DownEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, AdapterError> {
        Err(AdapterError::Embedding("timeout".into()))
    }
}

/// Embedder "real" de juguete: cuenta vocales y consonantes.
#[derive(Debug)]
struct ShapeEmbedder;

#[async_trait]
impl Embedder for ShapeEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AdapterError> {
        let vowels = text.chars().filter(|c| "aeiou".contains(*c)).count() as f32;
        Ok(vec![vowels, text.len() as f32 - vowels])
    }
}

#[tokio::test]
async fn lexicon_registry_serves_every_agent() {
    let reg = AdapterRegistry::lexicon();
    assert_eq!(reg.agents(), AgentKind::ALL.to_vec());
    let res = reg.resolve("sentiment").unwrap().process(&AgentInput::text("great product")).await.unwrap();
    assert!(!res.degraded);
    assert_eq!(res.output["label"], "positive");
    assert_eq!(res.cost, 1);
    let out = res.to_output();
    assert_eq!(out["agent"], "sentiment");
    assert_eq!(out["degraded"], false);
    assert!(matches!(reg.resolve("translate"), Err(AdapterError::UnknownAgent(_))));
}

#[tokio::test]
async fn upstream_failure_yields_degraded_fallback() {
    let reg = AdapterRegistry::with_backend(Arc::new(DownBackend));
    let res = reg.resolve("sentiment").unwrap().process(&AgentInput::text("great product")).await.unwrap();
    assert!(res.degraded);
    assert_eq!(res.output, json!({"label": "neutral", "score": 0.5}));
    let tags = reg.resolve("tag").unwrap().process(&AgentInput::text("x")).await.unwrap();
    assert_eq!(tags.output, json!({"tags": []}));
}

#[tokio::test]
async fn empty_text_is_invalid_input() {
    let reg = AdapterRegistry::lexicon();
    let err = reg.resolve("summarize").unwrap().process(&AgentInput::text("  ")).await.unwrap_err();
    assert!(matches!(err, AdapterError::InvalidInput(_)));
}

#[tokio::test]
async fn knowledge_query_ranks_by_similarity_per_panel() {
    let store = KnowledgeStore::default();
    store.ingest("support", "refund policy for annual plans").await.unwrap();
    store.ingest("support", "how to reset your password").await.unwrap();
    store.ingest("sales", "refund policy").await.unwrap();
    let res = store.query("support", "refund policy", 1).await.unwrap();
    assert_eq!(res.hits.len(), 1);
    assert_eq!(res.hits[0].text, "refund policy for annual plans");
    // el embedding por hash siempre se reporta
    assert!(res.degraded);
    assert!(store.query("empty", "anything", 3).await.unwrap().hits.is_empty());
}

#[tokio::test]
async fn embedder_failure_falls_back_and_flags_degraded() {
    let healthy = KnowledgeStore::new(Arc::new(ShapeEmbedder));
    healthy.ingest("p", "aaaa").await.unwrap();
    let res = healthy.query("p", "aa", 3).await.unwrap();
    assert!(!res.degraded);

    let broken = KnowledgeStore::new(Arc::new(DownEmbedder));
    let doc = broken.ingest("p", "billing faq").await.unwrap();
    assert!(doc.degraded);
    let res = broken.query("p", "billing", 3).await.unwrap();
    assert!(res.degraded);
    assert_eq!(res.hits[0].id, doc.id);
}
