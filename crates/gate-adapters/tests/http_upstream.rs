use std::sync::Arc;
use std::time::Duration;

use gate_adapters::{AdapterRegistry, AgentInput, AgentKind, CompletionBackend, Embedder, HttpCompletionBackend,
                    HttpEmbedder, KnowledgeStore, NhaAdapter, UpstreamConfig};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Responde una única petición con `status` y `body`, y devuelve el cuerpo
/// JSON recibido.
async fn serve_once(status: &'static str, body: Value) -> (String, tokio::task::JoinHandle<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/v1", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let received = loop {
            let n = sock.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(split) = text.find("\r\n\r\n") {
                let len = text[..split].lines()
                                       .find_map(|l| {
                                           let (k, v) = l.split_once(':')?;
                                           k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse().ok())?
                                       })
                                       .unwrap_or(0usize);
                if buf.len() >= split + 4 + len {
                    break serde_json::from_slice(&buf[split + 4..split + 4 + len]).unwrap_or(Value::Null);
                }
            }
            if n == 0 {
                break Value::Null;
            }
        };
        let payload = body.to_string();
        let resp = format!("HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: \
                            close\r\n\r\n{payload}",
                           payload.len());
        sock.write_all(resp.as_bytes()).await.unwrap();
        received
    });
    (url, handle)
}

fn cfg(url: &str) -> UpstreamConfig {
    UpstreamConfig::new(url, Duration::from_secs(2))
}

#[tokio::test]
async fn completion_posts_agent_and_text() {
    let (url, server) = serve_once("200 OK", json!({ "label": "positive", "score": 0.93 })).await;
    let backend = HttpCompletionBackend::new(cfg(&url));
    let out = backend.complete(AgentKind::Sentiment, &AgentInput::text("love it")).await.unwrap();
    assert_eq!(out["label"], "positive");
    let sent = server.await.unwrap();
    assert_eq!(sent["agent"], "sentiment");
    assert_eq!(sent["text"], "love it");
}

#[tokio::test]
async fn upstream_error_status_degrades_the_agent() {
    let (url, _server) = serve_once("503 Service Unavailable", json!({ "error": "busy" })).await;
    let registry = AdapterRegistry::with_backend(Arc::new(HttpCompletionBackend::new(cfg(&url))));
    let res = registry.resolve("sentiment").unwrap().process(&AgentInput::text("love it")).await.unwrap();
    assert!(res.degraded);
    assert_eq!(res.output["label"], "neutral");
}

#[tokio::test]
async fn unreachable_upstream_degrades_instead_of_failing() {
    let registry = AdapterRegistry::with_backend(Arc::new(HttpCompletionBackend::new(cfg("http://127.0.0.1:9/v1"))));
    let res = registry.resolve("tag").unwrap().process(&AgentInput::text("billing invoice")).await.unwrap();
    assert!(res.degraded);
    assert_eq!(res.output["tags"], json!([]));
}

#[tokio::test]
async fn non_object_completion_is_an_upstream_error() {
    let (url, _server) = serve_once("200 OK", json!(["not", "an", "object"])).await;
    let backend = HttpCompletionBackend::new(cfg(&url));
    assert!(backend.complete(AgentKind::Tag, &AgentInput::text("x")).await.is_err());
}

#[tokio::test]
async fn embedder_reads_the_vector() {
    let (url, server) = serve_once("200 OK", json!({ "data": [{ "embedding": [0.1, 0.2, 0.3] }] })).await;
    let embedder = HttpEmbedder::new(cfg(&url));
    assert_eq!(embedder.embed("refund policy").await.unwrap().len(), 3);
    assert_eq!(server.await.unwrap()["input"], "refund policy");
}

#[tokio::test]
async fn knowledge_falls_back_to_hash_when_the_embedder_is_down() {
    let store = KnowledgeStore::new(Arc::new(HttpEmbedder::new(cfg("http://127.0.0.1:9/embed"))));
    let doc = store.ingest("support", "refunds take five days").await.unwrap();
    assert!(doc.degraded);
    let res = store.query("support", "refunds", 1).await.unwrap();
    assert!(res.degraded);
    assert_eq!(res.hits.len(), 1);
}
