//! Backends remotos sobre HTTP.
//!
//! `HttpCompletionBackend` hace `POST {url}` con `{agent, text, params}` y
//! espera un objeto JSON con la salida del agente. `HttpEmbedder` hace
//! `POST {url}` con `{input}` y acepta `{embedding: [...]}` o la forma
//! `{data: [{embedding: [...]}]}`. Cualquier fallo de red, status no 2xx o
//! cuerpo inesperado es `Upstream`/`Embedding`, así el adapter y el
//! `KnowledgeStore` caen a su salida degradada.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};

use crate::agent::{AgentInput, AgentKind};
use crate::backend::CompletionBackend;
use crate::error::AdapterError;
use crate::knowledge::Embedder;

/// Destino HTTP y credencial opcional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl UpstreamConfig {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self { url: url.into(),
               token: None,
               timeout }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }
}

#[derive(Debug, Clone)]
struct UpstreamClient {
    config: UpstreamConfig,
    client: reqwest::Client,
}

impl UpstreamClient {
    fn new(config: UpstreamConfig) -> Self {
        let client = reqwest::Client::builder().timeout(config.timeout)
                                               .build()
                                               .unwrap_or_default();
        Self { config, client }
    }

    async fn post(&self, body: &Value) -> Result<Value, String> {
        let mut req = self.client.post(&self.config.url).json(body);
        if let Some(token) = &self.config.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| format!("request failed: {e}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("status {status}"));
        }
        resp.json::<Value>().await.map_err(|e| format!("bad body: {e}"))
    }
}

#[derive(Debug, Clone)]
pub struct HttpCompletionBackend {
    upstream: UpstreamClient,
}

impl HttpCompletionBackend {
    pub fn new(config: UpstreamConfig) -> Self {
        Self { upstream: UpstreamClient::new(config) }
    }
}

#[async_trait]
impl CompletionBackend for HttpCompletionBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn complete(&self, kind: AgentKind, input: &AgentInput) -> Result<Value, AdapterError> {
        let body = json!({ "agent": kind.as_str(), "text": input.text, "params": input.params });
        let out = self.upstream.post(&body).await.map_err(AdapterError::Upstream)?;
        if !out.is_object() {
            return Err(AdapterError::Upstream(format!("{} output is not an object", kind.as_str())));
        }
        debug!("upstream:complete agent={} url={}", kind.as_str(), self.upstream.config.url);
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    upstream: UpstreamClient,
}

impl HttpEmbedder {
    pub fn new(config: UpstreamConfig) -> Self {
        Self { upstream: UpstreamClient::new(config) }
    }
}

fn parse_embedding(body: &Value) -> Option<Vec<f32>> {
    let raw = body.get("embedding")
                  .or_else(|| body.pointer("/data/0/embedding"))?
                  .as_array()?;
    let v: Option<Vec<f32>> = raw.iter().map(|x| x.as_f64().map(|f| f as f32)).collect();
    v.filter(|v| !v.is_empty())
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, AdapterError> {
        let body = self.upstream
                       .post(&json!({ "input": text }))
                       .await
                       .map_err(AdapterError::Embedding)?;
        parse_embedding(&body).ok_or_else(|| AdapterError::Embedding("response has no embedding".into()))
    }
}
