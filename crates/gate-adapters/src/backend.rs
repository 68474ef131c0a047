//! Backends de completado.
//!
//! `LexiconBackend` resuelve todas las tareas en proceso con heurísticas de
//! léxico y frecuencia. Un backend remoto implementa el mismo trait.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent::{AgentInput, AgentKind};
use crate::error::AdapterError;

#[async_trait]
pub trait CompletionBackend: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn complete(&self, kind: AgentKind, input: &AgentInput) -> Result<Value, AdapterError>;
}

const POSITIVE: &[&str] = &["great", "good", "excellent", "love", "awesome", "amazing", "happy", "fantastic",
                            "helpful", "nice", "perfect", "thanks", "bueno", "genial", "excelente"];
const NEGATIVE: &[&str] = &["bad", "terrible", "awful", "hate", "broken", "poor", "slow", "bug", "angry", "worst",
                            "useless", "disappointed", "malo", "horrible", "fatal"];
const STOPWORDS: &[&str] = &["the", "and", "for", "that", "this", "with", "from", "have", "was", "are", "but",
                             "not", "you", "your", "our", "its", "they", "them", "then", "than", "there", "what",
                             "when", "which", "would", "could", "should", "about", "into", "been", "were", "will"];

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

/// Polaridad en [-1, 1]; `score` es la confianza en la etiqueta en [0.5, 1].
pub fn lexicon_sentiment(text: &str) -> Value {
    let (mut pos, mut neg) = (0u32, 0u32);
    for w in words(text) {
        if POSITIVE.contains(&w.as_str()) {
            pos += 1;
        } else if NEGATIVE.contains(&w.as_str()) {
            neg += 1;
        }
    }
    let total = pos + neg;
    if total == 0 {
        return json!({ "label": "neutral", "score": 0.5, "polarity": 0.0 });
    }
    let polarity = (f64::from(pos) - f64::from(neg)) / f64::from(total);
    let label = if polarity > 0.0 {
        "positive"
    } else if polarity < 0.0 {
        "negative"
    } else {
        "neutral"
    };
    json!({ "label": label, "score": 0.5 + polarity.abs() / 2.0, "polarity": polarity })
}

fn summarize(text: &str, max_sentences: usize) -> Value {
    let sentences: Vec<&str> = text.split_inclusive(['.', '!', '?'])
                                   .map(str::trim)
                                   .filter(|s| !s.is_empty())
                                   .collect();
    let summary = sentences.iter().take(max_sentences).copied().collect::<Vec<_>>().join(" ");
    json!({ "summary": summary, "sentences": sentences.len() })
}

fn tags(text: &str, k: usize) -> Value {
    let stop: HashSet<&str> = STOPWORDS.iter().copied().collect();
    let mut freq: BTreeMap<String, u32> = BTreeMap::new();
    for w in words(text).filter(|w| w.chars().count() > 3 && !stop.contains(w.as_str())) {
        *freq.entry(w).or_default() += 1;
    }
    let mut ranked: Vec<(String, u32)> = freq.into_iter().collect();
    // frecuencia descendente; empate por orden alfabético (BTreeMap ya ordena)
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    let tags: Vec<String> = ranked.into_iter().take(k).map(|(w, _)| w).collect();
    json!({ "tags": tags })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LexiconBackend;

#[async_trait]
impl CompletionBackend for LexiconBackend {
    fn name(&self) -> &str {
        "lexicon"
    }

    async fn complete(&self, kind: AgentKind, input: &AgentInput) -> Result<Value, AdapterError> {
        let param_usize = |key: &str, default: usize| {
            input.params
                 .get(key)
                 .and_then(Value::as_u64)
                 .map(|v| v as usize)
                 .unwrap_or(default)
        };
        match kind {
            AgentKind::Sentiment => Ok(lexicon_sentiment(&input.text)),
            AgentKind::Summarize => Ok(summarize(&input.text, param_usize("max_sentences", 2))),
            AgentKind::Tag => Ok(tags(&input.text, param_usize("k", 5))),
            // sin motor de voz: un transcript ya provisto pasa tal cual
            AgentKind::Transcribe => match input.params.get("transcript").and_then(Value::as_str) {
                Some(t) => Ok(json!({ "text": t, "language": "und" })),
                None if !input.text.is_empty() => Ok(json!({ "text": input.text, "language": "und" })),
                None => Err(AdapterError::Upstream("no speech engine configured".into())),
            },
        }
    }
}
