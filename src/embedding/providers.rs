//! Embedding provider implementations.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{EmbeddingError, EmbeddingProvider, TransientKind};

/// Longest summary returned by the local provider.
const LOCAL_SUMMARY_LEN: usize = 200;

// ---------------------------------------------------------------------------
// HashingEmbeddingProvider
// ---------------------------------------------------------------------------

/// Deterministic local embedding: feature-hashed bag of lowercase tokens,
/// L2-normalized. Needs no network, so it backs offline runs and tests.
#[derive(Debug, Clone)]
pub struct HashingEmbeddingProvider {
    dimension: usize,
}

impl HashingEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut v = vec![0.0f32; self.dimension];
        let mut tokens = 0usize;
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = fnv1a(token.to_lowercase().as_bytes());
            let slot = (h % self.dimension as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[slot] += sign;
            tokens += 1;
        }
        if tokens == 0 {
            return Err(EmbeddingError::InvalidInput("text has no tokens".to_string()));
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    h
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddingProvider {
    fn name(&self) -> &str {
        "hashing"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_sync(text)
    }

    async fn summarize(&self, text: &str) -> Result<String, EmbeddingError> {
        let first = text
            .split_inclusive(['.', '!', '?'])
            .next()
            .unwrap_or(text)
            .trim();
        Ok(first.chars().take(LOCAL_SUMMARY_LEN).collect())
    }
}

// ---------------------------------------------------------------------------
// HttpEmbeddingProvider
// ---------------------------------------------------------------------------

/// OpenAI-compatible HTTP provider.
///
/// Embeddings: `POST {endpoint}` with `{"model", "input"}`, reading
/// `data[0].embedding`. Summaries: `POST {chat_endpoint}` with a single user
/// message, reading `choices[0].message.content`.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    chat_endpoint: Option<String>,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbeddingProvider {
    pub fn new(
        endpoint: impl Into<String>,
        chat_endpoint: Option<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbeddingError::InvalidInput(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            chat_endpoint,
            model: model.into(),
            api_key,
        })
    }

    async fn post(&self, url: &str, body: Value) -> Result<Value, EmbeddingError> {
        let mut req = self.client.post(url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(classify_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text));
        }
        resp.json::<Value>().await.map_err(classify_reqwest)
    }
}

fn classify_status(status: u16, body: &str) -> EmbeddingError {
    let message = format!("HTTP {}: {}", status, body.chars().take(200).collect::<String>());
    match status {
        408 => EmbeddingError::transient(TransientKind::Timeout, message),
        429 => EmbeddingError::transient(TransientKind::RateLimited, message),
        500..=599 => EmbeddingError::transient(TransientKind::ServerError, message),
        _ => EmbeddingError::InvalidInput(message),
    }
}

fn classify_reqwest(e: reqwest::Error) -> EmbeddingError {
    if e.is_timeout() {
        EmbeddingError::transient(TransientKind::Timeout, e.to_string())
    } else if e.is_decode() {
        EmbeddingError::InvalidInput(format!("undecodable response: {}", e))
    } else {
        EmbeddingError::transient(TransientKind::Network, e.to_string())
    }
}

fn extract_embedding(body: &Value) -> Result<Vec<f32>, EmbeddingError> {
    body.pointer("/data/0/embedding")
        .and_then(Value::as_array)
        .ok_or_else(|| EmbeddingError::InvalidInput("response has no data[0].embedding".into()))?
        .iter()
        .map(|x| {
            x.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| EmbeddingError::InvalidInput("non-numeric embedding value".into()))
        })
        .collect()
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".to_string()));
        }
        let body = self
            .post(&self.endpoint, json!({ "model": self.model, "input": text }))
            .await?;
        extract_embedding(&body)
    }

    async fn summarize(&self, text: &str) -> Result<String, EmbeddingError> {
        let url = self
            .chat_endpoint
            .as_deref()
            .ok_or_else(|| EmbeddingError::InvalidInput("no chat endpoint configured".into()))?;
        let body = self
            .post(
                url,
                json!({
                    "model": self.model,
                    "messages": [{ "role": "user", "content": text }],
                }),
            )
            .await?;
        body.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EmbeddingError::InvalidInput("response has no summary content".into()))
    }
}
