//! Multi-provider text-to-vector embedding client (spec §4.D).
//!
//! Three provider modes are modeled as a tagged [`Provider`] rather than an
//! open plug-in system: remote batched OpenAI-style, local per-request
//! Ollama, and remote batched Google. The contract is uniform —
//! [`Provider::embed`] always returns one vector per input text, in input
//! order — and the client never retries internally; retry on failure is the
//! caller's job (see `crystal-ingest`).

#![deny(unsafe_code)]

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// No single request to a batched remote provider carries more than this
/// many characters of input text.
pub const MAX_BATCH_CHARS: usize = 800_000;

const REMOTE_TIMEOUT: Duration = Duration::from_secs(30);
const LOCAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors from an embedding call.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// The HTTP transport failed (connection, TLS, timeout).
    #[error("embedding request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The provider responded with a non-2xx status.
    #[error("embedding provider returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
    /// The provider returned a different number of vectors than inputs.
    #[error("provider returned {got} vectors for {expected} inputs")]
    CountMismatch {
        /// Vectors actually returned.
        got: usize,
        /// Inputs submitted.
        expected: usize,
    },
}

/// Configuration for the OpenAI-style remote batched provider.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// API base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// Embedding model name.
    pub model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "text-embedding-3-small".to_string(),
        }
    }
}

/// Configuration for the local Ollama provider (one request per input).
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Local server host, e.g. `http://127.0.0.1:11434`.
    pub host: String,
    /// Embedding model name.
    pub model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self { host: "http://127.0.0.1:11434".to_string(), model: "nomic-embed-text".to_string() }
    }
}

/// Configuration for the Google remote batched provider.
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    /// API base URL.
    pub base_url: String,
    /// API key.
    pub api_key: String,
    /// Embedding model name.
    pub model: String,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key: String::new(),
            model: "text-embedding-004".to_string(),
        }
    }
}

/// A configured embedding backend.
#[derive(Debug, Clone)]
pub enum Provider {
    /// Remote batched OpenAI-compatible provider, 1536-dim default.
    OpenAi(OpenAiConfig),
    /// Local HTTP Ollama server, 768-dim default, one request per input.
    Ollama(OllamaConfig),
    /// Remote batched Google provider, 768-dim default.
    Google(GoogleConfig),
}

impl Provider {
    /// The provider's default vector dimension, used to seed a store with
    /// no dimension yet locked in, before the first real vector arrives.
    pub fn default_dimension(&self) -> usize {
        match self {
            Provider::OpenAi(_) => 1536,
            Provider::Ollama(_) => 768,
            Provider::Google(_) => 768,
        }
    }

    fn timeout(&self) -> Duration {
        match self {
            Provider::Ollama(_) => LOCAL_TIMEOUT,
            Provider::OpenAi(_) | Provider::Google(_) => REMOTE_TIMEOUT,
        }
    }

    fn client(&self) -> Result<reqwest::Client, EmbedError> {
        Ok(reqwest::Client::builder().timeout(self.timeout()).build()?)
    }

    /// Embed `texts`, returning one vector per input in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            Provider::OpenAi(cfg) => embed_openai(cfg, texts).await,
            Provider::Ollama(cfg) => embed_ollama(cfg, texts).await,
            Provider::Google(cfg) => embed_google(cfg, texts).await,
        }
    }
}

/// Split `texts` into sub-batches, none exceeding [`MAX_BATCH_CHARS`]
/// characters of combined input, preserving order.
fn batch_by_chars(texts: &[String]) -> Vec<Vec<usize>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_chars = 0usize;
    for (idx, text) in texts.iter().enumerate() {
        let len = text.chars().count();
        if !current.is_empty() && current_chars + len > MAX_BATCH_CHARS {
            batches.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        current.push(idx);
        current_chars += len;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

async fn embed_openai(cfg: &OpenAiConfig, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
    let client = Provider::OpenAi(cfg.clone()).client()?;
    let mut out: Vec<Vec<f32>> = vec![Vec::new(); texts.len()];
    for batch in batch_by_chars(texts) {
        let inputs: Vec<&str> = batch.iter().map(|&i| texts[i].as_str()).collect();
        let body = serde_json::json!({ "model": cfg.model, "input": inputs });
        let response = client
            .post(format!("{}/embeddings", cfg.base_url))
            .header("Authorization", format!("Bearer {}", cfg.api_key))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Status { status, body });
        }
        let parsed: OpenAiEmbeddingResponse = response.json().await?;
        if parsed.data.len() != batch.len() {
            return Err(EmbedError::CountMismatch { got: parsed.data.len(), expected: batch.len() });
        }
        for item in parsed.data {
            out[batch[item.index]] = item.embedding;
        }
    }
    Ok(out)
}

#[derive(Deserialize)]
struct GoogleEmbeddingResponse {
    embeddings: Vec<GoogleEmbedding>,
}

#[derive(Deserialize)]
struct GoogleEmbedding {
    values: Vec<f32>,
}

async fn embed_google(cfg: &GoogleConfig, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
    let client = Provider::Google(cfg.clone()).client()?;
    let mut out = Vec::with_capacity(texts.len());
    for batch in batch_by_chars(texts) {
        let requests: Vec<_> = batch
            .iter()
            .map(|&i| {
                serde_json::json!({
                    "model": format!("models/{}", cfg.model),
                    "content": { "parts": [{ "text": texts[i] }] },
                })
            })
            .collect();
        let body = serde_json::json!({ "requests": requests });
        let response = client
            .post(format!(
                "{}/models/{}:batchEmbedContents?key={}",
                cfg.base_url, cfg.model, cfg.api_key
            ))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Status { status, body });
        }
        let parsed: GoogleEmbeddingResponse = response.json().await?;
        if parsed.embeddings.len() != batch.len() {
            return Err(EmbedError::CountMismatch {
                got: parsed.embeddings.len(),
                expected: batch.len(),
            });
        }
        for emb in parsed.embeddings {
            out.push(emb.values);
        }
    }
    Ok(out)
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

async fn embed_ollama(cfg: &OllamaConfig, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
    let client = Provider::Ollama(cfg.clone()).client()?;
    let mut out = Vec::with_capacity(texts.len());
    for text in texts {
        let body = serde_json::json!({ "model": cfg.model, "prompt": text });
        let response =
            client.post(format!("{}/api/embeddings", cfg.host)).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Status { status, body });
        }
        let parsed: OllamaEmbeddingResponse = response.json().await?;
        out.push(parsed.embedding);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(batch_by_chars(&[]).is_empty());
    }

    #[test]
    fn single_small_input_is_one_batch() {
        let texts = vec!["hello".to_string(), "world".to_string()];
        let batches = batch_by_chars(&texts);
        assert_eq!(batches, vec![vec![0, 1]]);
    }

    #[test]
    fn splits_when_exceeding_char_budget() {
        let big = "x".repeat(MAX_BATCH_CHARS - 10);
        let texts = vec![big.clone(), big.clone(), "small".to_string()];
        let batches = batch_by_chars(&texts);
        // each oversized text alone fills a batch; the third joins the
        // second because 10 + 5 <= MAX_BATCH_CHARS is false only once
        // capacity is exceeded, so it gets its own batch too.
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], vec![0]);
        assert_eq!(batches[1], vec![1]);
        assert_eq!(batches[2], vec![2]);
    }

    #[test]
    fn preserves_input_order_within_batches() {
        let texts: Vec<String> = (0..5).map(|i| format!("text-{i}")).collect();
        let batches = batch_by_chars(&texts);
        let flattened: Vec<usize> = batches.into_iter().flatten().collect();
        assert_eq!(flattened, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn default_dimensions_match_provider_conventions() {
        assert_eq!(Provider::OpenAi(OpenAiConfig::default()).default_dimension(), 1536);
        assert_eq!(Provider::Ollama(OllamaConfig::default()).default_dimension(), 768);
        assert_eq!(Provider::Google(GoogleConfig::default()).default_dimension(), 768);
    }

    #[tokio::test]
    async fn embedding_empty_text_slice_short_circuits() {
        let provider = Provider::OpenAi(OpenAiConfig::default());
        let result = provider.embed(&[]).await.unwrap();
        assert!(result.is_empty());
    }
}
