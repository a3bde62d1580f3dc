//! Embedding providers for chunk vectors.
//!
//! | `embedding.provider` | Provider | Endpoint |
//! |----------------------|----------|----------|
//! | `disabled` | [`DisabledProvider`] | none; pages are stored as text only |
//! | `openai` | [`OpenAIProvider`] | `POST {url}/v1/embeddings` (default `https://api.openai.com`) |
//! | `ollama` | [`OllamaProvider`] | `POST {url}/api/embed` (default `http://localhost:11434`) |
//!
//! [`embed_chunks`] splits input into `batch_size` batches and checks that
//! every returned vector has the provider's dimensionality.
//!
//! Requests that fail with 429, a 5xx status or a network error are retried
//! up to `embedding.max_retries` times with exponential backoff (1s, 2s, 4s,
//! ... capped at 32s). Other 4xx responses fail immediately.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";
const MAX_BACKOFF_EXP: u32 = 5;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;

    fn dims(&self) -> usize;

    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Builds the provider named by `embedding.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Embeds `texts` in groups of `batch_size`, preserving input order.
pub async fn embed_chunks(
    provider: &dyn EmbeddingProvider,
    batch_size: usize,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    let mut vectors = Vec::with_capacity(texts.len());
    for batch in texts.chunks(batch_size.max(1)) {
        debug!(model = provider.model_name(), batch = batch.len(), "embedding batch");
        let embedded = provider.embed(batch).await?;
        if embedded.len() != batch.len() {
            bail!(
                "embedding provider returned {} vectors for {} inputs",
                embedded.len(),
                batch.len()
            );
        }
        if let Some(bad) = embedded.iter().find(|v| v.len() != provider.dims()) {
            bail!(
                "embedding has {} dimensions, expected {}",
                bad.len(),
                provider.dims()
            );
        }
        vectors.extend(embedded);
    }
    Ok(vectors)
}

pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }
}

/// OpenAI-compatible embeddings. Needs `OPENAI_API_KEY`; `embedding.url`
/// points it at a compatible gateway.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    api_key: String,
    http: JsonPoster,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = model_and_dims(config, "OpenAI")?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base = config.url.as_deref().unwrap_or(OPENAI_BASE_URL);
        Ok(Self {
            model,
            dims,
            api_key,
            http: JsonPoster::new(config, "OpenAI", endpoint(base, "/v1/embeddings"))?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({ "model": self.model, "input": texts });
        let response = self.http.post(&body, Some(&self.api_key)).await?;
        parse_openai_response(&response)
    }
}

/// Embeddings from an Ollama server.
pub struct OllamaProvider {
    model: String,
    dims: usize,
    http: JsonPoster,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model, dims) = model_and_dims(config, "Ollama")?;
        let base = config.url.as_deref().unwrap_or(OLLAMA_BASE_URL);
        Ok(Self {
            model,
            dims,
            http: JsonPoster::new(config, "Ollama", endpoint(base, "/api/embed"))?,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({ "model": self.model, "input": texts });
        let response = self.http.post(&body, None).await?;
        parse_ollama_response(&response)
    }
}

fn model_and_dims(config: &EmbeddingConfig, label: &str) -> Result<(String, usize)> {
    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow!("embedding.model required for {} provider", label))?;
    let dims = config
        .dims
        .ok_or_else(|| anyhow!("embedding.dims required for {} provider", label))?;
    Ok((model, dims))
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = data
        .iter()
        .enumerate()
        .map(|(pos, item)| {
            let values = item
                .get("embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
            let index = item
                .get("index")
                .and_then(Value::as_u64)
                .map_or(pos, |i| i as usize);
            Ok((index, to_f32(values)))
        })
        .collect::<Result<Vec<_>>>()?;

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|values| to_f32(values))
                .ok_or_else(|| anyhow!("Invalid Ollama response: embedding is not an array"))
        })
        .collect()
}

fn to_f32(values: &[Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// A JSON POST endpoint with retry on transient failures.
struct JsonPoster {
    http: reqwest::Client,
    url: String,
    label: &'static str,
    max_retries: u32,
}

impl JsonPoster {
    fn new(config: &EmbeddingConfig, label: &'static str, url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            url,
            label,
            max_retries: config.max_retries,
        })
    }

    async fn post(&self, body: &Value, bearer: Option<&str>) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(MAX_BACKOFF_EXP));
                warn!(provider = self.label, attempt, delay_secs = delay.as_secs(), "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let mut request = self.http.post(&self.url).json(body);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    last_err = Some(anyhow!("{} connection error at {}: {}", self.label, self.url, e));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response.json().await?);
            }

            let text = response.text().await.unwrap_or_default();
            let err = anyhow!("{} API error {}: {}", self.label, status, text);
            if status.as_u16() == 429 || status.is_server_error() {
                last_err = Some(err);
                continue;
            }
            return Err(err);
        }

        Err(last_err.unwrap_or_else(|| anyhow!("{} embedding failed after retries", self.label)))
    }
}

/// Little-endian f32 bytes, as stored in `chunk_vectors.vector`.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
