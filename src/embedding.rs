//! Embedding capability and provider implementations.
//!
//! The pipeline treats the embedder as an injected capability behind the
//! [`Embedder`] trait. Concrete providers:
//! - **[`OllamaEmbedder`]** — calls a local Ollama instance's `/api/embed`.
//! - **[`OpenAIEmbedder`]** — calls the OpenAI embeddings API.
//!
//! Both batch their inputs and retry transient failures with exponential
//! backoff: HTTP 429 and 5xx retry, other 4xx fail immediately, network
//! errors retry. The embedding dimension is fixed per provider and checked
//! against KB metadata by the pipeline.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::EmbeddingConfig;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identity recorded in KB metadata.
    fn model_name(&self) -> &str;
    /// Fixed output dimension.
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Instantiate the configured provider.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<std::sync::Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "ollama" => Ok(std::sync::Arc::new(OllamaEmbedder::new(config)?)),
        "openai" => Ok(std::sync::Arc::new(OpenAIEmbedder::new(config)?)),
        "disabled" => bail!("Embedding provider is disabled; ingest requires one"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

fn required_model(config: &EmbeddingConfig) -> Result<String> {
    config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required"))
}

fn required_dims(config: &EmbeddingConfig) -> Result<usize> {
    config
        .dims
        .ok_or_else(|| anyhow::anyhow!("embedding.dims required"))
}

// ============ Ollama ============

pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    endpoint: String,
    timeout_secs: u64,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Ok(Self {
            model: required_model(config)?,
            dims: required_dims(config)?,
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;
        let url = format!("{}/api/embed", self.endpoint.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = match client.post(&url).json(&body).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last_err = Some(anyhow::anyhow!("network error: {}", e));
                    continue;
                }
            };

            let status = resp.status();
            if status.as_u16() == 429 || status.is_server_error() {
                last_err = Some(anyhow::anyhow!("ollama returned {}", status));
                continue;
            }
            if !status.is_success() {
                bail!("ollama returned {}", status);
            }

            let parsed: serde_json::Value = resp.json().await?;
            let embeddings = parsed["embeddings"]
                .as_array()
                .ok_or_else(|| anyhow::anyhow!("missing embeddings in ollama response"))?;
            let mut out = Vec::with_capacity(embeddings.len());
            for row in embeddings {
                let vector: Vec<f32> = row
                    .as_array()
                    .ok_or_else(|| anyhow::anyhow!("malformed embedding row"))?
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect();
                out.push(vector);
            }
            if out.len() != texts.len() {
                bail!(
                    "ollama returned {} embeddings for {} inputs",
                    out.len(),
                    texts.len()
                );
            }
            return Ok(out);
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("embedding retries exhausted")))
    }
}

// ============ OpenAI ============

pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    timeout_secs: u64,
    max_retries: u32,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }
        Ok(Self {
            model: required_model(config)?,
            dims: required_dims(config)?,
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = match client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", api_key))
                .json(&body)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_err = Some(anyhow::anyhow!("network error: {}", e));
                    continue;
                }
            };

            let status = resp.status();
            if status.as_u16() == 429 || status.is_server_error() {
                last_err = Some(anyhow::anyhow!("openai returned {}", status));
                continue;
            }
            if !status.is_success() {
                bail!("openai returned {}", status);
            }

            let parsed: serde_json::Value = resp.json().await?;
            let data = parsed["data"]
                .as_array()
                .ok_or_else(|| anyhow::anyhow!("missing data in openai response"))?;
            let mut rows: Vec<(i64, Vec<f32>)> = Vec::with_capacity(data.len());
            for item in data {
                let index = item["index"].as_i64().unwrap_or(rows.len() as i64);
                let vector: Vec<f32> = item["embedding"]
                    .as_array()
                    .ok_or_else(|| anyhow::anyhow!("malformed embedding row"))?
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect();
                rows.push((index, vector));
            }
            rows.sort_by_key(|(index, _)| *index);
            let out: Vec<Vec<f32>> = rows.into_iter().map(|(_, v)| v).collect();
            if out.len() != texts.len() {
                bail!(
                    "openai returned {} embeddings for {} inputs",
                    out.len(),
                    texts.len()
                );
            }
            return Ok(out);
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("embedding retries exhausted")))
    }
}
