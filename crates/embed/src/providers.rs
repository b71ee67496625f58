//! Built-in embedding providers.
//!
//! - `local` — deterministic hash-to-vector. Tests and offline development.
//! - `fastembed` — local ONNX inference, 384-d, lazy model load (feature).
//! - `openai` — OpenAI-compatible `/embeddings` REST endpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use sha2::{Digest, Sha512};

use p8_config::Settings;

use crate::EmbeddingProvider;

// ── local ─────────────────────────────────────────────────────────────────────

/// Hash-based deterministic embeddings. Same text, same vector; vectors are
/// L2-normalized so cosine similarity behaves. No semantic content — never
/// use outside tests.
pub struct LocalHashProvider {
    dimensions: usize,
}

impl LocalHashProvider {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn hash_embed(&self, text: &str) -> Vec<f32> {
        let mut raw: Vec<f32> = Vec::with_capacity(self.dimensions + 32);
        let mut seed: Vec<u8> = text.as_bytes().to_vec();

        while raw.len() < self.dimensions {
            let digest = Sha512::digest(&seed);
            seed = digest.to_vec();
            // 32 unsigned 16-bit lanes per 64-byte digest, mapped to [-1, 1].
            for pair in digest.chunks_exact(2) {
                let lane = u16::from_le_bytes([pair[0], pair[1]]);
                raw.push((lane as f32 / 32767.5) - 1.0);
            }
        }

        raw.truncate(self.dimensions);
        let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut raw {
                *v /= norm;
            }
        }
        raw
    }
}

#[async_trait]
impl EmbeddingProvider for LocalHashProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.hash_embed(t)).collect())
    }

    fn provider_name(&self) -> &str {
        "local"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ── fastembed ─────────────────────────────────────────────────────────────────

/// Local ONNX embeddings. The model downloads on first use, so initialization
/// is deferred until the first embed call.
#[cfg(feature = "fastembed")]
pub struct FastEmbedProvider {
    model_name: String,
    dimensions: usize,
    model: tokio::sync::OnceCell<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "fastembed")]
impl FastEmbedProvider {
    pub fn new(model_name: &str, dimensions: usize) -> Self {
        Self {
            model_name: model_name.to_string(),
            dimensions,
            model: tokio::sync::OnceCell::new(),
        }
    }
}

#[cfg(feature = "fastembed")]
#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model_name = self.model_name.clone();
        let model = self
            .model
            .get_or_try_init(|| async move {
                tokio::task::spawn_blocking(move || {
                    let options = fastembed::InitOptions::new(
                        fastembed::EmbeddingModel::BGESmallENV15,
                    );
                    fastembed::TextEmbedding::try_new(options)
                        .map(std::sync::Mutex::new)
                        .with_context(|| format!("loading fastembed model {model_name}"))
                })
                .await?
            })
            .await?;

        let texts = texts.to_vec();
        let vectors = {
            let mut guard = model.lock().expect("fastembed model poisoned");
            guard.embed(texts, None)?
        };
        Ok(vectors)
    }

    fn provider_name(&self) -> &str {
        "fastembed"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ── openai-compatible REST ────────────────────────────────────────────────────

/// OpenAI-compatible `/embeddings` endpoint over plain REST — no SDK.
pub struct OpenAiRestProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl OpenAiRestProvider {
    pub fn new(base_url: &str, api_key: &str, model: &str, dimensions: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiRestProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
                "dimensions": self.dimensions,
            }))
            .send()
            .await
            .context("embedding request failed")?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("embedding endpoint returned {status}: {body}");
        }

        let vectors = body["data"]
            .as_array()
            .context("embedding response missing data array")?
            .iter()
            .map(|item| {
                item["embedding"]
                    .as_array()
                    .map(|v| {
                        v.iter()
                            .filter_map(|f| f.as_f64().map(|f| f as f32))
                            .collect::<Vec<f32>>()
                    })
                    .context("embedding item missing vector")
            })
            .collect::<Result<Vec<_>>>()?;

        if vectors.len() != texts.len() {
            bail!(
                "embedding count mismatch: {} inputs, {} vectors",
                texts.len(),
                vectors.len()
            );
        }
        Ok(vectors)
    }

    fn provider_name(&self) -> &str {
        "openai"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

// ── selection ─────────────────────────────────────────────────────────────────

/// Parse a `"provider:model"` selection string.
///
/// `"local"` → `("local", None)`;
/// `"openai:text-embedding-3-small"` → `("openai", Some(...))`.
pub fn parse_embedding_model(embedding_model: &str) -> (String, Option<String>) {
    match embedding_model.split_once(':') {
        Some((provider, model)) => (provider.to_string(), Some(model.to_string())),
        None => (embedding_model.to_string(), None),
    }
}

/// Build the configured provider from `settings.embedding.model`.
pub fn create_provider(settings: &Settings) -> Arc<dyn EmbeddingProvider> {
    let (provider, model) = parse_embedding_model(&settings.embedding.model);
    match provider.as_str() {
        "openai" => Arc::new(OpenAiRestProvider::new(
            &settings.llm.base_url,
            &settings.llm.openai_api_key,
            model.as_deref().unwrap_or("text-embedding-3-small"),
            settings.embedding.dimensions,
        )),
        #[cfg(feature = "fastembed")]
        "fastembed" => Arc::new(FastEmbedProvider::new(
            model.as_deref().unwrap_or("BAAI/bge-small-en-v1.5"),
            384,
        )),
        _ => Arc::new(LocalHashProvider::new(settings.embedding.dimensions)),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_provider_is_deterministic_and_normalized() {
        let provider = LocalHashProvider::new(256);
        let a = provider.embed(&["hello world".to_string()]).await.unwrap();
        let b = provider.embed(&["hello world".to_string()]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 256);

        let norm: f32 = a[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "expected unit norm, got {norm}");
    }

    #[tokio::test]
    async fn local_provider_differs_across_texts() {
        let provider = LocalHashProvider::new(64);
        let out = provider
            .embed(&["alpha".to_string(), "beta".to_string()])
            .await
            .unwrap();
        assert_ne!(out[0], out[1]);
    }

    #[test]
    fn model_string_parses() {
        assert_eq!(parse_embedding_model("local"), ("local".to_string(), None));
        assert_eq!(
            parse_embedding_model("openai:text-embedding-3-small"),
            ("openai".to_string(), Some("text-embedding-3-small".to_string()))
        );
        assert_eq!(
            parse_embedding_model("fastembed:BAAI/bge-small-en-v1.5"),
            ("fastembed".to_string(), Some("BAAI/bge-small-en-v1.5".to_string()))
        );
    }
}
