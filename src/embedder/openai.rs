//! OpenAI-compatible embeddings adapter.
//!
//! Calls `POST {base_url}/embeddings` with a bearer token. Transient
//! failures (HTTP 429, 5xx, network errors, timeouts) are retried with
//! exponential backoff up to `max_retries`; a `Retry-After` header on a 429
//! stretches the backoff. Client errors are not retried:
//!
//! | Status | Error kind |
//! |--------|------------|
//! | 400 | `InvalidInput` |
//! | 401 / 403 | `Unauthorized` |
//! | 429 (`insufficient_quota`) | `QuotaExceeded` |
//! | 429 (otherwise) | `RateLimited` + retry-after hint |
//! | 408 / 5xx / network | `Api` / `Timeout` (retriable) |

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use super::Embedder;
use crate::error::{EmbedderErrorKind, Error, Result};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Backoff doubling cap: 1s, 2s, 4s, 8s, 16s, 32s.
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// Configuration for [`OpenAiEmbedder`].
#[derive(Debug, Clone, serde::Deserialize)]
pub struct OpenAiEmbedderConfig {
    /// Bearer token for the embeddings endpoint.
    pub api_key: String,
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    pub model: String,
    /// Expected vector dimensionality; responses are checked against it.
    pub dimensions: usize,
    /// API root, without the `/embeddings` suffix.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Retries for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(serde::Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Deserialize, Default)]
struct ApiErrorBody {
    #[serde(default)]
    error: ApiErrorDetail,
}

#[derive(Deserialize, Default)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<String>,
}

/// Reference [`Embedder`] over an OpenAI-compatible embeddings API.
pub struct OpenAiEmbedder {
    config: OpenAiEmbedderConfig,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(config: OpenAiEmbedderConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(Error::config("embedder api_key must not be empty"));
        }
        if config.model.trim().is_empty() {
            return Err(Error::config("embedder model must not be empty"));
        }
        if config.dimensions == 0 {
            return Err(Error::config("embedder dimensions must be >= 1"));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    async fn request_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let body = EmbeddingsRequest {
            model: &self.config.model,
            input: texts,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    EmbedderErrorKind::Timeout
                } else {
                    EmbedderErrorKind::Api
                };
                Error::embedder(kind, format!("request failed: {}", e))
            })?;

        let status = response.status();
        if status.is_success() {
            let parsed: EmbeddingsResponse = response.json().await.map_err(|e| {
                Error::embedder(EmbedderErrorKind::Api, format!("malformed response: {}", e))
            })?;
            return self.vectors_from_response(parsed, texts.len());
        }

        let retry_after = parse_retry_after(response.headers());
        let body_text = response.text().await.unwrap_or_default();
        let detail: ApiErrorBody = serde_json::from_str(&body_text).unwrap_or_default();
        let message = if detail.error.message.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, detail.error.message)
        };

        let kind = match status.as_u16() {
            400 => EmbedderErrorKind::InvalidInput,
            401 | 403 => EmbedderErrorKind::Unauthorized,
            429 => {
                if detail.error.code.as_deref() == Some("insufficient_quota") {
                    EmbedderErrorKind::QuotaExceeded
                } else {
                    EmbedderErrorKind::RateLimited
                }
            }
            408 => EmbedderErrorKind::Timeout,
            _ => EmbedderErrorKind::Api,
        };

        Err(Error::Embedder {
            kind,
            message,
            retry_after,
        })
    }

    fn vectors_from_response(
        &self,
        mut parsed: EmbeddingsResponse,
        expected: usize,
    ) -> Result<Vec<Vec<f32>>> {
        if parsed.data.len() != expected {
            return Err(Error::embedder(
                EmbedderErrorKind::Api,
                format!(
                    "provider returned {} embeddings for {} inputs",
                    parsed.data.len(),
                    expected
                ),
            ));
        }
        // Providers are allowed to return out of order; the index field is
        // authoritative.
        parsed.data.sort_by_key(|d| d.index);
        let mut vectors = Vec::with_capacity(parsed.data.len());
        for item in parsed.data {
            if item.embedding.len() != self.config.dimensions {
                return Err(Error::embedder(
                    EmbedderErrorKind::Api,
                    format!(
                        "dimension mismatch: expected {}, got {}",
                        self.config.dimensions,
                        item.embedding.len()
                    ),
                ));
            }
            if item.embedding.iter().any(|v| !v.is_finite()) {
                return Err(Error::embedder(
                    EmbedderErrorKind::Api,
                    "provider returned a non-finite component",
                ));
            }
            vectors.push(item.embedding);
        }
        Ok(vectors)
    }
}

#[async_trait::async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(pos) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(Error::embedder(
                EmbedderErrorKind::InvalidInput,
                format!("input text at position {} is empty", pos),
            ));
        }

        let mut last_err = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff =
                    Duration::from_secs(1 << (attempt - 1).min(MAX_BACKOFF_EXPONENT));
                let delay = match last_err.as_ref().and_then(Error::retry_after) {
                    Some(hint) => backoff.max(hint),
                    None => backoff,
                };
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying embed batch");
                tokio::time::sleep(delay).await;
            }

            match self.request_once(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(err) if err.is_retriable() => {
                    warn!(code = err.code(), "transient embedder failure: {}", err);
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            Error::embedder(EmbedderErrorKind::Api, "embedding failed after retries")
        }))
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OpenAiEmbedderConfig {
        OpenAiEmbedderConfig {
            api_key: "sk-test".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 3,
            base_url: default_base_url(),
            max_retries: 3,
            timeout_secs: 60,
        }
    }

    #[test]
    fn rejects_blank_credentials_and_zero_dims() {
        let mut c = config();
        c.api_key = " ".to_string();
        assert!(OpenAiEmbedder::new(c).is_err());

        let mut c = config();
        c.model = String::new();
        assert!(OpenAiEmbedder::new(c).is_err());

        let mut c = config();
        c.dimensions = 0;
        assert!(OpenAiEmbedder::new(c).is_err());
    }

    #[tokio::test]
    async fn empty_batch_short_circuits() {
        let embedder = OpenAiEmbedder::new(config()).unwrap();
        let out = embedder.embed_batch(&[]).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn empty_text_is_invalid_input() {
        let embedder = OpenAiEmbedder::new(config()).unwrap();
        let err = embedder
            .embed_batch(&["ok".to_string(), "   ".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EMBEDDER_INVALID_INPUT");
        assert!(!err.is_retriable());
    }

    #[test]
    fn response_order_restored_and_dims_checked() {
        let embedder = OpenAiEmbedder::new(config()).unwrap();
        let parsed = EmbeddingsResponse {
            data: vec![
                EmbeddingData {
                    index: 1,
                    embedding: vec![0.0, 1.0, 0.0],
                },
                EmbeddingData {
                    index: 0,
                    embedding: vec![1.0, 0.0, 0.0],
                },
            ],
        };
        let vectors = embedder.vectors_from_response(parsed, 2).unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0, 0.0]);

        let wrong_dims = EmbeddingsResponse {
            data: vec![EmbeddingData {
                index: 0,
                embedding: vec![1.0],
            }],
        };
        assert!(embedder.vectors_from_response(wrong_dims, 1).is_err());

        let wrong_count = EmbeddingsResponse { data: vec![] };
        assert!(embedder.vectors_from_response(wrong_count, 1).is_err());
    }
}
