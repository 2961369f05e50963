//! Embedding provider abstraction.
//!
//! [`Embedder`] converts text into fixed-dimension vectors. The pipeline
//! calls [`embed_batch`](Embedder::embed_batch) with contiguous batches of
//! chunk texts; the query service calls [`embed`](Embedder::embed) with the
//! question. Implementations are stateless from the caller's perspective
//! (they may rate-limit or retry internally).
//!
//! The crate ships one reference adapter, [`OpenAiEmbedder`], targeting an
//! OpenAI-compatible embeddings endpoint over HTTPS with a bearer token.

mod openai;

pub use openai::{OpenAiEmbedder, OpenAiEmbedderConfig};

use async_trait::async_trait;

use crate::error::Result;

/// A text-to-vector embedding provider.
///
/// Contract:
/// - `embed` rejects empty text and returns a non-empty vector of finite
///   floats with exactly [`dimensions`](Embedder::dimensions) entries.
/// - `embed_batch` returns one vector per input, in input order; an empty
///   input returns an empty output without any external call.
/// - Transient failures (rate limits, server errors, timeouts) may be
///   retried internally; non-transient failures surface immediately as
///   typed [`Error::Embedder`](crate::error::Error::Embedder) values.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Vector dimensionality, constant for the life of the embedder.
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts, preserving order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text. Defaults to a one-element batch.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| {
            crate::error::Error::embedder(
                crate::error::EmbedderErrorKind::Api,
                "provider returned an empty batch for a single text",
            )
        })
    }
}
