//! Document producer contract.
//!
//! A loader is an asynchronous producer of [`Document`]s: a repository
//! crawler, a wiki exporter, a message-queue drain. Loaders live outside
//! this crate; the pipeline only consumes the stream. The sequence may be
//! finite or unbounded, the loader owns its source-side rate limiting and
//! retries, and it must never yield a document with empty content.
//!
//! Source-specific parameters (roots, globs, cursors) belong to the
//! loader's own constructor.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::models::Document;

/// A lazy, possibly unbounded document sequence. An `Err` item terminates
/// the ingest run.
pub type DocumentStream<'a, M> = BoxStream<'a, Result<Document<M>>>;

/// An asynchronous source of documents.
#[async_trait]
pub trait DocumentLoader<M>: Send + Sync {
    /// Short source label for logs and status reporting (e.g. `"git:docs"`).
    fn name(&self) -> &str;

    /// Open the stream. Called once per ingest run.
    async fn load(&self) -> Result<DocumentStream<'static, M>>;
}
