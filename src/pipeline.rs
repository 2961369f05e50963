//! Ingestion pipeline orchestration.
//!
//! Drives one end-to-end ingest run: stream documents, and for each one
//! chunk → batch-embed → store in a single transaction, with per-document
//! retry and failure isolation. One bad document never aborts the run; an
//! error from the loader stream itself does.
//!
//! # Per-document procedure
//!
//! 1. Apply the metadata transform, if configured.
//! 2. For attempt `k = 1..=max_retries`:
//!    a. Split the text with the [`LineChunker`].
//!    b. Embed the chunk texts in contiguous `batch_size` batches,
//!       preserving order. Embedding always happens *before* the store
//!       transaction opens.
//!    c. Assemble [`EmbeddedChunk`]s with dense indices.
//!    d. `store.insert` — one transaction, replace semantics.
//!    e. On success break; on failure report via `on_error` and, when the
//!       error is retriable and attempts remain, back off
//!       `retry_delay × 2^(k−1)` (stretched by any rate-limit hint) and
//!       retry.
//! 3. Update counters and report via `on_progress`.
//!
//! # Concurrency
//!
//! Documents are processed sequentially by default; `concurrency > 1`
//! processes up to that many documents at once. Distinct documents share no
//! mutable state; counters update under one lock so `on_progress` observes
//! a monotonically non-decreasing `processed_documents`.
//!
//! # Cancellation
//!
//! When the cancellation token fires the pipeline stops pulling from the
//! stream and abandons pending retries; in-flight work completes or rolls
//! back, and the partially populated [`IngestResult`] is returned with
//! `cancelled = true`.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::stream::{StreamExt, TryStreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunker::LineChunker;
use crate::embedder::Embedder;
use crate::error::{EmbedderErrorKind, Error, Result};
use crate::loader::DocumentStream;
use crate::models::{
    Document, DocumentFailure, EmbeddedChunk, IngestErrorEvent, IngestProgress, IngestResult,
};
use crate::store::ChunkStore;

type ProgressFn = dyn Fn(IngestProgress) + Send + Sync;
type ErrorFn = dyn Fn(&IngestErrorEvent) + Send + Sync;
type TransformFn<M> = dyn Fn(M) -> M + Send + Sync;

/// Pipeline knobs. All defaults are overridable.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Maximum texts per `embed_batch` call.
    pub batch_size: usize,
    /// Attempts per document (first try included).
    pub max_retries: u32,
    /// Initial backoff between attempts; doubles each retry.
    pub retry_delay: Duration,
    /// Documents processed in parallel.
    pub concurrency: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            concurrency: 1,
        }
    }
}

#[derive(Default)]
struct ProgressState {
    processed: u64,
    successful: u64,
    failed: u64,
    chunks: u64,
}

/// Orchestrates one ingest run over a document stream.
pub struct IngestPipeline<M> {
    chunker: LineChunker,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn ChunkStore<M>>,
    options: PipelineOptions,
    on_progress: Arc<ProgressFn>,
    on_error: Arc<ErrorFn>,
    transform: Option<Arc<TransformFn<M>>>,
    cancellation: CancellationToken,
}

impl<M> IngestPipeline<M>
where
    M: Serialize + Send + Sync + 'static,
{
    pub fn new(
        chunker: LineChunker,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn ChunkStore<M>>,
        options: PipelineOptions,
    ) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(Error::config("pipeline batch_size must be > 0"));
        }
        if options.max_retries == 0 {
            return Err(Error::config("pipeline max_retries must be >= 1"));
        }
        if options.concurrency == 0 {
            return Err(Error::config("pipeline concurrency must be >= 1"));
        }
        Ok(Self {
            chunker,
            embedder,
            store,
            options,
            on_progress: Arc::new(|_| {}),
            on_error: Arc::new(|_| {}),
            transform: None,
            cancellation: CancellationToken::new(),
        })
    }

    /// Rewrite each document's metadata before ingestion. Without a
    /// transform the loader's metadata type is stored as-is (the type
    /// parameter makes source and target coincide by construction).
    pub fn with_metadata_transform(
        mut self,
        transform: impl Fn(M) -> M + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Invoked after every processed document with the run's counters.
    pub fn with_progress(
        mut self,
        on_progress: impl Fn(IngestProgress) + Send + Sync + 'static,
    ) -> Self {
        self.on_progress = Arc::new(on_progress);
        self
    }

    /// Invoked once per failed attempt, before any retry backoff.
    pub fn with_error_handler(
        mut self,
        on_error: impl Fn(&IngestErrorEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Arc::new(on_error);
        self
    }

    /// Wire a cancellation signal into the run.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Consume the stream and ingest every document.
    ///
    /// Per-document failures are retried per [`PipelineOptions`] and, when
    /// terminal, recorded in the result without aborting the run. An `Err`
    /// item from the stream itself terminates the run with that error.
    pub async fn run(&self, documents: DocumentStream<'_, M>) -> Result<IngestResult> {
        let state = Mutex::new(ProgressState::default());
        let failures = Mutex::new(Vec::new());

        info!(concurrency = self.options.concurrency, "ingest run started");

        let token = self.cancellation.clone();
        let gated = documents.take_while(move |_| {
            let open = !token.is_cancelled();
            async move { open }
        });

        gated
            .try_for_each_concurrent(Some(self.options.concurrency), |document| {
                let state = &state;
                let failures = &failures;
                async move {
                    self.process_document(document, state, failures).await;
                    Ok(())
                }
            })
            .await?;

        let state = state.into_inner().unwrap_or_default();
        let result = IngestResult {
            total_documents: state.processed,
            successful_documents: state.successful,
            failed_documents: state.failed,
            total_chunks: state.chunks,
            errors: failures.into_inner().unwrap_or_default(),
            cancelled: self.cancellation.is_cancelled(),
        };
        info!(
            total = result.total_documents,
            failed = result.failed_documents,
            chunks = result.total_chunks,
            cancelled = result.cancelled,
            "ingest run finished"
        );
        Ok(result)
    }

    async fn process_document(
        &self,
        document: Document<M>,
        state: &Mutex<ProgressState>,
        failures: &Mutex<Vec<DocumentFailure>>,
    ) {
        let Document { content, metadata } = document;
        let metadata = match &self.transform {
            Some(transform) => transform(metadata),
            None => metadata,
        };
        let document_key = self
            .store
            .document_key_of(&metadata)
            .unwrap_or_default();

        let mut terminal: Option<Error> = None;
        let mut stored_chunks = 0u64;

        for attempt in 1..=self.options.max_retries {
            match self.attempt(&content, &metadata).await {
                Ok(count) => {
                    stored_chunks = count;
                    debug!(%document_key, chunks = count, attempt, "document ingested");
                    break;
                }
                Err(err) => {
                    let will_retry = err.is_retriable()
                        && attempt < self.options.max_retries
                        && !self.cancellation.is_cancelled();
                    (self.on_error)(&IngestErrorEvent {
                        document_key: document_key.clone(),
                        message: err.to_string(),
                        code: err.code(),
                        will_retry,
                        attempt,
                    });
                    if !will_retry {
                        terminal = Some(err);
                        break;
                    }

                    let backoff = self
                        .options
                        .retry_delay
                        .saturating_mul(2u32.saturating_pow(attempt - 1));
                    let delay = match err.retry_after() {
                        Some(hint) => backoff.max(hint),
                        None => backoff,
                    };
                    warn!(
                        %document_key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        code = err.code(),
                        "retrying document after failure"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancellation.cancelled() => {
                            // Pending retries are abandoned on cancellation.
                            terminal = Some(err);
                            break;
                        }
                    }
                }
            }
        }

        let succeeded = terminal.is_none();
        if let Some(error) = terminal {
            if let Ok(mut failures) = failures.lock() {
                failures.push(DocumentFailure {
                    document_key: document_key.clone(),
                    error,
                });
            }
        }

        if let Ok(mut state) = state.lock() {
            state.processed += 1;
            if succeeded {
                state.successful += 1;
                state.chunks += stored_chunks;
            } else {
                state.failed += 1;
            }
            // Emitted under the lock so processed_documents never appears
            // to move backwards to the observer.
            (self.on_progress)(IngestProgress {
                processed_documents: state.processed,
                successful_documents: state.successful,
                failed_documents: state.failed,
                total_chunks: state.chunks,
            });
        }
    }

    /// One attempt: chunk, embed in batches, store in one transaction.
    /// Embedding completes before the store transaction opens.
    async fn attempt(&self, content: &str, metadata: &M) -> Result<u64> {
        let chunks = self.chunker.split(content);

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.options.batch_size) {
            let batch_vectors = self.embedder.embed_batch(batch).await?;
            if batch_vectors.len() != batch.len() {
                return Err(Error::embedder(
                    EmbedderErrorKind::Api,
                    format!(
                        "embedder returned {} vectors for a batch of {}",
                        batch_vectors.len(),
                        batch.len()
                    ),
                ));
            }
            vectors.extend(batch_vectors);
        }

        let embedded: Vec<EmbeddedChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| EmbeddedChunk::new(chunk, vector))
            .collect();
        let count = embedded.len() as u64;

        self.store.insert(metadata, &embedded).await?;
        Ok(count)
    }
}
