//! Core data types that flow through the ingestion and retrieval pipeline.
//!
//! The data lifecycle is:
//!
//! ```text
//! Loader → Document<M> → LineChunker → Chunk → Embedder → EmbeddedChunk
//!                                                              ↓
//!                                                      ChunkStore::insert
//!                                                              ↓
//!                                                  QueryService → QueryResult<M>
//! ```
//!
//! `M` is the caller's metadata record type. It only needs to round-trip
//! through serde; the [`MetadataSchema`](crate::schema::MetadataSchema)
//! validates its JSON image at the two trust boundaries (pipeline input and
//! query row decode).

use chrono::{DateTime, Utc};

use crate::error::Error;

/// A source document entering the pipeline.
///
/// Produced by a [`DocumentLoader`](crate::loader::DocumentLoader). The
/// `content` must be non-empty; the metadata record must conform to the
/// schema declared on the store, and its `document_key` field is the stable
/// identity of the document inside the store's source scope.
#[derive(Debug, Clone)]
pub struct Document<M> {
    /// Full text content of the document.
    pub content: String,
    /// Caller-typed metadata record.
    pub metadata: M,
}

/// A fragment of one document's text.
///
/// Indices are dense within a document: `0, 1, 2, …` in emission order.
/// Content is trimmed and never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Chunk text, trimmed, at most `max_chunk_size` characters.
    pub content: String,
    /// Zero-based position within the document's chunk sequence.
    pub index: i32,
}

/// A chunk paired with its embedding vector.
///
/// The vector's dimensionality is fixed by the configured embedder and by
/// the table's DDL; the store does not re-declare it.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    /// Chunk text, trimmed, non-empty.
    pub content: String,
    /// Zero-based position within the document.
    pub index: i32,
    /// Fixed-dimension embedding of `content`.
    pub embedding: Vec<f32>,
}

impl EmbeddedChunk {
    pub fn new(chunk: Chunk, embedding: Vec<f32>) -> Self {
        Self {
            content: chunk.content,
            index: chunk.index,
            embedding,
        }
    }
}

/// A scalar value that can bind to a metadata, static-context, or filter
/// column.
///
/// Timestamp values travel through JSON as RFC 3339 strings.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
}

impl Scalar {
    /// Name of the scalar's type, as reported in validation issues.
    pub fn type_name(&self) -> &'static str {
        match self {
            Scalar::Text(_) => "text",
            Scalar::Integer(_) => "integer",
            Scalar::Float(_) => "float",
            Scalar::Boolean(_) => "boolean",
            Scalar::Timestamp(_) => "timestamp",
        }
    }

    /// The scalar's JSON image (timestamps as RFC 3339 strings).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::Text(s) => serde_json::Value::String(s.clone()),
            Scalar::Integer(n) => serde_json::Value::from(*n),
            Scalar::Float(f) => serde_json::Value::from(*f),
            Scalar::Boolean(b) => serde_json::Value::Bool(*b),
            Scalar::Timestamp(t) => serde_json::Value::String(t.to_rfc3339()),
        }
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Text(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Integer(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::Integer(v as i64)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Boolean(v)
    }
}

impl From<DateTime<Utc>> for Scalar {
    fn from(v: DateTime<Utc>) -> Self {
        Scalar::Timestamp(v)
    }
}

/// A value produced by a [`FilterResolver`](crate::query::FilterResolver)
/// for one physical column.
///
/// `One` becomes `col = $n`; `Any` becomes `col = ANY($n)` and requires all
/// scalars to share one type.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    One(Scalar),
    Any(Vec<Scalar>),
}

impl<S: Into<Scalar>> From<S> for FilterValue {
    fn from(v: S) -> Self {
        FilterValue::One(v.into())
    }
}

/// A single ranked result returned by the query service.
#[derive(Debug, Clone)]
pub struct QueryResult<M> {
    /// The stored chunk (content + index).
    pub chunk: Chunk,
    /// Similarity to the query, clamped into `[0.0, 1.0]`.
    pub similarity: f64,
    /// The document metadata decoded from the row's mapped columns.
    pub metadata: M,
}

/// Aggregate outcome of one ingest run.
///
/// A partially failed run has the same shape as a successful one, with
/// `failed_documents > 0` and one [`DocumentFailure`] per document that
/// exhausted its retries.
#[derive(Debug, Default)]
pub struct IngestResult {
    /// Documents pulled from the loader stream.
    pub total_documents: u64,
    /// Documents whose chunks were durably stored.
    pub successful_documents: u64,
    /// Documents that failed after all retry attempts.
    pub failed_documents: u64,
    /// Chunks written across all successful documents.
    pub total_chunks: u64,
    /// Per-document terminal failures, in completion order.
    pub errors: Vec<DocumentFailure>,
    /// True when the run stopped early because the cancellation token fired.
    pub cancelled: bool,
}

/// A document that failed every retry attempt during an ingest run.
#[derive(Debug)]
pub struct DocumentFailure {
    /// The document's key (string image of the `document_key` field).
    pub document_key: String,
    /// The terminal error for this document.
    pub error: Error,
}

/// Counters handed to the pipeline's `on_progress` callback after every
/// processed document. `processed_documents` is monotonically non-decreasing
/// even when documents run concurrently.
#[derive(Debug, Clone, Copy)]
pub struct IngestProgress {
    pub processed_documents: u64,
    pub successful_documents: u64,
    pub failed_documents: u64,
    pub total_chunks: u64,
}

/// One failed attempt at processing a document, handed to the pipeline's
/// `on_error` callback.
#[derive(Debug)]
pub struct IngestErrorEvent {
    /// The document's key (string image of the `document_key` field).
    pub document_key: String,
    /// Error message for this attempt.
    pub message: String,
    /// Stable error code (see [`Error::code`]).
    pub code: &'static str,
    /// Whether the pipeline will retry this document.
    pub will_retry: bool,
    /// 1-based attempt number.
    pub attempt: u32,
}
