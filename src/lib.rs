//! # ragline
//!
//! **A RAG data plane over PostgreSQL + pgvector.**
//!
//! ragline ingests textual documents from pluggable sources into a
//! vector-indexed relational store, and answers semantic queries by
//! embedding a question and retrieving the most similar stored fragments,
//! filtered by caller-supplied context.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────────┐   ┌─────────────────┐
//! │  Loader  │──▶│      IngestPipeline        │──▶│  Postgres +     │
//! │ (caller) │   │ chunk → embed → transact   │   │  pgvector       │
//! └──────────┘   └───────────────────────────┘   └───────┬─────────┘
//!                                                        │
//!                     ┌──────────────────────────────────┘
//!                     ▼
//!               ┌──────────────┐
//!               │ QueryService │──▶ ranked QueryResult<M>
//!               └──────────────┘
//! ```
//!
//! ## Data flow
//!
//! 1. A **loader** ([`loader::DocumentLoader`]) streams
//!    [`Document`](models::Document)s with caller-typed metadata.
//! 2. The **pipeline** ([`pipeline::IngestPipeline`]) splits each document
//!    with the [`chunker::LineChunker`], embeds chunk texts in batches via
//!    an [`embedder::Embedder`], and hands fully embedded chunks to the
//!    store — with per-document retry, progress callbacks, and failure
//!    isolation.
//! 3. The **store** ([`store::PgChunkStore`]) transactionally replaces the
//!    stored generation for each `(source scope, document key)`.
//! 4. The **query service** ([`query::QueryService`]) embeds a question,
//!    resolves the caller's context into column filters, and runs a
//!    similarity-ordered scan.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Core data types: `Document`, `Chunk`, `EmbeddedChunk`, `QueryResult`, `IngestResult` |
//! | [`schema`] | Metadata schema and logical → physical column mapping, with strict validation |
//! | [`chunker`] | Deterministic line-window chunker with overlap and character caps |
//! | [`embedder`] | `Embedder` trait and the OpenAI-compatible reference adapter |
//! | [`db`] | Shared connection pools (one per connection string) and the pgvector probe |
//! | [`store`] | `ChunkStore` trait, Postgres implementation, in-memory implementation |
//! | [`query`] | Similarity search with context-derived filters |
//! | [`pipeline`] | Streaming, batched, retrying ingest orchestrator |
//! | [`loader`] | Document producer contract |
//! | [`error`] | Typed error taxonomy with stable codes and retriability |
//!
//! ## Database contract
//!
//! The library manages no DDL. Each configured table needs the three fixed
//! columns plus one column per mapped metadata field, e.g.:
//!
//! ```sql
//! CREATE EXTENSION IF NOT EXISTS vector;
//! CREATE TABLE code_chunks (
//!     chunk_content  TEXT NOT NULL,
//!     chunk_index    INTEGER NOT NULL,
//!     embedding      VECTOR(1536) NOT NULL,
//!     file_path      TEXT NOT NULL,
//!     repository_index_db_id BIGINT NOT NULL
//! );
//! CREATE INDEX ON code_chunks USING hnsw (embedding vector_cosine_ops);
//! ```

pub mod chunker;
pub mod db;
pub mod embedder;
pub mod error;
pub mod loader;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod schema;
pub mod store;

pub use chunker::{ChunkerConfig, LineChunker};
pub use embedder::{Embedder, OpenAiEmbedder, OpenAiEmbedderConfig};
pub use error::{Error, Result};
pub use loader::{DocumentLoader, DocumentStream};
pub use models::{
    Chunk, Document, EmbeddedChunk, FilterValue, IngestProgress, IngestResult, QueryResult, Scalar,
};
pub use pipeline::{IngestPipeline, PipelineOptions};
pub use query::{
    DistanceFunction, FilterResolver, QueryService, QueryServiceConfig, SearchRequest,
    UnfilteredResolver,
};
pub use schema::{FieldDef, FieldType, MetadataSchema, SchemaConfig};
pub use store::{ChunkStore, MemoryChunkStore, PgChunkStore, StoreConfig};
