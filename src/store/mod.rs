//! Chunk storage abstraction.
//!
//! The [`ChunkStore`] trait defines the write-side operations the ingest
//! pipeline needs, enabling pluggable backends:
//!
//! | Implementation | Backing | Use |
//! |----------------|---------|-----|
//! | [`PgChunkStore`] | PostgreSQL + pgvector | production |
//! | [`MemoryChunkStore`] | in-process map | tests, embedding-free development |
//!
//! The unit of durability is the document: `insert` transactionally replaces
//! the stored generation for one `(source scope, document key)` with the new
//! batch. Implementations must be `Send + Sync`.

pub mod memory;
pub mod pg;

pub use memory::MemoryChunkStore;
pub use pg::{PgChunkStore, StoreConfig};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::models::EmbeddedChunk;

/// Write-side chunk persistence with per-document replace semantics.
#[async_trait]
pub trait ChunkStore<M>: Send + Sync
where
    M: Serialize + Send + Sync,
{
    /// Transactionally replace the stored chunks for the document identified
    /// by `metadata`'s document key (within this store's source scope).
    ///
    /// All-or-nothing: after success the rows for that key are exactly the
    /// new batch; on failure the prior generation is preserved. The metadata
    /// is validated before any storage contact. Chunks must arrive with
    /// dense indices `0..N-1` and fully computed embeddings — the store
    /// never calls an embedder.
    async fn insert(&self, metadata: &M, chunks: &[EmbeddedChunk]) -> Result<()>;

    /// Delete every stored chunk for `metadata`'s document key within this
    /// store's source scope. No-op when nothing matches. Returns the number
    /// of rows removed.
    async fn delete_by_document_key(&self, metadata: &M) -> Result<u64>;

    /// Delete every stored chunk in this store's source scope. Refuses to
    /// run when the static context is empty (an unscoped store would purge
    /// the whole table). Returns the number of rows removed.
    async fn delete_by_source_scope(&self) -> Result<u64>;

    /// Number of chunk rows currently stored in this store's source scope.
    async fn count_by_source_scope(&self) -> Result<u64>;

    /// String image of `metadata`'s document key, per this store's column
    /// mapping. Used by the pipeline for progress and error reporting.
    fn document_key_of(&self, metadata: &M) -> Result<String>;

    /// Release the store's pool reference. Idempotent; never errors.
    async fn dispose(&self);
}
