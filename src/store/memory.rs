//! In-memory chunk store.
//!
//! Implements [`ChunkStore`] with the same validation and replace semantics
//! as the Postgres store, backed by a map keyed on the document key. Used by
//! pipeline tests and for development without a database; a store instance
//! models exactly one source scope.

use std::collections::HashMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::pg::check_chunk_sequence;
use super::ChunkStore;
use crate::error::{Error, Result};
use crate::models::{EmbeddedChunk, Scalar};
use crate::schema::{MetadataSchema, SchemaConfig};

/// One stored document generation.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    /// Validated metadata map as it would land in mapped columns.
    pub metadata: Map<String, Value>,
    /// The generation's chunks, in index order.
    pub chunks: Vec<EmbeddedChunk>,
}

/// In-process [`ChunkStore`] implementation.
pub struct MemoryChunkStore<M> {
    schema: MetadataSchema,
    static_context: Vec<(String, Scalar)>,
    documents: Mutex<HashMap<String, StoredDocument>>,
    _marker: PhantomData<fn(M) -> M>,
}

impl<M> MemoryChunkStore<M>
where
    M: Serialize + Send + Sync,
{
    pub fn new(schema: SchemaConfig) -> Result<Self> {
        Self::with_static_context(schema, HashMap::new())
    }

    pub fn with_static_context(
        schema: SchemaConfig,
        static_context: HashMap<String, Scalar>,
    ) -> Result<Self> {
        let schema = MetadataSchema::new(schema)?;
        let mut static_context: Vec<(String, Scalar)> = static_context.into_iter().collect();
        static_context.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self {
            schema,
            static_context,
            documents: Mutex::new(HashMap::new()),
            _marker: PhantomData,
        })
    }

    pub fn schema(&self) -> &MetadataSchema {
        &self.schema
    }

    /// Snapshot of one stored document, by document key.
    pub async fn document(&self, key: &str) -> Option<StoredDocument> {
        self.documents.lock().await.get(key).cloned()
    }

    /// Keys of every stored document, unordered.
    pub async fn document_keys(&self) -> Vec<String> {
        self.documents.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl<M> ChunkStore<M> for MemoryChunkStore<M>
where
    M: Serialize + Send + Sync,
{
    async fn insert(&self, metadata: &M, chunks: &[EmbeddedChunk]) -> Result<()> {
        let map = self.schema.metadata_map(metadata)?;
        check_chunk_sequence(chunks)?;
        let key = self.schema.document_key_string(&map);
        self.documents.lock().await.insert(
            key,
            StoredDocument {
                metadata: map,
                chunks: chunks.to_vec(),
            },
        );
        Ok(())
    }

    async fn delete_by_document_key(&self, metadata: &M) -> Result<u64> {
        let map = self.schema.metadata_map(metadata)?;
        let key = self.schema.document_key_string(&map);
        match self.documents.lock().await.remove(&key) {
            Some(doc) => Ok(doc.chunks.len() as u64),
            None => Ok(0),
        }
    }

    async fn delete_by_source_scope(&self) -> Result<u64> {
        if self.static_context.is_empty() {
            return Err(Error::config(
                "delete_by_source_scope requires a non-empty static context",
            ));
        }
        let mut documents = self.documents.lock().await;
        let removed: u64 = documents.values().map(|d| d.chunks.len() as u64).sum();
        documents.clear();
        Ok(removed)
    }

    async fn count_by_source_scope(&self) -> Result<u64> {
        let documents = self.documents.lock().await;
        Ok(documents.values().map(|d| d.chunks.len() as u64).sum())
    }

    fn document_key_of(&self, metadata: &M) -> Result<String> {
        super::pg::document_key_of(&self.schema, metadata)
    }

    async fn dispose(&self) {}
}
