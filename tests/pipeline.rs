//! End-to-end pipeline tests over the in-memory store.
//!
//! A stub embedder stands in for the hosted API so the full
//! chunk → batch-embed → store flow runs without a network or a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use ragline::error::{EmbedderErrorKind, Error, Result};
use ragline::{
    ChunkStore, ChunkerConfig, Document, Embedder, FieldDef, FieldType, IngestPipeline,
    LineChunker, MemoryChunkStore, PipelineOptions, SchemaConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocMeta {
    path: String,
    repo: i64,
}

fn schema() -> SchemaConfig {
    SchemaConfig {
        fields: vec![
            FieldDef::new("path", FieldType::Text),
            FieldDef::new("repo", FieldType::Integer),
        ],
        document_key: "path".to_string(),
        source_keys: vec!["repo".to_string()],
        ..Default::default()
    }
}

fn doc(path: &str, content: &str) -> ragline::error::Result<Document<DocMeta>> {
    Ok(Document {
        content: content.to_string(),
        metadata: DocMeta {
            path: path.to_string(),
            repo: 1,
        },
    })
}

fn chunker() -> LineChunker {
    LineChunker::new(ChunkerConfig {
        max_lines: 2,
        overlap: 0,
        max_chunk_size: 1000,
    })
    .unwrap()
}

fn options() -> PipelineOptions {
    PipelineOptions {
        batch_size: 2,
        max_retries: 3,
        retry_delay: Duration::from_millis(1),
        concurrency: 1,
    }
}

/// Returns `[1, 0, 0]` for every text, so every stored similarity is 1.
struct FixedEmbedder;

#[async_trait]
impl Embedder for FixedEmbedder {
    fn dimensions(&self) -> usize {
        3
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
    }
}

/// Fails with a non-retriable error whenever a text contains the marker.
struct PoisonEmbedder {
    marker: &'static str,
}

#[async_trait]
impl Embedder for PoisonEmbedder {
    fn dimensions(&self) -> usize {
        3
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.iter().any(|t| t.contains(self.marker)) {
            return Err(Error::embedder(
                EmbedderErrorKind::InvalidInput,
                "poisoned document",
            ));
        }
        Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
    }
}

/// Fails with a retriable error the first `failures` calls, then succeeds.
struct FlakyEmbedder {
    failures: AtomicU32,
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    fn dimensions(&self) -> usize {
        3
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            (n > 0).then(|| n - 1)
        })
        .is_ok()
        {
            return Err(Error::embedder(EmbedderErrorKind::Api, "transient failure"));
        }
        Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
    }
}

/// Encodes the text length into the vector, to pin embedding/chunk pairing.
struct LengthEmbedder;

#[async_trait]
impl Embedder for LengthEmbedder {
    fn dimensions(&self) -> usize {
        3
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| vec![t.chars().count() as f32, 0.0, 0.0])
            .collect())
    }
}

fn pipeline(
    embedder: Arc<dyn Embedder>,
    store: Arc<MemoryChunkStore<DocMeta>>,
    options: PipelineOptions,
) -> IngestPipeline<DocMeta> {
    IngestPipeline::new(chunker(), embedder, store, options).unwrap()
}

#[tokio::test]
async fn ingests_a_stream_of_documents() {
    let store = Arc::new(MemoryChunkStore::<DocMeta>::new(schema()).unwrap());
    let pipeline = pipeline(Arc::new(FixedEmbedder), store.clone(), options());

    let docs = stream::iter(vec![
        doc("a.rs", "line 1\nline 2\nline 3"),
        doc("b.rs", "only line"),
    ])
    .boxed();
    let result = pipeline.run(docs).await.unwrap();

    assert_eq!(result.total_documents, 2);
    assert_eq!(result.successful_documents, 2);
    assert_eq!(result.failed_documents, 0);
    // a.rs: 2 windows of 2 lines; b.rs: 1 window.
    assert_eq!(result.total_chunks, 3);
    assert!(!result.cancelled);

    let stored = store.document("a.rs").await.unwrap();
    assert_eq!(stored.chunks.len(), 2);
    assert_eq!(stored.chunks[0].content, "line 1\nline 2");
    assert_eq!(stored.chunks[1].content, "line 3");
    assert_eq!(stored.chunks[1].index, 1);
    assert_eq!(stored.chunks[0].embedding, vec![1.0, 0.0, 0.0]);
}

#[tokio::test]
async fn one_poisoned_document_does_not_abort_the_run() {
    let store = Arc::new(MemoryChunkStore::<DocMeta>::new(schema()).unwrap());
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = events.clone();
    let pipeline = pipeline(
        Arc::new(PoisonEmbedder { marker: "POISON" }),
        store.clone(),
        options(),
    )
    .with_error_handler(move |event| {
        seen.lock().unwrap().push((event.document_key.clone(), event.will_retry));
    });

    let docs = stream::iter(vec![
        doc("d1.rs", "fine"),
        doc("d2.rs", "POISON here"),
        doc("d3.rs", "also fine"),
    ])
    .boxed();
    let result = pipeline.run(docs).await.unwrap();

    assert_eq!(result.total_documents, 3);
    assert_eq!(result.successful_documents, 2);
    assert_eq!(result.failed_documents, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].document_key, "d2.rs");
    assert_eq!(result.errors[0].error.code(), "EMBEDDER_INVALID_INPUT");

    // Non-retriable failure: exactly one attempt, no retry promised.
    let events = events.lock().unwrap();
    assert_eq!(events.as_slice(), &[("d2.rs".to_string(), false)]);

    assert!(store.document("d1.rs").await.is_some());
    assert!(store.document("d2.rs").await.is_none());
    assert!(store.document("d3.rs").await.is_some());
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let store = Arc::new(MemoryChunkStore::<DocMeta>::new(schema()).unwrap());
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let seen = attempts.clone();
    let pipeline = pipeline(
        Arc::new(FlakyEmbedder { failures: AtomicU32::new(2) }),
        store.clone(),
        options(),
    )
    .with_error_handler(move |event| {
        seen.lock().unwrap().push((event.attempt, event.will_retry));
    });

    let result = pipeline
        .run(stream::iter(vec![doc("a.rs", "text")]).boxed())
        .await
        .unwrap();

    assert_eq!(result.successful_documents, 1);
    assert_eq!(result.failed_documents, 0);
    assert_eq!(attempts.lock().unwrap().as_slice(), &[(1, true), (2, true)]);
    assert!(store.document("a.rs").await.is_some());
}

#[tokio::test]
async fn exhausted_retries_record_the_failure() {
    let store = Arc::new(MemoryChunkStore::<DocMeta>::new(schema()).unwrap());
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let seen = attempts.clone();
    let pipeline = pipeline(
        Arc::new(FlakyEmbedder { failures: AtomicU32::new(u32::MAX) }),
        store.clone(),
        PipelineOptions {
            max_retries: 2,
            ..options()
        },
    )
    .with_error_handler(move |event| {
        seen.lock().unwrap().push((event.attempt, event.will_retry));
    });

    let result = pipeline
        .run(stream::iter(vec![doc("a.rs", "text")]).boxed())
        .await
        .unwrap();

    assert_eq!(result.failed_documents, 1);
    assert_eq!(attempts.lock().unwrap().as_slice(), &[(1, true), (2, false)]);
    assert!(store.document("a.rs").await.is_none());
}

#[tokio::test]
async fn reingest_replaces_the_previous_generation() {
    let store = Arc::new(MemoryChunkStore::<DocMeta>::new(schema()).unwrap());
    let pipeline = pipeline(Arc::new(FixedEmbedder), store.clone(), options());

    pipeline
        .run(stream::iter(vec![doc("x.ts", "1\n2\n3\n4\n5\n6\n7\n8")]).boxed())
        .await
        .unwrap();
    assert_eq!(store.document("x.ts").await.unwrap().chunks.len(), 4);

    pipeline
        .run(stream::iter(vec![doc("x.ts", "1\n2\n3")]).boxed())
        .await
        .unwrap();
    let stored = store.document("x.ts").await.unwrap();
    assert_eq!(stored.chunks.len(), 2);
    let indices: Vec<i32> = stored.chunks.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![0, 1]);
}

#[tokio::test]
async fn whitespace_document_counts_as_processed_with_zero_chunks() {
    let store = Arc::new(MemoryChunkStore::<DocMeta>::new(schema()).unwrap());
    let pipeline = pipeline(Arc::new(FixedEmbedder), store.clone(), options());

    let result = pipeline
        .run(stream::iter(vec![doc("empty.rs", "\n\n  \n")]).boxed())
        .await
        .unwrap();

    assert_eq!(result.successful_documents, 1);
    assert_eq!(result.total_chunks, 0);
    // The (empty) generation still replaced whatever was there before.
    assert_eq!(store.document("empty.rs").await.unwrap().chunks.len(), 0);
}

#[tokio::test]
async fn embeddings_stay_paired_with_their_chunks_across_batches() {
    let store = Arc::new(MemoryChunkStore::<DocMeta>::new(schema()).unwrap());
    let pipeline = pipeline(Arc::new(LengthEmbedder), store.clone(), options());

    // Five windows of distinct lengths, embedded in batches of two.
    let content = "a\nbb\nccc\ndddd\neeeee\nffffff\nggggggg\nhhhhhhhh\niiiiiiiii\njjjjjjjjjj";
    pipeline
        .run(stream::iter(vec![doc("sized.rs", content)]).boxed())
        .await
        .unwrap();

    let stored = store.document("sized.rs").await.unwrap();
    assert_eq!(stored.chunks.len(), 5);
    for chunk in &stored.chunks {
        assert_eq!(
            chunk.embedding[0],
            chunk.content.chars().count() as f32,
            "chunk {} got another chunk's embedding",
            chunk.index
        );
    }
}

#[tokio::test]
async fn loader_error_terminates_the_run() {
    let store = Arc::new(MemoryChunkStore::<DocMeta>::new(schema()).unwrap());
    let pipeline = pipeline(Arc::new(FixedEmbedder), store.clone(), options());

    let docs = stream::iter(vec![
        doc("ok.rs", "fine"),
        Err(Error::operation(
            ragline::error::OperationErrorKind::InvalidOperation,
            "loader blew up",
        )),
        doc("never.rs", "unreached"),
    ])
    .boxed();

    let err = pipeline.run(docs).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_OPERATION");
    assert!(store.document("ok.rs").await.is_some());
    assert!(store.document("never.rs").await.is_none());
}

#[tokio::test]
async fn cancellation_stops_pulling_new_documents() {
    let store = Arc::new(MemoryChunkStore::<DocMeta>::new(schema()).unwrap());
    let token = CancellationToken::new();

    // Cancel as soon as the first document reports progress.
    let trip = token.clone();
    let pipeline = pipeline(Arc::new(FixedEmbedder), store.clone(), options())
        .with_cancellation(token.clone())
        .with_progress(move |_| trip.cancel());

    let docs = stream::iter(vec![
        doc("first.rs", "a"),
        doc("second.rs", "b"),
        doc("third.rs", "c"),
    ])
    .boxed();
    let result = pipeline.run(docs).await.unwrap();

    assert!(result.cancelled);
    assert_eq!(result.total_documents, 1);
    assert!(store.document("second.rs").await.is_none());
    assert!(store.document("third.rs").await.is_none());
}

#[tokio::test]
async fn progress_is_monotonic_under_concurrency() {
    let store = Arc::new(MemoryChunkStore::<DocMeta>::new(schema()).unwrap());
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    let pipeline = pipeline(
        Arc::new(FixedEmbedder),
        store.clone(),
        PipelineOptions {
            concurrency: 4,
            ..options()
        },
    )
    .with_progress(move |p| sink.lock().unwrap().push(p.processed_documents));

    let docs: Vec<_> = (0..12).map(|i| doc(&format!("f{}.rs", i), "text")).collect();
    let result = pipeline.run(stream::iter(docs).boxed()).await.unwrap();

    assert_eq!(result.total_documents, 12);
    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 12);
    for pair in observed.windows(2) {
        assert!(pair[0] <= pair[1], "progress went backwards: {:?}", pair);
    }
    assert_eq!(*observed.last().unwrap(), 12);
}

#[tokio::test]
async fn metadata_transform_rewrites_before_storage() {
    let store = Arc::new(MemoryChunkStore::<DocMeta>::new(schema()).unwrap());
    let pipeline = pipeline(Arc::new(FixedEmbedder), store.clone(), options())
        .with_metadata_transform(|meta: DocMeta| DocMeta {
            path: format!("prefix/{}", meta.path),
            ..meta
        });

    pipeline
        .run(stream::iter(vec![doc("a.rs", "text")]).boxed())
        .await
        .unwrap();

    assert!(store.document("a.rs").await.is_none());
    let stored = store.document("prefix/a.rs").await.unwrap();
    assert_eq!(
        stored.metadata.get("path").and_then(|v| v.as_str()),
        Some("prefix/a.rs")
    );
}

#[tokio::test]
async fn invalid_options_rejected_at_construction() {
    let store = Arc::new(MemoryChunkStore::<DocMeta>::new(schema()).unwrap());
    for bad in [
        PipelineOptions { batch_size: 0, ..options() },
        PipelineOptions { max_retries: 0, ..options() },
        PipelineOptions { concurrency: 0, ..options() },
    ] {
        let result = IngestPipeline::new(
            chunker(),
            Arc::new(FixedEmbedder) as Arc<dyn Embedder>,
            store.clone() as Arc<dyn ChunkStore<DocMeta>>,
            bad,
        );
        assert!(result.is_err());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TenantMeta {
    path: String,
    repo: i64,
    tenant: String,
}

#[tokio::test]
async fn static_context_store_purges_only_its_scope() {
    // Two stores over the same schema but different scopes never see each
    // other's rows; the unscoped purge stays refused.
    let schema = SchemaConfig {
        fields: vec![
            FieldDef::new("path", FieldType::Text),
            FieldDef::new("repo", FieldType::Integer),
            FieldDef::new("tenant", FieldType::Text),
        ],
        document_key: "path".to_string(),
        source_keys: vec!["repo".to_string()],
        ..Default::default()
    };
    let acme: MemoryChunkStore<TenantMeta> = MemoryChunkStore::with_static_context(
        schema.clone(),
        HashMap::from([("tenant".to_string(), ragline::Scalar::Text("acme".into()))]),
    )
    .unwrap();

    let meta = TenantMeta { path: "a".into(), repo: 1, tenant: "acme".into() };
    acme.insert(
        &meta,
        &[ragline::EmbeddedChunk { content: "x".into(), index: 0, embedding: vec![1.0] }],
    )
    .await
    .unwrap();

    assert_eq!(acme.count_by_source_scope().await.unwrap(), 1);
    assert_eq!(acme.delete_by_source_scope().await.unwrap(), 1);
    assert_eq!(acme.count_by_source_scope().await.unwrap(), 0);
}
