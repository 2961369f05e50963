//! PostgreSQL + pgvector chunk store.
//!
//! One `insert` is one transaction: a DELETE scoped by the store's source
//! scope and the document's key, followed by one parameterized INSERT per
//! chunk in index order. Identifiers are validated at construction and
//! quoted on emission; every value is bound, never interpolated.

use std::collections::HashMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use pgvector::Vector;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;
use tracing::debug;

use super::ChunkStore;
use crate::db::{PoolConfig, PoolHandle};
use crate::error::{DatabaseErrorKind, Error, OperationErrorKind, Result};
use crate::models::{EmbeddedChunk, Scalar};
use crate::schema::{quote_ident, validate_identifier, MetadataSchema, SchemaConfig};

/// Configuration for [`PgChunkStore`] (and the write half of a query
/// service).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Postgres connection string. Stores sharing a string share a pool.
    pub url: String,
    /// Target table. The table's DDL (including the vector column dimension
    /// and any ANN index) is the caller's responsibility.
    pub table: String,
    /// Metadata fields, document key, source keys, and column overrides.
    pub schema: SchemaConfig,
    /// Physical column → fixed value, merged into every inserted row and
    /// into every scoped predicate (e.g. a tenant id).
    pub static_context: HashMap<String, Scalar>,
    /// Pool sizing and timeouts.
    pub pool: PoolConfig,
}

/// Write-side store over PostgreSQL + pgvector.
#[derive(Debug)]
pub struct PgChunkStore<M> {
    handle: PoolHandle,
    table: String,
    schema: MetadataSchema,
    /// Sorted by column name so emitted SQL is deterministic.
    static_context: Vec<(String, Scalar)>,
    _marker: PhantomData<fn(M) -> M>,
}

impl<M> PgChunkStore<M>
where
    M: Serialize + Send + Sync,
{
    /// Validate the configuration, freeze the column mapping, and acquire a
    /// (shared, lazily-connected) pool handle.
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        validate_identifier(&config.table, "table")?;
        let schema = MetadataSchema::new(config.schema)?;

        let mut static_context: Vec<(String, Scalar)> =
            config.static_context.into_iter().collect();
        static_context.sort_by(|a, b| a.0.cmp(&b.0));
        for (column, _) in &static_context {
            validate_identifier(column, "static context column")?;
            if column == schema.content_column()
                || column == schema.index_column()
                || column == schema.embedding_column()
            {
                return Err(Error::config(format!(
                    "static context may not target the fixed column '{}'",
                    column
                )));
            }
            if column == schema.document_key_column() {
                return Err(Error::config(format!(
                    "static context may not target the document key column '{}'",
                    column
                )));
            }
        }

        let handle = PoolHandle::acquire(&config.url, &config.pool).await?;
        Ok(Self {
            handle,
            table: config.table,
            schema,
            static_context,
            _marker: PhantomData,
        })
    }

    pub fn schema(&self) -> &MetadataSchema {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Scope predicates: every static context entry, plus any source-key
    /// column the static context does not cover, valued from the validated
    /// metadata map when one is available.
    fn scope_predicates(&self, map: Option<&Map<String, Value>>) -> Result<Vec<(String, Scalar)>> {
        let mut predicates = self.static_context.clone();
        if let Some(map) = map {
            for key_field in self.schema.source_key_fields() {
                let column = match self.schema.column_for(key_field) {
                    Some(c) => c.to_string(),
                    None => continue,
                };
                if predicates.iter().any(|(c, _)| *c == column) {
                    continue;
                }
                let field = self
                    .schema
                    .fields()
                    .iter()
                    .find(|f| f.name == *key_field)
                    .ok_or_else(|| Error::config(format!("unknown source key '{}'", key_field)))?;
                // validate_map guarantees source keys are present and typed.
                let value = map.get(key_field).ok_or_else(|| {
                    Error::config(format!("source key '{}' missing from metadata", key_field))
                })?;
                predicates.push((column, MetadataSchema::value_to_scalar(field, value)?));
            }
        }
        Ok(predicates)
    }

    /// Columns and values for one document's rows, beyond the fixed three:
    /// mapped metadata fields with non-null values (in declaration order,
    /// static context winning on collision), then the static context.
    fn row_values(&self, map: &Map<String, Value>) -> Result<Vec<(String, Scalar)>> {
        let mut values = Vec::new();
        for field in self.schema.fields() {
            let column = match self.schema.column_for(&field.name) {
                Some(c) => c.to_string(),
                None => continue,
            };
            if self.static_context.iter().any(|(c, _)| *c == column) {
                continue;
            }
            match map.get(&field.name) {
                None | Some(Value::Null) => continue,
                Some(value) => {
                    values.push((column, MetadataSchema::value_to_scalar(field, value)?))
                }
            }
        }
        values.extend(self.static_context.iter().cloned());
        Ok(values)
    }

    fn document_key_scalar(&self, map: &Map<String, Value>) -> Result<Scalar> {
        let key_field = self.schema.document_key_field();
        let field = self
            .schema
            .fields()
            .iter()
            .find(|f| f.name == key_field)
            .ok_or_else(|| Error::config(format!("unknown document key '{}'", key_field)))?;
        let value = map.get(key_field).ok_or_else(|| {
            Error::config(format!("document key '{}' missing from metadata", key_field))
        })?;
        MetadataSchema::value_to_scalar(field, value)
    }
}

#[async_trait]
impl<M> ChunkStore<M> for PgChunkStore<M>
where
    M: Serialize + Send + Sync,
{
    async fn insert(&self, metadata: &M, chunks: &[EmbeddedChunk]) -> Result<()> {
        // Validation precedes all database contact.
        let map = self.schema.metadata_map(metadata)?;
        check_chunk_sequence(chunks)?;

        let document_key = self.document_key_scalar(&map)?;
        let predicates = self.scope_predicates(Some(&map))?;
        let row_values = self.row_values(&map)?;

        self.handle.ensure_vector_type().await?;

        let mut tx = self
            .handle
            .pool()
            .begin()
            .await
            .map_err(|e| Error::from_sqlx("insert", e))?;

        let delete = delete_sql(&self.table, &predicates, Some(self.schema.document_key_column()));
        let mut query = sqlx::query(&delete);
        for (_, value) in &predicates {
            query = bind_scalar(query, value);
        }
        query = bind_scalar(query, &document_key);
        query
            .execute(&mut *tx)
            .await
            .map_err(|e| in_transaction("insert", e))?;

        let columns: Vec<&str> = [
            self.schema.content_column(),
            self.schema.index_column(),
            self.schema.embedding_column(),
        ]
        .into_iter()
        .chain(row_values.iter().map(|(c, _)| c.as_str()))
        .collect();
        let insert = insert_sql(&self.table, &columns);

        for chunk in chunks {
            let mut query = sqlx::query(&insert)
                .bind(chunk.content.clone())
                .bind(chunk.index)
                .bind(Vector::from(chunk.embedding.clone()));
            for (_, value) in &row_values {
                query = bind_scalar(query, value);
            }
            query
                .execute(&mut *tx)
                .await
                .map_err(|e| in_transaction("insert", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| in_transaction("insert", e))?;

        debug!(
            table = %self.table,
            document_key = %self.schema.document_key_string(&map),
            chunks = chunks.len(),
            "replaced document generation"
        );
        Ok(())
    }

    async fn delete_by_document_key(&self, metadata: &M) -> Result<u64> {
        let map = self.schema.metadata_map(metadata)?;
        let document_key = self.document_key_scalar(&map)?;
        let predicates = self.scope_predicates(Some(&map))?;

        let sql = delete_sql(&self.table, &predicates, Some(self.schema.document_key_column()));
        let mut query = sqlx::query(&sql);
        for (_, value) in &predicates {
            query = bind_scalar(query, value);
        }
        query = bind_scalar(query, &document_key);

        let result = query
            .execute(self.handle.pool())
            .await
            .map_err(|e| Error::from_sqlx("delete_by_document_key", e))?;
        Ok(result.rows_affected())
    }

    async fn delete_by_source_scope(&self) -> Result<u64> {
        if self.static_context.is_empty() {
            return Err(Error::config(
                "delete_by_source_scope requires a non-empty static context; \
                 refusing to purge the whole table",
            ));
        }
        let sql = delete_sql(&self.table, &self.static_context, None);
        let mut query = sqlx::query(&sql);
        for (_, value) in &self.static_context {
            query = bind_scalar(query, value);
        }
        let result = query
            .execute(self.handle.pool())
            .await
            .map_err(|e| Error::from_sqlx("delete_by_source_scope", e))?;
        debug!(table = %self.table, rows = result.rows_affected(), "purged source scope");
        Ok(result.rows_affected())
    }

    async fn count_by_source_scope(&self) -> Result<u64> {
        let sql = count_sql(&self.table, &self.static_context);
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for (_, value) in &self.static_context {
            query = bind_count_scalar(query, value);
        }
        let count = query
            .fetch_one(self.handle.pool())
            .await
            .map_err(|e| Error::from_sqlx("count_by_source_scope", e))?;
        Ok(count.max(0) as u64)
    }

    fn document_key_of(&self, metadata: &M) -> Result<String> {
        document_key_of(&self.schema, metadata)
    }

    async fn dispose(&self) {
        self.handle.dispose().await;
    }
}

/// Best-effort key extraction for reporting; full validation happens in
/// `insert`.
pub(crate) fn document_key_of<M: Serialize>(
    schema: &MetadataSchema,
    metadata: &M,
) -> Result<String> {
    let value = serde_json::to_value(metadata).map_err(|e| {
        Error::from(crate::error::ValidationError::single(
            "metadata",
            "serializable record",
            "serialization failure",
            e.to_string(),
        ))
    })?;
    Ok(match value {
        Value::Object(map) => schema.document_key_string(&map),
        _ => String::new(),
    })
}

/// Chunks must arrive in dense index order with non-empty content and
/// embeddings; the pipeline guarantees this, so a violation is a caller bug.
pub(crate) fn check_chunk_sequence(chunks: &[EmbeddedChunk]) -> Result<()> {
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.index != i as i32 {
            return Err(Error::operation(
                OperationErrorKind::InvalidOperation,
                format!("chunk index {} at position {}; indices must be dense from 0", chunk.index, i),
            ));
        }
        if chunk.content.trim().is_empty() {
            return Err(Error::operation(
                OperationErrorKind::InvalidOperation,
                format!("chunk {} has empty content", i),
            ));
        }
        if chunk.embedding.is_empty() {
            return Err(Error::operation(
                OperationErrorKind::InvalidOperation,
                format!("chunk {} has no embedding", i),
            ));
        }
    }
    Ok(())
}

/// Errors inside the replace transaction surface as `TransactionFailed`,
/// except the permanent classes, which keep their kind so the pipeline will
/// not retry them.
fn in_transaction(operation: &str, err: sqlx::Error) -> Error {
    match Error::from_sqlx(operation, err) {
        Error::Database {
            kind: DatabaseErrorKind::QueryFailed,
            operation,
            source,
        } => Error::Database {
            kind: DatabaseErrorKind::TransactionFailed,
            operation,
            source,
        },
        other => other,
    }
}

pub(crate) fn bind_scalar<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Scalar,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Scalar::Text(s) => query.bind(s.clone()),
        Scalar::Integer(n) => query.bind(*n),
        Scalar::Float(f) => query.bind(*f),
        Scalar::Boolean(b) => query.bind(*b),
        Scalar::Timestamp(t) => query.bind(*t),
    }
}

fn bind_count_scalar<'q>(
    query: sqlx::query::QueryScalar<'q, Postgres, i64, PgArguments>,
    value: &Scalar,
) -> sqlx::query::QueryScalar<'q, Postgres, i64, PgArguments> {
    match value {
        Scalar::Text(s) => query.bind(s.clone()),
        Scalar::Integer(n) => query.bind(*n),
        Scalar::Float(f) => query.bind(*f),
        Scalar::Boolean(b) => query.bind(*b),
        Scalar::Timestamp(t) => query.bind(*t),
    }
}

fn delete_sql(table: &str, predicates: &[(String, Scalar)], key_column: Option<&str>) -> String {
    let mut sql = format!("DELETE FROM {}", quote_ident(table));
    let mut clauses = Vec::with_capacity(predicates.len() + 1);
    for (i, (column, _)) in predicates.iter().enumerate() {
        clauses.push(format!("{} = ${}", quote_ident(column), i + 1));
    }
    if let Some(key) = key_column {
        clauses.push(format!("{} = ${}", quote_ident(key), predicates.len() + 1));
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql
}

fn insert_sql(table: &str, columns: &[&str]) -> String {
    let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let params: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        cols.join(", "),
        params.join(", ")
    )
}

fn count_sql(table: &str, predicates: &[(String, Scalar)]) -> String {
    let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
    if !predicates.is_empty() {
        let clauses: Vec<String> = predicates
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{} = ${}", quote_ident(column), i + 1))
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct FileMeta {
        file_path: String,
        repository_index_db_id: i64,
    }

    fn store_config(static_context: HashMap<String, Scalar>) -> StoreConfig {
        StoreConfig {
            url: "postgres://ragline@localhost/ragline_unit".to_string(),
            table: "code_chunks".to_string(),
            schema: SchemaConfig {
                fields: vec![
                    FieldDef::new("filePath", FieldType::Text),
                    FieldDef::new("repositoryIndexDbId", FieldType::Integer),
                ],
                document_key: "filePath".to_string(),
                source_keys: vec!["repositoryIndexDbId".to_string()],
                ..Default::default()
            },
            static_context,
            pool: PoolConfig::default(),
        }
    }

    async fn store() -> PgChunkStore<FileMeta> {
        PgChunkStore::connect(store_config(HashMap::new())).await.unwrap()
    }

    #[test]
    fn delete_sql_shape() {
        let predicates = vec![
            ("repository_index_db_id".to_string(), Scalar::Integer(7)),
            ("tenant".to_string(), Scalar::Text("acme".into())),
        ];
        assert_eq!(
            delete_sql("code_chunks", &predicates, Some("file_path")),
            "DELETE FROM \"code_chunks\" WHERE \"repository_index_db_id\" = $1 \
             AND \"tenant\" = $2 AND \"file_path\" = $3"
        );
        assert_eq!(
            delete_sql("code_chunks", &predicates, None),
            "DELETE FROM \"code_chunks\" WHERE \"repository_index_db_id\" = $1 AND \"tenant\" = $2"
        );
    }

    #[test]
    fn insert_sql_shape() {
        let sql = insert_sql(
            "code_chunks",
            &["chunk_content", "chunk_index", "embedding", "file_path"],
        );
        assert_eq!(
            sql,
            "INSERT INTO \"code_chunks\" (\"chunk_content\", \"chunk_index\", \
             \"embedding\", \"file_path\") VALUES ($1, $2, $3, $4)"
        );
    }

    #[test]
    fn chunk_sequence_must_be_dense() {
        let good = vec![
            EmbeddedChunk { content: "a".into(), index: 0, embedding: vec![1.0] },
            EmbeddedChunk { content: "b".into(), index: 1, embedding: vec![1.0] },
        ];
        check_chunk_sequence(&good).unwrap();

        let gap = vec![EmbeddedChunk { content: "a".into(), index: 1, embedding: vec![1.0] }];
        assert_eq!(check_chunk_sequence(&gap).unwrap_err().code(), "INVALID_OPERATION");

        let empty = vec![EmbeddedChunk { content: "  ".into(), index: 0, embedding: vec![1.0] }];
        assert!(check_chunk_sequence(&empty).is_err());

        let no_vec = vec![EmbeddedChunk { content: "a".into(), index: 0, embedding: vec![] }];
        assert!(check_chunk_sequence(&no_vec).is_err());
    }

    #[tokio::test]
    async fn scope_includes_static_context_then_source_keys() {
        let store: PgChunkStore<FileMeta> = PgChunkStore::connect(store_config(HashMap::from([
            ("tenant".to_string(), Scalar::Text("acme".into())),
        ])))
        .await
        .unwrap();

        let meta = FileMeta {
            file_path: "src/x.ts".into(),
            repository_index_db_id: 42,
        };
        let map = store.schema.metadata_map(&meta).unwrap();
        let predicates = store.scope_predicates(Some(&map)).unwrap();
        assert_eq!(
            predicates,
            vec![
                ("tenant".to_string(), Scalar::Text("acme".into())),
                ("repository_index_db_id".to_string(), Scalar::Integer(42)),
            ]
        );
        store.dispose().await;
    }

    #[tokio::test]
    async fn static_context_overrides_metadata_column() {
        let store: PgChunkStore<FileMeta> = PgChunkStore::connect(store_config(HashMap::from([
            ("repository_index_db_id".to_string(), Scalar::Integer(99)),
        ])))
        .await
        .unwrap();

        let meta = FileMeta {
            file_path: "src/x.ts".into(),
            repository_index_db_id: 42,
        };
        let map = store.schema.metadata_map(&meta).unwrap();
        let values = store.row_values(&map).unwrap();
        // The metadata's own value for the covered column is dropped; the
        // static context entry is what lands in the row.
        assert_eq!(
            values,
            vec![
                ("file_path".to_string(), Scalar::Text("src/x.ts".into())),
                ("repository_index_db_id".to_string(), Scalar::Integer(99)),
            ]
        );
        store.dispose().await;
    }

    #[tokio::test]
    async fn invalid_table_rejected() {
        let mut config = store_config(HashMap::new());
        config.table = "bad table".to_string();
        assert!(PgChunkStore::<FileMeta>::connect(config).await.is_err());
    }

    #[tokio::test]
    async fn static_context_may_not_shadow_document_key() {
        let config = store_config(HashMap::from([(
            "file_path".to_string(),
            Scalar::Text("pinned".into()),
        )]));
        let err = PgChunkStore::<FileMeta>::connect(config).await.unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION");
    }

    #[tokio::test]
    async fn static_context_may_not_shadow_fixed_columns() {
        let config = store_config(HashMap::from([(
            "embedding".to_string(),
            Scalar::Text("x".into()),
        )]));
        assert!(PgChunkStore::<FileMeta>::connect(config).await.is_err());
    }

    #[tokio::test]
    async fn unscoped_purge_refused_without_db_contact() {
        let store = store().await;
        let err = store.delete_by_source_scope().await.unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION");
        store.dispose().await;
    }

    #[tokio::test]
    async fn insert_validates_before_any_database_contact() {
        let store = store().await;
        // Metadata with the wrong type never reaches the (unreachable) pool.
        #[derive(Serialize)]
        struct BadMeta {
            #[serde(rename = "filePath")]
            file_path: i64,
            #[serde(rename = "repositoryIndexDbId")]
            repo: i64,
        }
        let bad = serde_json::to_value(BadMeta { file_path: 1, repo: 2 }).unwrap();
        let map_err = store.schema.validate_map(bad.as_object().unwrap()).unwrap_err();
        assert_eq!(map_err.code(), "VALIDATION");
        store.dispose().await;
    }
}
