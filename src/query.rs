//! Read-side query service.
//!
//! Embeds a natural-language question, applies context-derived equality
//! filters, runs a similarity-ordered scan over the vector column, and
//! returns typed rows. The caller's context type `C` is turned into
//! `physical column → value` predicates by a [`FilterResolver`]; the write
//! side's static context and the resolver must agree on physical column
//! names, and the column mapping is the one place both learn them from.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::debug;

use crate::db::{PoolConfig, PoolHandle};
use crate::embedder::Embedder;
use crate::error::{
    DatabaseErrorKind, EmbedderErrorKind, Error, Result, ValidationError, ValidationIssue,
};
use crate::models::{Chunk, FilterValue, QueryResult, Scalar};
use crate::schema::{quote_ident, FieldType, MetadataSchema, SchemaConfig};
use crate::store::pg::bind_scalar;

const MAX_LIMIT: i64 = 1000;

/// Distance operator used for ranking. Cosine is the reference; the
/// `[0, 1]` similarity contract is exact for cosine and approximated for
/// the other two (both are monotonic in relevance and clamped).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceFunction {
    #[default]
    Cosine,
    Euclidean,
    InnerProduct,
}

/// Turns a request-time context into equality predicates on physical
/// columns. May be async (e.g. a tenant lookup).
#[async_trait]
pub trait FilterResolver<C>: Send + Sync {
    async fn resolve(&self, context: &C) -> Result<HashMap<String, FilterValue>>;
}

/// Resolver that never filters. Useful for single-scope tables.
pub struct UnfilteredResolver;

#[async_trait]
impl<C: Send + Sync> FilterResolver<C> for UnfilteredResolver {
    async fn resolve(&self, _context: &C) -> Result<HashMap<String, FilterValue>> {
        Ok(HashMap::new())
    }
}

/// Configuration for [`QueryService`].
#[derive(Debug, Clone)]
pub struct QueryServiceConfig {
    /// Postgres connection string; shares the pool with any store on the
    /// same string.
    pub url: String,
    pub table: String,
    pub schema: SchemaConfig,
    pub pool: PoolConfig,
    pub distance_function: DistanceFunction,
    /// Deadline for one similarity scan.
    pub query_timeout_secs: u64,
}

impl QueryServiceConfig {
    pub fn new(url: impl Into<String>, table: impl Into<String>, schema: SchemaConfig) -> Self {
        Self {
            url: url.into(),
            table: table.into(),
            schema,
            pool: PoolConfig::default(),
            distance_function: DistanceFunction::Cosine,
            query_timeout_secs: 30,
        }
    }
}

/// One search request.
#[derive(Debug, Clone)]
pub struct SearchRequest<C> {
    /// Natural-language question; trimmed length must be positive.
    pub question: String,
    /// Maximum results, in `[1, 1000]`.
    pub limit: i64,
    /// Minimum similarity, in `[0.0, 1.0]`.
    pub similarity_threshold: f64,
    /// Caller context handed to the filter resolver.
    pub context: C,
}

/// Read-side similarity search over a chunk table.
pub struct QueryService<M, C> {
    handle: PoolHandle,
    table: String,
    schema: MetadataSchema,
    embedder: Arc<dyn Embedder>,
    resolver: Arc<dyn FilterResolver<C>>,
    distance: DistanceFunction,
    query_timeout: Duration,
    _marker: PhantomData<fn(M, C)>,
}

impl<M, C> QueryService<M, C>
where
    M: DeserializeOwned + Send + Sync,
    C: Send + Sync,
{
    pub async fn connect(
        config: QueryServiceConfig,
        embedder: Arc<dyn Embedder>,
        resolver: Arc<dyn FilterResolver<C>>,
    ) -> Result<Self> {
        crate::schema::validate_identifier(&config.table, "table")?;
        if config.query_timeout_secs == 0 {
            return Err(Error::config("query_timeout_secs must be > 0"));
        }
        let schema = MetadataSchema::new(config.schema)?;
        let handle = PoolHandle::acquire(&config.url, &config.pool).await?;
        Ok(Self {
            handle,
            table: config.table,
            schema,
            embedder,
            resolver,
            distance: config.distance_function,
            query_timeout: Duration::from_secs(config.query_timeout_secs),
            _marker: PhantomData,
        })
    }

    /// Rank stored chunks against the question and return every row at or
    /// above the similarity threshold, best first.
    pub async fn search(&self, request: SearchRequest<C>) -> Result<Vec<QueryResult<M>>> {
        validate_request(&request)?;

        self.handle.ensure_vector_type().await?;

        let embedding = self.embedder.embed(request.question.trim()).await?;
        if embedding.is_empty() {
            return Err(Error::embedder(
                EmbedderErrorKind::Api,
                "embedder returned an empty vector for the question",
            ));
        }

        let resolved = self.resolver.resolve(&request.context).await?;
        let filters = validate_filters(resolved)?;

        let sql = search_sql(
            &self.table,
            &self.schema,
            self.distance,
            &filters,
            request.limit,
        );
        let mut query = sqlx::query(&sql)
            .bind(Vector::from(embedding))
            .bind(request.similarity_threshold);
        for (_, value) in &filters {
            query = bind_filter(query, value);
        }

        let rows = tokio::time::timeout(self.query_timeout, query.fetch_all(self.handle.pool()))
            .await
            .map_err(|_| Error::database(DatabaseErrorKind::Timeout, "search"))?
            .map_err(|e| Error::from_sqlx("search", e))?;

        debug!(table = %self.table, rows = rows.len(), "similarity scan complete");

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            results.push(self.decode_row(row)?);
        }
        Ok(results)
    }

    fn decode_row(&self, row: &PgRow) -> Result<QueryResult<M>> {
        let content: String = row
            .try_get(self.schema.content_column())
            .map_err(|e| Error::from_sqlx("search", e))?;
        let index: i32 = row
            .try_get(self.schema.index_column())
            .map_err(|e| Error::from_sqlx("search", e))?;
        let similarity: f64 = row
            .try_get("similarity")
            .map_err(|e| Error::from_sqlx("search", e))?;

        let mut map = Map::new();
        for field in self.schema.fields() {
            let column = match self.schema.column_for(&field.name) {
                Some(c) => c,
                None => continue,
            };
            map.insert(field.name.clone(), field_value(row, column, field.field_type)?);
        }
        // Rows are a trust boundary: a row that no longer satisfies the
        // declared schema fails the whole query rather than yielding a
        // half-decoded record.
        self.schema.validate_map(&map)?;
        let metadata: M = serde_json::from_value(Value::Object(map)).map_err(|e| {
            Error::from(ValidationError::single(
                "row.metadata",
                "a record matching the declared schema",
                "undecodable row",
                e.to_string(),
            ))
        })?;

        Ok(QueryResult {
            chunk: Chunk { content, index },
            similarity: similarity.clamp(0.0, 1.0),
            metadata,
        })
    }

    /// Release the service's pool reference. Idempotent.
    pub async fn dispose(&self) {
        self.handle.dispose().await;
    }
}

fn validate_request<C>(request: &SearchRequest<C>) -> Result<()> {
    let mut issues = Vec::new();
    if request.question.trim().is_empty() {
        issues.push(ValidationIssue {
            path: "question".to_string(),
            message: "question must not be blank".to_string(),
            expected: "non-empty text".to_string(),
            received: "blank".to_string(),
        });
    }
    if !(1..=MAX_LIMIT).contains(&request.limit) {
        issues.push(ValidationIssue {
            path: "limit".to_string(),
            message: "limit out of range".to_string(),
            expected: format!("integer in [1, {}]", MAX_LIMIT),
            received: request.limit.to_string(),
        });
    }
    if !(0.0..=1.0).contains(&request.similarity_threshold)
        || request.similarity_threshold.is_nan()
    {
        issues.push(ValidationIssue {
            path: "similarity_threshold".to_string(),
            message: "threshold out of range".to_string(),
            expected: "number in [0.0, 1.0]".to_string(),
            received: request.similarity_threshold.to_string(),
        });
    }
    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(issues).into())
    }
}

/// Validate resolver output and fix its order (sorted by column) so the
/// emitted SQL is deterministic.
fn validate_filters(
    filters: HashMap<String, FilterValue>,
) -> Result<Vec<(String, FilterValue)>> {
    let mut issues = Vec::new();
    let mut out: Vec<(String, FilterValue)> = filters.into_iter().collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));

    for (column, value) in &out {
        if crate::schema::validate_identifier(column, "filter column").is_err() {
            issues.push(ValidationIssue {
                path: format!("filters.{}", column),
                message: "invalid filter column".to_string(),
                expected: "identifier matching ^[A-Za-z_][A-Za-z0-9_]*$".to_string(),
                received: column.clone(),
            });
            continue;
        }
        if let FilterValue::Any(scalars) = value {
            if scalars.is_empty() {
                issues.push(ValidationIssue {
                    path: format!("filters.{}", column),
                    message: "empty filter list".to_string(),
                    expected: "at least one value".to_string(),
                    received: "[]".to_string(),
                });
            } else if scalars
                .iter()
                .any(|s| s.type_name() != scalars[0].type_name())
            {
                issues.push(ValidationIssue {
                    path: format!("filters.{}", column),
                    message: "mixed scalar types in filter list".to_string(),
                    expected: scalars[0].type_name().to_string(),
                    received: "mixed".to_string(),
                });
            }
        }
    }

    if issues.is_empty() {
        Ok(out)
    } else {
        Err(ValidationError::new(issues).into())
    }
}

/// Similarity expression for the configured operator. `$1` is the query
/// vector.
fn similarity_expr(embedding_column: &str, distance: DistanceFunction) -> String {
    let col = quote_ident(embedding_column);
    match distance {
        DistanceFunction::Cosine => format!("(1 - ({} <=> $1))", col),
        DistanceFunction::Euclidean => format!("(1 / (1 + ({} <-> $1)))", col),
        DistanceFunction::InnerProduct => format!("(-({} <#> $1))", col),
    }
}

/// Build the similarity scan. The threshold is `$2`; filters bind from `$3`
/// on; `limit` is validated upstream and interpolated as a bounded integer.
fn search_sql(
    table: &str,
    schema: &MetadataSchema,
    distance: DistanceFunction,
    filters: &[(String, FilterValue)],
    limit: i64,
) -> String {
    let expr = similarity_expr(schema.embedding_column(), distance);

    let mut select_cols = vec![
        quote_ident(schema.content_column()),
        quote_ident(schema.index_column()),
    ];
    for field in schema.fields() {
        if let Some(column) = schema.column_for(&field.name) {
            select_cols.push(quote_ident(column));
        }
    }
    select_cols.push(format!("{} AS similarity", expr));

    let mut sql = format!(
        "SELECT {} FROM {} WHERE {} >= $2",
        select_cols.join(", "),
        quote_ident(table),
        expr
    );
    for (i, (column, value)) in filters.iter().enumerate() {
        let placeholder = i + 3;
        match value {
            FilterValue::One(_) => {
                sql.push_str(&format!(" AND {} = ${}", quote_ident(column), placeholder));
            }
            FilterValue::Any(_) => {
                sql.push_str(&format!(" AND {} = ANY(${})", quote_ident(column), placeholder));
            }
        }
    }
    sql.push_str(&format!(" ORDER BY similarity DESC LIMIT {}", limit));
    sql
}

fn bind_filter<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    value: &FilterValue,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match value {
        FilterValue::One(scalar) => bind_scalar(query, scalar),
        // validate_filters guarantees non-empty, homogeneous lists.
        FilterValue::Any(scalars) => match scalars[0] {
            Scalar::Text(_) => query.bind(
                scalars
                    .iter()
                    .filter_map(|s| match s {
                        Scalar::Text(v) => Some(v.clone()),
                        _ => None,
                    })
                    .collect::<Vec<String>>(),
            ),
            Scalar::Integer(_) => query.bind(
                scalars
                    .iter()
                    .filter_map(|s| match s {
                        Scalar::Integer(v) => Some(*v),
                        _ => None,
                    })
                    .collect::<Vec<i64>>(),
            ),
            Scalar::Float(_) => query.bind(
                scalars
                    .iter()
                    .filter_map(|s| match s {
                        Scalar::Float(v) => Some(*v),
                        _ => None,
                    })
                    .collect::<Vec<f64>>(),
            ),
            Scalar::Boolean(_) => query.bind(
                scalars
                    .iter()
                    .filter_map(|s| match s {
                        Scalar::Boolean(v) => Some(*v),
                        _ => None,
                    })
                    .collect::<Vec<bool>>(),
            ),
            Scalar::Timestamp(_) => query.bind(
                scalars
                    .iter()
                    .filter_map(|s| match s {
                        Scalar::Timestamp(v) => Some(*v),
                        _ => None,
                    })
                    .collect::<Vec<DateTime<Utc>>>(),
            ),
        },
    }
}

fn field_value(row: &PgRow, column: &str, field_type: FieldType) -> Result<Value> {
    let wrap = |e: sqlx::Error| Error::from_sqlx("search", e);
    let value = match field_type {
        FieldType::Text => row
            .try_get::<Option<String>, _>(column)
            .map_err(wrap)?
            .map(Value::String)
            .unwrap_or(Value::Null),
        FieldType::Integer => {
            // Accept both int8 and int4 columns for declared integer fields.
            let wide: std::result::Result<Option<i64>, sqlx::Error> = row.try_get(column);
            let n = match wide {
                Ok(v) => v,
                Err(_) => row
                    .try_get::<Option<i32>, _>(column)
                    .map_err(wrap)?
                    .map(i64::from),
            };
            n.map(Value::from).unwrap_or(Value::Null)
        }
        FieldType::Float => {
            let wide: std::result::Result<Option<f64>, sqlx::Error> = row.try_get(column);
            let f = match wide {
                Ok(v) => v,
                Err(_) => row
                    .try_get::<Option<f32>, _>(column)
                    .map_err(wrap)?
                    .map(f64::from),
            };
            f.map(Value::from).unwrap_or(Value::Null)
        }
        FieldType::Boolean => row
            .try_get::<Option<bool>, _>(column)
            .map_err(wrap)?
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        FieldType::Timestamp => row
            .try_get::<Option<DateTime<Utc>>, _>(column)
            .map_err(wrap)?
            .map(|t| Value::String(t.to_rfc3339()))
            .unwrap_or(Value::Null),
    };
    Ok(value)
}
