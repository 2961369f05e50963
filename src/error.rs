//! Error types for the RAG data plane.
//!
//! One public [`Error`] enum covers the five failure categories: validation,
//! configuration, database, embedder, and operation. Every error carries a
//! stable [`code`](Error::code) for logs and metrics, and
//! [`is_retriable`](Error::is_retriable) drives the ingest pipeline's retry
//! policy.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors surfaced by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// An input failed the declared metadata schema or a numeric/range
    /// precondition. Never retried.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A required configuration value is missing or invalid at construction.
    /// Fatal.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A database operation failed.
    #[error("database error during {operation}: {kind}")]
    Database {
        kind: DatabaseErrorKind,
        /// Operation context (e.g. `"insert"`, `"search"`), never query text.
        operation: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// The embedding provider failed.
    #[error("embedder error ({kind}): {message}")]
    Embedder {
        kind: EmbedderErrorKind,
        message: String,
        /// Pacing hint from a rate-limit response, if the provider sent one.
        retry_after: Option<Duration>,
    },

    /// A higher-level logical failure.
    #[error("operation error ({kind}): {message}")]
    Operation {
        kind: OperationErrorKind,
        message: String,
    },
}

/// Database failure classes. `TableNotFound` and `ConstraintViolation` are
/// permanent; the rest are treated as transient by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    ConnectionFailed,
    QueryFailed,
    TransactionFailed,
    TableNotFound,
    ConstraintViolation,
    Timeout,
}

impl fmt::Display for DatabaseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DatabaseErrorKind::ConnectionFailed => "connection failed",
            DatabaseErrorKind::QueryFailed => "query failed",
            DatabaseErrorKind::TransactionFailed => "transaction failed",
            DatabaseErrorKind::TableNotFound => "table not found",
            DatabaseErrorKind::ConstraintViolation => "constraint violation",
            DatabaseErrorKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Embedder failure classes. `Api`, `RateLimited`, and `Timeout` are
/// transient; `InvalidInput`, `QuotaExceeded`, and `Unauthorized` are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderErrorKind {
    Api,
    RateLimited,
    InvalidInput,
    Timeout,
    QuotaExceeded,
    Unauthorized,
}

impl fmt::Display for EmbedderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EmbedderErrorKind::Api => "api error",
            EmbedderErrorKind::RateLimited => "rate limit exceeded",
            EmbedderErrorKind::InvalidInput => "invalid input",
            EmbedderErrorKind::Timeout => "timeout",
            EmbedderErrorKind::QuotaExceeded => "quota exceeded",
            EmbedderErrorKind::Unauthorized => "unauthorized",
        };
        f.write_str(s)
    }
}

/// Logical operation failures. Contextual; never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationErrorKind {
    DocumentNotFound,
    InvalidOperation,
}

impl fmt::Display for OperationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationErrorKind::DocumentNotFound => "document not found",
            OperationErrorKind::InvalidOperation => "invalid operation",
        };
        f.write_str(s)
    }
}

/// A schema or precondition failure with per-field detail.
#[derive(Debug, Error)]
#[error("validation failed: {}", format_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

/// One field-level validation problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Path of the offending field (e.g. `"metadata.filePath"`).
    pub path: String,
    /// Human-readable description.
    pub message: String,
    /// What the schema expected (type or constraint).
    pub expected: String,
    /// What was actually received.
    pub received: String,
}

impl ValidationError {
    pub fn new(issues: Vec<ValidationIssue>) -> Self {
        Self { issues }
    }

    /// Single-issue convenience constructor.
    pub fn single(
        path: impl Into<String>,
        expected: impl Into<String>,
        received: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            issues: vec![ValidationIssue {
                path: path.into(),
                message: message.into(),
                expected: expected.into(),
                received: received.into(),
            }],
        }
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("{}: {} (expected {}, got {})", i.path, i.message, i.expected, i.received))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Configuration-error convenience constructor.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    /// Operation-error convenience constructor.
    pub fn operation(kind: OperationErrorKind, message: impl Into<String>) -> Self {
        Error::Operation {
            kind,
            message: message.into(),
        }
    }

    /// Embedder-error convenience constructor.
    pub fn embedder(kind: EmbedderErrorKind, message: impl Into<String>) -> Self {
        Error::Embedder {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Database-error constructor without an underlying driver error.
    pub fn database(kind: DatabaseErrorKind, operation: impl Into<String>) -> Self {
        Error::Database {
            kind,
            operation: operation.into(),
            source: None,
        }
    }

    /// Classify and wrap a driver error with operation context.
    ///
    /// The operation name is carried; the query text is not.
    pub(crate) fn from_sqlx(operation: &str, err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // undefined_table
                Some("42P01") => DatabaseErrorKind::TableNotFound,
                // integrity constraint violations
                Some(code) if code.starts_with("23") => DatabaseErrorKind::ConstraintViolation,
                // query_canceled (statement_timeout)
                Some("57014") => DatabaseErrorKind::Timeout,
                _ => DatabaseErrorKind::QueryFailed,
            },
            sqlx::Error::PoolTimedOut => DatabaseErrorKind::Timeout,
            sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Configuration(_) => DatabaseErrorKind::ConnectionFailed,
            _ => DatabaseErrorKind::QueryFailed,
        };
        Error::Database {
            kind,
            operation: operation.to_string(),
            source: Some(err),
        }
    }

    /// Stable machine-readable code for logs and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION",
            Error::Configuration { .. } => "CONFIGURATION",
            Error::Database { kind, .. } => match kind {
                DatabaseErrorKind::ConnectionFailed => "DB_CONNECTION_FAILED",
                DatabaseErrorKind::QueryFailed => "DB_QUERY_FAILED",
                DatabaseErrorKind::TransactionFailed => "DB_TRANSACTION_FAILED",
                DatabaseErrorKind::TableNotFound => "DB_TABLE_NOT_FOUND",
                DatabaseErrorKind::ConstraintViolation => "DB_CONSTRAINT_VIOLATION",
                DatabaseErrorKind::Timeout => "DB_TIMEOUT",
            },
            Error::Embedder { kind, .. } => match kind {
                EmbedderErrorKind::Api => "EMBEDDER_API_ERROR",
                EmbedderErrorKind::RateLimited => "EMBEDDER_RATE_LIMITED",
                EmbedderErrorKind::InvalidInput => "EMBEDDER_INVALID_INPUT",
                EmbedderErrorKind::Timeout => "EMBEDDER_TIMEOUT",
                EmbedderErrorKind::QuotaExceeded => "EMBEDDER_QUOTA_EXCEEDED",
                EmbedderErrorKind::Unauthorized => "EMBEDDER_UNAUTHORIZED",
            },
            Error::Operation { kind, .. } => match kind {
                OperationErrorKind::DocumentNotFound => "DOCUMENT_NOT_FOUND",
                OperationErrorKind::InvalidOperation => "INVALID_OPERATION",
            },
        }
    }

    /// Whether the ingest pipeline may retry after this error.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Validation(_) | Error::Configuration { .. } | Error::Operation { .. } => false,
            Error::Database { kind, .. } => !matches!(
                kind,
                DatabaseErrorKind::TableNotFound | DatabaseErrorKind::ConstraintViolation
            ),
            Error::Embedder { kind, .. } => matches!(
                kind,
                EmbedderErrorKind::Api
                    | EmbedderErrorKind::RateLimited
                    | EmbedderErrorKind::Timeout
            ),
        }
    }

    /// Pacing hint attached to a rate-limit error, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Embedder { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
