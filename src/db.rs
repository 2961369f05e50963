//! Shared connection pools and the pgvector type probe.
//!
//! One `PgPool` exists per connection string, shared by every store and
//! query service bound to that string. Handles are reference-counted:
//! `dispose` releases a reference, and the last release closes the pool.
//!
//! The pgvector probe runs once per pool, before the first statement that
//! touches a vector column. It is single-flight: the first caller performs
//! it, concurrent callers await the same completion, and a failure leaves
//! the guard clear so a later call can retry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Deserialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::error::{DatabaseErrorKind, Error, Result};

/// Pool sizing and timeout knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    20
}
fn default_min_connections() -> u32 {
    5
}
fn default_idle_timeout_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    2
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

struct PoolEntry {
    pool: PgPool,
    vector_probe: Arc<OnceCell<()>>,
    refs: usize,
}

fn registry() -> &'static Mutex<HashMap<String, PoolEntry>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, PoolEntry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A reference-counted handle onto the shared pool for one connection
/// string.
#[derive(Debug)]
pub struct PoolHandle {
    url: String,
    pool: PgPool,
    vector_probe: Arc<OnceCell<()>>,
    disposed: AtomicBool,
}

impl PoolHandle {
    /// Acquire a handle, creating the pool on first use of a connection
    /// string. Pool creation is lazy; no connection is opened here.
    pub async fn acquire(url: &str, config: &PoolConfig) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(Error::config("database url must not be empty"));
        }
        if config.max_connections == 0 || config.min_connections > config.max_connections {
            return Err(Error::config(format!(
                "invalid pool sizing: min {} / max {}",
                config.min_connections, config.max_connections
            )));
        }

        let mut reg = registry().lock().await;
        if let Some(entry) = reg.get_mut(url) {
            entry.refs += 1;
            return Ok(Self {
                url: url.to_string(),
                pool: entry.pool.clone(),
                vector_probe: entry.vector_probe.clone(),
                disposed: AtomicBool::new(false),
            });
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect_lazy(url)
            .map_err(|e| Error::from_sqlx("pool creation", e))?;

        let vector_probe = Arc::new(OnceCell::new());
        reg.insert(
            url.to_string(),
            PoolEntry {
                pool: pool.clone(),
                vector_probe: vector_probe.clone(),
                refs: 1,
            },
        );
        debug!(url_hash = url_hash(url), "created connection pool");

        Ok(Self {
            url: url.to_string(),
            pool,
            vector_probe,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Verify the `vector` type exists on this pool's database. Runs at most
    /// once per pool; concurrent callers await the first probe; a failed
    /// probe is retried by the next caller.
    pub async fn ensure_vector_type(&self) -> Result<()> {
        self.vector_probe
            .get_or_try_init(|| async {
                let found: Option<i32> =
                    sqlx::query_scalar("SELECT 1 FROM pg_type WHERE typname = 'vector'")
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(|e| Error::from_sqlx("vector type probe", e))?;
                if found.is_none() {
                    return Err(Error::database(
                        DatabaseErrorKind::TableNotFound,
                        "vector type probe (pgvector extension is not installed; \
                         run CREATE EXTENSION vector)",
                    ));
                }
                debug!("vector type registered for pool");
                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// Release this handle's reference. The last release closes the pool and
    /// evicts it from the registry. Idempotent; never errors.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool_to_close = {
            let mut reg = registry().lock().await;
            match reg.get_mut(&self.url) {
                Some(entry) if entry.refs <= 1 => reg.remove(&self.url).map(|e| e.pool),
                Some(entry) => {
                    entry.refs -= 1;
                    None
                }
                None => None,
            }
        };
        if let Some(pool) = pool_to_close {
            pool.close().await;
            debug!(url_hash = url_hash(&self.url), "closed connection pool");
        }
    }
}

/// Cheap stable hash so logs never carry credentials from the URL.
fn url_hash(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}
