//! Embedded database
//!
//! One SQLite file holds everything: apps, files, users, storage rows,
//! jobs, egress config, logs. WAL mode with a busy timeout strictly below
//! the runtime's execution window, so lock contention surfaces to the
//! budget framework instead of wedging a request.
//!
//! Two pools share the file: the hosted pool serves app traffic, and a
//! small reserved admin pool keeps the dashboard responsive when hosted
//! traffic saturates connections.

pub mod config_store;
pub mod writer;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

use crate::error::{is_busy, Error, Result};

/// Busy timeout; kept under the JS execution window.
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// Hosted pool ceiling. SQLite is effectively single-writer; more
/// connections only add lock contention.
const MAX_CONNECTIONS: u32 = 10;

/// Reserved connections for management endpoints.
const ADMIN_CONNECTIONS: u32 = 2;

/// The two pools over one database file.
#[derive(Debug, Clone)]
pub struct Database {
    /// Hosted-traffic pool
    pub pool: SqlitePool,
    /// Reserved admin pool
    pub admin_pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) and migrate the database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .min_connections(1)
            .connect_with(options.clone())
            .await?;

        let admin_pool = SqlitePoolOptions::new()
            .max_connections(ADMIN_CONNECTIONS)
            .min_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::Internal(format!("migration failed: {e}")))?;

        tracing::info!(path = %path.display(), "database ready");

        Ok(Self { pool, admin_pool })
    }

    /// Open an in-memory database (tests).
    pub async fn open_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .shared_cache(true)
            .foreign_keys(true);

        // A single connection keeps the in-memory database alive and
        // visible to every user of the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::Internal(format!("migration failed: {e}")))?;

        Ok(Self { pool: pool.clone(), admin_pool: pool })
    }
}

/// Retry a transient-busy operation up to 3 times with exponential backoff
/// (10 ms base, doubling). Non-transient errors return immediately.
pub async fn with_busy_retry<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut delay = Duration::from_millis(10);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_busy(&e) && attempt < 3 => {
                attempt += 1;
                tracing::debug!(attempt, "database busy, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(Error::Database(e)),
        }
    }
}

/// Current time as epoch seconds, the canonical timestamp format in the
/// schema.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
