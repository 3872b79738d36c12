//! App storage: KV, documents, blobs
//!
//! Three schema-aware stores over the embedded database. Reads hit the pool
//! directly; every mutation goes through the single writer queue. Scoping is
//! structural: a [`Scope`] is stamped by the host bridge, never taken from
//! user-supplied data, so `fazt.app.user.*` calls cannot reach another
//! user's rows no matter what the filter says.

mod blobs;
mod docs;
mod kv;

pub use docs::{apply_patch, matches, FindOptions};

use std::sync::Arc;

use crate::db::writer::WriteQueue;
use crate::error::{Error, Result};
use crate::limits::Limits;

/// Row ownership for a storage call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Shared app data (`fazt.app.*`)
    Shared,
    /// Data owned by one user (`fazt.app.user.*`)
    User(String),
}

impl Scope {
    /// The `user_id` column value; shared rows use the empty string.
    pub fn user_key(&self) -> &str {
        match self {
            Self::Shared => "",
            Self::User(id) => id,
        }
    }
}

/// Handle to the three stores.
#[derive(Clone)]
pub struct Storage {
    pool: sqlx::SqlitePool,
    queue: WriteQueue,
    limits: Arc<Limits>,
}

impl Storage {
    pub fn new(pool: sqlx::SqlitePool, queue: WriteQueue, limits: Arc<Limits>) -> Self {
        Self { pool, queue, limits }
    }

    pub(crate) fn pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }

    pub(crate) fn queue(&self) -> &WriteQueue {
        &self.queue
    }

    pub(crate) fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Enforce the per-entry size cap.
    pub(crate) fn check_entry_size(&self, bytes: usize) -> Result<()> {
        if bytes as u64 > self.limits.storage.max_file_size {
            return Err(Error::PayloadTooLarge(format!(
                "entry of {bytes} bytes exceeds the {} byte limit",
                self.limits.storage.max_file_size
            )));
        }
        Ok(())
    }

    /// Enforce the aggregate per-app cap before adding `incoming` bytes.
    pub(crate) async fn check_app_quota(&self, app_id: &str, incoming: u64) -> Result<()> {
        let (blobs,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(size), 0) FROM storage_blobs WHERE app_id = ?",
        )
        .bind(app_id)
        .fetch_one(&self.pool)
        .await?;
        let (rows,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(LENGTH(value)), 0) + \
             (SELECT COALESCE(SUM(LENGTH(data)), 0) FROM storage_docs WHERE app_id = ?) \
             FROM storage_kv WHERE app_id = ?",
        )
        .bind(app_id)
        .bind(app_id)
        .fetch_one(&self.pool)
        .await?;

        let used = (blobs + rows) as u64;
        if used + incoming > self.limits.storage.max_site_size {
            return Err(Error::PayloadTooLarge(format!(
                "app storage quota exceeded ({used} + {incoming} > {})",
                self.limits.storage.max_site_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::db::Database;
    use crate::limits::{Hardware, Limits};

    pub async fn storage() -> (Database, Storage) {
        let db = Database::open_memory().await.expect("open db");
        let limits = Arc::new(Limits::derive(&Hardware {
            total_ram: 2 << 30,
            available_ram: 1 << 30,
            cpu_cores: 2,
        }));
        let queue = WriteQueue::start(db.pool.clone(), 64);
        let storage = Storage::new(db.pool.clone(), queue, limits);
        (db, storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_user_key() {
        assert_eq!(Scope::Shared.user_key(), "");
        assert_eq!(Scope::User("fazt_usr_abc".into()).user_key(), "fazt_usr_abc");
    }
}
