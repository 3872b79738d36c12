//! Single writer queue
//!
//! Every mutation of app data funnels through one task owning the write
//! side of the database. A bounded channel provides backpressure: when it
//! fills, callers fail fast with a retryable error instead of piling onto
//! the lock. The writer drains a small window of pending batches into one
//! transaction to amortize fsyncs without head-of-line blocking.
//!
//! Each submitted batch completes (or fails) before `submit` returns, which
//! gives read-your-writes within a request for free.

use tokio::sync::{mpsc, oneshot};

use super::{now_secs, with_busy_retry};
use crate::error::{Error, Result};

/// Batches merged into one transaction per drain.
const DRAIN_WINDOW: usize = 16;

/// A single mutation against app storage.
#[derive(Debug)]
pub enum WriteOp {
    KvSet {
        app_id: String,
        user_id: String,
        key: String,
        value: String,
        expires_at: Option<i64>,
    },
    KvDelete {
        app_id: String,
        user_id: String,
        key: String,
    },
    DocInsert {
        id: String,
        app_id: String,
        user_id: String,
        collection: String,
        data: String,
    },
    DocReplace {
        id: String,
        data: String,
    },
    DocDelete {
        ids: Vec<String>,
    },
    BlobPut {
        app_id: String,
        user_id: String,
        path: String,
        content: Vec<u8>,
        content_type: String,
    },
    BlobDelete {
        app_id: String,
        user_id: String,
        path: String,
    },
    JobInsert {
        id: String,
        app_id: String,
        wake_at: i64,
        payload: String,
    },
    JobCancel {
        id: String,
        app_id: String,
    },
}

struct WriteBatch {
    ops: Vec<WriteOp>,
    respond_to: oneshot::Sender<Result<()>>,
}

/// Handle to the writer task.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<WriteBatch>,
}

impl WriteQueue {
    /// Spawn the writer task over `pool` with the given queue depth.
    pub fn start(pool: sqlx::SqlitePool, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(writer_loop(pool, rx));
        Self { tx }
    }

    /// Submit a batch of ops; resolves once they are committed.
    ///
    /// # Errors
    ///
    /// `SERVICE_UNAVAILABLE` when the queue is full (retryable), or the
    /// underlying database error after the retry policy is exhausted.
    pub async fn submit(&self, ops: Vec<WriteOp>) -> Result<()> {
        let (respond_to, done) = oneshot::channel();
        self.tx
            .try_send(WriteBatch { ops, respond_to })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    Error::Unavailable("write queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    Error::Internal("write queue stopped".to_string())
                }
            })?;
        done.await
            .map_err(|_| Error::Internal("writer dropped batch".to_string()))?
    }
}

async fn writer_loop(pool: sqlx::SqlitePool, mut rx: mpsc::Receiver<WriteBatch>) {
    while let Some(first) = rx.recv().await {
        let mut window = vec![first];
        while window.len() < DRAIN_WINDOW {
            match rx.try_recv() {
                Ok(batch) => window.push(batch),
                Err(_) => break,
            }
        }

        let result = with_busy_retry(|| apply_window(&pool, &window)).await;
        let shared = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(e.to_string()),
        };
        for batch in window {
            let out = match &shared {
                Ok(()) => Ok(()),
                Err(msg) => Err(Error::Internal(msg.clone())),
            };
            let _ = batch.respond_to.send(out);
        }
        if let Err(e) = result {
            tracing::error!(error = %e, "write window failed");
        }
    }
    tracing::debug!("write queue drained, writer stopping");
}

async fn apply_window(
    pool: &sqlx::SqlitePool,
    window: &[WriteBatch],
) -> std::result::Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for batch in window {
        for op in &batch.ops {
            apply_op(&mut tx, op).await?;
        }
    }
    tx.commit().await
}

async fn apply_op(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    op: &WriteOp,
) -> std::result::Result<(), sqlx::Error> {
    let now = now_secs();
    match op {
        WriteOp::KvSet { app_id, user_id, key, value, expires_at } => {
            sqlx::query(
                "INSERT INTO storage_kv (app_id, user_id, key, value, expires_at, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (app_id, user_id, key) \
                 DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at, updated_at = excluded.updated_at",
            )
            .bind(app_id)
            .bind(user_id)
            .bind(key)
            .bind(value)
            .bind(expires_at)
            .bind(now)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::KvDelete { app_id, user_id, key } => {
            sqlx::query("DELETE FROM storage_kv WHERE app_id = ? AND user_id = ? AND key = ?")
                .bind(app_id)
                .bind(user_id)
                .bind(key)
                .execute(&mut **tx)
                .await?;
        }
        WriteOp::DocInsert { id, app_id, user_id, collection, data } => {
            sqlx::query(
                "INSERT INTO storage_docs (id, app_id, user_id, collection, data, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(app_id)
            .bind(user_id)
            .bind(collection)
            .bind(data)
            .bind(now)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::DocReplace { id, data } => {
            sqlx::query("UPDATE storage_docs SET data = ?, updated_at = ? WHERE id = ?")
                .bind(data)
                .bind(now)
                .bind(id)
                .execute(&mut **tx)
                .await?;
        }
        WriteOp::DocDelete { ids } => {
            for id in ids {
                sqlx::query("DELETE FROM storage_docs WHERE id = ?")
                    .bind(id)
                    .execute(&mut **tx)
                    .await?;
            }
        }
        WriteOp::BlobPut { app_id, user_id, path, content, content_type } => {
            sqlx::query(
                "INSERT INTO storage_blobs (app_id, user_id, path, content, content_type, size, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (app_id, user_id, path) \
                 DO UPDATE SET content = excluded.content, content_type = excluded.content_type, \
                               size = excluded.size, updated_at = excluded.updated_at",
            )
            .bind(app_id)
            .bind(user_id)
            .bind(path)
            .bind(content.as_slice())
            .bind(content_type)
            .bind(content.len() as i64)
            .bind(now)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::BlobDelete { app_id, user_id, path } => {
            sqlx::query("DELETE FROM storage_blobs WHERE app_id = ? AND user_id = ? AND path = ?")
                .bind(app_id)
                .bind(user_id)
                .bind(path)
                .execute(&mut **tx)
                .await?;
        }
        WriteOp::JobInsert { id, app_id, wake_at, payload } => {
            sqlx::query(
                "INSERT INTO jobs (id, app_id, wake_at, payload, status, created_at) \
                 VALUES (?, ?, ?, ?, 'pending', ?)",
            )
            .bind(id)
            .bind(app_id)
            .bind(wake_at)
            .bind(payload)
            .bind(now)
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::JobCancel { id, app_id } => {
            sqlx::query("DELETE FROM jobs WHERE id = ? AND app_id = ? AND status = 'pending'")
                .bind(id)
                .bind(app_id)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_kv_set_round_trip() {
        let db = Database::open_memory().await.unwrap();
        let queue = WriteQueue::start(db.pool.clone(), 16);

        queue
            .submit(vec![WriteOp::KvSet {
                app_id: "app1".into(),
                user_id: String::new(),
                key: "greeting".into(),
                value: "\"hello\"".into(),
                expires_at: None,
            }])
            .await
            .expect("submit");

        let row: (String,) =
            sqlx::query_as("SELECT value FROM storage_kv WHERE app_id = 'app1' AND key = 'greeting'")
                .fetch_one(&db.pool)
                .await
                .unwrap();
        assert_eq!(row.0, "\"hello\"");
    }

    #[tokio::test]
    async fn test_kv_set_overwrites() {
        let db = Database::open_memory().await.unwrap();
        let queue = WriteQueue::start(db.pool.clone(), 16);

        for value in ["\"a\"", "\"b\""] {
            queue
                .submit(vec![WriteOp::KvSet {
                    app_id: "app1".into(),
                    user_id: String::new(),
                    key: "k".into(),
                    value: value.into(),
                    expires_at: None,
                }])
                .await
                .unwrap();
        }

        let row: (String,) = sqlx::query_as("SELECT value FROM storage_kv WHERE key = 'k'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(row.0, "\"b\"");
    }

    #[tokio::test]
    async fn test_program_order_within_request() {
        let db = Database::open_memory().await.unwrap();
        let queue = WriteQueue::start(db.pool.clone(), 16);

        // W1 then W2 from one request; both visible after the second submit.
        queue
            .submit(vec![WriteOp::DocInsert {
                id: "d1".into(),
                app_id: "a".into(),
                user_id: String::new(),
                collection: "c".into(),
                data: "{\"n\":1}".into(),
            }])
            .await
            .unwrap();
        queue
            .submit(vec![WriteOp::DocReplace { id: "d1".into(), data: "{\"n\":2}".into() }])
            .await
            .unwrap();

        let row: (String,) = sqlx::query_as("SELECT data FROM storage_docs WHERE id = 'd1'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(row.0, "{\"n\":2}");
    }
}
