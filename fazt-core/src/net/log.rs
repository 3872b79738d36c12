//! Egress log buffer
//!
//! Events buffer in memory and flush on an interval in one bulk insert;
//! error events flush the buffer immediately. Query strings never reach the
//! log (they may carry secrets).

use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::db::now_secs;
use crate::limits::Limits;

/// One egress log entry.
#[derive(Debug, Clone)]
pub struct NetLogEntry {
    pub ts: i64,
    pub app_id: Option<String>,
    pub method: String,
    pub host: String,
    /// Path only; the query string is stripped before logging.
    pub path: String,
    pub status: Option<i64>,
    pub duration_ms: Option<i64>,
    pub bytes_in: Option<i64>,
    pub error: Option<String>,
}

impl NetLogEntry {
    pub fn new(app_id: &str, method: &str, host: &str, path: &str) -> Self {
        Self {
            ts: now_secs(),
            app_id: Some(app_id.to_string()),
            method: method.to_string(),
            host: host.to_string(),
            path: path.split('?').next().unwrap_or(path).to_string(),
            status: None,
            duration_ms: None,
            bytes_in: None,
            error: None,
        }
    }
}

/// Sender half of the net log.
#[derive(Clone)]
pub struct NetLog {
    tx: mpsc::UnboundedSender<NetLogEntry>,
}

impl NetLog {
    pub fn start(pool: SqlitePool, limits: Arc<Limits>, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(collector(pool, limits, rx, shutdown));
        Self { tx }
    }

    pub fn record(&self, entry: NetLogEntry) {
        let _ = self.tx.send(entry);
    }
}

async fn collector(
    pool: SqlitePool,
    limits: Arc<Limits>,
    mut rx: mpsc::UnboundedReceiver<NetLogEntry>,
    shutdown: CancellationToken,
) {
    let mut buffer: Vec<NetLogEntry> = Vec::new();
    let interval = std::time::Duration::from_millis(limits.net.log_flush_ms.max(100));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                while let Ok(entry) = rx.try_recv() {
                    buffer.push(entry);
                }
                flush(&pool, &mut buffer).await;
                return;
            }
            entry = rx.recv() => {
                match entry {
                    Some(entry) => {
                        let is_error = entry.error.is_some();
                        buffer.push(entry);
                        if is_error || buffer.len() >= limits.net.log_buffer_size {
                            flush(&pool, &mut buffer).await;
                        }
                    }
                    None => {
                        flush(&pool, &mut buffer).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                flush(&pool, &mut buffer).await;
            }
        }
    }
}

async fn flush(pool: &SqlitePool, buffer: &mut Vec<NetLogEntry>) {
    if buffer.is_empty() {
        return;
    }
    let result = async {
        let mut tx = pool.begin().await?;
        for entry in buffer.iter() {
            sqlx::query(
                "INSERT INTO net_log (ts, app_id, method, host, path, status, duration_ms, bytes_in, error) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(entry.ts)
            .bind(&entry.app_id)
            .bind(&entry.method)
            .bind(&entry.host)
            .bind(&entry.path)
            .bind(entry.status)
            .bind(entry.duration_ms)
            .bind(entry.bytes_in)
            .bind(&entry.error)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }
    .await;

    match result {
        Ok(()) => buffer.clear(),
        Err(e) => tracing::warn!(error = %e, "net log flush failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::limits::{Hardware, Limits};

    #[tokio::test]
    async fn test_error_flushes_immediately() {
        let db = Database::open_memory().await.unwrap();
        let limits = Arc::new(Limits::derive(&Hardware {
            total_ram: 2 << 30,
            available_ram: 1 << 30,
            cpu_cores: 2,
        }));
        let shutdown = CancellationToken::new();
        let log = NetLog::start(db.pool.clone(), limits, shutdown.clone());

        let mut entry = NetLogEntry::new("app1", "GET", "api.x.com", "/v1?token=secret");
        entry.error = Some("NET_BLOCKED".to_string());
        log.record(entry);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let (path, error): (String, Option<String>) =
            sqlx::query_as("SELECT path, error FROM net_log LIMIT 1")
                .fetch_one(&db.pool)
                .await
                .unwrap();
        // Query string stripped.
        assert_eq!(path, "/v1");
        assert_eq!(error.as_deref(), Some("NET_BLOCKED"));
        shutdown.cancel();
    }
}
