//! Activity log and analytics buffer
//!
//! Every component reports structured events to one in-process bus. Events
//! accumulate in memory and flush in a single transaction every 30 seconds
//! or at 1000 buffered events, whichever first. A failed flush retries once
//! after 5 seconds; on persistent failure the oldest entries are dropped so
//! the buffer stays bounded. Retention pruning piggybacks on flushes.

use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::db::now_secs;
use crate::limits::Limits;

/// Flush when the buffer reaches this many events.
const FLUSH_THRESHOLD: usize = 1000;

/// Flush interval.
const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Retry delay after a failed flush.
const RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

/// Hard cap on buffered events while the database is down.
const BUFFER_CAP: usize = 10_000;

/// One activity event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub ts: i64,
    pub app_id: Option<String>,
    pub user_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub action: String,
    pub actor: Option<String>,
    pub weight: i64,
    pub path: Option<String>,
    pub status: Option<i64>,
    pub duration_ms: Option<i64>,
    pub details: Option<Value>,
}

impl Event {
    /// A minimally filled event; callers set the rest with struct update.
    pub fn new(event_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            ts: now_secs(),
            app_id: None,
            user_id: None,
            event_type: event_type.into(),
            action: action.into(),
            actor: None,
            weight: 1,
            path: None,
            status: None,
            duration_ms: None,
            details: None,
        }
    }
}

/// Cloneable sender half of the bus.
#[derive(Clone)]
pub struct ActivityLog {
    tx: mpsc::UnboundedSender<Event>,
}

impl ActivityLog {
    /// Start the collector task. Cancelling `shutdown` flushes and stops.
    pub fn start(pool: SqlitePool, limits: Arc<Limits>, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(collector(pool, limits, rx, shutdown));
        Self { tx }
    }

    /// Record an event. Never blocks; silently drops once the collector is
    /// gone (shutdown races).
    pub fn record(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

async fn collector(
    pool: SqlitePool,
    limits: Arc<Limits>,
    mut rx: mpsc::UnboundedReceiver<Event>,
    shutdown: CancellationToken,
) {
    let mut buffer: Vec<Event> = Vec::new();
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                // Drain whatever arrived before the cancel.
                while let Ok(event) = rx.try_recv() {
                    buffer.push(event);
                }
                let _ = flush(&pool, &mut buffer).await;
                tracing::debug!("activity collector stopped");
                return;
            }
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= FLUSH_THRESHOLD {
                            flush_with_retry(&pool, &mut buffer).await;
                            prune(&pool, &limits).await;
                        }
                    }
                    None => {
                        let _ = flush(&pool, &mut buffer).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_with_retry(&pool, &mut buffer).await;
                    prune(&pool, &limits).await;
                }
            }
        }
    }
}

async fn flush_with_retry(pool: &SqlitePool, buffer: &mut Vec<Event>) {
    if flush(pool, buffer).await.is_err() {
        tokio::time::sleep(RETRY_DELAY).await;
        if let Err(e) = flush(pool, buffer).await {
            tracing::warn!(error = %e, buffered = buffer.len(), "activity flush failed twice");
            // Keep the buffer bounded by dropping the oldest entries.
            if buffer.len() > BUFFER_CAP {
                let excess = buffer.len() - BUFFER_CAP;
                buffer.drain(..excess);
            }
        }
    }
}

async fn flush(pool: &SqlitePool, buffer: &mut Vec<Event>) -> Result<(), sqlx::Error> {
    if buffer.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for event in buffer.iter() {
        sqlx::query(
            "INSERT INTO activity_log \
             (ts, app_id, user_id, type, action, actor, weight, path, status, duration_ms, details) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.ts)
        .bind(&event.app_id)
        .bind(&event.user_id)
        .bind(&event.event_type)
        .bind(&event.action)
        .bind(&event.actor)
        .bind(event.weight)
        .bind(&event.path)
        .bind(event.status)
        .bind(event.duration_ms)
        .bind(event.details.as_ref().map(|d| d.to_string()))
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    buffer.clear();
    Ok(())
}

/// Trim the table back to the retention bound.
async fn prune(pool: &SqlitePool, limits: &Limits) {
    let result = sqlx::query(
        "DELETE FROM activity_log WHERE id <= \
         (SELECT id FROM activity_log ORDER BY id DESC LIMIT 1 OFFSET ?)",
    )
    .bind(limits.storage.max_log_rows as i64)
    .execute(pool)
    .await;
    if let Err(e) = result {
        tracing::warn!(error = %e, "activity prune failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::limits::{Hardware, Limits};

    fn limits() -> Arc<Limits> {
        Arc::new(Limits::derive(&Hardware {
            total_ram: 2 << 30,
            available_ram: 1 << 30,
            cpu_cores: 2,
        }))
    }

    #[tokio::test]
    async fn test_shutdown_flushes_buffer() {
        let db = Database::open_memory().await.unwrap();
        let shutdown = CancellationToken::new();
        let log = ActivityLog::start(db.pool.clone(), limits(), shutdown.clone());

        let mut event = Event::new("http", "request");
        event.app_id = Some("app1".into());
        event.status = Some(200);
        log.record(event);

        shutdown.cancel();
        // Give the collector a moment to drain and flush.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM activity_log")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_threshold_triggers_flush() {
        let db = Database::open_memory().await.unwrap();
        let shutdown = CancellationToken::new();
        let log = ActivityLog::start(db.pool.clone(), limits(), shutdown.clone());

        for _ in 0..FLUSH_THRESHOLD {
            log.record(Event::new("test", "tick"));
        }
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM activity_log")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert!(count >= FLUSH_THRESHOLD as i64);
        shutdown.cancel();
    }

    #[test]
    fn test_event_defaults() {
        let event = Event::new("http", "request");
        assert_eq!(event.weight, 1);
        assert!(event.app_id.is_none());
        assert!(event.ts > 0);
    }
}
