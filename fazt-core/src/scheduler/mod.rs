//! Hibernate scheduler
//!
//! Jobs are rows: an app calls `fazt.schedule(delay, state)`, the handler
//! returns, and nothing stays in memory. A 1-second tick claims due rows,
//! marks them running, and re-executes the app with `trigger = "schedule"`
//! and the stored state. Failures mark the row failed with the error; the
//! tick loop itself never dies.

pub mod memory;
pub mod workers;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::writer::{WriteOp, WriteQueue};
use crate::db::now_secs;
use crate::error::{Error, Result};
use crate::limits::Limits;

/// Jobs claimed per tick.
const CLAIM_BATCH: i64 = 10;

/// Executes a claimed job (implemented by the JS runtime).
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run the app's handler with `trigger = "schedule"` and the payload as
    /// state. A returned error string marks the job failed.
    async fn execute_job(&self, app_id: &str, job_id: &str, state: Value)
        -> std::result::Result<(), String>;
}

/// A job row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    pub app_id: String,
    pub wake_at: i64,
    pub payload: String,
    pub status: String,
    pub error: Option<String>,
    pub created_at: i64,
}

/// Parse a JS delay: a number is milliseconds; strings take `30s`, `5m`,
/// `2h`, `1d` forms.
pub fn parse_delay(delay: &Value) -> Result<Duration> {
    if let Some(ms) = delay.as_u64() {
        return Ok(Duration::from_millis(ms));
    }
    let Some(s) = delay.as_str() else {
        return Err(Error::BadRequest("delay must be a number or duration string".to_string()));
    };
    let s = s.trim();
    let (digits, unit) = s.split_at(s.len().saturating_sub(1));
    let n: u64 = digits
        .parse()
        .map_err(|_| Error::BadRequest(format!("invalid delay: {s}")))?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86_400,
        _ => return Err(Error::BadRequest(format!("invalid delay unit: {s}"))),
    };
    Ok(Duration::from_secs(secs))
}

/// Scheduler handle for the host bridge.
#[derive(Clone)]
pub struct Scheduler {
    pool: sqlx::SqlitePool,
    queue: WriteQueue,
    limits: Arc<Limits>,
}

impl Scheduler {
    pub fn new(pool: sqlx::SqlitePool, queue: WriteQueue, limits: Arc<Limits>) -> Self {
        Self { pool, queue, limits }
    }

    /// Enqueue a job. Delay is clamped to the configured window; payload is
    /// capped at 64 KiB; the per-app pending cap applies.
    pub async fn schedule(&self, app_id: &str, delay: Duration, state: &Value) -> Result<String> {
        let min = Duration::from_secs(self.limits.runtime.min_job_delay_secs);
        let max = Duration::from_secs(self.limits.runtime.max_job_delay_secs);
        if delay < min || delay > max {
            return Err(Error::BadRequest(format!(
                "delay must be between {}s and {}s",
                min.as_secs(),
                max.as_secs()
            )));
        }

        let payload = serde_json::to_string(state).map_err(|e| Error::Internal(e.to_string()))?;
        if payload.len() > 64 * 1024 {
            return Err(Error::PayloadTooLarge("job payload exceeds 64 KiB".to_string()));
        }

        let (pending,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs WHERE app_id = ? AND status = 'pending'",
        )
        .bind(app_id)
        .fetch_one(&self.pool)
        .await?;
        if pending >= self.limits.runtime.max_jobs_per_app as i64 {
            return Err(Error::RateLimited { retry_after_secs: 60 });
        }

        let id = Uuid::new_v4().to_string();
        self.queue
            .submit(vec![WriteOp::JobInsert {
                id: id.clone(),
                app_id: app_id.to_string(),
                wake_at: now_secs() + delay.as_secs() as i64,
                payload,
            }])
            .await?;
        Ok(id)
    }

    /// Cancel a pending job owned by the app.
    pub async fn cancel(&self, app_id: &str, job_id: &str) -> Result<()> {
        self.queue
            .submit(vec![WriteOp::JobCancel {
                id: job_id.to_string(),
                app_id: app_id.to_string(),
            }])
            .await
    }

    /// List an app's jobs, newest first.
    pub async fn list(&self, app_id: &str) -> Result<Vec<Job>> {
        Ok(sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE app_id = ? ORDER BY created_at DESC LIMIT 100",
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Run the tick loop until `shutdown` fires.
    pub fn start_ticker(&self, executor: Arc<dyn JobExecutor>, shutdown: CancellationToken) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        tracing::debug!("scheduler ticker stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.tick(&executor).await {
                            tracing::warn!(error = %e, "scheduler tick failed");
                        }
                    }
                }
            }
        });
    }

    /// One tick: claim due jobs and dispatch them.
    pub async fn tick(&self, executor: &Arc<dyn JobExecutor>) -> Result<()> {
        let claimed = sqlx::query_as::<_, Job>(
            "UPDATE jobs SET status = 'running' \
             WHERE id IN (SELECT id FROM jobs WHERE status = 'pending' AND wake_at <= ? \
                          ORDER BY wake_at LIMIT ?) \
             RETURNING *",
        )
        .bind(now_secs())
        .bind(CLAIM_BATCH)
        .fetch_all(&self.pool)
        .await?;

        for job in claimed {
            let pool = self.pool.clone();
            let executor = executor.clone();
            let exec_timeout = self.limits.runtime.exec_timeout();
            tokio::spawn(async move {
                let state: Value = serde_json::from_str(&job.payload).unwrap_or(Value::Null);
                let outcome = tokio::time::timeout(
                    exec_timeout + Duration::from_secs(1),
                    executor.execute_job(&job.app_id, &job.id, state),
                )
                .await;

                let (status, error) = match outcome {
                    Ok(Ok(())) => ("done", None),
                    Ok(Err(message)) => ("failed", Some(message)),
                    Err(_) => ("failed", Some("job timed out".to_string())),
                };
                if let Err(e) = sqlx::query("UPDATE jobs SET status = ?, error = ? WHERE id = ?")
                    .bind(status)
                    .bind(&error)
                    .bind(&job.id)
                    .execute(&pool)
                    .await
                {
                    tracing::error!(job = %job.id, error = %e, "failed to finalize job");
                }
                if let Some(message) = error {
                    tracing::warn!(job = %job.id, app = %job.app_id, error = %message, "job failed");
                }
            });
        }
        Ok(())
    }
}
