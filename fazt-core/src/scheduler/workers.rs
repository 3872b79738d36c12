//! Worker pool
//!
//! Long-running user tasks, including daemons that survive restarts.
//! Concurrency is capped per app (5) and globally (CPU-scaled); excess work
//! queues FIFO and is never dropped. Each worker reserves from the shared
//! memory pool before starting. Daemons that crash are restarted by a
//! supervisor with exponential backoff, resuming from their last
//! checkpoint.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::memory::MemoryPool;
use crate::db::now_secs;
use crate::error::{Error, Result};
use crate::limits::Limits;

/// Per-app concurrent worker cap.
const PER_APP_CONCURRENCY: usize = 5;

/// Checkpoint size cap.
const MAX_CHECKPOINT_BYTES: usize = 1024 * 1024;

/// Default memory reservation per worker when the config does not say.
const DEFAULT_WORKER_MEMORY: u64 = 16 * 1024 * 1024;

/// Backoff bounds for daemon restarts.
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Uptime after which a daemon's backoff resets.
const HEALTHY_AFTER: Duration = Duration::from_secs(300);

/// Runs worker code (implemented by the JS runtime).
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    /// Execute `code_path` from the app's VFS under `ctx` until completion
    /// or cancellation. Returning `Err` marks the job failed (and restarts
    /// it when it is a daemon).
    async fn run_worker(&self, ctx: WorkerCtx) -> std::result::Result<(), String>;
}

/// Handle given to a running worker; the JS `job` object is built over it.
#[derive(Clone)]
pub struct WorkerCtx {
    pub job_id: String,
    pub app_id: String,
    pub code_path: String,
    pub config: Value,
    pub cancelled: CancellationToken,
    pool: sqlx::SqlitePool,
}

impl WorkerCtx {
    /// Report progress in [0, 1].
    pub async fn progress(&self, fraction: f64) -> Result<()> {
        sqlx::query("UPDATE worker_jobs SET progress = ?, updated_at = ? WHERE id = ?")
            .bind(fraction.clamp(0.0, 1.0))
            .bind(now_secs())
            .bind(&self.job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist a checkpoint (≤ 1 MiB).
    pub async fn checkpoint(&self, state: &Value) -> Result<()> {
        let raw = serde_json::to_string(state).map_err(|e| Error::Internal(e.to_string()))?;
        if raw.len() > MAX_CHECKPOINT_BYTES {
            return Err(Error::PayloadTooLarge("checkpoint exceeds 1 MiB".to_string()));
        }
        sqlx::query("UPDATE worker_jobs SET checkpoint = ?, updated_at = ? WHERE id = ?")
            .bind(raw)
            .bind(now_secs())
            .bind(&self.job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Read the last persisted checkpoint.
    pub async fn get_checkpoint(&self) -> Result<Option<Value>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT checkpoint FROM worker_jobs WHERE id = ?")
                .bind(&self.job_id)
                .fetch_optional(&self.pool)
                .await?;
        match row.and_then(|(c,)| c) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

/// A worker job row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WorkerJob {
    pub id: String,
    pub app_id: String,
    pub code_path: String,
    pub status: String,
    pub config: String,
    pub daemon: bool,
    pub progress: f64,
    pub checkpoint: Option<String>,
    pub restart_count: i64,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

struct QueuedJob {
    job_id: String,
    app_id: String,
}

/// The pool.
pub struct WorkerPool {
    pool: sqlx::SqlitePool,
    memory: Arc<MemoryPool>,
    executor: Arc<dyn WorkerExecutor>,
    limits: Arc<Limits>,
    global_running: AtomicUsize,
    app_running: DashMap<String, usize>,
    queue: Mutex<VecDeque<QueuedJob>>,
    running_tokens: DashMap<String, CancellationToken>,
    shutdown: CancellationToken,
    accepting: std::sync::atomic::AtomicBool,
    /// Wakes the pump task; queue and slot changes signal it.
    wake: tokio::sync::Notify,
}

impl WorkerPool {
    pub fn new(
        pool: sqlx::SqlitePool,
        memory: Arc<MemoryPool>,
        executor: Arc<dyn WorkerExecutor>,
        limits: Arc<Limits>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let worker_pool = Arc::new(Self {
            pool,
            memory,
            executor,
            limits,
            global_running: AtomicUsize::new(0),
            app_running: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            running_tokens: DashMap::new(),
            shutdown,
            accepting: std::sync::atomic::AtomicBool::new(true),
            wake: tokio::sync::Notify::new(),
        });

        // The pump runs in its own task, decoupled from the jobs it
        // launches, and drains the queue whenever something signals it.
        let pump_handle = worker_pool.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = pump_handle.shutdown.cancelled() => return,
                    () = pump_handle.wake.notified() => pump_handle.pump().await,
                }
            }
        });

        worker_pool
    }

    /// Spawn a worker from `fazt.worker.spawn(path, opts)`. Returns the job
    /// id immediately; the work runs (or queues) in the background.
    pub async fn spawn(
        self: &Arc<Self>,
        app_id: &str,
        code_path: &str,
        config: Value,
    ) -> Result<String> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("worker pool is shutting down".to_string()));
        }
        if !code_path.starts_with("api/") || code_path.contains("..") {
            return Err(Error::BadRequest(format!("worker path must live under api/: {code_path}")));
        }
        let daemon = config.get("daemon").and_then(Value::as_bool).unwrap_or(false);
        let id = Uuid::new_v4().to_string();
        let now = now_secs();
        sqlx::query(
            "INSERT INTO worker_jobs (id, app_id, code_path, status, config, daemon, created_at, updated_at) \
             VALUES (?, ?, ?, 'queued', ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(app_id)
        .bind(code_path)
        .bind(serde_json::to_string(&config).map_err(|e| Error::Internal(e.to_string()))?)
        .bind(daemon)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.enqueue(QueuedJob { job_id: id.clone(), app_id: app_id.to_string() });
        Ok(id)
    }

    /// Cancel a running or queued job.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        if let Some(token) = self.running_tokens.get(job_id) {
            token.cancel();
        }
        self.queue
            .lock()
            .expect("worker queue poisoned")
            .retain(|q| q.job_id != job_id);
        sqlx::query(
            "UPDATE worker_jobs SET status = 'cancelled', updated_at = ? \
             WHERE id = ? AND status IN ('queued', 'running')",
        )
        .bind(now_secs())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// List an app's worker jobs.
    pub async fn list(&self, app_id: &str) -> Result<Vec<WorkerJob>> {
        Ok(sqlx::query_as::<_, WorkerJob>(
            "SELECT * FROM worker_jobs WHERE app_id = ? ORDER BY created_at DESC LIMIT 100",
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Rehydrate daemons left running by the previous process.
    pub async fn restore_daemons(self: &Arc<Self>) -> Result<usize> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT id, app_id FROM worker_jobs WHERE daemon = 1 AND status = 'running'",
        )
        .fetch_all(&self.pool)
        .await?;
        let count = rows.len();
        for (job_id, app_id) in rows {
            tracing::info!(job = %job_id, "restoring daemon");
            self.enqueue(QueuedJob { job_id, app_id });
        }
        Ok(count)
    }

    /// Stop accepting work, give running jobs a grace window to checkpoint,
    /// then hard-cancel.
    pub async fn stop(self: &Arc<Self>, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        self.queue.lock().expect("worker queue poisoned").clear();

        let deadline = tokio::time::Instant::now() + grace;
        while self.global_running.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for entry in self.running_tokens.iter() {
            entry.value().cancel();
        }
    }

    fn enqueue(&self, job: QueuedJob) {
        self.queue.lock().expect("worker queue poisoned").push_back(job);
        self.wake.notify_one();
    }

    /// Start every queued job that fits the concurrency caps.
    async fn pump(self: &Arc<Self>) {
        loop {
            let next = {
                let mut queue = self.queue.lock().expect("worker queue poisoned");
                let global = self.global_running.load(Ordering::SeqCst);
                if global >= self.limits.worker_concurrency() {
                    return;
                }
                // First queued job whose app still has a free slot; jobs
                // from saturated apps keep their queue position.
                let position = queue.iter().position(|q| {
                    self.app_running.get(&q.app_id).map(|c| *c).unwrap_or(0)
                        < PER_APP_CONCURRENCY
                });
                match position {
                    Some(pos) => queue.remove(pos),
                    None => None,
                }
            };
            let Some(next) = next else { return };
            if let Err(e) = self.clone().launch(next.job_id.clone()).await {
                tracing::error!(job = %next.job_id, error = %e, "failed to launch worker");
            }
        }
    }

    async fn launch(self: Arc<Self>, job_id: String) -> Result<()> {
        let job = sqlx::query_as::<_, WorkerJob>("SELECT * FROM worker_jobs WHERE id = ?")
            .bind(&job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("worker job {job_id}")))?;

        let config: Value = serde_json::from_str(&job.config).unwrap_or(Value::Null);
        let reserve = config
            .get("memory")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_WORKER_MEMORY);

        self.global_running.fetch_add(1, Ordering::SeqCst);
        *self.app_running.entry(job.app_id.clone()).or_insert(0) += 1;

        let token = self.shutdown.child_token();
        self.running_tokens.insert(job.id.clone(), token.clone());

        sqlx::query("UPDATE worker_jobs SET status = 'running', updated_at = ? WHERE id = ?")
            .bind(now_secs())
            .bind(&job.id)
            .execute(&self.pool)
            .await?;

        let pool_handle = self.clone();
        tokio::spawn(async move {
            let lease = pool_handle.memory.acquire(reserve).await;
            let ctx = WorkerCtx {
                job_id: job.id.clone(),
                app_id: job.app_id.clone(),
                code_path: job.code_path.clone(),
                config,
                cancelled: token.clone(),
                pool: pool_handle.pool.clone(),
            };

            let result = pool_handle.executor.run_worker(ctx).await;
            drop(lease);

            pool_handle.finish(&job, result, token).await;
        });
        Ok(())
    }

    async fn finish(
        self: &Arc<Self>,
        job: &WorkerJob,
        result: std::result::Result<(), String>,
        token: CancellationToken,
    ) {
        self.running_tokens.remove(&job.id);
        self.global_running.fetch_sub(1, Ordering::SeqCst);
        if let Some(mut count) = self.app_running.get_mut(&job.app_id) {
            *count = count.saturating_sub(1);
        }

        let cancelled = token.is_cancelled();
        let (status, error) = match (&result, cancelled) {
            (_, true) => ("cancelled", None),
            (Ok(()), _) => ("done", None),
            (Err(message), _) => ("failed", Some(message.clone())),
        };

        if let Err(e) = sqlx::query(
            "UPDATE worker_jobs SET status = ?, error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(&error)
        .bind(now_secs())
        .bind(&job.id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(job = %job.id, error = %e, "failed to finalize worker");
        }

        // A crashed daemon restarts with backoff; its checkpoint survives.
        if job.daemon && status == "failed" && self.accepting.load(Ordering::SeqCst) {
            self.supervise_restart(job).await;
        }

        // A free slot may unblock queued work.
        self.wake.notify_one();
    }

    async fn supervise_restart(self: &Arc<Self>, job: &WorkerJob) {
        let started_at = job.updated_at;
        let healthy = now_secs() - started_at >= HEALTHY_AFTER.as_secs() as i64;
        let restarts = if healthy { 0 } else { job.restart_count + 1 };

        let backoff = BACKOFF_MIN
            .saturating_mul(1u32 << restarts.clamp(0, 6) as u32)
            .min(BACKOFF_MAX);
        tracing::warn!(
            job = %job.id,
            restarts,
            backoff_secs = backoff.as_secs(),
            "daemon crashed, scheduling restart"
        );

        if let Err(e) = sqlx::query(
            "UPDATE worker_jobs SET restart_count = ?, status = 'queued', updated_at = ? WHERE id = ?",
        )
        .bind(restarts)
        .bind(now_secs())
        .bind(&job.id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(job = %job.id, error = %e, "failed to requeue daemon");
            return;
        }

        let pool_handle = self.clone();
        let job_id = job.id.clone();
        let app_id = job.app_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = pool_handle.shutdown.cancelled() => {}
                () = tokio::time::sleep(backoff) => {
                    pool_handle.enqueue(QueuedJob { job_id, app_id });
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::limits::{Hardware, Limits};
    use serde_json::json;

    struct TestExecutor {
        checkpoint_on_run: Option<Value>,
        fail: bool,
        observed_checkpoints: Mutex<Vec<Option<Value>>>,
    }

    #[async_trait]
    impl WorkerExecutor for TestExecutor {
        async fn run_worker(&self, ctx: WorkerCtx) -> std::result::Result<(), String> {
            let seen = ctx.get_checkpoint().await.map_err(|e| e.to_string())?;
            self.observed_checkpoints.lock().unwrap().push(seen);
            if let Some(cp) = &self.checkpoint_on_run {
                ctx.checkpoint(cp).await.map_err(|e| e.to_string())?;
            }
            if self.fail {
                Err("worker crashed".to_string())
            } else {
                Ok(())
            }
        }
    }

    async fn setup(executor: TestExecutor) -> (Database, Arc<WorkerPool>, Arc<TestExecutor>) {
        let db = Database::open_memory().await.unwrap();
        let limits = Arc::new(Limits::derive(&Hardware {
            total_ram: 2 << 30,
            available_ram: 1 << 30,
            cpu_cores: 2,
        }));
        let executor = Arc::new(executor);
        let pool = WorkerPool::new(
            db.pool.clone(),
            MemoryPool::new(64 * 1024 * 1024),
            executor.clone(),
            limits,
            CancellationToken::new(),
        );
        (db, pool, executor)
    }

    #[tokio::test]
    async fn test_worker_runs_to_done() {
        let (db, pool, _) = setup(TestExecutor {
            checkpoint_on_run: None,
            fail: false,
            observed_checkpoints: Default::default(),
        })
        .await;

        let id = pool.spawn("app1", "api/worker.js", json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let job = sqlx::query_as::<_, WorkerJob>("SELECT * FROM worker_jobs WHERE id = ?")
            .bind(&id)
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(job.status, "done");
    }

    #[tokio::test]
    async fn test_worker_path_validation() {
        let (_db, pool, _) = setup(TestExecutor {
            checkpoint_on_run: None,
            fail: false,
            observed_checkpoints: Default::default(),
        })
        .await;
        assert!(pool.spawn("app1", "main.js", json!({})).await.is_err());
        assert!(pool.spawn("app1", "api/../../etc", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_daemon_requeued_with_backoff() {
        let (db, pool, _) = setup(TestExecutor {
            checkpoint_on_run: Some(json!({"cursor": 42})),
            fail: true,
            observed_checkpoints: Default::default(),
        })
        .await;

        let id = pool.spawn("app1", "api/daemon.js", json!({"daemon": true})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let job = sqlx::query_as::<_, WorkerJob>("SELECT * FROM worker_jobs WHERE id = ?")
            .bind(&id)
            .fetch_one(&db.pool)
            .await
            .unwrap();
        // Crashed daemon goes back to queued with its checkpoint intact.
        assert_eq!(job.status, "queued");
        assert!(job.restart_count >= 1);
        assert!(job.checkpoint.is_some());
    }

    #[tokio::test]
    async fn test_restored_daemon_sees_checkpoint() {
        let (db, pool, executor) = setup(TestExecutor {
            checkpoint_on_run: None,
            fail: false,
            observed_checkpoints: Default::default(),
        })
        .await;

        // Simulate a pre-crash row from a previous process.
        sqlx::query(
            "INSERT INTO worker_jobs (id, app_id, code_path, status, config, daemon, checkpoint, created_at, updated_at) \
             VALUES ('j1', 'app1', 'api/d.js', 'running', '{}', 1, '{\"n\":9}', 0, 0)",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let restored = pool.restore_daemons().await.unwrap();
        assert_eq!(restored, 1);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let seen = executor.observed_checkpoints.lock().unwrap();
        assert_eq!(seen.as_slice(), &[Some(json!({"n": 9}))]);
    }

    #[tokio::test]
    async fn test_checkpoint_size_cap() {
        let db = Database::open_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO worker_jobs (id, app_id, code_path, status, config, created_at, updated_at) \
             VALUES ('j1', 'app1', 'api/w.js', 'running', '{}', 0, 0)",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let ctx = WorkerCtx {
            job_id: "j1".into(),
            app_id: "app1".into(),
            code_path: "api/w.js".into(),
            config: Value::Null,
            cancelled: CancellationToken::new(),
            pool: db.pool.clone(),
        };
        let huge = json!({"blob": "x".repeat(MAX_CHECKPOINT_BYTES + 1)});
        let err = ctx.checkpoint(&huge).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PayloadTooLarge);
    }

    #[tokio::test]
    async fn test_stop_rejects_new_work() {
        let (_db, pool, _) = setup(TestExecutor {
            checkpoint_on_run: None,
            fail: false,
            observed_checkpoints: Default::default(),
        })
        .await;
        pool.stop(Duration::from_millis(10)).await;
        let err = pool.spawn("app1", "api/w.js", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ServiceUnavailable);
    }
}
