//! Shared application state
//!
//! All subsystem singletons, initialized once per process in dependency
//! order and torn down in reverse on shutdown. Handlers receive this via
//! `State<SharedState>`.

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityLog;
use crate::apps;
use crate::config::BootConfig;
use crate::db::writer::WriteQueue;
use crate::db::Database;
use crate::error::Result;
use crate::limits::Limits;
use crate::net::{EgressProxy, NetLog};
use crate::realtime::RealtimeBus;
use crate::runtime::Runtime;
use crate::scheduler::memory::MemoryPool;
use crate::scheduler::workers::WorkerPool;
use crate::scheduler::Scheduler;
use crate::storage::Storage;
use crate::vfs::Vfs;

/// Cheap-to-clone handle to everything.
pub type SharedState = Arc<AppState>;

/// The process-wide state.
pub struct AppState {
    pub config: BootConfig,
    pub limits: Arc<Limits>,
    pub db: Database,
    pub queue: WriteQueue,
    pub storage: Storage,
    pub vfs: Arc<Vfs>,
    pub activity: ActivityLog,
    pub netlog: NetLog,
    pub proxy: Arc<EgressProxy>,
    pub realtime: Arc<RealtimeBus>,
    pub scheduler: Scheduler,
    pub runtime: Arc<Runtime>,
    pub workers: Arc<WorkerPool>,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl AppState {
    /// Boot every subsystem: leaves first, then the runtime, then the
    /// supervisors that need the runtime as executor.
    pub async fn boot(config: BootConfig) -> Result<SharedState> {
        let limits = Arc::new(Limits::discover());
        tracing::info!(
            ram = limits.hardware.total_ram,
            cores = limits.hardware.cpu_cores,
            "limits derived"
        );

        let db = Database::open(&config.db_path).await?;
        ensure_system_apps(&db).await?;

        let shutdown = CancellationToken::new();
        let queue = WriteQueue::start(db.pool.clone(), limits.storage.write_queue);
        let storage = Storage::new(db.pool.clone(), queue.clone(), limits.clone());
        let vfs = Arc::new(Vfs::new(db.pool.clone(), limits.clone()));
        let activity = ActivityLog::start(db.pool.clone(), limits.clone(), shutdown.clone());
        let netlog = NetLog::start(db.pool.clone(), limits.clone(), shutdown.clone());
        let proxy = Arc::new(EgressProxy::new(db.pool.clone(), limits.clone(), netlog.clone()));
        let realtime = Arc::new(RealtimeBus::new());
        let scheduler = Scheduler::new(db.pool.clone(), queue.clone(), limits.clone());

        let runtime = Runtime::new(
            db.pool.clone(),
            vfs.clone(),
            storage.clone(),
            scheduler.clone(),
            realtime.clone(),
            activity.clone(),
            proxy.clone(),
            limits.clone(),
        );

        let memory = MemoryPool::new(limits.worker_memory_budget());
        memory.start_monitor(shutdown.clone());
        let workers = WorkerPool::new(
            db.pool.clone(),
            memory,
            runtime.clone(),
            limits.clone(),
            shutdown.clone(),
        );
        runtime.set_workers(workers.clone());

        scheduler.start_ticker(runtime.clone(), shutdown.clone());
        let restored = workers.restore_daemons().await?;
        if restored > 0 {
            tracing::info!(restored, "daemons restored");
        }

        Ok(Arc::new(Self {
            config,
            limits,
            db,
            queue,
            storage,
            vfs,
            activity,
            netlog,
            proxy,
            realtime,
            scheduler,
            runtime,
            workers,
            shutdown,
            started_at: Instant::now(),
        }))
    }

    /// Graceful teardown, reverse of boot order: stop taking work, let
    /// workers checkpoint, flush buffers.
    pub async fn stop(&self) {
        tracing::info!("shutting down");
        self.workers.stop(std::time::Duration::from_secs(5)).await;
        // Cancelling the token stops the scheduler ticker, the memory
        // monitor, and flushes the activity and net-log buffers.
        self.shutdown.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

/// Seed rows for the built-in apps so aliases, env vars and logs can
/// reference them. Their files are pinned in memory, not in the DB.
async fn ensure_system_apps(db: &Database) -> Result<()> {
    for (id, name) in [
        (apps::SYSTEM_WELCOME, "welcome"),
        (apps::SYSTEM_ADMIN, "admin"),
    ] {
        sqlx::query(
            "INSERT INTO apps (id, name, source, created_at, updated_at) \
             VALUES (?, ?, 'system', ?, ?) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(id)
        .bind(name)
        .bind(crate::db::now_secs())
        .bind(crate::db::now_secs())
        .execute(&db.pool)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// Boot a full state over an in-memory database.
    pub async fn memory_state() -> SharedState {
        let db = Database::open_memory().await.expect("open db");
        ensure_system_apps(&db).await.expect("system apps");

        let limits = Arc::new(Limits::derive(&crate::limits::Hardware {
            total_ram: 2 << 30,
            available_ram: 1 << 30,
            cpu_cores: 2,
        }));
        let shutdown = CancellationToken::new();
        let queue = WriteQueue::start(db.pool.clone(), 64);
        let storage = Storage::new(db.pool.clone(), queue.clone(), limits.clone());
        let vfs = Arc::new(Vfs::new(db.pool.clone(), limits.clone()));
        let activity = ActivityLog::start(db.pool.clone(), limits.clone(), shutdown.clone());
        let netlog = NetLog::start(db.pool.clone(), limits.clone(), shutdown.clone());
        let proxy = Arc::new(EgressProxy::new(db.pool.clone(), limits.clone(), netlog.clone()));
        let realtime = Arc::new(RealtimeBus::new());
        let scheduler = Scheduler::new(db.pool.clone(), queue.clone(), limits.clone());
        let runtime = Runtime::new(
            db.pool.clone(),
            vfs.clone(),
            storage.clone(),
            scheduler.clone(),
            realtime.clone(),
            activity.clone(),
            proxy.clone(),
            limits.clone(),
        );
        let memory = MemoryPool::new(64 * 1024 * 1024);
        let workers = WorkerPool::new(
            db.pool.clone(),
            memory,
            runtime.clone(),
            limits.clone(),
            shutdown.clone(),
        );
        runtime.set_workers(workers.clone());

        Arc::new(AppState {
            config: BootConfig::default(),
            limits,
            db,
            queue,
            storage,
            vfs,
            activity,
            netlog,
            proxy,
            realtime,
            scheduler,
            runtime,
            workers,
            shutdown,
            started_at: Instant::now(),
        })
    }
}
