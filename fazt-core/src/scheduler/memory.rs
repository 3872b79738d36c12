//! Worker memory pool
//!
//! A process-wide byte budget allocated to worker jobs on request. At the
//! hard cap new allocations wait instead of failing; a monitor samples the
//! process heap and logs a warning once usage crosses 80 % of the budget.

use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// Monitor sample interval.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Warning threshold as a fraction of the budget.
const WARN_FRACTION: f64 = 0.8;

/// The pool. Cheap to clone via `Arc`.
pub struct MemoryPool {
    budget: u64,
    used: Mutex<u64>,
    freed: Notify,
}

/// Releases its reservation on drop.
pub struct MemoryLease {
    pool: Arc<MemoryPool>,
    bytes: u64,
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        let pool = self.pool.clone();
        let bytes = self.bytes;
        tokio::spawn(async move {
            let mut used = pool.used.lock().await;
            *used = used.saturating_sub(bytes);
            drop(used);
            pool.freed.notify_waiters();
        });
    }
}

impl MemoryPool {
    #[must_use]
    pub fn new(budget: u64) -> Arc<Self> {
        Arc::new(Self { budget, used: Mutex::new(0), freed: Notify::new() })
    }

    /// Reserve `bytes`, waiting while the pool is at its cap. A request
    /// larger than the whole budget is clamped so it can eventually run.
    pub async fn acquire(self: &Arc<Self>, bytes: u64) -> MemoryLease {
        let bytes = bytes.min(self.budget);
        loop {
            {
                let mut used = self.used.lock().await;
                if *used + bytes <= self.budget {
                    *used += bytes;
                    return MemoryLease { pool: self.clone(), bytes };
                }
            }
            self.freed.notified().await;
        }
    }

    /// Bytes currently reserved.
    pub async fn used(&self) -> u64 {
        *self.used.lock().await
    }

    /// The configured budget.
    #[must_use]
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Start the heap monitor task.
    pub fn start_monitor(self: &Arc<Self>, shutdown: CancellationToken) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut system = System::new();
            let pid = Pid::from_u32(std::process::id());
            let mut warned = false;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(SAMPLE_INTERVAL) => {
                        system.refresh_process(pid);
                        let Some(process) = system.process(pid) else { continue };
                        let rss = process.memory();
                        let threshold = (pool.budget as f64 * WARN_FRACTION) as u64;
                        let reserved = pool.used().await;
                        if reserved > threshold && !warned {
                            warned = true;
                            tracing::warn!(
                                reserved,
                                budget = pool.budget,
                                process_rss = rss,
                                "worker memory pool above 80% of budget"
                            );
                        } else if reserved <= threshold {
                            warned = false;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_release() {
        let pool = MemoryPool::new(100);
        let lease = pool.acquire(60).await;
        assert_eq!(pool.used().await, 60);
        drop(lease);
        // Release happens via spawned task.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.used().await, 0);
    }

    #[tokio::test]
    async fn test_acquire_waits_at_cap() {
        let pool = MemoryPool::new(100);
        let first = pool.acquire(80).await;

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(50).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let lease = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert_eq!(lease.bytes, 50);
    }

    #[tokio::test]
    async fn test_oversized_request_clamped() {
        let pool = MemoryPool::new(100);
        let lease = pool.acquire(10_000).await;
        assert_eq!(lease.bytes, 100);
    }
}
