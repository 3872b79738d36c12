//! System limits and capacity model
//!
//! A single hierarchical [`Limits`] struct is built once per boot from the
//! detected hardware and drives every other subsystem's bounds: cache sizes,
//! isolate pool width, write-queue depth, egress budgets, worker memory.
//! Reconfiguration at runtime requires a restart; all consumers hold an
//! `Arc<Limits>` snapshot taken at initialization.

mod hardware;
pub mod schema;

pub use hardware::Hardware;

use serde::{Deserialize, Serialize};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Top-level limits, discovered at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    /// Detected hardware (read-only)
    pub hardware: Hardware,
    /// Storage bounds
    pub storage: StorageLimits,
    /// JS runtime bounds
    pub runtime: RuntimeLimits,
    /// Request capacity
    pub capacity: CapacityLimits,
    /// Egress bounds
    pub net: NetLimits,
    /// Media transcoding bounds
    pub video: VideoLimits,
}

/// Storage bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageLimits {
    /// VFS cache budget in bytes
    pub max_vfs: u64,
    /// In-memory upload threshold in bytes; larger uploads spill to disk
    pub max_upload: u64,
    /// Write queue depth
    pub write_queue: usize,
    /// Per-file / per-entry size cap in bytes
    pub max_file_size: u64,
    /// Aggregate per-app size cap in bytes
    pub max_site_size: u64,
    /// Activity log retention in rows
    pub max_log_rows: u64,
}

/// JS runtime bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeLimits {
    /// JS execution window in milliseconds
    pub exec_timeout_ms: u64,
    /// Per-execution memory cap in bytes
    pub max_memory: u64,
    /// Pending scheduler jobs per app
    pub max_jobs_per_app: u32,
    /// Minimum schedule delay in seconds
    pub min_job_delay_secs: u64,
    /// Maximum schedule delay in seconds
    pub max_job_delay_secs: u64,
}

impl RuntimeLimits {
    /// JS execution window as a [`Duration`].
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }
}

/// Request capacity, CPU/RAM scaled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityLimits {
    /// Expected comfortable concurrent users
    pub users: u32,
    /// Burst ceiling for concurrent users
    pub users_max: u32,
    /// Sustainable read requests/sec
    pub reads: u32,
    /// Sustainable write requests/sec
    pub writes: u32,
    /// Sustainable mixed requests/sec
    pub mixed: u32,
    /// Concurrent in-flight request cap
    pub max_requests: u32,
    /// Whole-request lifetime in milliseconds
    pub request_timeout_ms: u64,
}

impl CapacityLimits {
    /// Whole-request lifetime as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Egress bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetLimits {
    /// Outbound calls per JS execution
    pub max_calls: u32,
    /// Per-call timeout in milliseconds
    pub call_timeout_ms: u64,
    /// Minimum budget slack required to admit a call, in milliseconds
    pub min_net_time_ms: u64,
    /// Concurrent outbound requests per app
    pub app_concurrency: u32,
    /// Concurrent outbound requests globally
    pub concurrency: u32,
    /// Outbound request body cap in bytes
    pub max_request_body: u64,
    /// Response size cap in bytes
    pub max_response: u64,
    /// Redirect hop cap
    pub max_redirects: u32,
    /// System-wide per-domain requests/sec; 0 disables
    pub rate_limit: u32,
    /// Token bucket burst
    pub rate_burst: u32,
    /// Net log buffer entries before forced flush
    pub log_buffer_size: usize,
    /// Net log flush interval in milliseconds
    pub log_flush_ms: u64,
    /// Egress response cache item cap
    pub cache_max_items: usize,
    /// Egress response cache byte cap
    pub cache_max_bytes: u64,
}

/// Media transcoding bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoLimits {
    /// Whether ffmpeg was found on PATH at boot
    pub ffmpeg_available: bool,
    /// Concurrent transcodes
    pub concurrency: u32,
    /// Input duration cap in seconds
    pub max_duration_sec: u32,
    /// Input size cap in MiB
    pub max_input_mb: u32,
    /// Output vertical resolution cap
    pub output_max_height: u32,
}

impl Limits {
    /// Discover hardware and derive every bound.
    ///
    /// `FAZT_CAP_*` environment variables override individual capacity
    /// fields after derivation (e.g. `FAZT_CAP_MAX_REQUESTS=64`).
    pub fn discover() -> Self {
        let hardware = Hardware::detect();
        let mut limits = Self::derive(&hardware);
        limits.apply_env_overrides();
        limits
    }

    /// Derive all bounds from a hardware description.
    pub fn derive(hardware: &Hardware) -> Self {
        let cores = hardware.cpu_cores.max(1);
        let ram = hardware.total_ram;

        // Memory budget fractions tuned for a small single-tenant box: the
        // platform never claims more than a quarter of RAM for caches.
        let max_vfs = (ram / 8).clamp(32 * MIB, 512 * MIB);
        let max_memory = (ram / 16).clamp(32 * MIB, 256 * MIB);

        let storage = StorageLimits {
            max_vfs,
            max_upload: 8 * MIB,
            write_queue: 256 * cores,
            max_file_size: 25 * MIB,
            max_site_size: 500 * MIB,
            max_log_rows: 100_000,
        };

        let runtime = RuntimeLimits {
            exec_timeout_ms: 5_000,
            max_memory,
            max_jobs_per_app: 100,
            min_job_delay_secs: 10,
            max_job_delay_secs: 30 * 24 * 60 * 60,
        };

        let capacity = CapacityLimits {
            users: (cores as u32) * 25,
            users_max: (cores as u32) * 100,
            reads: (cores as u32) * 400,
            writes: (cores as u32) * 60,
            mixed: (cores as u32) * 150,
            max_requests: (cores as u32) * 16,
            request_timeout_ms: 10_000,
        };

        let net = NetLimits {
            max_calls: 10,
            call_timeout_ms: 3_000,
            min_net_time_ms: 200,
            app_concurrency: 5,
            concurrency: (cores as u32) * 8,
            max_request_body: 5 * MIB,
            max_response: 10 * MIB,
            max_redirects: 3,
            rate_limit: 0,
            rate_burst: 10,
            log_buffer_size: 256,
            log_flush_ms: 5_000,
            cache_max_items: 512,
            cache_max_bytes: 32 * MIB,
        };

        let video = VideoLimits {
            ffmpeg_available: hardware::ffmpeg_available(),
            concurrency: if ram >= 4 * GIB { 2 } else { 1 },
            max_duration_sec: 600,
            max_input_mb: 500,
            output_max_height: 1080,
        };

        Self {
            hardware: hardware.clone(),
            storage,
            runtime,
            capacity,
            net,
            video,
        }
    }

    /// Apply `FAZT_CAP_*` overrides onto the derived capacity values.
    fn apply_env_overrides(&mut self) {
        fn env_u32(name: &str) -> Option<u32> {
            std::env::var(name).ok()?.parse().ok()
        }
        fn env_u64(name: &str) -> Option<u64> {
            std::env::var(name).ok()?.parse().ok()
        }

        if let Some(v) = env_u32("FAZT_CAP_USERS") {
            self.capacity.users = v;
        }
        if let Some(v) = env_u32("FAZT_CAP_USERS_MAX") {
            self.capacity.users_max = v;
        }
        if let Some(v) = env_u32("FAZT_CAP_READS") {
            self.capacity.reads = v;
        }
        if let Some(v) = env_u32("FAZT_CAP_WRITES") {
            self.capacity.writes = v;
        }
        if let Some(v) = env_u32("FAZT_CAP_MIXED") {
            self.capacity.mixed = v;
        }
        if let Some(v) = env_u32("FAZT_CAP_MAX_REQUESTS") {
            self.capacity.max_requests = v;
        }
        if let Some(v) = env_u64("FAZT_CAP_TIMEOUT_MS") {
            self.capacity.request_timeout_ms = v;
        }
    }

    /// Isolate pool width: one isolate per core, floor of two.
    pub fn isolate_pool_size(&self) -> usize {
        (self.hardware.cpu_cores).max(2)
    }

    /// Worker pool global concurrency.
    pub fn worker_concurrency(&self) -> usize {
        (self.hardware.cpu_cores * 2).clamp(4, 32)
    }

    /// Worker memory pool budget in bytes.
    pub fn worker_memory_budget(&self) -> u64 {
        (self.hardware.total_ram / 16).clamp(64 * MIB, 256 * MIB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_hardware(ram_gib: u64, cores: usize) -> Hardware {
        Hardware {
            total_ram: ram_gib * GIB,
            available_ram: ram_gib * GIB / 2,
            cpu_cores: cores,
        }
    }

    #[test]
    fn test_derive_scales_with_cores() {
        let small = Limits::derive(&fake_hardware(1, 1));
        let big = Limits::derive(&fake_hardware(8, 8));
        assert!(big.capacity.max_requests > small.capacity.max_requests);
        assert!(big.net.concurrency > small.net.concurrency);
        assert!(big.storage.write_queue > small.storage.write_queue);
    }

    #[test]
    fn test_vfs_cache_clamped() {
        let tiny = Limits::derive(&fake_hardware(1, 1));
        assert!(tiny.storage.max_vfs >= 32 * MIB);
        let huge = Limits::derive(&fake_hardware(64, 16));
        assert!(huge.storage.max_vfs <= 512 * MIB);
    }

    #[test]
    fn test_exec_inside_request_timeout() {
        let limits = Limits::derive(&fake_hardware(2, 2));
        assert!(limits.runtime.exec_timeout() < limits.capacity.request_timeout());
    }

    #[test]
    fn test_isolate_pool_floor() {
        let limits = Limits::derive(&fake_hardware(1, 1));
        assert_eq!(limits.isolate_pool_size(), 2);
    }

    #[test]
    fn test_job_delay_window() {
        let limits = Limits::derive(&fake_hardware(2, 2));
        assert_eq!(limits.runtime.min_job_delay_secs, 10);
        assert_eq!(limits.runtime.max_job_delay_secs, 30 * 24 * 60 * 60);
    }
}
