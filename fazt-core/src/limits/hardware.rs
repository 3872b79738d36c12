//! Hardware discovery
//!
//! Detection order for memory: cgroup v2 limit (container deployments),
//! then sysinfo (reads /proc/meminfo on Linux, syscalls elsewhere).

use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::{System, SystemExt};

/// Detected hardware, read-only after boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hardware {
    /// Total RAM in bytes
    pub total_ram: u64,
    /// Available RAM at boot in bytes
    pub available_ram: u64,
    /// Logical CPU cores
    pub cpu_cores: usize,
}

impl Hardware {
    /// Detect the machine this process runs on.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        let mut total_ram = sys.total_memory();
        let available_ram = sys.available_memory();

        // A cgroup memory cap below physical RAM is the real budget.
        if let Some(cg) = cgroup_memory_max() {
            if cg < total_ram {
                total_ram = cg;
            }
        }

        let cpu_cores = cgroup_cpu_quota().unwrap_or_else(num_cpus::get).max(1);

        Self {
            total_ram,
            available_ram: available_ram.min(total_ram),
            cpu_cores,
        }
    }
}

/// cgroup v2 memory.max, when bounded.
fn cgroup_memory_max() -> Option<u64> {
    let raw = std::fs::read_to_string("/sys/fs/cgroup/memory.max").ok()?;
    let trimmed = raw.trim();
    if trimmed == "max" {
        return None;
    }
    trimmed.parse().ok()
}

/// cgroup v2 cpu.max quota, rounded up to whole cores.
fn cgroup_cpu_quota() -> Option<usize> {
    let raw = std::fs::read_to_string("/sys/fs/cgroup/cpu.max").ok()?;
    let mut parts = raw.trim().split_whitespace();
    let quota: u64 = parts.next()?.parse().ok()?;
    let period: u64 = parts.next()?.parse().ok()?;
    if period == 0 {
        return None;
    }
    Some(((quota + period - 1) / period).max(1) as usize)
}

/// Whether ffmpeg is reachable on PATH.
pub fn ffmpeg_available() -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        Path::new(&dir).join("ffmpeg").is_file()
            || Path::new(&dir).join("ffmpeg.exe").is_file()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_reports_nonzero() {
        let hw = Hardware::detect();
        assert!(hw.total_ram > 0);
        assert!(hw.cpu_cores >= 1);
        assert!(hw.available_ram <= hw.total_ram);
    }
}
