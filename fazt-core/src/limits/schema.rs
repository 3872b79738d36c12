//! Limits schema metadata
//!
//! `GET /api/system/limits` returns values; `GET /api/system/limits/schema`
//! returns this registry. The two stay in parity: every field serialized by
//! [`super::Limits`] has an entry here, keyed by its JSON path.

use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{json, Value};

/// Measurement unit of a limits field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Bytes,
    Milliseconds,
    Seconds,
    Count,
    PerSecond,
    Bool,
}

/// Metadata for one limits field.
#[derive(Debug, Clone, Serialize)]
pub struct FieldSchema {
    /// Dotted JSON path, e.g. `storage.max_vfs`
    pub path: &'static str,
    /// Short human label
    pub label: &'static str,
    /// Longer description
    pub description: &'static str,
    /// Measurement unit
    pub unit: Unit,
    /// Inclusive [min, max] range, when bounded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<[u64; 2]>,
    /// Whether the field is fixed at boot
    pub read_only: bool,
}

macro_rules! field {
    ($path:expr, $label:expr, $desc:expr, $unit:expr, ro) => {
        FieldSchema { path: $path, label: $label, description: $desc, unit: $unit, range: None, read_only: true }
    };
    ($path:expr, $label:expr, $desc:expr, $unit:expr, [$lo:expr, $hi:expr]) => {
        FieldSchema { path: $path, label: $label, description: $desc, unit: $unit, range: Some([$lo, $hi]), read_only: false }
    };
}

/// The full registry, built once.
pub static SCHEMA: Lazy<Vec<FieldSchema>> = Lazy::new(|| {
    use Unit::*;
    vec![
        field!("hardware.total_ram", "Total RAM", "Physical or cgroup-capped memory", Bytes, ro),
        field!("hardware.available_ram", "Available RAM", "Free memory at boot", Bytes, ro),
        field!("hardware.cpu_cores", "CPU cores", "Logical cores visible to the process", Count, ro),
        field!("storage.max_vfs", "VFS cache", "Byte budget for the app file cache", Bytes, [1 << 25, 1 << 30]),
        field!("storage.max_upload", "Upload threshold", "Uploads above this spill to disk", Bytes, [1 << 20, 1 << 27]),
        field!("storage.write_queue", "Write queue", "Pending write batches before backpressure", Count, [16, 65536]),
        field!("storage.max_file_size", "Max file size", "Per-file and per-entry cap", Bytes, [1 << 20, 1 << 30]),
        field!("storage.max_site_size", "Max site size", "Aggregate per-app cap", Bytes, [1 << 20, 10 << 30]),
        field!("storage.max_log_rows", "Log retention", "Activity log row cap", Count, [1000, 10_000_000]),
        field!("runtime.exec_timeout_ms", "Exec timeout", "JS execution window", Milliseconds, [500, 60_000]),
        field!("runtime.max_memory", "Isolate memory", "Per-execution heap cap", Bytes, [1 << 24, 1 << 30]),
        field!("runtime.max_jobs_per_app", "Jobs per app", "Pending scheduler jobs per app", Count, [1, 10_000]),
        field!("runtime.min_job_delay_secs", "Min job delay", "Shortest schedulable delay", Seconds, ro),
        field!("runtime.max_job_delay_secs", "Max job delay", "Longest schedulable delay", Seconds, ro),
        field!("capacity.users", "Users", "Comfortable concurrent users", Count, [1, 100_000]),
        field!("capacity.users_max", "Users ceiling", "Burst concurrent users", Count, [1, 1_000_000]),
        field!("capacity.reads", "Reads", "Sustainable read requests per second", PerSecond, [1, 1_000_000]),
        field!("capacity.writes", "Writes", "Sustainable write requests per second", PerSecond, [1, 100_000]),
        field!("capacity.mixed", "Mixed", "Sustainable mixed requests per second", PerSecond, [1, 1_000_000]),
        field!("capacity.max_requests", "In-flight cap", "Concurrent requests admitted", Count, [1, 100_000]),
        field!("capacity.request_timeout_ms", "Request timeout", "Whole-request lifetime", Milliseconds, [1000, 120_000]),
        field!("net.max_calls", "Calls per exec", "Outbound calls per JS execution", Count, [1, 1000]),
        field!("net.call_timeout_ms", "Call timeout", "Per-call ceiling", Milliseconds, [100, 30_000]),
        field!("net.min_net_time_ms", "Min net time", "Budget slack required to admit a call", Milliseconds, ro),
        field!("net.app_concurrency", "App concurrency", "Concurrent outbound per app", Count, [1, 100]),
        field!("net.concurrency", "Global concurrency", "Concurrent outbound total", Count, [1, 10_000]),
        field!("net.max_request_body", "Request body cap", "Outbound body size cap", Bytes, [1 << 10, 1 << 27]),
        field!("net.max_response", "Response cap", "Response size cap", Bytes, [1 << 10, 1 << 28]),
        field!("net.max_redirects", "Redirect cap", "Redirect hops followed", Count, [0, 10]),
        field!("net.rate_limit", "Rate limit", "Per-domain requests per second; 0 disables", PerSecond, [0, 10_000]),
        field!("net.rate_burst", "Rate burst", "Token bucket burst", Count, [1, 10_000]),
        field!("net.log_buffer_size", "Log buffer", "Buffered net log entries", Count, [16, 100_000]),
        field!("net.log_flush_ms", "Log flush", "Net log flush interval", Milliseconds, [100, 600_000]),
        field!("net.cache_max_items", "Cache items", "Egress cache entry cap", Count, [0, 100_000]),
        field!("net.cache_max_bytes", "Cache bytes", "Egress cache byte cap", Bytes, [0, 1 << 30]),
        field!("video.ffmpeg_available", "ffmpeg", "Whether ffmpeg was found at boot", Bool, ro),
        field!("video.concurrency", "Transcodes", "Concurrent transcodes", Count, [1, 16]),
        field!("video.max_duration_sec", "Max duration", "Input duration cap", Seconds, [1, 86_400]),
        field!("video.max_input_mb", "Max input", "Input size cap in MiB", Count, [1, 100_000]),
        field!("video.output_max_height", "Max height", "Output vertical resolution cap", Count, [144, 4320]),
    ]
});

/// The cached JSON form of the registry.
pub static SCHEMA_JSON: Lazy<Value> = Lazy::new(|| json!({ "fields": &*SCHEMA }));

#[cfg(test)]
mod tests {
    use super::super::{Hardware, Limits};
    use super::*;

    fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
        let mut cur = value;
        for seg in path.split('.') {
            cur = cur.get(seg)?;
        }
        Some(cur)
    }

    #[test]
    fn test_schema_covers_every_value() {
        let limits = Limits::derive(&Hardware {
            total_ram: 2 << 30,
            available_ram: 1 << 30,
            cpu_cores: 2,
        });
        let values = serde_json::to_value(&limits).expect("serialize limits");
        for field in SCHEMA.iter() {
            assert!(
                lookup(&values, field.path).is_some(),
                "schema path {} missing from limits values",
                field.path
            );
        }
    }

    #[test]
    fn test_value_types_match_units() {
        let limits = Limits::derive(&Hardware {
            total_ram: 2 << 30,
            available_ram: 1 << 30,
            cpu_cores: 2,
        });
        let values = serde_json::to_value(&limits).expect("serialize limits");
        for field in SCHEMA.iter() {
            let v = lookup(&values, field.path).unwrap();
            match field.unit {
                Unit::Bool => assert!(v.is_boolean(), "{} not bool", field.path),
                _ => assert!(v.is_number(), "{} not numeric", field.path),
            }
        }
    }

    #[test]
    fn test_no_duplicate_paths() {
        let mut seen = std::collections::HashSet::new();
        for field in SCHEMA.iter() {
            assert!(seen.insert(field.path), "duplicate path {}", field.path);
        }
    }
}
