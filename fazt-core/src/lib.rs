//! fazt-core
//!
//! A single-binary, single-SQLite personal application platform. Apps are
//! mixes of static assets and server-side JS handlers hosted on subdomains
//! of one root domain, all backed by one embedded database that also holds
//! configuration, analytics, sessions, secrets, scheduled jobs, and a
//! virtual filesystem for app content.
//!
//! Subsystems:
//! - [`vfs`] — content storage with a byte-weighted LRU cache and pinned
//!   system assets
//! - [`runtime`] — the sandboxed JS isolate pool and the `fazt.*` bridge
//! - [`storage`] — KV / document / blob stores with structural user
//!   isolation and a single writer queue
//! - [`scheduler`] — hibernate jobs and the worker pool with daemons
//! - [`net`] — the SSRF-safe egress proxy
//! - [`http`] — host routing, auth middleware, response envelope
//! - [`limits`] — the hardware-derived capacity model everything reads

pub mod activity;
pub mod apps;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod ids;
pub mod limits;
pub mod net;
pub mod peers;
pub mod realtime;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod storage;
pub mod vfs;

pub use config::BootConfig;
pub use error::{Error, ErrorKind, Result};
pub use state::{AppState, SharedState};

/// Initialize tracing from `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
