//! Command implementations

pub mod app;
pub mod net;
pub mod peer;
pub mod secret;
pub mod server;
pub mod sql;

use crate::output::Format;

/// Shared command context.
pub struct Ctx {
    pub db: Option<std::path::PathBuf>,
    pub format: Format,
}
