//! Pinned system apps
//!
//! The admin UI shell and the welcome app ship inside the binary and are
//! loaded once at boot into a non-evictable map. Reads never touch the
//! database or the LRU cache.

use std::collections::HashMap;
use std::sync::Arc;

use super::cache::CachedFile;
use crate::apps::{SYSTEM_ADMIN, SYSTEM_WELCOME};

const WELCOME_INDEX: &[u8] = include_bytes!("../../assets/welcome/index.html");
const ADMIN_INDEX: &[u8] = include_bytes!("../../assets/admin/index.html");

/// Immutable (app_id, path) → file map built at boot.
pub struct Pinned {
    files: HashMap<(String, String), CachedFile>,
}

impl Pinned {
    /// Load the embedded system apps.
    #[must_use]
    pub fn load() -> Self {
        let mut files = HashMap::new();
        files.insert(
            (SYSTEM_WELCOME.to_string(), "index.html".to_string()),
            CachedFile {
                bytes: Arc::new(WELCOME_INDEX.to_vec()),
                mime_type: "text/html; charset=utf-8".to_string(),
            },
        );
        files.insert(
            (SYSTEM_ADMIN.to_string(), "index.html".to_string()),
            CachedFile {
                bytes: Arc::new(ADMIN_INDEX.to_vec()),
                mime_type: "text/html; charset=utf-8".to_string(),
            },
        );
        Self { files }
    }

    /// Look up a pinned file.
    #[must_use]
    pub fn get(&self, app_id: &str, path: &str) -> Option<CachedFile> {
        self.files.get(&(app_id.to_string(), path.to_string())).cloned()
    }

    /// Whether the app id names a pinned app.
    #[must_use]
    pub fn is_pinned_app(&self, app_id: &str) -> bool {
        app_id == SYSTEM_WELCOME || app_id == SYSTEM_ADMIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pinned_lookup() {
        let pinned = Pinned::load();
        assert!(pinned.get(SYSTEM_WELCOME, "index.html").is_some());
        assert!(pinned.get(SYSTEM_ADMIN, "index.html").is_some());
        assert!(pinned.get(SYSTEM_WELCOME, "missing.js").is_none());
        assert!(pinned.is_pinned_app(SYSTEM_ADMIN));
        assert!(!pinned.is_pinned_app("fazt_app_other0000000"));
    }
}
