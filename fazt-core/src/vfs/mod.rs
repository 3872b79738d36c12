//! Virtual filesystem
//!
//! Content storage keyed by (app_id, path), written only by deploy and read
//! by everything else. Read path: byte-LRU cache → pinned system apps → DB.
//! Deploy replaces an app's whole file set in one transaction, so a reader
//! sees either the old set or the new one, never a mix.

mod cache;
pub mod deploy;
mod pinned;

pub use cache::CachedFile;
pub use deploy::{DeploySummary, FileUpload};

use std::sync::Arc;

use cache::ByteCache;
use pinned::Pinned;

use crate::apps::App;
use crate::error::{Error, Result};
use crate::limits::Limits;

/// The VFS handle shared across subsystems.
pub struct Vfs {
    pool: sqlx::SqlitePool,
    cache: std::sync::Mutex<ByteCache>,
    pinned: Pinned,
    limits: Arc<Limits>,
}

/// How a static request resolves.
#[derive(Debug)]
pub enum Resolved {
    /// Serve these bytes
    File(CachedFile),
    /// Path is under `private/`; the static pipeline must not serve it
    Private,
    /// Path is under `api/`; hand off to the runtime
    Api,
    /// Nothing matched
    NotFound,
}

impl Vfs {
    pub fn new(pool: sqlx::SqlitePool, limits: Arc<Limits>) -> Self {
        Self {
            pool,
            cache: std::sync::Mutex::new(ByteCache::new(limits.storage.max_vfs)),
            pinned: Pinned::load(),
            limits,
        }
    }

    pub(crate) fn limits(&self) -> &Limits {
        &self.limits
    }

    pub(crate) fn pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }

    /// Read one file by exact path.
    pub async fn read(&self, app_id: &str, path: &str) -> Result<Option<CachedFile>> {
        if let Some(file) = self.pinned.get(app_id, path) {
            return Ok(Some(file));
        }
        if let Some(file) = self.cache.lock().expect("vfs cache poisoned").get(app_id, path) {
            return Ok(Some(file));
        }

        let row: Option<(Vec<u8>, String)> = sqlx::query_as(
            "SELECT content, mime_type FROM files WHERE app_id = ? AND path = ?",
        )
        .bind(app_id)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        let Some((content, mime_type)) = row else {
            return Ok(None);
        };
        let file = CachedFile { bytes: Arc::new(content), mime_type };
        self.cache
            .lock()
            .expect("vfs cache poisoned")
            .insert(app_id, path, file.clone());
        Ok(Some(file))
    }

    /// List an app's file paths with sizes.
    pub async fn list(&self, app_id: &str) -> Result<Vec<(String, u64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT path, size FROM files WHERE app_id = ? ORDER BY path")
                .bind(app_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(p, s)| (p, s as u64)).collect())
    }

    /// Resolve a static `GET` against an app, applying the serving rules.
    ///
    /// `private/*` is never served here; `api/*` belongs to the runtime.
    /// Otherwise: exact path, then `path/index.html`, then (`clean_urls`)
    /// `path.html`, then (`spa_mode`) root `index.html` for extensionless
    /// paths.
    pub async fn resolve_static(&self, app: &App, raw_path: &str) -> Result<Resolved> {
        let path = raw_path.trim_start_matches('/');
        if path.starts_with("private/") || path == "private" {
            return Ok(Resolved::Private);
        }
        if path.starts_with("api/") || path == "api" {
            return Ok(Resolved::Api);
        }

        let candidate = if path.is_empty() { "index.html" } else { path };
        if let Some(file) = self.read(&app.id, candidate).await? {
            return Ok(Resolved::File(file));
        }

        if !path.is_empty() {
            let index = format!("{}/index.html", path.trim_end_matches('/'));
            if let Some(file) = self.read(&app.id, &index).await? {
                return Ok(Resolved::File(file));
            }

            if app.clean_urls {
                let html = format!("{path}.html");
                if let Some(file) = self.read(&app.id, &html).await? {
                    return Ok(Resolved::File(file));
                }
            }
        }

        // SPA fallback only for extensionless paths: a final segment with a
        // dot is a missing asset, not a client route.
        let last = path.rsplit('/').next().unwrap_or("");
        if app.spa_mode && !last.contains('.') {
            if let Some(file) = self.read(&app.id, "index.html").await? {
                return Ok(Resolved::File(file));
            }
        }

        Ok(Resolved::NotFound)
    }

    /// Drop cached entries for an app after deploy or delete.
    pub fn invalidate(&self, app_id: &str) {
        self.cache.lock().expect("vfs cache poisoned").invalidate_app(app_id);
    }

    /// Cache usage in bytes (health endpoint).
    pub fn cache_bytes(&self) -> u64 {
        self.cache.lock().expect("vfs cache poisoned").total_bytes()
    }

    /// Replace the app's file rows; used by deploy within its transaction
    /// handling. Exposed via [`deploy`].
    pub(crate) async fn replace_files(
        &self,
        app_id: &str,
        files: &[deploy::StoredFile],
    ) -> std::result::Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM files WHERE app_id = ?")
            .bind(app_id)
            .execute(&mut *tx)
            .await?;
        for file in files {
            sqlx::query(
                "INSERT INTO files (app_id, path, content, mime_type, size) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(app_id)
            .bind(&file.path)
            .bind(file.content.as_slice())
            .bind(&file.mime_type)
            .bind(file.content.len() as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    /// Validate that an error-free read path exists for private file
    /// access from the runtime: sanitized, `private/`-prefixed.
    pub async fn read_private(&self, app_id: &str, rel: &str) -> Result<Option<CachedFile>> {
        if rel.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return Err(Error::BadRequest(format!("invalid private path: {rel}")));
        }
        self.read(app_id, &format!("private/{rel}")).await
    }

    /// List private file paths, relative to `private/`.
    pub async fn list_private(&self, app_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT path FROM files WHERE app_id = ? AND path LIKE 'private/%' ORDER BY path",
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(p,)| p.trim_start_matches("private/").to_string())
            .collect())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{seed_file, vfs};
    use super::*;
    use crate::apps;

    async fn test_app(db: &crate::db::Database, spa: bool, clean: bool) -> App {
        let app = apps::create(&db.pool, "site", "personal").await.unwrap();
        sqlx::query("UPDATE apps SET spa_mode = ?, clean_urls = ? WHERE id = ?")
            .bind(spa)
            .bind(clean)
            .bind(&app.id)
            .execute(&db.pool)
            .await
            .unwrap();
        apps::get(&db.pool, &app.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_read_caches() {
        let (db, vfs) = vfs().await;
        seed_file(&db, "app1", "a.txt", b"hello").await;

        let first = vfs.read("app1", "a.txt").await.unwrap().unwrap();
        assert_eq!(&*first.bytes, b"hello");
        assert!(vfs.cache_bytes() > 0);

        // Remove the row; the cache still serves it.
        sqlx::query("DELETE FROM files").execute(&db.pool).await.unwrap();
        assert!(vfs.read("app1", "a.txt").await.unwrap().is_some());

        vfs.invalidate("app1");
        assert!(vfs.read("app1", "a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_exact_then_index() {
        let (db, vfs) = vfs().await;
        let app = test_app(&db, false, false).await;
        seed_file(&db, &app.id, "index.html", b"<root>").await;
        seed_file(&db, &app.id, "docs/index.html", b"<docs>").await;

        match vfs.resolve_static(&app, "/").await.unwrap() {
            Resolved::File(f) => assert_eq!(&*f.bytes, b"<root>"),
            other => panic!("expected file, got {other:?}"),
        }
        match vfs.resolve_static(&app, "/docs").await.unwrap() {
            Resolved::File(f) => assert_eq!(&*f.bytes, b"<docs>"),
            other => panic!("expected file, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_private_and_api() {
        let (db, vfs) = vfs().await;
        let app = test_app(&db, false, false).await;
        seed_file(&db, &app.id, "private/s.json", b"{}").await;

        assert!(matches!(vfs.resolve_static(&app, "/private/s.json").await.unwrap(), Resolved::Private));
        assert!(matches!(vfs.resolve_static(&app, "/api/ping").await.unwrap(), Resolved::Api));
    }

    #[tokio::test]
    async fn test_clean_urls() {
        let (db, vfs) = vfs().await;
        let app = test_app(&db, false, true).await;
        seed_file(&db, &app.id, "about.html", b"<about>").await;

        match vfs.resolve_static(&app, "/about").await.unwrap() {
            Resolved::File(f) => assert_eq!(&*f.bytes, b"<about>"),
            other => panic!("expected file, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spa_fallback_extensionless_only() {
        let (db, vfs) = vfs().await;
        let app = test_app(&db, true, false).await;
        seed_file(&db, &app.id, "index.html", b"<spa>").await;

        match vfs.resolve_static(&app, "/some/client/route").await.unwrap() {
            Resolved::File(f) => assert_eq!(&*f.bytes, b"<spa>"),
            other => panic!("expected file, got {other:?}"),
        }
        // Dotted final segment is a missing asset.
        assert!(matches!(
            vfs.resolve_static(&app, "/missing/app.js").await.unwrap(),
            Resolved::NotFound
        ));
    }

    #[tokio::test]
    async fn test_private_read_sanitizes() {
        let (db, vfs) = vfs().await;
        seed_file(&db, "app1", "private/config.json", b"{\"k\":1}").await;

        assert!(vfs.read_private("app1", "config.json").await.unwrap().is_some());
        assert!(vfs.read_private("app1", "../index.html").await.is_err());
    }

    #[tokio::test]
    async fn test_list_private_strips_prefix() {
        let (db, vfs) = vfs().await;
        seed_file(&db, "app1", "private/a.json", b"{}").await;
        seed_file(&db, "app1", "index.html", b"x").await;
        let listed = vfs.list_private("app1").await.unwrap();
        assert_eq!(listed, vec!["a.json"]);
    }
}
