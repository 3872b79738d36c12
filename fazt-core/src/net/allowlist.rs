//! Egress allowlist
//!
//! Entries are (domain, app|global) with optional per-domain overrides. The
//! full table is small, so it is cached in memory with a 30 s TTL and
//! invalidated on mutation. Wildcards match subdomains only: `*.example.com`
//! matches `api.example.com` but never the bare `example.com`.

use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::db::now_secs;
use crate::error::{Error, Result};

/// Cache TTL.
const CACHE_TTL: Duration = Duration::from_secs(30);

/// An allowlist row. `app_id` empty means global.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AllowlistEntry {
    pub id: i64,
    pub domain: String,
    pub app_id: String,
    pub https_only: bool,
    pub cache_ttl: Option<i64>,
    pub rate_limit: Option<i64>,
    pub rate_burst: Option<i64>,
    pub max_response: Option<i64>,
    pub timeout_ms: Option<i64>,
    pub created_at: i64,
}

/// Canonicalize a host for matching: lowercase, strip trailing dot and port.
pub fn canonical_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    let host = host.strip_suffix('.').unwrap_or(&host);
    // IPv6 literals keep their brackets; everything else drops a :port.
    if host.starts_with('[') {
        host.split(']').next().map(|h| format!("{h}]")).unwrap_or_else(|| host.to_string())
    } else {
        host.split(':').next().unwrap_or(host).to_string()
    }
}

/// Whether a pattern covers a host.
pub fn domain_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        // Wildcards never match the bare domain.
        host.len() > suffix.len() + 1 && host.ends_with(suffix)
            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
    } else {
        pattern == host
    }
}

/// The allowlist with its TTL cache.
pub struct Allowlist {
    pool: SqlitePool,
    cache: Mutex<Option<(Instant, Vec<AllowlistEntry>)>>,
}

impl Allowlist {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, cache: Mutex::new(None) }
    }

    async fn entries(&self) -> Result<Vec<AllowlistEntry>> {
        {
            let cache = self.cache.lock().expect("allowlist lock poisoned");
            if let Some((loaded, entries)) = cache.as_ref() {
                if loaded.elapsed() < CACHE_TTL {
                    return Ok(entries.clone());
                }
            }
        }
        let entries = sqlx::query_as::<_, AllowlistEntry>("SELECT * FROM net_allowlist")
            .fetch_all(&self.pool)
            .await?;
        *self.cache.lock().expect("allowlist lock poisoned") =
            Some((Instant::now(), entries.clone()));
        Ok(entries)
    }

    /// Find the entry permitting `host` for `app_id`, app-scoped rows
    /// winning over global ones. `None` means not allowed.
    pub async fn lookup(&self, app_id: &str, host: &str) -> Result<Option<AllowlistEntry>> {
        let host = canonical_host(host);
        let entries = self.entries().await?;

        let mut global: Option<AllowlistEntry> = None;
        for entry in entries {
            if !domain_matches(&entry.domain, &host) {
                continue;
            }
            if entry.app_id == app_id {
                return Ok(Some(entry));
            }
            if entry.app_id.is_empty() && global.is_none() {
                global = Some(entry);
            }
        }
        Ok(global)
    }

    /// Add an entry; `app_id` of `None` makes it global.
    #[allow(clippy::too_many_arguments)]
    pub async fn add(
        &self,
        domain: &str,
        app_id: Option<&str>,
        https_only: bool,
        cache_ttl: Option<i64>,
        rate_limit: Option<i64>,
        rate_burst: Option<i64>,
        max_response: Option<i64>,
        timeout_ms: Option<i64>,
    ) -> Result<AllowlistEntry> {
        let domain = canonical_host(domain);
        if domain.is_empty() || domain == "*" || domain.starts_with("*.") && domain.len() < 4 {
            return Err(Error::Validation(format!("invalid allowlist domain: {domain}")));
        }
        let inserted = sqlx::query(
            "INSERT INTO net_allowlist \
             (domain, app_id, https_only, cache_ttl, rate_limit, rate_burst, max_response, timeout_ms, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&domain)
        .bind(app_id.unwrap_or(""))
        .bind(https_only)
        .bind(cache_ttl)
        .bind(rate_limit)
        .bind(rate_burst)
        .bind(max_response)
        .bind(timeout_ms)
        .bind(now_secs())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(result) => {
                self.invalidate();
                let id = result.last_insert_rowid();
                Ok(sqlx::query_as::<_, AllowlistEntry>("SELECT * FROM net_allowlist WHERE id = ?")
                    .bind(id)
                    .fetch_one(&self.pool)
                    .await?)
            }
            Err(sqlx::Error::Database(db)) if db.message().contains("UNIQUE") => {
                Err(Error::Conflict(format!("allowlist entry for '{domain}' exists")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove an entry by id.
    pub async fn remove(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM net_allowlist WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.invalidate();
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("allowlist entry {id}")));
        }
        Ok(())
    }

    /// List all entries.
    pub async fn list(&self) -> Result<Vec<AllowlistEntry>> {
        Ok(sqlx::query_as::<_, AllowlistEntry>(
            "SELECT * FROM net_allowlist ORDER BY domain, app_id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Drop the cache (called on every mutation).
    pub fn invalidate(&self) {
        *self.cache.lock().expect("allowlist lock poisoned") = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_canonical_host() {
        assert_eq!(canonical_host("API.Example.COM"), "api.example.com");
        assert_eq!(canonical_host("example.com."), "example.com");
        assert_eq!(canonical_host("example.com:8443"), "example.com");
    }

    #[test]
    fn test_wildcard_semantics() {
        assert!(domain_matches("*.example.com", "api.example.com"));
        assert!(domain_matches("*.example.com", "a.b.example.com"));
        assert!(!domain_matches("*.example.com", "example.com"));
        assert!(!domain_matches("*.example.com", "badexample.com"));
        assert!(domain_matches("example.com", "example.com"));
        assert!(!domain_matches("example.com", "api.example.com"));
    }

    #[tokio::test]
    async fn test_app_entry_beats_global() {
        let db = Database::open_memory().await.unwrap();
        let list = Allowlist::new(db.pool.clone());
        list.add("api.stripe.com", None, true, None, None, None, None, None).await.unwrap();
        list.add("api.stripe.com", Some("app1"), false, None, None, None, Some(1024), None)
            .await
            .unwrap();

        let entry = list.lookup("app1", "api.stripe.com").await.unwrap().unwrap();
        assert_eq!(entry.app_id, "app1");
        assert_eq!(entry.max_response, Some(1024));

        let other = list.lookup("app2", "api.stripe.com").await.unwrap().unwrap();
        assert!(other.app_id.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_miss() {
        let db = Database::open_memory().await.unwrap();
        let list = Allowlist::new(db.pool.clone());
        assert!(list.lookup("app1", "evil.example").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mutation_invalidates_cache() {
        let db = Database::open_memory().await.unwrap();
        let list = Allowlist::new(db.pool.clone());

        // Prime the cache with an empty table.
        assert!(list.lookup("app1", "api.github.com").await.unwrap().is_none());

        let entry = list.add("api.github.com", None, true, None, None, None, None, None)
            .await
            .unwrap();
        assert!(list.lookup("app1", "api.github.com").await.unwrap().is_some());

        list.remove(entry.id).await.unwrap();
        assert!(list.lookup("app1", "api.github.com").await.unwrap().is_none());
    }
}
