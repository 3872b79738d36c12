//! App registry
//!
//! Apps are the unit of deployment. Each owns its VFS files, aliases, env
//! vars, storage rows, and jobs; deleting an app cascades through all of
//! them. System apps are served from memory and protected from deletion.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::{now_secs, with_busy_retry};
use crate::error::{Error, Result};
use crate::ids::{generate, IdKind};

/// Reserved id of the built-in welcome app.
pub const SYSTEM_WELCOME: &str = "fazt_app_system0welcm";
/// Reserved id of the built-in admin UI app.
pub const SYSTEM_ADMIN: &str = "fazt_app_system0admin";

/// An app row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct App {
    pub id: String,
    pub name: String,
    pub source: String,
    pub manifest: Option<String>,
    pub spa_mode: bool,
    pub clean_urls: bool,
    pub dir_listing: bool,
    pub source_commit: Option<String>,
    pub source_ref: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl App {
    /// System apps ship inside the binary and cannot be deleted.
    pub fn is_system(&self) -> bool {
        self.source == "system"
    }
}

/// Fetch by id.
pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<App>> {
    let app = sqlx::query_as::<_, App>("SELECT * FROM apps WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(app)
}

/// Fetch by human name.
pub async fn get_by_name(pool: &SqlitePool, name: &str) -> Result<Option<App>> {
    let app = sqlx::query_as::<_, App>("SELECT * FROM apps WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(app)
}

/// Resolve a hostname through the alias table.
pub async fn get_by_alias(pool: &SqlitePool, domain: &str) -> Result<Option<App>> {
    let app = sqlx::query_as::<_, App>(
        "SELECT a.* FROM apps a JOIN aliases al ON al.app_id = a.id WHERE al.domain = ?",
    )
    .bind(domain)
    .fetch_optional(pool)
    .await?;
    Ok(app)
}

/// List all apps, system first then by name.
pub async fn list(pool: &SqlitePool) -> Result<Vec<App>> {
    let apps = sqlx::query_as::<_, App>(
        "SELECT * FROM apps ORDER BY source = 'system' DESC, name",
    )
    .fetch_all(pool)
    .await?;
    Ok(apps)
}

/// Create an app with a fresh id. Name uniqueness maps to `CONFLICT`.
pub async fn create(pool: &SqlitePool, name: &str, source: &str) -> Result<App> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
        return Err(Error::Validation(format!(
            "app name must be alphanumeric/dashes: {name}"
        )));
    }
    let id = generate(IdKind::App);
    let now = now_secs();
    let inserted = sqlx::query(
        "INSERT INTO apps (id, name, source, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(name)
    .bind(source)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => {}
        Err(sqlx::Error::Database(db)) if db.message().contains("UNIQUE") => {
            return Err(Error::Conflict(format!("app name '{name}' already exists")));
        }
        Err(e) => return Err(e.into()),
    }

    get(pool, &id)
        .await?
        .ok_or_else(|| Error::Internal("app vanished after insert".to_string()))
}

/// Fetch by name, creating a personal app when absent.
pub async fn ensure(pool: &SqlitePool, name: &str) -> Result<App> {
    if let Some(app) = get_by_name(pool, name).await? {
        return Ok(app);
    }
    create(pool, name, "personal").await
}

/// Delete an app and everything it owns. System apps are refused.
pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
    let app = get(pool, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("app {id}")))?;
    if app.is_system() {
        return Err(Error::Forbidden("system apps cannot be deleted".to_string()));
    }

    let id = id.to_string();
    with_busy_retry(|| {
        let pool = pool.clone();
        let id = id.clone();
        async move {
            let mut tx = pool.begin().await?;
            // Tables without FK cascade clean up explicitly.
            for table in ["storage_kv", "storage_docs", "storage_blobs", "jobs", "worker_jobs"] {
                sqlx::query(&format!("DELETE FROM {table} WHERE app_id = ?"))
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
            }
            sqlx::query("DELETE FROM net_allowlist WHERE app_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM net_secrets WHERE app_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM apps WHERE id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await
        }
    })
    .await?;
    Ok(())
}

/// Update deploy-controlled flags from a parsed manifest.
pub async fn apply_manifest(pool: &SqlitePool, id: &str, manifest: &serde_json::Value) -> Result<()> {
    let spa = manifest.get("spa_mode").and_then(|v| v.as_bool()).unwrap_or(false);
    let clean = manifest.get("clean_urls").and_then(|v| v.as_bool()).unwrap_or(false);
    let listing = manifest.get("dir_listing").and_then(|v| v.as_bool()).unwrap_or(false);
    sqlx::query(
        "UPDATE apps SET manifest = ?, spa_mode = ?, clean_urls = ?, dir_listing = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(serde_json::to_string(manifest).map_err(|e| Error::Internal(e.to_string()))?)
    .bind(spa)
    .bind(clean)
    .bind(listing)
    .bind(now_secs())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

// ============================================================================
// Aliases
// ============================================================================

/// An alias row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Alias {
    pub domain: String,
    pub app_id: String,
    pub is_primary: bool,
}

/// List aliases for an app.
pub async fn list_aliases(pool: &SqlitePool, app_id: &str) -> Result<Vec<Alias>> {
    let rows = sqlx::query_as::<_, Alias>(
        "SELECT domain, app_id, is_primary FROM aliases WHERE app_id = ? ORDER BY domain",
    )
    .bind(app_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Bind a domain to an app. Domains are globally unique; at most one
/// primary per app (demoting the old primary when needed).
pub async fn add_alias(pool: &SqlitePool, app_id: &str, domain: &str, primary: bool) -> Result<()> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() || !domain.contains('.') && domain != "localhost" {
        return Err(Error::Validation(format!("invalid domain: {domain}")));
    }

    let mut tx = pool.begin().await?;
    if primary {
        sqlx::query("UPDATE aliases SET is_primary = 0 WHERE app_id = ?")
            .bind(app_id)
            .execute(&mut *tx)
            .await?;
    }
    let inserted = sqlx::query(
        "INSERT INTO aliases (domain, app_id, is_primary) VALUES (?, ?, ?)",
    )
    .bind(&domain)
    .bind(app_id)
    .bind(primary)
    .execute(&mut *tx)
    .await;
    match inserted {
        Ok(_) => {}
        Err(sqlx::Error::Database(db)) if db.message().contains("UNIQUE") => {
            return Err(Error::Conflict(format!("domain '{domain}' is already bound")));
        }
        Err(e) => return Err(e.into()),
    }
    tx.commit().await?;
    Ok(())
}

/// Unbind a domain.
pub async fn remove_alias(pool: &SqlitePool, app_id: &str, domain: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM aliases WHERE app_id = ? AND domain = ?")
        .bind(app_id)
        .bind(domain)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("alias {domain}")));
    }
    Ok(())
}

// ============================================================================
// Env vars
// ============================================================================

/// List env vars for an app.
pub async fn list_env(pool: &SqlitePool, app_id: &str) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT name, value FROM env_vars WHERE app_id = ? ORDER BY name")
            .bind(app_id)
            .fetch_all(pool)
            .await?;
    Ok(rows)
}

/// Read one env var.
pub async fn get_env(pool: &SqlitePool, app_id: &str, name: &str) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT value FROM env_vars WHERE app_id = ? AND name = ?")
            .bind(app_id)
            .bind(name)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(v,)| v))
}

/// Upsert one env var.
pub async fn set_env(pool: &SqlitePool, app_id: &str, name: &str, value: &str) -> Result<()> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(Error::Validation(format!("invalid env var name: {name}")));
    }
    sqlx::query(
        "INSERT INTO env_vars (app_id, name, value) VALUES (?, ?, ?) \
         ON CONFLICT (app_id, name) DO UPDATE SET value = excluded.value",
    )
    .bind(app_id)
    .bind(name)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// Remove one env var.
pub async fn delete_env(pool: &SqlitePool, app_id: &str, name: &str) -> Result<()> {
    sqlx::query("DELETE FROM env_vars WHERE app_id = ? AND name = ?")
        .bind(app_id)
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_create_and_lookup() {
        let db = Database::open_memory().await.unwrap();
        let app = create(&db.pool, "blog", "personal").await.unwrap();
        assert!(app.id.starts_with("fazt_app_"));
        assert_eq!(get_by_name(&db.pool, "blog").await.unwrap().unwrap().id, app.id);
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let db = Database::open_memory().await.unwrap();
        create(&db.pool, "blog", "personal").await.unwrap();
        let err = create(&db.pool, "blog", "personal").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let db = Database::open_memory().await.unwrap();
        assert!(create(&db.pool, "has space", "personal").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_cascades_storage() {
        let db = Database::open_memory().await.unwrap();
        let app = create(&db.pool, "blog", "personal").await.unwrap();
        sqlx::query(
            "INSERT INTO storage_kv (app_id, user_id, key, value, created_at, updated_at) \
             VALUES (?, '', 'k', '1', 0, 0)",
        )
        .bind(&app.id)
        .execute(&db.pool)
        .await
        .unwrap();

        delete(&db.pool, &app.id).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM storage_kv")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_system_app_protected() {
        let db = Database::open_memory().await.unwrap();
        let app = create(&db.pool, "welcome", "system").await.unwrap();
        let err = delete(&db.pool, &app.id).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn test_alias_resolution_and_primary() {
        let db = Database::open_memory().await.unwrap();
        let app = create(&db.pool, "blog", "personal").await.unwrap();
        add_alias(&db.pool, &app.id, "blog.example.dev", true).await.unwrap();
        add_alias(&db.pool, &app.id, "www.blog.example.dev", true).await.unwrap();

        let resolved = get_by_alias(&db.pool, "blog.example.dev").await.unwrap().unwrap();
        assert_eq!(resolved.id, app.id);

        // Second primary demoted the first.
        let aliases = list_aliases(&db.pool, &app.id).await.unwrap();
        let primaries: Vec<_> = aliases.iter().filter(|a| a.is_primary).collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].domain, "www.blog.example.dev");
    }

    #[tokio::test]
    async fn test_domain_unique_across_apps() {
        let db = Database::open_memory().await.unwrap();
        let a = create(&db.pool, "a", "personal").await.unwrap();
        let b = create(&db.pool, "b", "personal").await.unwrap();
        add_alias(&db.pool, &a.id, "x.example.dev", false).await.unwrap();
        let err = add_alias(&db.pool, &b.id, "x.example.dev", false).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_env_round_trip() {
        let db = Database::open_memory().await.unwrap();
        let app = create(&db.pool, "blog", "personal").await.unwrap();
        set_env(&db.pool, &app.id, "API_URL", "https://x").await.unwrap();
        assert_eq!(
            get_env(&db.pool, &app.id, "API_URL").await.unwrap(),
            Some("https://x".to_string())
        );
        delete_env(&db.pool, &app.id, "API_URL").await.unwrap();
        assert_eq!(get_env(&db.pool, &app.id, "API_URL").await.unwrap(), None);
    }
}
