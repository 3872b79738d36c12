//! Runtime configuration store
//!
//! Key/JSON-value rows in the `configurations` table. Keys are namespaced:
//! `peers.*`, `instance.*`, `auth.*`, `https.*`, `ntfy.*`, `app.<name>.*`.

use serde_json::Value;
use sqlx::SqlitePool;

use super::now_secs;
use crate::error::{Error, Result};

const NAMESPACES: &[&str] = &["peers", "instance", "auth", "https", "ntfy", "app"];

/// Check a configuration key against the allowed namespaces.
pub fn validate_key(key: &str) -> Result<()> {
    let ns = key.split('.').next().unwrap_or("");
    if key.len() < 3 || !key.contains('.') || !NAMESPACES.contains(&ns) {
        return Err(Error::Validation(format!("invalid configuration key: {key}")));
    }
    Ok(())
}

/// Fetch one value.
pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<Value>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT value FROM configurations WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
    match row {
        Some((raw,)) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Upsert one value.
pub async fn set(pool: &SqlitePool, key: &str, value: &Value) -> Result<()> {
    validate_key(key)?;
    sqlx::query(
        "INSERT INTO configurations (key, value, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(serde_json::to_string(value).map_err(|e| Error::Internal(e.to_string()))?)
    .bind(now_secs())
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete one value.
pub async fn delete(pool: &SqlitePool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM configurations WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

/// List all keys under a prefix with their values.
pub async fn list(pool: &SqlitePool, prefix: &str) -> Result<Vec<(String, Value)>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT key, value FROM configurations WHERE key LIKE ? || '%' ORDER BY key",
    )
    .bind(prefix)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|(k, v)| Ok((k, serde_json::from_str(&v)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;

    #[test]
    fn test_key_validation() {
        assert!(validate_key("instance.name").is_ok());
        assert!(validate_key("app.blog.theme").is_ok());
        assert!(validate_key("bogus.name").is_err());
        assert!(validate_key("instance").is_err());
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let db = Database::open_memory().await.unwrap();
        set(&db.pool, "instance.name", &json!("home")).await.unwrap();
        let v = get(&db.pool, "instance.name").await.unwrap();
        assert_eq!(v, Some(json!("home")));
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let db = Database::open_memory().await.unwrap();
        set(&db.pool, "ntfy.topic", &json!("alerts")).await.unwrap();
        set(&db.pool, "ntfy.url", &json!("https://ntfy.sh")).await.unwrap();
        set(&db.pool, "instance.name", &json!("home")).await.unwrap();

        let rows = list(&db.pool, "ntfy.").await.unwrap();
        assert_eq!(rows.len(), 2);
    }
}
