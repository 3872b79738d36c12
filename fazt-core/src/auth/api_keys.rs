//! API keys
//!
//! Keys are `fazt_tok_*` secrets shown once at creation; only an Argon2
//! hash is stored. Lookup goes through a short stored prefix so a verify
//! hashes at most a handful of candidates.

use serde::Serialize;
use sqlx::SqlitePool;

use super::PasswordHasher;
use crate::db::now_secs;
use crate::error::{Error, Result};
use crate::ids::{generate, generate_secret, IdKind};

/// Length of the random secret portion.
const SECRET_LEN: usize = 32;

/// Characters of the secret stored in clear for lookup.
const PREFIX_LEN: usize = 17; // "fazt_tok_" + 8

/// An API key row (hash never serialized).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ApiKey {
    pub id: String,
    pub name: Option<String>,
    pub key_prefix: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub app_id: Option<String>,
    pub scope: String,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
}

/// Create a key; returns the row and the plaintext secret (shown once).
pub async fn create_api_key(
    pool: &SqlitePool,
    name: Option<&str>,
    app_id: Option<&str>,
    scope: &str,
) -> Result<(ApiKey, String)> {
    if !matches!(scope, "deploy" | "exec" | "admin") {
        return Err(Error::Validation(format!("unknown key scope: {scope}")));
    }
    let secret = generate_secret(IdKind::ApiKey, SECRET_LEN);
    let prefix = secret[..PREFIX_LEN].to_string();
    let hash = PasswordHasher.hash(&secret)?;
    let id = generate(IdKind::ApiKey);

    sqlx::query(
        "INSERT INTO api_keys (id, name, key_prefix, key_hash, app_id, scope, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(name)
    .bind(&prefix)
    .bind(&hash)
    .bind(app_id)
    .bind(scope)
    .bind(now_secs())
    .execute(pool)
    .await?;

    let key = sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE id = ?")
        .bind(&id)
        .fetch_one(pool)
        .await?;
    Ok((key, secret))
}

/// Verify a presented bearer secret, updating `last_used_at` on success.
pub async fn verify_api_key(pool: &SqlitePool, secret: &str) -> Result<ApiKey> {
    if secret.len() < PREFIX_LEN || !secret.starts_with("fazt_tok_") {
        return Err(Error::Unauthorized("invalid API key".to_string()));
    }
    let prefix = &secret[..PREFIX_LEN];
    let candidates = sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE key_prefix = ?")
        .bind(prefix)
        .fetch_all(pool)
        .await?;

    for key in candidates {
        if PasswordHasher.verify(secret, &key.key_hash)? {
            sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
                .bind(now_secs())
                .bind(&key.id)
                .execute(pool)
                .await?;
            return Ok(key);
        }
    }
    Err(Error::Unauthorized("invalid API key".to_string()))
}

/// List keys, optionally filtered by app.
pub async fn list_api_keys(pool: &SqlitePool, app_id: Option<&str>) -> Result<Vec<ApiKey>> {
    let keys = match app_id {
        Some(app) => {
            sqlx::query_as::<_, ApiKey>(
                "SELECT * FROM api_keys WHERE app_id = ? ORDER BY created_at",
            )
            .bind(app)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys ORDER BY created_at")
                .fetch_all(pool)
                .await?
        }
    };
    Ok(keys)
}

/// Revoke a key.
pub async fn revoke_api_key(pool: &SqlitePool, id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM api_keys WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("api key {id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_create_and_verify() {
        let db = Database::open_memory().await.unwrap();
        let (key, secret) = create_api_key(&db.pool, Some("ci"), None, "deploy").await.unwrap();
        assert!(secret.starts_with("fazt_tok_"));

        let verified = verify_api_key(&db.pool, &secret).await.unwrap();
        assert_eq!(verified.id, key.id);
        assert!(verified.last_used_at.is_none()); // fetched before touch
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let db = Database::open_memory().await.unwrap();
        let (_, secret) = create_api_key(&db.pool, None, None, "deploy").await.unwrap();
        let mut tampered = secret.clone();
        tampered.pop();
        tampered.push('!');
        assert!(verify_api_key(&db.pool, &tampered).await.is_err());
        assert!(verify_api_key(&db.pool, "fazt_tok_totally-made-up-secret").await.is_err());
    }

    #[tokio::test]
    async fn test_revoked_key_fails() {
        let db = Database::open_memory().await.unwrap();
        let (key, secret) = create_api_key(&db.pool, None, None, "exec").await.unwrap();
        revoke_api_key(&db.pool, &key.id).await.unwrap();
        assert!(verify_api_key(&db.pool, &secret).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_scope_rejected() {
        let db = Database::open_memory().await.unwrap();
        assert!(create_api_key(&db.pool, None, None, "everything").await.is_err());
    }
}
