//! Egress secrets
//!
//! Named credentials injected server-side into outbound requests. Values
//! never cross into JS: handlers reference a secret by name
//! (`fetch(url, {auth: "STRIPE_KEY"})`) and the proxy injects it according
//! to `inject_as`. Lookup prefers an app-scoped row, then global; a
//! `domain` column restricts where a secret may be sent.

use serde::Serialize;
use sqlx::SqlitePool;

use super::allowlist::domain_matches;
use crate::db::now_secs;
use crate::error::{Error, NetError, Result};

/// How a secret enters the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectAs {
    Bearer,
    Header,
    Query,
}

impl InjectAs {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "bearer" => Ok(Self::Bearer),
            "header" => Ok(Self::Header),
            "query" => Ok(Self::Query),
            other => Err(Error::Validation(format!("unknown inject mode: {other}"))),
        }
    }
}

/// A secret row, value included (internal use only).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Secret {
    pub id: i64,
    pub app_id: String,
    pub name: String,
    pub value: String,
    pub inject_as: String,
    pub inject_key: Option<String>,
    pub domain: Option<String>,
    pub created_at: i64,
}

/// Listing shape: never carries the value.
#[derive(Debug, Clone, Serialize)]
pub struct SecretInfo {
    pub id: i64,
    pub app_id: String,
    pub name: String,
    pub inject_as: String,
    pub inject_key: Option<String>,
    pub domain: Option<String>,
    pub created_at: i64,
}

impl From<Secret> for SecretInfo {
    fn from(s: Secret) -> Self {
        Self {
            id: s.id,
            app_id: s.app_id,
            name: s.name,
            inject_as: s.inject_as,
            inject_key: s.inject_key,
            domain: s.domain,
            created_at: s.created_at,
        }
    }
}

/// Store (upsert) a secret.
pub async fn set_secret(
    pool: &SqlitePool,
    app_id: Option<&str>,
    name: &str,
    value: &str,
    inject_as: &str,
    inject_key: Option<&str>,
    domain: Option<&str>,
) -> Result<()> {
    InjectAs::parse(inject_as)?;
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(Error::Validation(format!("invalid secret name: {name}")));
    }
    sqlx::query(
        "INSERT INTO net_secrets (app_id, name, value, inject_as, inject_key, domain, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (app_id, name) DO UPDATE SET \
           value = excluded.value, inject_as = excluded.inject_as, \
           inject_key = excluded.inject_key, domain = excluded.domain",
    )
    .bind(app_id.unwrap_or(""))
    .bind(name)
    .bind(value)
    .bind(inject_as)
    .bind(inject_key)
    .bind(domain)
    .bind(now_secs())
    .execute(pool)
    .await?;
    Ok(())
}

/// List secrets without values.
pub async fn list_secrets(pool: &SqlitePool) -> Result<Vec<SecretInfo>> {
    let rows = sqlx::query_as::<_, Secret>("SELECT * FROM net_secrets ORDER BY app_id, name")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(SecretInfo::from).collect())
}

/// Remove a secret.
pub async fn remove_secret(pool: &SqlitePool, app_id: Option<&str>, name: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM net_secrets WHERE app_id = ? AND name = ?")
        .bind(app_id.unwrap_or(""))
        .bind(name)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("secret {name}")));
    }
    Ok(())
}

/// Resolve a secret for a fetch: app-scoped first, then global; the
/// optional domain restriction must cover the target host.
pub async fn resolve_secret(
    pool: &SqlitePool,
    app_id: &str,
    name: &str,
    host: &str,
) -> Result<(String, InjectAs, Option<String>)> {
    let rows = sqlx::query_as::<_, Secret>(
        "SELECT * FROM net_secrets WHERE name = ? AND app_id IN (?, '') \
         ORDER BY app_id DESC",
    )
    .bind(name)
    .bind(app_id)
    .fetch_all(pool)
    .await?;

    for secret in rows {
        if let Some(restriction) = &secret.domain {
            if !domain_matches(restriction, host) && restriction != host {
                continue;
            }
        }
        let mode = InjectAs::parse(&secret.inject_as)?;
        return Ok((secret.value, mode, secret.inject_key));
    }
    Err(NetError::auth(format!("no secret named '{name}' for this app and domain")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_app_scope_beats_global() {
        let db = Database::open_memory().await.unwrap();
        set_secret(&db.pool, None, "KEY", "global-value", "bearer", None, None).await.unwrap();
        set_secret(&db.pool, Some("app1"), "KEY", "app-value", "bearer", None, None)
            .await
            .unwrap();

        let (value, _, _) = resolve_secret(&db.pool, "app1", "KEY", "api.x.com").await.unwrap();
        assert_eq!(value, "app-value");

        let (value, _, _) = resolve_secret(&db.pool, "app2", "KEY", "api.x.com").await.unwrap();
        assert_eq!(value, "global-value");
    }

    #[tokio::test]
    async fn test_domain_restriction() {
        let db = Database::open_memory().await.unwrap();
        set_secret(&db.pool, None, "STRIPE", "sk-123", "bearer", None, Some("api.stripe.com"))
            .await
            .unwrap();

        assert!(resolve_secret(&db.pool, "app1", "STRIPE", "api.stripe.com").await.is_ok());
        let err = resolve_secret(&db.pool, "app1", "STRIPE", "evil.example").await.unwrap_err();
        match err {
            Error::Net(net) => assert_eq!(net.code, "NET_AUTH"),
            other => panic!("expected NET_AUTH, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_secret_is_net_auth() {
        let db = Database::open_memory().await.unwrap();
        let err = resolve_secret(&db.pool, "app1", "NOPE", "x.com").await.unwrap_err();
        match err {
            Error::Net(net) => {
                assert_eq!(net.code, "NET_AUTH");
                assert!(!net.retryable);
            }
            other => panic!("expected NET_AUTH, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_listing_hides_values() {
        let db = Database::open_memory().await.unwrap();
        set_secret(&db.pool, None, "KEY", "sensitive", "header", Some("X-Key"), None)
            .await
            .unwrap();
        let listed = list_secrets(&db.pool).await.unwrap();
        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains("sensitive"));
    }
}
