//! Peer records
//!
//! A peer is a remote fazt instance the local CLI can target with
//! `@name`. Records carry the base URL and an API token; at most one peer
//! is the default (partial unique index).

use serde::Serialize;
use sqlx::SqlitePool;

use crate::db::now_secs;
use crate::error::{Error, Result};

/// A peer row (token never serialized).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Peer {
    pub name: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub node_id: Option<String>,
    pub public_key: Option<String>,
    pub is_default: bool,
    pub last_seen: Option<i64>,
    pub last_status: Option<String>,
}

/// Add a peer.
pub async fn add(pool: &SqlitePool, name: &str, url: &str, token: &str) -> Result<Peer> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
        return Err(Error::Validation(format!("invalid peer name: {name}")));
    }
    let url = url.trim_end_matches('/');
    let inserted = sqlx::query("INSERT INTO peers (name, url, token) VALUES (?, ?, ?)")
        .bind(name)
        .bind(url)
        .bind(token)
        .execute(pool)
        .await;
    match inserted {
        Ok(_) => {}
        Err(sqlx::Error::Database(db)) if db.message().contains("UNIQUE") => {
            return Err(Error::Conflict(format!("peer '{name}' exists")));
        }
        Err(e) => return Err(e.into()),
    }
    get(pool, name)
        .await?
        .ok_or_else(|| Error::Internal("peer vanished after insert".to_string()))
}

/// Fetch one peer.
pub async fn get(pool: &SqlitePool, name: &str) -> Result<Option<Peer>> {
    Ok(sqlx::query_as::<_, Peer>("SELECT * FROM peers WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?)
}

/// List all peers.
pub async fn list(pool: &SqlitePool) -> Result<Vec<Peer>> {
    Ok(sqlx::query_as::<_, Peer>("SELECT * FROM peers ORDER BY name")
        .fetch_all(pool)
        .await?)
}

/// Remove a peer.
pub async fn remove(pool: &SqlitePool, name: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM peers WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("peer {name}")));
    }
    Ok(())
}

/// Make `name` the sole default.
pub async fn set_default(pool: &SqlitePool, name: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE peers SET is_default = 0 WHERE is_default = 1")
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("UPDATE peers SET is_default = 1 WHERE name = ?")
        .bind(name)
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("peer {name}")));
    }
    tx.commit().await?;
    Ok(())
}

/// The default peer, if any.
pub async fn default_peer(pool: &SqlitePool) -> Result<Option<Peer>> {
    Ok(sqlx::query_as::<_, Peer>("SELECT * FROM peers WHERE is_default = 1")
        .fetch_optional(pool)
        .await?)
}

/// Record the outcome of contacting a peer.
pub async fn record_status(pool: &SqlitePool, name: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE peers SET last_seen = ?, last_status = ? WHERE name = ?")
        .bind(now_secs())
        .bind(status)
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
    async fn test_add_list_remove() {
        let db = Database::open_memory().await.unwrap();
        add(&db.pool, "home", "https://fazt.example/", "fazt_tok_x").await.unwrap();
        let peers = list(&db.pool).await.unwrap();
        assert_eq!(peers.len(), 1);
        // Trailing slash trimmed.
        assert_eq!(peers[0].url, "https://fazt.example");
        remove(&db.pool, "home").await.unwrap();
        assert!(list(&db.pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_default() {
        let db = Database::open_memory().await.unwrap();
        add(&db.pool, "a", "https://a.example", "t").await.unwrap();
        add(&db.pool, "b", "https://b.example", "t").await.unwrap();

        set_default(&db.pool, "a").await.unwrap();
        set_default(&db.pool, "b").await.unwrap();

        let default = default_peer(&db.pool).await.unwrap().unwrap();
        assert_eq!(default.name, "b");
        let defaults: Vec<_> = list(&db.pool).await.unwrap().into_iter().filter(|p| p.is_default).collect();
        assert_eq!(defaults.len(), 1);
    }

    #[tokio::test]
    async fn test_token_not_serialized() {
        let db = Database::open_memory().await.unwrap();
        let peer = add(&db.pool, "home", "https://x.example", "super-secret").await.unwrap();
        let json = serde_json::to_string(&peer).unwrap();
        assert!(!json.contains("super-secret"));
    }
}
