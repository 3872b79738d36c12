//! Sessions
//!
//! Session ids are long random `fazt_ses_*` tokens stored as rows. Expiry
//! is strict: a validate after `expires_at` deletes the row and fails.
//! Valid sessions slide, extending to a full TTL from now.

use serde::Serialize;
use sqlx::SqlitePool;

use crate::db::now_secs;
use crate::error::{Error, Result};
use crate::ids::{generate_secret, IdKind};

/// Session lifetime: 30 days.
pub const SESSION_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// Entropy of the random token portion.
const TOKEN_LEN: usize = 32;

/// A session row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub expires_at: i64,
    pub created_at: i64,
}

/// Create a session for a user.
pub async fn create_session(pool: &SqlitePool, user_id: &str) -> Result<Session> {
    let id = generate_secret(IdKind::Session, TOKEN_LEN);
    let now = now_secs();
    sqlx::query(
        "INSERT INTO auth_sessions (id, user_id, expires_at, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(now + SESSION_TTL_SECS)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(Session { id, user_id: user_id.to_string(), expires_at: now + SESSION_TTL_SECS, created_at: now })
}

/// Validate a session id, refreshing its expiry. Expired sessions are
/// removed and rejected.
pub async fn validate_session(pool: &SqlitePool, id: &str) -> Result<Session> {
    let session = sqlx::query_as::<_, Session>("SELECT * FROM auth_sessions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::Unauthorized("invalid session".to_string()))?;

    let now = now_secs();
    if session.expires_at <= now {
        sqlx::query("DELETE FROM auth_sessions WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        return Err(Error::Unauthorized("session expired".to_string()));
    }

    sqlx::query("UPDATE auth_sessions SET expires_at = ? WHERE id = ?")
        .bind(now + SESSION_TTL_SECS)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(session)
}

/// Delete a session (logout).
pub async fn delete_session(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM auth_sessions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{create_user, Role};
    use crate::db::Database;

    #[tokio::test]
    async fn test_session_round_trip() {
        let db = Database::open_memory().await.unwrap();
        let user = create_user(&db.pool, "admin", None, "password1", Role::User).await.unwrap();
        let session = create_session(&db.pool, &user.id).await.unwrap();
        assert!(session.id.starts_with("fazt_ses_"));

        let validated = validate_session(&db.pool, &session.id).await.unwrap();
        assert_eq!(validated.user_id, user.id);
    }

    #[tokio::test]
    async fn test_expired_session_rejected_and_removed() {
        let db = Database::open_memory().await.unwrap();
        let user = create_user(&db.pool, "admin", None, "password1", Role::User).await.unwrap();
        let session = create_session(&db.pool, &user.id).await.unwrap();

        sqlx::query("UPDATE auth_sessions SET expires_at = 1 WHERE id = ?")
            .bind(&session.id)
            .execute(&db.pool)
            .await
            .unwrap();

        let err = validate_session(&db.pool, &session.id).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unauthorized);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM auth_sessions")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_logout() {
        let db = Database::open_memory().await.unwrap();
        let user = create_user(&db.pool, "admin", None, "password1", Role::User).await.unwrap();
        let session = create_session(&db.pool, &user.id).await.unwrap();
        delete_session(&db.pool, &session.id).await.unwrap();
        assert!(validate_session(&db.pool, &session.id).await.is_err());
    }
}
