//! Invites
//!
//! Single-use tokens that bind a new user atomically: the token is marked
//! used in the same transaction that creates the account, so a raced second
//! redemption fails cleanly.

use serde::Serialize;
use sqlx::SqlitePool;

use super::{PasswordHasher, Role};
use crate::db::{now_secs, with_busy_retry};
use crate::error::{Error, Result};
use crate::ids::{generate, generate_secret, IdKind};

/// An invite row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Invite {
    pub token: String,
    pub role: String,
    pub created_by: Option<String>,
    pub expires_at: Option<i64>,
    pub used_by: Option<String>,
    pub used_at: Option<i64>,
    pub created_at: i64,
}

/// Create an invite granting `role` on redemption.
pub async fn create_invite(
    pool: &SqlitePool,
    created_by: &str,
    role: Role,
    ttl_secs: Option<i64>,
) -> Result<Invite> {
    if role == Role::Owner {
        return Err(Error::Validation("invites cannot grant the owner role".to_string()));
    }
    let token = generate_secret(IdKind::Invite, 24);
    let now = now_secs();
    sqlx::query(
        "INSERT INTO invites (token, role, created_by, expires_at, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&token)
    .bind(role.to_string())
    .bind(created_by)
    .bind(ttl_secs.map(|t| now + t))
    .bind(now)
    .execute(pool)
    .await?;

    Ok(sqlx::query_as::<_, Invite>("SELECT * FROM invites WHERE token = ?")
        .bind(&token)
        .fetch_one(pool)
        .await?)
}

/// Redeem an invite, creating the user in the same transaction.
pub async fn redeem_invite(
    pool: &SqlitePool,
    token: &str,
    username: &str,
    password: &str,
) -> Result<String> {
    let hash = PasswordHasher.hash(password)?;
    let user_id = generate(IdKind::User);
    let now = now_secs();

    let token = token.to_string();
    let username = username.to_string();
    let user_id_out = user_id.clone();

    with_busy_retry(|| {
        let pool = pool.clone();
        let (token, username, hash, user_id) =
            (token.clone(), username.clone(), hash.clone(), user_id.clone());
        async move {
            let mut tx = pool.begin().await?;

            // Claiming the token and checking validity in one UPDATE makes
            // redemption race-safe.
            let claimed = sqlx::query(
                "UPDATE invites SET used_by = ?, used_at = ? \
                 WHERE token = ? AND used_by IS NULL \
                   AND (expires_at IS NULL OR expires_at > ?)",
            )
            .bind(&user_id)
            .bind(now)
            .bind(&token)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            if claimed.rows_affected() == 0 {
                return Err(sqlx::Error::RowNotFound);
            }

            let (role,): (String,) =
                sqlx::query_as("SELECT role FROM invites WHERE token = ?")
                    .bind(&token)
                    .fetch_one(&mut *tx)
                    .await?;

            sqlx::query(
                "INSERT INTO auth_users (id, username, password_hash, role, created_at) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&user_id)
            .bind(&username)
            .bind(&hash)
            .bind(&role)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            tx.commit().await
        }
    })
    .await
    .map_err(|e| match e {
        Error::Database(sqlx::Error::RowNotFound) => {
            Error::BadRequest("invalid or used invite".to_string())
        }
        Error::Database(sqlx::Error::Database(db)) if db.message().contains("UNIQUE") => {
            Error::Conflict(format!("username '{username}' is taken"))
        }
        other => other,
    })?;

    Ok(user_id_out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{create_user, get_user};
    use crate::db::Database;

    #[tokio::test]
    async fn test_redeem_creates_user_with_role() {
        let db = Database::open_memory().await.unwrap();
        let owner = create_user(&db.pool, "owner", None, "password1", Role::User).await.unwrap();
        let invite = create_invite(&db.pool, &owner.id, Role::Admin, None).await.unwrap();

        let user_id = redeem_invite(&db.pool, &invite.token, "alice", "password2").await.unwrap();
        let alice = get_user(&db.pool, &user_id).await.unwrap().unwrap();
        assert_eq!(alice.role(), Role::Admin);
    }

    #[tokio::test]
    async fn test_invite_single_use() {
        let db = Database::open_memory().await.unwrap();
        let owner = create_user(&db.pool, "owner", None, "password1", Role::User).await.unwrap();
        let invite = create_invite(&db.pool, &owner.id, Role::User, None).await.unwrap();

        redeem_invite(&db.pool, &invite.token, "alice", "password2").await.unwrap();
        let err = redeem_invite(&db.pool, &invite.token, "bob", "password3").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn test_expired_invite_rejected() {
        let db = Database::open_memory().await.unwrap();
        let owner = create_user(&db.pool, "owner", None, "password1", Role::User).await.unwrap();
        let invite = create_invite(&db.pool, &owner.id, Role::User, Some(-10)).await.unwrap();
        assert!(redeem_invite(&db.pool, &invite.token, "late", "password2").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_redeem_leaves_invite_unused() {
        let db = Database::open_memory().await.unwrap();
        let owner = create_user(&db.pool, "owner", None, "password1", Role::User).await.unwrap();
        let invite = create_invite(&db.pool, &owner.id, Role::User, None).await.unwrap();

        // Duplicate username rolls the whole transaction back.
        let err = redeem_invite(&db.pool, &invite.token, "owner", "password2").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);

        // The invite is still redeemable.
        redeem_invite(&db.pool, &invite.token, "fresh", "password3").await.unwrap();
    }
}
