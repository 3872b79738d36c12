//! User accounts

use once_cell::sync::Lazy;
use serde::Serialize;
use sqlx::SqlitePool;

use super::{PasswordHasher, Role};
use crate::db::now_secs;
use crate::error::{Error, Result};
use crate::ids::{generate, IdKind};

/// A user row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    pub created_at: i64,
}

impl User {
    /// Parsed role.
    pub fn role(&self) -> Role {
        self.role.parse().unwrap_or(Role::User)
    }
}

/// Create a user. The first user in an empty database becomes the owner.
pub async fn create_user(
    pool: &SqlitePool,
    username: &str,
    email: Option<&str>,
    password: &str,
    role: Role,
) -> Result<User> {
    if username.is_empty() || !username.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-') {
        return Err(Error::Validation(format!("invalid username: {username}")));
    }
    let role = if count_users(pool).await? == 0 { Role::Owner } else { role };
    let hash = PasswordHasher.hash(password)?;
    let id = generate(IdKind::User);

    let inserted = sqlx::query(
        "INSERT INTO auth_users (id, username, email, password_hash, role, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(username)
    .bind(email)
    .bind(&hash)
    .bind(role.to_string())
    .bind(now_secs())
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => {}
        Err(sqlx::Error::Database(db)) if db.message().contains("UNIQUE") => {
            return Err(Error::Conflict(format!("username '{username}' is taken")));
        }
        Err(e) => return Err(e.into()),
    }

    get_user(pool, &id)
        .await?
        .ok_or_else(|| Error::Internal("user vanished after insert".to_string()))
}

/// Fetch by id.
pub async fn get_user(pool: &SqlitePool, id: &str) -> Result<Option<User>> {
    Ok(sqlx::query_as::<_, User>("SELECT * FROM auth_users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?)
}

/// Fetch by username.
pub async fn get_user_by_username(pool: &SqlitePool, username: &str) -> Result<Option<User>> {
    Ok(sqlx::query_as::<_, User>("SELECT * FROM auth_users WHERE username = ?")
        .bind(username)
        .fetch_optional(pool)
        .await?)
}

/// Total user count.
pub async fn count_users(pool: &SqlitePool) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM auth_users")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// List all users.
pub async fn list_users(pool: &SqlitePool) -> Result<Vec<User>> {
    Ok(sqlx::query_as::<_, User>("SELECT * FROM auth_users ORDER BY created_at")
        .fetch_all(pool)
        .await?)
}

/// Change a user's role. Only the owner may promote, and the owner role
/// itself is not assignable this way.
pub async fn promote(pool: &SqlitePool, actor: &User, target_id: &str, role: Role) -> Result<()> {
    if actor.role() != Role::Owner {
        return Err(Error::Forbidden("only the owner can change roles".to_string()));
    }
    if role == Role::Owner {
        return Err(Error::Validation("the owner role cannot be assigned".to_string()));
    }
    let result = sqlx::query("UPDATE auth_users SET role = ? WHERE id = ? AND role != 'owner'")
        .bind(role.to_string())
        .bind(target_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("user {target_id}")));
    }
    Ok(())
}

// Verified once so unknown-username logins cost the same as real ones.
static DUMMY_HASH: Lazy<String> =
    Lazy::new(|| PasswordHasher.hash("constant-work-placeholder").expect("static hash"));

/// Password login with constant work on unknown usernames: the dummy hash
/// is verified regardless, so timing does not reveal which usernames exist.
pub async fn constant_work_login(
    pool: &SqlitePool,
    username: &str,
    password: &str,
) -> Result<User> {
    let user = get_user_by_username(pool, username).await?;
    let hash = user.as_ref().map(|u| u.password_hash.as_str()).unwrap_or(&DUMMY_HASH);
    let ok = PasswordHasher.verify(password, hash)?;
    match user {
        Some(user) if ok => Ok(user),
        _ => Err(Error::Unauthorized("invalid username or password".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_first_user_is_owner() {
        let db = Database::open_memory().await.unwrap();
        let first = create_user(&db.pool, "admin", None, "password1", Role::User).await.unwrap();
        assert_eq!(first.role(), Role::Owner);
        let second = create_user(&db.pool, "bob", None, "password2", Role::User).await.unwrap();
        assert_eq!(second.role(), Role::User);
    }

    #[tokio::test]
    async fn test_single_owner_enforced() {
        let db = Database::open_memory().await.unwrap();
        create_user(&db.pool, "admin", None, "password1", Role::User).await.unwrap();
        // A direct attempt to insert a second owner trips the partial index.
        let result = sqlx::query(
            "INSERT INTO auth_users (id, username, password_hash, role, created_at) \
             VALUES ('fazt_usr_x00000000000', 'x', 'h', 'owner', 0)",
        )
        .execute(&db.pool)
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_login_success_and_failure() {
        let db = Database::open_memory().await.unwrap();
        create_user(&db.pool, "admin", None, "correcthorse", Role::User).await.unwrap();

        assert!(constant_work_login(&db.pool, "admin", "correcthorse").await.is_ok());
        assert!(constant_work_login(&db.pool, "admin", "wrong").await.is_err());
        assert!(constant_work_login(&db.pool, "ghost", "whatever").await.is_err());
    }

    #[tokio::test]
    async fn test_promote_requires_owner() {
        let db = Database::open_memory().await.unwrap();
        let owner = create_user(&db.pool, "owner", None, "password1", Role::User).await.unwrap();
        let user = create_user(&db.pool, "bob", None, "password2", Role::User).await.unwrap();

        promote(&db.pool, &owner, &user.id, Role::Admin).await.unwrap();
        let bob = get_user(&db.pool, &user.id).await.unwrap().unwrap();
        assert_eq!(bob.role(), Role::Admin);

        // Admins cannot promote.
        let err = promote(&db.pool, &bob, &owner.id, Role::User).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Forbidden);
    }
}
