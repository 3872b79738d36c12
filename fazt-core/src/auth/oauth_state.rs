//! OAuth state nonces
//!
//! Single-use CSRF nonces for the authorization flow. Validation consumes
//! the row atomically (delete-returning), so a replayed state fails.

use rand::Rng;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::db::now_secs;
use crate::error::{Error, Result};

/// State lifetime: ten minutes.
const STATE_TTL_SECS: i64 = 600;

/// Generate a random URL-safe state value.
fn generate_nonce() -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Create and store a state nonce with attached data.
pub async fn create_state(pool: &SqlitePool, data: &Value) -> Result<String> {
    let state = generate_nonce();
    let now = now_secs();
    sqlx::query(
        "INSERT INTO oauth_states (state, data, created_at, expires_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&state)
    .bind(serde_json::to_string(data).map_err(|e| Error::Internal(e.to_string()))?)
    .bind(now)
    .bind(now + STATE_TTL_SECS)
    .execute(pool)
    .await?;
    Ok(state)
}

/// Validate and consume a state nonce, returning its data.
pub async fn validate_state(pool: &SqlitePool, state: &str) -> Result<Value> {
    let row: Option<(String, i64)> =
        sqlx::query_as("DELETE FROM oauth_states WHERE state = ? RETURNING data, expires_at")
            .bind(state)
            .fetch_optional(pool)
            .await?;

    match row {
        Some((_, expires)) if expires <= now_secs() => {
            Err(Error::BadRequest("expired OAuth state".to_string()))
        }
        Some((data, _)) => Ok(serde_json::from_str(&data)?),
        None => Err(Error::BadRequest("invalid or used OAuth state".to_string())),
    }
}
