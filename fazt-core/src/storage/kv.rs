//! Key/value store
//!
//! Values are JSON. TTL is honored at read time; expired rows are removed
//! lazily by the read path and in bulk by maintenance pruning.

use serde_json::Value;

use super::{Scope, Storage};
use crate::db::{now_secs, writer::WriteOp};
use crate::error::Result;

impl Storage {
    /// Set a key. `ttl_secs` of `None` means no expiry.
    pub async fn kv_set(
        &self,
        app_id: &str,
        scope: &Scope,
        key: &str,
        value: &Value,
        ttl_secs: Option<u64>,
    ) -> Result<()> {
        let raw = serde_json::to_string(value)
            .map_err(|e| crate::error::Error::Internal(e.to_string()))?;
        self.check_entry_size(raw.len())?;

        let expires_at = ttl_secs.map(|ttl| now_secs() + ttl as i64);
        self.queue()
            .submit(vec![WriteOp::KvSet {
                app_id: app_id.to_string(),
                user_id: scope.user_key().to_string(),
                key: key.to_string(),
                value: raw,
                expires_at,
            }])
            .await
    }

    /// Get a key; expired entries read as absent.
    pub async fn kv_get(&self, app_id: &str, scope: &Scope, key: &str) -> Result<Option<Value>> {
        let row: Option<(String, Option<i64>)> = sqlx::query_as(
            "SELECT value, expires_at FROM storage_kv \
             WHERE app_id = ? AND user_id = ? AND key = ?",
        )
        .bind(app_id)
        .bind(scope.user_key())
        .bind(key)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some((_, Some(expiry))) if expiry <= now_secs() => {
                // Lazy expiry; the delete is best-effort.
                let _ = self
                    .queue()
                    .submit(vec![WriteOp::KvDelete {
                        app_id: app_id.to_string(),
                        user_id: scope.user_key().to_string(),
                        key: key.to_string(),
                    }])
                    .await;
                Ok(None)
            }
            Some((raw, _)) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Delete a key.
    pub async fn kv_delete(&self, app_id: &str, scope: &Scope, key: &str) -> Result<()> {
        self.queue()
            .submit(vec![WriteOp::KvDelete {
                app_id: app_id.to_string(),
                user_id: scope.user_key().to_string(),
                key: key.to_string(),
            }])
            .await
    }

    /// List keys under a prefix, excluding expired entries.
    pub async fn kv_list(&self, app_id: &str, scope: &Scope, prefix: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM storage_kv \
             WHERE app_id = ? AND user_id = ? AND key LIKE ? || '%' \
               AND (expires_at IS NULL OR expires_at > ?) \
             ORDER BY key",
        )
        .bind(app_id)
        .bind(scope.user_key())
        .bind(prefix)
        .bind(now_secs())
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::storage;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let (_db, st) = storage().await;
        st.kv_set("app1", &Scope::Shared, "k", &json!({"a": 1}), None)
            .await
            .unwrap();
        let v = st.kv_get("app1", &Scope::Shared, "k").await.unwrap();
        assert_eq!(v, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let (_db, st) = storage().await;
        assert_eq!(st.kv_get("app1", &Scope::Shared, "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete() {
        let (_db, st) = storage().await;
        st.kv_set("app1", &Scope::Shared, "k", &json!(true), None).await.unwrap();
        st.kv_delete("app1", &Scope::Shared, "k").await.unwrap();
        assert_eq!(st.kv_get("app1", &Scope::Shared, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_user_scoping() {
        let (_db, st) = storage().await;
        let alice = Scope::User("fazt_usr_alice0000000".into());
        let bob = Scope::User("fazt_usr_bob000000000".into());

        st.kv_set("app1", &alice, "k", &json!("alice"), None).await.unwrap();
        assert_eq!(st.kv_get("app1", &bob, "k").await.unwrap(), None);
        assert_eq!(st.kv_get("app1", &Scope::Shared, "k").await.unwrap(), None);
        assert_eq!(st.kv_get("app1", &alice, "k").await.unwrap(), Some(json!("alice")));
    }

    #[tokio::test]
    async fn test_ttl_expiry_on_read() {
        let (db, st) = storage().await;
        st.kv_set("app1", &Scope::Shared, "k", &json!(1), Some(60)).await.unwrap();

        // Force the row into the past.
        sqlx::query("UPDATE storage_kv SET expires_at = 1 WHERE key = 'k'")
            .execute(&db.pool)
            .await
            .unwrap();

        assert_eq!(st.kv_get("app1", &Scope::Shared, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let (_db, st) = storage().await;
        for key in ["user:1", "user:2", "other"] {
            st.kv_set("app1", &Scope::Shared, key, &json!(0), None).await.unwrap();
        }
        let keys = st.kv_list("app1", &Scope::Shared, "user:").await.unwrap();
        assert_eq!(keys, vec!["user:1", "user:2"]);
    }
}
