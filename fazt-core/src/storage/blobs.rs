//! Blob store
//!
//! S3-shaped byte storage. User-scoped blobs live under the same implicit
//! scope column as KV and documents; paths are app-relative and sanitized.

use super::{Scope, Storage};
use crate::db::writer::WriteOp;
use crate::error::{Error, Result};

/// A blob listing entry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BlobEntry {
    pub path: String,
    pub content_type: String,
    pub size: u64,
}

fn check_path(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with('/') || path.split('/').any(|seg| seg == "..") {
        return Err(Error::BadRequest(format!("invalid blob path: {path}")));
    }
    Ok(())
}

impl Storage {
    /// Store bytes at `path`, replacing any existing blob.
    pub async fn blob_put(
        &self,
        app_id: &str,
        scope: &Scope,
        path: &str,
        content: Vec<u8>,
        content_type: Option<String>,
    ) -> Result<()> {
        check_path(path)?;
        self.check_entry_size(content.len())?;
        self.check_app_quota(app_id, content.len() as u64).await?;

        let content_type = content_type.unwrap_or_else(|| {
            mime_guess::from_path(path).first_or_octet_stream().essence_str().to_string()
        });

        self.queue()
            .submit(vec![WriteOp::BlobPut {
                app_id: app_id.to_string(),
                user_id: scope.user_key().to_string(),
                path: path.to_string(),
                content,
                content_type,
            }])
            .await
    }

    /// Fetch a blob's bytes and content type.
    pub async fn blob_get(
        &self,
        app_id: &str,
        scope: &Scope,
        path: &str,
    ) -> Result<Option<(Vec<u8>, String)>> {
        check_path(path)?;
        let row: Option<(Vec<u8>, String)> = sqlx::query_as(
            "SELECT content, content_type FROM storage_blobs \
             WHERE app_id = ? AND user_id = ? AND path = ?",
        )
        .bind(app_id)
        .bind(scope.user_key())
        .bind(path)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Remove a blob.
    pub async fn blob_delete(&self, app_id: &str, scope: &Scope, path: &str) -> Result<()> {
        check_path(path)?;
        self.queue()
            .submit(vec![WriteOp::BlobDelete {
                app_id: app_id.to_string(),
                user_id: scope.user_key().to_string(),
                path: path.to_string(),
            }])
            .await
    }

    /// List blobs under a prefix.
    pub async fn blob_list(
        &self,
        app_id: &str,
        scope: &Scope,
        prefix: &str,
    ) -> Result<Vec<BlobEntry>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT path, content_type, size FROM storage_blobs \
             WHERE app_id = ? AND user_id = ? AND path LIKE ? || '%' \
             ORDER BY path",
        )
        .bind(app_id)
        .bind(scope.user_key())
        .bind(prefix)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .into_iter()
            .map(|(path, content_type, size)| BlobEntry {
                path,
                content_type,
                size: size as u64,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::storage;
    use super::*;

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (_db, st) = storage().await;
        st.blob_put("app1", &Scope::Shared, "img/logo.png", vec![1, 2, 3], None)
            .await
            .unwrap();
        let (bytes, ct) = st
            .blob_get("app1", &Scope::Shared, "img/logo.png")
            .await
            .unwrap()
            .expect("blob");
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(ct, "image/png");
    }

    #[tokio::test]
    async fn test_delete() {
        let (_db, st) = storage().await;
        st.blob_put("app1", &Scope::Shared, "a.txt", b"x".to_vec(), None).await.unwrap();
        st.blob_delete("app1", &Scope::Shared, "a.txt").await.unwrap();
        assert!(st.blob_get("app1", &Scope::Shared, "a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_prefix_and_scope() {
        let (_db, st) = storage().await;
        let user = Scope::User("fazt_usr_u00000000000".into());
        st.blob_put("app1", &Scope::Shared, "docs/a", b"1".to_vec(), None).await.unwrap();
        st.blob_put("app1", &user, "docs/b", b"2".to_vec(), None).await.unwrap();

        let shared = st.blob_list("app1", &Scope::Shared, "docs/").await.unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].path, "docs/a");

        let scoped = st.blob_list("app1", &user, "docs/").await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].path, "docs/b");
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let (_db, st) = storage().await;
        let err = st
            .blob_put("app1", &Scope::Shared, "../escape", b"x".to_vec(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BadRequest);
    }
}
