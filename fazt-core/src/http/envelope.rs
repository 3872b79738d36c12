//! Response envelope
//!
//! Success bodies carry exactly one top-level `data` key, optionally
//! `meta` for pagination. Error bodies (built in [`crate::error`]) carry
//! exactly one top-level `error` key. The two never mix.

use axum::{
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

/// `{"data": ...}`
pub struct Data<T>(pub T);

impl<T: Serialize> IntoResponse for Data<T> {
    fn into_response(self) -> Response {
        Json(json!({ "data": self.0 })).into_response()
    }
}

/// `{"data": ..., "meta": {"total", "limit", "offset"}}`
pub struct Page<T> {
    pub items: T,
    pub total: u64,
    pub limit: u64,
    pub offset: u64,
}

impl<T: Serialize> IntoResponse for Page<T> {
    fn into_response(self) -> Response {
        Json(json!({
            "data": self.items,
            "meta": { "total": self.total, "limit": self.limit, "offset": self.offset },
        }))
        .into_response()
    }
}

/// `201` + `{"data": ...}`
pub struct Created<T>(pub T);

impl<T: Serialize> IntoResponse for Created<T> {
    fn into_response(self) -> Response {
        (axum::http::StatusCode::CREATED, Json(json!({ "data": self.0 }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_data_has_single_key() {
        let json = body_json(Data(json!({"ok": true})).into_response()).await;
        let keys: Vec<_> = json.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["data"]);
    }

    #[tokio::test]
    async fn test_page_meta() {
        let response = Page { items: vec![1, 2], total: 10, limit: 2, offset: 4 }.into_response();
        let json = body_json(response).await;
        assert_eq!(json["meta"]["total"], 10);
        assert_eq!(json["meta"]["offset"], 4);
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_created_status() {
        let response = Created(json!({"id": 1})).into_response();
        assert_eq!(response.status(), axum::http::StatusCode::CREATED);
    }
}
