//! Egress administration endpoints

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Result;
use crate::http::envelope::{Created, Data, Page};
use crate::net::secrets;
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct AllowBody {
    pub domain: String,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default = "default_true")]
    pub https_only: bool,
    #[serde(default)]
    pub cache_ttl: Option<i64>,
    #[serde(default)]
    pub rate_limit: Option<i64>,
    #[serde(default)]
    pub rate_burst: Option<i64>,
    #[serde(default)]
    pub max_response: Option<i64>,
    #[serde(default)]
    pub timeout_ms: Option<i64>,
}

fn default_true() -> bool {
    true
}

/// `GET /api/net/allowlist`
pub async fn allowlist_list(State(state): State<SharedState>) -> Result<Data<Value>> {
    let entries = state.proxy.allowlist().list().await?;
    Ok(Data(serde_json::to_value(entries).unwrap_or(Value::Null)))
}

/// `POST /api/net/allowlist`
pub async fn allowlist_add(
    State(state): State<SharedState>,
    Json(body): Json<AllowBody>,
) -> Result<Created<Value>> {
    let entry = state
        .proxy
        .allowlist()
        .add(
            &body.domain,
            body.app_id.as_deref(),
            body.https_only,
            body.cache_ttl,
            body.rate_limit,
            body.rate_burst,
            body.max_response,
            body.timeout_ms,
        )
        .await?;
    state.proxy.reset_rate_buckets();
    Ok(Created(serde_json::to_value(entry).unwrap_or(Value::Null)))
}

/// `DELETE /api/net/allowlist/{id}`
pub async fn allowlist_remove(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Data<Value>> {
    state.proxy.allowlist().remove(id).await?;
    state.proxy.reset_rate_buckets();
    Ok(Data(json!({ "removed": id })))
}

#[derive(Deserialize)]
pub struct SecretBody {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default = "default_inject")]
    pub inject_as: String,
    #[serde(default)]
    pub inject_key: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

fn default_inject() -> String {
    "bearer".to_string()
}

/// `GET /api/net/secrets` — metadata only, never values.
pub async fn secrets_list(State(state): State<SharedState>) -> Result<Data<Value>> {
    let listed = secrets::list_secrets(&state.db.admin_pool).await?;
    Ok(Data(serde_json::to_value(listed).unwrap_or(Value::Null)))
}

/// `PUT /api/net/secrets`
pub async fn secrets_set(
    State(state): State<SharedState>,
    Json(body): Json<SecretBody>,
) -> Result<Data<Value>> {
    secrets::set_secret(
        &state.db.admin_pool,
        body.app_id.as_deref(),
        &body.name,
        &body.value,
        &body.inject_as,
        body.inject_key.as_deref(),
        body.domain.as_deref(),
    )
    .await?;
    Ok(Data(json!({ "name": body.name })))
}

/// `DELETE /api/net/secrets/{name}`
pub async fn secrets_remove(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Query(query): Query<SecretScopeQuery>,
) -> Result<Data<Value>> {
    secrets::remove_secret(&state.db.admin_pool, query.app_id.as_deref(), &name).await?;
    Ok(Data(json!({ "removed": name })))
}

#[derive(Deserialize)]
pub struct SecretScopeQuery {
    #[serde(default)]
    pub app_id: Option<String>,
}

#[derive(Deserialize)]
pub struct NetLogQuery {
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub offset: u64,
}

fn default_limit() -> u64 {
    100
}

/// `GET /api/net/logs`
pub async fn logs(
    State(state): State<SharedState>,
    Query(query): Query<NetLogQuery>,
) -> Result<Page<Vec<Value>>> {
    let limit = query.limit.min(1000);
    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM net_log")
        .fetch_one(&state.db.admin_pool)
        .await?;
    let rows: Vec<(i64, i64, Option<String>, String, String, String, Option<i64>, Option<i64>, Option<i64>, Option<String>)> =
        sqlx::query_as(
            "SELECT id, ts, app_id, method, host, path, status, duration_ms, bytes_in, error \
             FROM net_log ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&state.db.admin_pool)
        .await?;

    let items = rows
        .into_iter()
        .map(|(id, ts, app_id, method, host, path, status, duration_ms, bytes_in, error)| {
            json!({
                "id": id,
                "ts": ts,
                "app_id": app_id,
                "method": method,
                "host": host,
                "path": path,
                "status": status,
                "duration_ms": duration_ms,
                "bytes_in": bytes_in,
                "error": error,
            })
        })
        .collect();
    Ok(Page { items, total: total as u64, limit, offset: query.offset })
}

/// `GET /api/net/cache` — cache stats.
pub async fn cache_stats(State(state): State<SharedState>) -> Result<Data<Value>> {
    let (items, bytes) = state.proxy.cache().stats();
    Ok(Data(json!({ "items": items, "bytes": bytes })))
}

/// `DELETE /api/net/cache`
pub async fn cache_clear(State(state): State<SharedState>) -> Result<Data<Value>> {
    state.proxy.cache().clear();
    Ok(Data(json!({ "cleared": true })))
}
