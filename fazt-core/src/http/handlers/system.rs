//! System endpoints: health, limits, config

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use crate::db::config_store;
use crate::error::{Error, Result};
use crate::http::envelope::Data;
use crate::limits::schema::SCHEMA_JSON;
use crate::state::SharedState;

/// `GET /api/system/health` (public)
pub async fn health(State(state): State<SharedState>) -> Result<Data<Value>> {
    let db_ok = sqlx::query("SELECT 1").execute(&state.db.admin_pool).await.is_ok();
    Ok(Data(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "vfs_cache_bytes": state.vfs.cache_bytes(),
    })))
}

/// `GET /api/system/limits`
pub async fn limits(State(state): State<SharedState>) -> Result<Data<Value>> {
    Ok(Data(serde_json::to_value(&*state.limits).map_err(|e| Error::Internal(e.to_string()))?))
}

/// `GET /api/system/limits/schema`
pub async fn limits_schema() -> Data<Value> {
    Data(SCHEMA_JSON.clone())
}

/// `GET /api/system/capacity` (compat alias for the capacity block)
pub async fn capacity(State(state): State<SharedState>) -> Result<Data<Value>> {
    Ok(Data(
        serde_json::to_value(&state.limits.capacity).map_err(|e| Error::Internal(e.to_string()))?,
    ))
}

/// `GET /api/system/config` — the full configurations table.
pub async fn config_list(State(state): State<SharedState>) -> Result<Data<Value>> {
    let rows = config_store::list(&state.db.admin_pool, "").await?;
    let map: serde_json::Map<String, Value> = rows.into_iter().collect();
    Ok(Data(Value::Object(map)))
}

/// `PUT /api/system/config/{key}`
pub async fn config_set(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    Json(value): Json<Value>,
) -> Result<Data<Value>> {
    config_store::set(&state.db.admin_pool, &key, &value).await?;
    Ok(Data(json!({ "key": key })))
}

/// `DELETE /api/system/config/{key}`
pub async fn config_delete(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<Data<Value>> {
    config_store::delete(&state.db.admin_pool, &key).await?;
    Ok(Data(json!({ "removed": key })))
}

/// `POST /api/system/vacuum` — reclaim space; also prunes expired KV rows.
pub async fn vacuum(State(state): State<SharedState>) -> Result<Data<Value>> {
    sqlx::query("DELETE FROM storage_kv WHERE expires_at IS NOT NULL AND expires_at <= ?")
        .bind(crate::db::now_secs())
        .execute(&state.db.admin_pool)
        .await?;
    sqlx::query("VACUUM").execute(&state.db.admin_pool).await?;
    Ok(Data(json!({ "ok": true })))
}

/// `POST /api/system/prune` — trim activity and net logs to retention.
pub async fn prune(State(state): State<SharedState>) -> Result<Data<Value>> {
    let cap = state.limits.storage.max_log_rows as i64;
    let activity = sqlx::query(
        "DELETE FROM activity_log WHERE id <= \
         (SELECT id FROM activity_log ORDER BY id DESC LIMIT 1 OFFSET ?)",
    )
    .bind(cap)
    .execute(&state.db.admin_pool)
    .await?;
    let net = sqlx::query(
        "DELETE FROM net_log WHERE id <= \
         (SELECT id FROM net_log ORDER BY id DESC LIMIT 1 OFFSET ?)",
    )
    .bind(cap)
    .execute(&state.db.admin_pool)
    .await?;
    Ok(Data(json!({
        "activity_pruned": activity.rows_affected(),
        "net_pruned": net.rows_affected(),
    })))
}
