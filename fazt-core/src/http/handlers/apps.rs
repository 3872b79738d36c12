//! App management endpoints

use axum::{
    body::Bytes,
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::io::{Cursor, Seek, Write};

use crate::apps;
use crate::error::{Error, Result};
use crate::http::envelope::{Created, Data, Page};
use crate::state::SharedState;
use crate::vfs::{deploy::unpack_zip, FileUpload};

/// Resolve an app by id or name.
async fn resolve(state: &SharedState, key: &str) -> Result<apps::App> {
    if let Some(app) = apps::get(&state.db.pool, key).await? {
        return Ok(app);
    }
    apps::get_by_name(&state.db.pool, key)
        .await?
        .ok_or_else(|| Error::NotFound(format!("app {key}")))
}

/// `GET /api/apps`
pub async fn list(State(state): State<SharedState>) -> Result<Data<Vec<apps::App>>> {
    Ok(Data(apps::list(&state.db.pool).await?))
}

/// `GET /api/apps/{id}`
pub async fn get(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Data<serde_json::Value>> {
    let app = resolve(&state, &id).await?;
    let files = state.vfs.list(&app.id).await?;
    let bytes: u64 = files.iter().map(|(_, size)| size).sum();
    let aliases = apps::list_aliases(&state.db.pool, &app.id).await?;
    Ok(Data(json!({
        "app": app,
        "files": files.len(),
        "bytes": bytes,
        "aliases": aliases,
    })))
}

#[derive(Deserialize)]
pub struct CreateBody {
    pub name: String,
}

/// `POST /api/apps`
pub async fn create(
    State(state): State<SharedState>,
    Json(body): Json<CreateBody>,
) -> Result<Created<apps::App>> {
    Ok(Created(apps::create(&state.db.pool, &body.name, "personal").await?))
}

/// `DELETE /api/apps/{id}`
pub async fn delete(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Data<serde_json::Value>> {
    let app = resolve(&state, &id).await?;
    apps::delete(&state.db.pool, &app.id).await?;
    state.vfs.invalidate(&app.id);
    Ok(Data(json!({ "deleted": app.id })))
}

/// `POST /api/apps/{id}/deploy` — a ZIP body or multipart file fields.
/// Uploads past the in-memory threshold spill to a temp file before
/// unpacking.
pub async fn deploy(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let app = resolve(&state, &id).await?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/zip");

    let uploads = if content_type.starts_with("multipart/form-data") {
        return Err(Error::BadRequest(
            "multipart deploys go through /deploy/multipart".to_string(),
        ));
    } else if body.len() as u64 > state.limits.storage.max_upload {
        // Spill: large archives go through disk instead of a second
        // in-memory copy.
        let mut spill = tempfile::tempfile_in(
            state.config.temp_dir.clone().unwrap_or_else(std::env::temp_dir),
        )?;
        spill.write_all(&body)?;
        spill.rewind()?;
        unpack_zip(spill)?
    } else {
        unpack_zip(Cursor::new(body.to_vec()))?
    };

    let summary = state.vfs.deploy(&app.id, uploads).await?;
    Ok((StatusCode::CREATED, Data(summary)).into_response())
}

/// `POST /api/apps/{id}/deploy/multipart` — one part per file, the part
/// name carrying the path.
pub async fn deploy_multipart(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<Response> {
    let app = resolve(&state, &id).await?;

    let mut uploads = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::BadRequest(format!("bad multipart body: {e}")))?
    {
        let path = field
            .file_name()
            .or(field.name())
            .ok_or_else(|| Error::BadRequest("multipart field without a name".to_string()))?
            .to_string();
        let content = field
            .bytes()
            .await
            .map_err(|e| Error::BadRequest(format!("failed reading {path}: {e}")))?;
        uploads.push(FileUpload { path, content: content.to_vec() });
    }

    let summary = state.vfs.deploy(&app.id, uploads).await?;
    Ok((StatusCode::CREATED, Data(summary)).into_response())
}

/// `GET /api/apps/{id}/files`
pub async fn files(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Data<Vec<serde_json::Value>>> {
    let app = resolve(&state, &id).await?;
    let files = state.vfs.list(&app.id).await?;
    Ok(Data(
        files
            .into_iter()
            .map(|(path, size)| json!({ "path": path, "size": size }))
            .collect(),
    ))
}

/// `GET /api/apps/{id}/files/{path...}`
pub async fn file_content(
    State(state): State<SharedState>,
    Path((id, path)): Path<(String, String)>,
) -> Result<Response> {
    let app = resolve(&state, &id).await?;
    let file = state
        .vfs
        .read(&app.id, &path)
        .await?
        .ok_or_else(|| Error::NotFound(format!("file {path}")))?;
    Ok((
        [(header::CONTENT_TYPE, file.mime_type.clone())],
        file.bytes.to_vec(),
    )
        .into_response())
}

// ============================================================================
// Aliases
// ============================================================================

#[derive(Deserialize)]
pub struct AliasBody {
    pub domain: String,
    #[serde(default)]
    pub primary: bool,
}

/// `GET /api/apps/{id}/domains`
pub async fn list_domains(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Data<Vec<apps::Alias>>> {
    let app = resolve(&state, &id).await?;
    Ok(Data(apps::list_aliases(&state.db.pool, &app.id).await?))
}

/// `POST /api/apps/{id}/domains`
pub async fn add_domain(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<AliasBody>,
) -> Result<Created<serde_json::Value>> {
    let app = resolve(&state, &id).await?;
    apps::add_alias(&state.db.pool, &app.id, &body.domain, body.primary).await?;
    Ok(Created(json!({ "domain": body.domain })))
}

/// `DELETE /api/apps/{id}/domains/{domain}`
pub async fn remove_domain(
    State(state): State<SharedState>,
    Path((id, domain)): Path<(String, String)>,
) -> Result<Data<serde_json::Value>> {
    let app = resolve(&state, &id).await?;
    apps::remove_alias(&state.db.pool, &app.id, &domain).await?;
    Ok(Data(json!({ "removed": domain })))
}

// ============================================================================
// Env vars
// ============================================================================

/// `GET /api/apps/{id}/env`
pub async fn list_env(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Data<Vec<serde_json::Value>>> {
    let app = resolve(&state, &id).await?;
    let vars = apps::list_env(&state.db.pool, &app.id).await?;
    Ok(Data(
        vars.into_iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect(),
    ))
}

#[derive(Deserialize)]
pub struct EnvBody {
    pub name: String,
    pub value: String,
}

/// `PUT /api/apps/{id}/env`
pub async fn set_env(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<EnvBody>,
) -> Result<Data<serde_json::Value>> {
    let app = resolve(&state, &id).await?;
    apps::set_env(&state.db.pool, &app.id, &body.name, &body.value).await?;
    Ok(Data(json!({ "name": body.name })))
}

/// `DELETE /api/apps/{id}/env/{name}`
pub async fn delete_env(
    State(state): State<SharedState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Data<serde_json::Value>> {
    let app = resolve(&state, &id).await?;
    apps::delete_env(&state.db.pool, &app.id, &name).await?;
    Ok(Data(json!({ "removed": name })))
}

// ============================================================================
// API keys
// ============================================================================

#[derive(Deserialize)]
pub struct KeyBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_scope() -> String {
    "deploy".to_string()
}

/// `GET /api/apps/{id}/keys`
pub async fn list_keys(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Data<Vec<crate::auth::ApiKey>>> {
    let app = resolve(&state, &id).await?;
    Ok(Data(crate::auth::list_api_keys(&state.db.pool, Some(&app.id)).await?))
}

/// `POST /api/apps/{id}/keys` — the secret appears once in this response.
pub async fn create_key(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<KeyBody>,
) -> Result<Created<serde_json::Value>> {
    let app = resolve(&state, &id).await?;
    let (key, secret) =
        crate::auth::create_api_key(&state.db.pool, body.name.as_deref(), Some(&app.id), &body.scope)
            .await?;
    Ok(Created(json!({ "key": key, "secret": secret })))
}

/// `DELETE /api/apps/{id}/keys/{key_id}`
pub async fn revoke_key(
    State(state): State<SharedState>,
    Path((id, key_id)): Path<(String, String)>,
) -> Result<Data<serde_json::Value>> {
    let _app = resolve(&state, &id).await?;
    crate::auth::revoke_api_key(&state.db.pool, &key_id).await?;
    Ok(Data(json!({ "revoked": key_id })))
}

// ============================================================================
// Logs and jobs
// ============================================================================

#[derive(Deserialize)]
pub struct LogQuery {
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub offset: u64,
}

fn default_limit() -> u64 {
    100
}

/// `GET /api/apps/{id}/logs` — activity rows for this app.
pub async fn logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Page<Vec<serde_json::Value>>> {
    let app = resolve(&state, &id).await?;
    let limit = query.limit.min(1000);

    let (total,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM activity_log WHERE app_id = ?")
            .bind(&app.id)
            .fetch_one(&state.db.admin_pool)
            .await?;
    let rows: Vec<(i64, i64, String, String, Option<String>, Option<i64>, Option<String>)> =
        sqlx::query_as(
            "SELECT id, ts, type, action, path, status, details FROM activity_log \
             WHERE app_id = ? ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(&app.id)
        .bind(limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&state.db.admin_pool)
        .await?;

    let items = rows
        .into_iter()
        .map(|(id, ts, event_type, action, path, status, details)| {
            json!({
                "id": id,
                "ts": ts,
                "type": event_type,
                "action": action,
                "path": path,
                "status": status,
                "details": details.and_then(|d| serde_json::from_str::<serde_json::Value>(&d).ok()),
            })
        })
        .collect();

    Ok(Page { items, total: total as u64, limit, offset: query.offset })
}

/// `GET /api/apps/{id}/jobs` — scheduler and worker jobs.
pub async fn jobs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Data<serde_json::Value>> {
    let app = resolve(&state, &id).await?;
    let scheduled = state.scheduler.list(&app.id).await?;
    let workers = state.workers.list(&app.id).await?;
    Ok(Data(json!({ "scheduled": scheduled, "workers": workers })))
}
