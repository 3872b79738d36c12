//! Auth endpoints

use axum::{
    extract::{Extension, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{self, SESSION_TTL_SECS};
use crate::error::{Error, Result};
use crate::http::auth_mw::AuthContext;
use crate::http::envelope::Data;
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct LoginBody {
    pub username: String,
    pub password: String,
}

/// `POST /api/auth/login`
pub async fn login(
    State(state): State<SharedState>,
    Json(body): Json<LoginBody>,
) -> Result<Response> {
    let user = auth::constant_work_login(&state.db.pool, &body.username, &body.password).await?;
    let session = auth::create_session(&state.db.pool, &user.id).await?;

    let cookie = format!(
        "fazt_session={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        session.id, SESSION_TTL_SECS
    );
    let mut response = Data(json!({ "user_id": user.id })).into_response();
    response.headers_mut().insert(
        header::SET_COOKIE,
        HeaderValue::from_str(&cookie).map_err(|e| Error::Internal(e.to_string()))?,
    );
    Ok(response)
}

/// `POST /api/auth/logout`
pub async fn logout(State(state): State<SharedState>, headers: HeaderMap) -> Result<Response> {
    if let Some(session_id) = cookie_value(&headers) {
        auth::delete_session(&state.db.pool, &session_id).await?;
    }
    let mut response = Data(json!({ "ok": true })).into_response();
    response.headers_mut().insert(
        header::SET_COOKIE,
        HeaderValue::from_static("fazt_session=; Path=/; HttpOnly; Max-Age=0"),
    );
    Ok(response)
}

/// `GET /api/auth/me`
pub async fn me(Extension(ctx): Extension<AuthContext>) -> Result<Data<serde_json::Value>> {
    let user = ctx
        .user
        .as_ref()
        .ok_or_else(|| Error::Unauthorized("no session".to_string()))?;
    Ok(Data(json!({
        "user_id": user.id,
        "username": user.username,
        "email": user.email,
        "role": user.role,
    })))
}

/// `GET /api/auth/status` (public): whether setup has happened and whether
/// the caller is signed in.
pub async fn status(
    State(state): State<SharedState>,
    ctx: Option<Extension<AuthContext>>,
) -> Result<Data<serde_json::Value>> {
    let users = auth::count_users(&state.db.pool).await?;
    let logged_in = ctx
        .as_ref()
        .map(|Extension(ctx)| ctx.authenticated())
        .unwrap_or(false);
    Ok(Data(json!({
        "initialized": users > 0,
        "logged_in": logged_in,
    })))
}

#[derive(Deserialize)]
pub struct RegisterBody {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Invite token; required once an owner exists.
    #[serde(default)]
    pub invite: Option<String>,
}

/// `POST /api/auth/register` (public): first user becomes the owner;
/// afterwards a valid invite is required.
pub async fn register(
    State(state): State<SharedState>,
    Json(body): Json<RegisterBody>,
) -> Result<Data<serde_json::Value>> {
    let existing = auth::count_users(&state.db.pool).await?;
    let user_id = if existing == 0 {
        let user = auth::create_user(
            &state.db.pool,
            &body.username,
            body.email.as_deref(),
            &body.password,
            auth::Role::User, // promoted to owner by create_user
        )
        .await?;
        user.id
    } else {
        let invite = body
            .invite
            .as_deref()
            .ok_or_else(|| Error::Forbidden("registration requires an invite".to_string()))?;
        auth::redeem_invite(&state.db.pool, invite, &body.username, &body.password).await?
    };
    Ok(Data(json!({ "user_id": user_id })))
}

#[derive(Deserialize)]
pub struct InviteBody {
    #[serde(default = "default_invite_role")]
    pub role: String,
    /// Lifetime in seconds; unlimited when absent
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}

fn default_invite_role() -> String {
    "user".to_string()
}

/// `POST /api/auth/invites` (admin)
pub async fn create_invite(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<InviteBody>,
) -> Result<Data<auth::Invite>> {
    let actor = ctx
        .user
        .as_ref()
        .map(|u| u.id.clone())
        .unwrap_or_else(|| "admin-token".to_string());
    let role: auth::Role = body.role.parse()?;
    let invite = auth::create_invite(&state.db.pool, &actor, role, body.ttl_secs).await?;
    Ok(Data(invite))
}

/// `GET /api/auth/users` (admin)
pub async fn list_users(State(state): State<SharedState>) -> Result<Data<Vec<auth::User>>> {
    Ok(Data(auth::list_users(&state.db.pool).await?))
}

#[derive(Deserialize)]
pub struct RoleBody {
    pub role: String,
}

/// `PUT /api/auth/users/{id}/role` — owner only (enforced by `promote`).
pub async fn set_role(
    State(state): State<SharedState>,
    Extension(ctx): Extension<AuthContext>,
    axum::extract::Path(id): axum::extract::Path<String>,
    Json(body): Json<RoleBody>,
) -> Result<Data<serde_json::Value>> {
    let actor = ctx
        .user
        .as_ref()
        .ok_or_else(|| Error::Forbidden("role changes require an owner session".to_string()))?;
    let role: auth::Role = body.role.parse()?;
    auth::promote(&state.db.pool, actor, &id, role).await?;
    Ok(Data(json!({ "user_id": id, "role": body.role })))
}

#[derive(Deserialize)]
pub struct OAuthStartQuery {
    pub provider: String,
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

/// `GET /api/auth/oauth/start` (public) — mints a single-use state nonce.
/// The provider authorization URL itself is assembled by the caller; token
/// exchange happens outside the core.
pub async fn oauth_start(
    State(state): State<SharedState>,
    axum::extract::Query(query): axum::extract::Query<OAuthStartQuery>,
) -> Result<Data<serde_json::Value>> {
    let nonce = auth::create_state(
        &state.db.pool,
        &json!({ "provider": query.provider, "redirect_uri": query.redirect_uri }),
    )
    .await?;
    Ok(Data(json!({ "state": nonce })))
}

#[derive(Deserialize)]
pub struct OAuthCallbackQuery {
    pub state: String,
}

/// `GET /api/auth/oauth/callback` (public) — consumes the state nonce
/// atomically. A replayed or expired state fails here before any token
/// exchange is attempted.
pub async fn oauth_callback(
    State(state): State<SharedState>,
    axum::extract::Query(query): axum::extract::Query<OAuthCallbackQuery>,
) -> Result<Data<serde_json::Value>> {
    let data = auth::validate_state(&state.db.pool, &query.state).await?;
    Ok(Data(json!({ "validated": true, "context": data })))
}

fn cookie_value(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "fazt_session").then(|| value.to_string())
    })
}
