//! App request serving
//!
//! Everything that arrives on an app host: `/api/*` goes to the runtime,
//! `/private/*` is auth-gated VFS streaming, `/__fazt/realtime/*` attaches
//! an SSE subscriber, and the rest is static file resolution.

use axum::{
    body::Body,
    http::{header, HeaderMap, Request, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::activity::Event;
use crate::apps::App;
use crate::auth;
use crate::error::Error;
use crate::runtime::bridge::BridgeUser;
use crate::runtime::JsRequest;
use crate::state::SharedState;
use crate::vfs::Resolved;

/// Serve one request against an app.
pub async fn serve(state: SharedState, app: App, req: Request<Body>) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    // X-Forwarded-For is honored only when the peer sits in a trusted
    // private range; otherwise the socket address is authoritative.
    let actor = req
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|info| {
            crate::http::auth_mw::client_ip(&req, info.0.ip(), &state.config.trusted_proxies)
                .to_string()
        });

    let response = route(state.clone(), &app, req).await;
    let status = response.status().as_u16();

    let mut event = Event::new("http", method.as_str().to_ascii_lowercase());
    event.app_id = Some(app.id.clone());
    event.actor = actor;
    event.path = Some(path);
    event.status = Some(status as i64);
    event.duration_ms = Some(started.elapsed().as_millis() as i64);
    state.activity.record(event);

    response
}

async fn route(state: SharedState, app: &App, req: Request<Body>) -> Response {
    let path = req.uri().path().to_string();

    if let Some(channel) = path.strip_prefix("/__fazt/realtime/") {
        return subscribe(state, app, channel.to_string());
    }
    if path.starts_with("/api/") || path == "/api" {
        return run_handler(state, app, req).await;
    }
    if path.starts_with("/private/") || path == "/private" {
        return serve_private(state, app, req).await;
    }

    if req.method() != axum::http::Method::GET && req.method() != axum::http::Method::HEAD {
        return Error::NotFound("only GET is served statically".to_string()).into_response();
    }
    match state.vfs.resolve_static(app, &path).await {
        Ok(Resolved::File(file)) => (
            [(header::CONTENT_TYPE, file.mime_type.clone())],
            file.bytes.to_vec(),
        )
            .into_response(),
        Ok(Resolved::Private) => {
            Error::Forbidden("private files require authentication".to_string()).into_response()
        }
        Ok(Resolved::Api) => run_handler(state, app, req).await,
        Ok(Resolved::NotFound) => (StatusCode::NOT_FOUND, "not found").into_response(),
        Err(e) => e.into_response(),
    }
}

/// Resolve the session cookie into a bridge user, when present.
async fn bridge_user(state: &SharedState, headers: &HeaderMap) -> Option<BridgeUser> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    let session_id = cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "fazt_session").then(|| value.to_string())
    })?;
    let session = auth::validate_session(&state.db.pool, &session_id).await.ok()?;
    let user = auth::get_user(&state.db.pool, &session.user_id).await.ok()??;
    Some(BridgeUser {
        id: user.id.clone(),
        username: user.username.clone(),
        role: user.role.clone(),
    })
}

async fn run_handler(state: SharedState, app: &App, req: Request<Body>) -> Response {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();

    let mut query = Map::new();
    if let Some(raw) = req.uri().query() {
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            query.insert(key.into_owned(), Value::String(value.into_owned()));
        }
    }

    let mut headers = Map::new();
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), Value::String(value.to_string()));
        }
    }

    let user = bridge_user(&state, req.headers()).await;

    let limit = state.limits.net.max_request_body as usize;
    let body = match axum::body::to_bytes(req.into_body(), limit).await {
        Ok(bytes) if bytes.is_empty() => None,
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(_) => {
            return Error::PayloadTooLarge("request body too large".to_string()).into_response()
        }
    };

    let js_request = JsRequest {
        method,
        path,
        query,
        headers,
        body,
        trigger: "http".to_string(),
        state: Value::Null,
    };

    match state.runtime.execute(app, js_request, user).await {
        Ok(response) => {
            let mut builder = Response::builder().status(response.status);
            for (name, value) in &response.headers {
                builder = builder.header(name, value);
            }
            builder
                .body(Body::from(response.body))
                .unwrap_or_else(|_| {
                    Error::Internal("response build failed".to_string()).into_response()
                })
        }
        Err(e) => e.into_response(),
    }
}

async fn serve_private(state: SharedState, app: &App, req: Request<Body>) -> Response {
    // Any valid session will do; private files are app-deployer content
    // for signed-in users, not per-user data.
    if bridge_user(&state, req.headers()).await.is_none() {
        return Error::Unauthorized("private files require a session".to_string()).into_response();
    }
    let rel = req.uri().path().trim_start_matches('/').trim_start_matches("private/");
    match state.vfs.read_private(&app.id, rel).await {
        Ok(Some(file)) => (
            [(header::CONTENT_TYPE, file.mime_type.clone())],
            file.bytes.to_vec(),
        )
            .into_response(),
        Ok(None) => Error::NotFound(format!("private/{rel}")).into_response(),
        Err(e) => e.into_response(),
    }
}

/// SSE subscription to an app-scoped realtime channel. A consumer that
/// lags past the ring capacity observes an error and its stream ends.
fn subscribe(state: SharedState, app: &App, channel: String) -> Response {
    let receiver = state.realtime.subscribe(&app.id, &channel);
    let stream = BroadcastStream::new(receiver)
        .take_while(|item| futures::future::ready(item.is_ok()))
        .map(|item| {
            let msg = item.expect("take_while guarantees ok");
            Ok::<_, std::convert::Infallible>(
                SseEvent::default().event(msg.channel).data(msg.data),
            )
        });
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// A JSON 404 used when no app matches the host.
pub fn unknown_host(host: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        axum::Json(json!({
            "error": { "code": "NOT_FOUND", "message": format!("no app for host {host}") }
        })),
    )
        .into_response()
}
