//! Request pipeline
//!
//! The root service inspects `Host` and dispatches: `admin.<root>` (and
//! loopback) to the admin surface, the bare root to the welcome app, name
//! subdomains and custom domains to their apps. The admin API is a regular
//! axum router layered with the auth middlewares; app traffic goes through
//! [`app_host`].

pub mod app_host;
pub mod auth_mw;
pub mod envelope;
pub mod handlers;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Request, State},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use tower::util::ServiceExt;

use crate::apps::{self, SYSTEM_ADMIN, SYSTEM_WELCOME};
use crate::net::allowlist::canonical_host;
use crate::state::SharedState;
use handlers::{analytics, apps as app_handlers, auth as auth_handlers, mcp, net_admin, sql, system};

/// Build the root service.
pub fn build(state: SharedState) -> Router {
    let admin = admin_router(state.clone());
    Router::new()
        .fallback(dispatch)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::catch_panic::CatchPanicLayer::custom(panic_response))
        .with_state(DispatchState { state, admin })
}

/// A panicking handler becomes a plain envelope; the process carries on.
fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("panic");
    tracing::error!(detail, "request handler panicked");
    crate::error::Error::Internal("handler panicked".to_string()).into_response()
}

#[derive(Clone)]
struct DispatchState {
    state: SharedState,
    admin: Router,
}

/// Where a host resolves.
enum Target {
    Admin,
    App(String),
    Unknown,
}

async fn resolve_target(state: &SharedState, host: &str) -> Target {
    let root = state.config.root_domain.to_ascii_lowercase();

    if host == format!("admin.{root}") || host == "localhost" || host == "127.0.0.1" {
        return Target::Admin;
    }
    if host == root || host == format!("root.{root}") || host == format!("www.{root}") {
        return Target::App(SYSTEM_WELCOME.to_string());
    }

    if let Some(name) = host.strip_suffix(&format!(".{root}")) {
        // Name subdomain first, then an app-id subdomain (dev routes).
        if let Ok(Some(app)) = apps::get_by_name(&state.db.pool, name).await {
            return Target::App(app.id);
        }
        if let Ok(Some(app)) = apps::get(&state.db.pool, name).await {
            return Target::App(app.id);
        }
        return Target::Unknown;
    }

    match apps::get_by_alias(&state.db.pool, host).await {
        Ok(Some(app)) => Target::App(app.id),
        _ => Target::Unknown,
    }
}

async fn dispatch(State(ds): State<DispatchState>, req: Request<Body>) -> Response {
    let host = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let host = canonical_host(host);

    match resolve_target(&ds.state, &host).await {
        Target::Admin => {
            let path = req.uri().path();
            if path.starts_with("/api/") || path.starts_with("/mcp/") {
                match ds.admin.clone().oneshot(req).await {
                    Ok(response) => response,
                    Err(never) => match never {},
                }
            } else {
                // The admin UI shell is a pinned system app.
                match apps::get(&ds.state.db.pool, SYSTEM_ADMIN).await {
                    Ok(Some(app)) => app_host::serve(ds.state.clone(), app, req).await,
                    _ => app_host::unknown_host(&host),
                }
            }
        }
        Target::App(app_id) => match apps::get(&ds.state.db.pool, &app_id).await {
            Ok(Some(app)) => app_host::serve(ds.state.clone(), app, req).await,
            _ => app_host::unknown_host(&host),
        },
        Target::Unknown => app_host::unknown_host(&host),
    }
}

/// The admin API: public whitelist, authenticated surface, admin-only
/// surface, all behind the credential-resolving middleware.
fn admin_router(state: SharedState) -> Router {
    let public = Router::new()
        .route("/api/auth/login", post(auth_handlers::login))
        .route("/api/auth/register", post(auth_handlers::register))
        .route("/api/auth/status", get(auth_handlers::status))
        .route("/api/auth/oauth/start", get(auth_handlers::oauth_start))
        .route("/api/auth/oauth/callback", get(auth_handlers::oauth_callback))
        .route("/api/system/health", get(system::health));

    let authed = Router::new()
        .route("/api/auth/logout", post(auth_handlers::logout))
        .route("/api/auth/me", get(auth_handlers::me))
        .route("/api/apps", get(app_handlers::list).post(app_handlers::create))
        .route(
            "/api/apps/{id}",
            get(app_handlers::get).delete(app_handlers::delete),
        )
        .route(
            "/api/apps/{id}/deploy",
            post(app_handlers::deploy)
                .layer(DefaultBodyLimit::max(state.limits.storage.max_site_size as usize)),
        )
        .route(
            "/api/apps/{id}/deploy/multipart",
            post(app_handlers::deploy_multipart)
                .layer(DefaultBodyLimit::max(state.limits.storage.max_site_size as usize)),
        )
        .route("/api/apps/{id}/files", get(app_handlers::files))
        .route("/api/apps/{id}/files/{*path}", get(app_handlers::file_content))
        .route(
            "/api/apps/{id}/domains",
            get(app_handlers::list_domains).post(app_handlers::add_domain),
        )
        .route("/api/apps/{id}/domains/{domain}", delete(app_handlers::remove_domain))
        .route(
            "/api/apps/{id}/env",
            get(app_handlers::list_env).put(app_handlers::set_env),
        )
        .route("/api/apps/{id}/env/{name}", delete(app_handlers::delete_env))
        .route(
            "/api/apps/{id}/keys",
            get(app_handlers::list_keys).post(app_handlers::create_key),
        )
        .route("/api/apps/{id}/keys/{key_id}", delete(app_handlers::revoke_key))
        .route("/api/apps/{id}/logs", get(app_handlers::logs))
        .route("/api/apps/{id}/jobs", get(app_handlers::jobs))
        .route("/api/system/limits", get(system::limits))
        .route("/api/system/limits/schema", get(system::limits_schema))
        .route("/api/system/capacity", get(system::capacity))
        .route("/api/analytics/events", get(analytics::events))
        .route("/api/analytics/stats", get(analytics::stats))
        .route("/mcp/initialize", post(mcp::initialize))
        .route("/mcp/tools/list", post(mcp::tools_list))
        .route("/mcp/tools/call", post(mcp::tools_call))
        .layer(middleware::from_fn(auth_mw::require_auth));

    let admin_only = Router::new()
        .route("/api/auth/invites", post(auth_handlers::create_invite))
        .route("/api/auth/users", get(auth_handlers::list_users))
        .route("/api/auth/users/{id}/role", put(auth_handlers::set_role))
        .route("/api/system/config", get(system::config_list))
        .route(
            "/api/system/config/{key}",
            put(system::config_set).delete(system::config_delete),
        )
        .route("/api/system/vacuum", post(system::vacuum))
        .route("/api/system/prune", post(system::prune))
        .route("/api/sql", post(sql::execute))
        .route(
            "/api/net/allowlist",
            get(net_admin::allowlist_list).post(net_admin::allowlist_add),
        )
        .route("/api/net/allowlist/{id}", delete(net_admin::allowlist_remove))
        .route(
            "/api/net/secrets",
            get(net_admin::secrets_list).put(net_admin::secrets_set),
        )
        .route("/api/net/secrets/{name}", delete(net_admin::secrets_remove))
        .route("/api/net/logs", get(net_admin::logs))
        .route(
            "/api/net/cache",
            get(net_admin::cache_stats).delete(net_admin::cache_clear),
        )
        .layer(middleware::from_fn(auth_mw::require_admin));

    Router::new()
        .merge(public)
        .merge(authed)
        .merge(admin_only)
        .fallback(api_not_found)
        .layer(middleware::from_fn_with_state(state.clone(), auth_mw::resolve))
        .with_state(state)
}

async fn api_not_found() -> Response {
    crate::error::Error::NotFound("no such endpoint".to_string()).into_response()
}
