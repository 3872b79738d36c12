//! Authentication middleware
//!
//! Two credentials exist: the `fazt_session` cookie and
//! `Authorization: Bearer fazt_tok_*` API keys. The middleware resolves
//! whichever is present into an [`AuthContext`] request extension; the
//! `require_*` layers then gate access. Routes mounted outside the
//! `require_auth` layer (login, health, OAuth callback, webhooks) are the
//! explicit public whitelist.

use axum::{
    body::Body,
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::net::IpAddr;

use crate::auth::{self, Role, User};
use crate::error::Error;
use crate::state::SharedState;

/// Resolved caller identity.
#[derive(Clone)]
pub struct AuthContext {
    pub user: Option<User>,
    /// True when the credential was the fixed `FAZT_ADMIN_TOKEN`.
    pub admin_token: bool,
    /// Scope of the presented API key, when that was the credential.
    pub api_key_scope: Option<String>,
}

impl AuthContext {
    /// Effective role. The fixed admin token acts as owner; API keys grant
    /// admin only when minted with the admin scope.
    pub fn role(&self) -> Option<Role> {
        if self.admin_token {
            return Some(Role::Owner);
        }
        match self.api_key_scope.as_deref() {
            Some("admin") => return Some(Role::Admin),
            Some(_) => return Some(Role::User),
            None => {}
        }
        self.user.as_ref().map(User::role)
    }

    /// Whether any credential was presented and validated.
    pub fn authenticated(&self) -> bool {
        self.admin_token || self.api_key_scope.is_some() || self.user.is_some()
    }
}

/// Extract the session id from the cookie header.
fn session_cookie(req: &Request<Body>) -> Option<String> {
    let cookies = req.headers().get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == "fazt_session").then(|| value.to_string())
    })
}

/// Extract a bearer token.
fn bearer(req: &Request<Body>) -> Option<String> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::to_string)
}

/// Resolve credentials into an `AuthContext` extension. Never rejects by
/// itself; the `require_*` layers do.
pub async fn resolve(
    State(state): State<SharedState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let mut ctx = AuthContext { user: None, admin_token: false, api_key_scope: None };

    if let Some(token) = bearer(&req) {
        if state
            .config
            .admin_token
            .as_deref()
            .map(|fixed| constant_eq(fixed, &token))
            .unwrap_or(false)
        {
            ctx.admin_token = true;
        } else if let Ok(key) = auth::verify_api_key(&state.db.pool, &token).await {
            tracing::debug!(key = %key.id, scope = %key.scope, "api key accepted");
            ctx.api_key_scope = Some(key.scope);
        }
    } else if let Some(session_id) = session_cookie(&req) {
        if let Ok(session) = auth::validate_session(&state.db.pool, &session_id).await {
            if let Ok(Some(user)) = auth::get_user(&state.db.pool, &session.user_id).await {
                ctx.user = Some(user);
            }
        }
    }

    req.extensions_mut().insert(ctx);
    next.run(req).await
}

/// Reject anonymous requests.
pub async fn require_auth(req: Request<Body>, next: Next) -> Response {
    let authed = req
        .extensions()
        .get::<AuthContext>()
        .map(AuthContext::authenticated)
        .unwrap_or(false);
    if !authed {
        return Error::Unauthorized("authentication required".to_string()).into();
    }
    next.run(req).await
}

/// Reject callers below admin.
pub async fn require_admin(req: Request<Body>, next: Next) -> Response {
    let role = req.extensions().get::<AuthContext>().and_then(AuthContext::role);
    match role {
        Some(role) if role.at_least(Role::Admin) => next.run(req).await,
        Some(_) => Error::Forbidden("admin role required".to_string()).into(),
        None => Error::Unauthorized("authentication required".to_string()).into(),
    }
}

impl From<Error> for Response {
    fn from(e: Error) -> Self {
        use axum::response::IntoResponse;
        e.into_response()
    }
}

/// The client address, honoring X-Forwarded-For only from trusted ranges.
pub fn client_ip(req: &Request<Body>, peer: IpAddr, trusted: &[String]) -> IpAddr {
    let trusted_peer = trusted.iter().any(|cidr| cidr_contains(cidr, peer));
    if !trusted_peer {
        return peer;
    }
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(peer)
}

/// Minimal IPv4 CIDR membership; IPv6 peers only match exact entries.
fn cidr_contains(cidr: &str, ip: IpAddr) -> bool {
    let Some((base, bits)) = cidr.split_once('/') else {
        return cidr.parse::<IpAddr>().map(|c| c == ip).unwrap_or(false);
    };
    let (Ok(base), Ok(bits)) = (base.parse::<IpAddr>(), bits.parse::<u32>()) else {
        return false;
    };
    match (base, ip) {
        (IpAddr::V4(base), IpAddr::V4(ip)) => {
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits.min(32)) };
            (u32::from(base) & mask) == (u32::from(ip) & mask)
        }
        _ => false,
    }
}

/// Length-independent comparison for the fixed admin token.
fn constant_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_contains() {
        assert!(cidr_contains("10.0.0.0/8", "10.1.2.3".parse().unwrap()));
        assert!(!cidr_contains("10.0.0.0/8", "11.0.0.1".parse().unwrap()));
        assert!(cidr_contains("127.0.0.0/8", "127.0.0.1".parse().unwrap()));
        assert!(!cidr_contains("192.168.0.0/16", "192.169.0.1".parse().unwrap()));
    }

    #[test]
    fn test_constant_eq() {
        assert!(constant_eq("secret", "secret"));
        assert!(!constant_eq("secret", "secreT"));
        assert!(!constant_eq("secret", "longer-secret"));
    }

    #[test]
    fn test_client_ip_untrusted_peer_ignores_xff() {
        let req = Request::builder()
            .header("x-forwarded-for", "1.2.3.4")
            .body(Body::empty())
            .unwrap();
        let peer: IpAddr = "8.8.8.8".parse().unwrap();
        let trusted = vec!["127.0.0.0/8".to_string()];
        assert_eq!(client_ip(&req, peer, &trusted), peer);
    }

    #[test]
    fn test_client_ip_trusted_peer_uses_xff() {
        let req = Request::builder()
            .header("x-forwarded-for", "1.2.3.4, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        let peer: IpAddr = "127.0.0.1".parse().unwrap();
        let trusted = vec!["127.0.0.0/8".to_string()];
        assert_eq!(client_ip(&req, peer, &trusted), "1.2.3.4".parse::<IpAddr>().unwrap());
    }
}
