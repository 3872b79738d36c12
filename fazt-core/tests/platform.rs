//! End-to-end pipeline tests over a fully booted instance.

use axum::body::{to_bytes, Body};
use axum::http::Request;
use serde_json::{json, Value};
use std::io::Write as _;
use tower::util::ServiceExt;

async fn boot() -> (tempfile::TempDir, fazt_core::SharedState, axum::Router) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = fazt_core::BootConfig {
        db_path: dir.path().join("data.db"),
        ..Default::default()
    };
    let state = fazt_core::AppState::boot(config).await.expect("boot");
    let router = fazt_core::http::build(state.clone());
    (dir, state, router)
}

async fn call(router: &axum::Router, req: Request<Body>) -> (u16, Value, Option<String>) {
    let response = router.clone().oneshot(req).await.expect("infallible");
    let status = response.status().as_u16();
    let cookie = response
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").to_string());
    let bytes = to_bytes(response.into_body(), 1 << 22).await.expect("body");
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::String(
        String::from_utf8_lossy(&bytes).into_owned(),
    ));
    (status, body, cookie)
}

fn api(method: &str, path: &str, session: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("host", "admin.localhost")
        .header("content-type", "application/json");
    if let Some(session) = session {
        builder = builder.header("cookie", session);
    }
    match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Register the owner and return a session cookie.
async fn sign_in(router: &axum::Router) -> String {
    let (status, _, _) = call(
        router,
        api(
            "POST",
            "/api/auth/register",
            None,
            Some(json!({"username": "admin", "password": "correcthorse"})),
        ),
    )
    .await;
    assert_eq!(status, 200);

    let (status, body, cookie) = call(
        router,
        api(
            "POST",
            "/api/auth/login",
            None,
            Some(json!({"username": "admin", "password": "correcthorse"})),
        ),
    )
    .await;
    assert_eq!(status, 200);
    assert!(body["data"]["user_id"].as_str().unwrap().starts_with("fazt_usr_"));
    cookie.expect("session cookie")
}

fn make_zip(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buffer);
        let options = zip::write::SimpleFileOptions::default();
        for (path, content) in entries {
            writer.start_file(*path, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }
    buffer.into_inner()
}

async fn deploy(router: &axum::Router, session: &str, name: &str, archive: Vec<u8>) -> Value {
    let (_, _, _) = call(
        router,
        api("POST", "/api/apps", Some(session), Some(json!({"name": name}))),
    )
    .await;
    let req = Request::builder()
        .method("POST")
        .uri(format!("/api/apps/{name}/deploy"))
        .header("host", "admin.localhost")
        .header("content-type", "application/zip")
        .header("cookie", session)
        .body(Body::from(archive))
        .unwrap();
    let (status, body, _) = call(router, req).await;
    assert_eq!(status, 201, "deploy failed: {body}");
    body["data"].clone()
}

const MAIN_JS: &str = r#"
function handler(req) {
  if (req.path === '/api/ping') {
    respond(200, { ok: true });
    return;
  }
  if (req.path === '/api/ssrf') {
    try {
      fazt.net.fetch('http://127.0.0.1:8080/');
      respond(200, { code: 'NO_ERROR' });
    } catch (e) {
      respond(200, { code: e.code });
    }
    return;
  }
  if (req.path === '/api/later') {
    const id = fazt.schedule('1m', { n: 0 });
    respond(200, { id: id });
    return;
  }
  respond(404, { error: { code: 'NOT_FOUND', message: 'no route' } });
}
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deploy_and_serve_static() {
    let (_dir, _state, router) = boot().await;
    let session = sign_in(&router).await;

    deploy(
        &router,
        &session,
        "site",
        make_zip(&[("index.html", "hello"), ("api/main.js", MAIN_JS)]),
    )
    .await;

    let req = Request::builder()
        .method("GET")
        .uri("/")
        .header("host", "site.localhost")
        .body(Body::empty())
        .unwrap();
    let (status, body, _) = call(&router, req).await;
    assert_eq!(status, 200);
    assert_eq!(body, Value::String("hello".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_envelope() {
    let (_dir, _state, router) = boot().await;
    let session = sign_in(&router).await;
    deploy(
        &router,
        &session,
        "site",
        make_zip(&[("api/main.js", MAIN_JS)]),
    )
    .await;

    let req = Request::builder()
        .method("GET")
        .uri("/api/ping")
        .header("host", "site.localhost")
        .body(Body::empty())
        .unwrap();
    let (status, body, _) = call(&router, req).await;
    assert_eq!(status, 200, "handler failed: {body}");
    assert_eq!(body["data"]["ok"], true);
    // Envelope exclusivity.
    assert!(body.get("error").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ssrf_blocked_inside_js() {
    let (_dir, _state, router) = boot().await;
    let session = sign_in(&router).await;
    deploy(
        &router,
        &session,
        "site",
        make_zip(&[("api/main.js", MAIN_JS)]),
    )
    .await;

    let req = Request::builder()
        .method("GET")
        .uri("/api/ssrf")
        .header("host", "site.localhost")
        .body(Body::empty())
        .unwrap();
    let (status, body, _) = call(&router, req).await;
    assert_eq!(status, 200, "handler failed: {body}");
    assert_eq!(body["data"]["code"], "NET_BLOCKED");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_schedule_creates_hibernating_job() {
    let (_dir, state, router) = boot().await;
    let session = sign_in(&router).await;
    deploy(
        &router,
        &session,
        "site",
        make_zip(&[("api/main.js", MAIN_JS)]),
    )
    .await;

    let before = chrono_now();
    let req = Request::builder()
        .method("POST")
        .uri("/api/later")
        .header("host", "site.localhost")
        .body(Body::empty())
        .unwrap();
    let (status, body, _) = call(&router, req).await;
    assert_eq!(status, 200, "handler failed: {body}");
    let job_id = body["data"]["id"].as_str().expect("job id").to_string();

    let (wake_at, job_status): (i64, String) =
        sqlx::query_as("SELECT wake_at, status FROM jobs WHERE id = ?")
            .bind(&job_id)
            .fetch_one(&state.db.pool)
            .await
            .expect("job row");
    assert_eq!(job_status, "pending");
    assert!(wake_at >= before + 58 && wake_at <= before + 62);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deploy_idempotent() {
    let (_dir, _state, router) = boot().await;
    let session = sign_in(&router).await;

    let archive = || make_zip(&[("index.html", "v"), ("api/main.js", MAIN_JS)]);
    let first = deploy(&router, &session, "site", archive()).await;
    let second = deploy(&router, &session, "site", archive()).await;
    assert_eq!(first["source_commit"], second["source_commit"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_private_requires_session() {
    let (_dir, _state, router) = boot().await;
    let session = sign_in(&router).await;
    deploy(
        &router,
        &session,
        "site",
        make_zip(&[("private/config.json", "{\"k\":1}")]),
    )
    .await;

    let anonymous = Request::builder()
        .method("GET")
        .uri("/private/config.json")
        .header("host", "site.localhost")
        .body(Body::empty())
        .unwrap();
    let (status, body, _) = call(&router, anonymous).await;
    assert_eq!(status, 401, "expected unauthorized: {body}");

    let authed = Request::builder()
        .method("GET")
        .uri("/private/config.json")
        .header("host", "site.localhost")
        .header("cookie", &session)
        .body(Body::empty())
        .unwrap();
    let (status, body, _) = call(&router, authed).await;
    assert_eq!(status, 200, "expected file: {body}");
}

fn chrono_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}
