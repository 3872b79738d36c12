//! Serverless JS runtime
//!
//! Executes each app's `api/main.js` in a fresh, sandboxed isolate with the
//! injected `fazt.*` namespace. The pool is an admission semaphore sized by
//! CPU cores: acquisition blocks for a short window, then fails retryably.
//! Each execution gets a wall-clock [`budget::Budget`] that storage and
//! egress admission consult.

pub mod budget;
pub mod bridge;
mod isolate;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde_json::{json, Map, Value};
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::activity::{ActivityLog, Event};
use crate::apps::{self, App};
use crate::error::{Error, Result};
use crate::limits::Limits;
use crate::net::EgressProxy;
use crate::realtime::RealtimeBus;
use crate::scheduler::workers::{WorkerCtx, WorkerExecutor, WorkerPool};
use crate::scheduler::{JobExecutor, Scheduler};
use crate::storage::Storage;
use crate::vfs::Vfs;

use budget::Budget;
use bridge::{BridgeUser, HostBridge};

/// How long acquisition may block before failing retryably.
const ADMISSION_WINDOW: Duration = Duration::from_secs(1);

/// Grace past the budget deadline before the interrupt fires.
const INTERRUPT_GRACE: Duration = Duration::from_millis(500);

/// A request as seen by JS.
#[derive(Debug, serde::Serialize)]
pub struct JsRequest {
    pub method: String,
    pub path: String,
    pub query: Map<String, Value>,
    pub headers: Map<String, Value>,
    pub body: Option<String>,
    pub trigger: String,
    pub state: Value,
}

impl JsRequest {
    /// A synthetic request for scheduler wake-ups.
    pub fn for_schedule(state: Value) -> Self {
        Self {
            method: "POST".to_string(),
            path: "/api/__schedule".to_string(),
            query: Map::new(),
            headers: Map::new(),
            body: None,
            trigger: "schedule".to_string(),
            state,
        }
    }
}

/// The response produced by a JS execution.
#[derive(Debug)]
pub struct JsResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// The runtime singleton.
pub struct Runtime {
    pub db: sqlx::SqlitePool,
    pub vfs: Arc<Vfs>,
    pub storage: Storage,
    pub scheduler: Scheduler,
    pub realtime: Arc<RealtimeBus>,
    pub activity: ActivityLog,
    pub proxy: Arc<EgressProxy>,
    pub limits: Arc<Limits>,
    admission: Arc<Semaphore>,
    workers: OnceCell<Arc<WorkerPool>>,
}

impl Runtime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: sqlx::SqlitePool,
        vfs: Arc<Vfs>,
        storage: Storage,
        scheduler: Scheduler,
        realtime: Arc<RealtimeBus>,
        activity: ActivityLog,
        proxy: Arc<EgressProxy>,
        limits: Arc<Limits>,
    ) -> Arc<Self> {
        let admission = Arc::new(Semaphore::new(limits.isolate_pool_size()));
        Arc::new(Self {
            db,
            vfs,
            storage,
            scheduler,
            realtime,
            activity,
            proxy,
            limits,
            admission,
            workers: OnceCell::new(),
        })
    }

    /// Wire the worker pool after construction (it needs the runtime as its
    /// executor).
    pub fn set_workers(&self, workers: Arc<WorkerPool>) {
        let _ = self.workers.set(workers);
    }

    /// Execute an app's handler for one request.
    pub async fn execute(
        &self,
        app: &App,
        request: JsRequest,
        user: Option<BridgeUser>,
    ) -> Result<JsResponse> {
        let permit = tokio::time::timeout(ADMISSION_WINDOW, self.admission.clone().acquire_owned())
            .await
            .map_err(|_| Error::Unavailable("isolate pool is saturated".to_string()))?
            .map_err(|_| Error::Internal("isolate pool closed".to_string()))?;

        let source = self
            .vfs
            .read(&app.id, "api/main.js")
            .await?
            .ok_or_else(|| Error::NotFound("app has no api/main.js".to_string()))?;
        let source = String::from_utf8_lossy(&source.bytes).into_owned();

        let budget = Budget::new(self.limits.runtime.exec_timeout());
        let deadline = Instant::now() + budget.window() + INTERRUPT_GRACE;
        let bridge = self.bridge(app.clone(), user, budget, None);

        let request_json = serde_json::to_string(&request)
            .map_err(|e| Error::Internal(e.to_string()))?;

        let bridge_for_run = bridge.clone();
        let started = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || {
            isolate::run(
                &source,
                isolate::IsolateJob::Http { request_json },
                &bridge_for_run,
                Some(deadline),
                None,
            )
        })
        .await
        .map_err(|e| Error::Internal(format!("isolate task panicked: {e}")))?;
        drop(permit);

        self.persist_console(app, &bridge, started.elapsed(), &request.path);

        let raw = outcome?.ok_or_else(|| Error::Internal("dispatch returned nothing".to_string()))?;
        parse_response(&raw)
    }

    fn bridge(
        &self,
        app: App,
        user: Option<BridgeUser>,
        budget: Budget,
        worker_ctx: Option<WorkerCtx>,
    ) -> Arc<HostBridge> {
        Arc::new(HostBridge {
            app,
            user,
            budget,
            handle: tokio::runtime::Handle::current(),
            limits: self.limits.clone(),
            storage: self.storage.clone(),
            vfs: self.vfs.clone(),
            proxy: self.proxy.clone(),
            scheduler: self.scheduler.clone(),
            workers: self.workers.get().cloned(),
            realtime: self.realtime.clone(),
            activity: self.activity.clone(),
            db: self.db.clone(),
            console: Mutex::new(Vec::new()),
            net_calls: AtomicU32::new(0),
            worker_ctx,
        })
    }

    fn persist_console(
        &self,
        app: &App,
        bridge: &HostBridge,
        elapsed: Duration,
        path: &str,
    ) {
        let lines = bridge.take_console();
        if lines.is_empty() {
            return;
        }
        let details: Vec<Value> = lines
            .into_iter()
            .map(|line| json!({ "level": line.level, "message": line.message }))
            .collect();
        let mut event = Event::new("runtime", "console");
        event.app_id = Some(app.id.clone());
        event.path = Some(path.to_string());
        event.duration_ms = Some(elapsed.as_millis() as i64);
        event.details = Some(Value::Array(details));
        self.activity.record(event);
    }
}

fn parse_response(raw: &str) -> Result<JsResponse> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| Error::Internal(format!("malformed dispatch result: {e}")))?;
    let status = value
        .get("status")
        .and_then(Value::as_u64)
        .filter(|s| (100..600).contains(s))
        .ok_or_else(|| Error::Internal("dispatch result missing status".to_string()))?
        as u16;
    let headers = value
        .get("headers")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(name, v)| v.as_str().map(|v| (name.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();
    let body = value
        .get("body")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .as_bytes()
        .to_vec();
    Ok(JsResponse { status, headers, body })
}

#[async_trait]
impl JobExecutor for Runtime {
    async fn execute_job(
        &self,
        app_id: &str,
        job_id: &str,
        state: Value,
    ) -> std::result::Result<(), String> {
        let app = apps::get(&self.db, app_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("app {app_id} is gone"))?;
        tracing::debug!(app = %app.name, job = %job_id, "waking scheduled job");
        self.execute(&app, JsRequest::for_schedule(state), None)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl WorkerExecutor for Runtime {
    async fn run_worker(&self, ctx: WorkerCtx) -> std::result::Result<(), String> {
        let app = apps::get(&self.db, &ctx.app_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("app {} is gone", ctx.app_id))?;

        let source = self
            .vfs
            .read(&app.id, &ctx.code_path)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("worker module {} missing", ctx.code_path))?;
        let source = String::from_utf8_lossy(&source.bytes).into_owned();

        // Daemons run unbounded; plain workers may carry a timeout in
        // their config (milliseconds).
        let timeout = ctx
            .config
            .get("timeout")
            .and_then(Value::as_u64)
            .map(Duration::from_millis);
        let window = timeout.unwrap_or(Duration::from_secs(60 * 60 * 24 * 365));
        let budget = Budget::new(window);
        let deadline = timeout.map(|t| Instant::now() + t + INTERRUPT_GRACE);

        let info_json = json!({ "id": ctx.job_id, "config": ctx.config }).to_string();
        let cancel = ctx.cancelled.clone();
        let bridge = self.bridge(app.clone(), None, budget, Some(ctx));

        let bridge_for_run = bridge.clone();
        let started = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || {
            isolate::run(
                &source,
                isolate::IsolateJob::Worker { info_json },
                &bridge_for_run,
                deadline,
                Some(cancel),
            )
        })
        .await
        .map_err(|e| format!("worker task panicked: {e}"))?;

        self.persist_console(&app, &bridge, started.elapsed(), "worker");

        outcome.map(|_| ()).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response() {
        let raw = r#"{"status":200,"headers":{"content-type":"application/json"},"body":"{\"data\":{\"ok\":true}}"}"#;
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.headers[0].0, "content-type");
        assert_eq!(resp.body, br#"{"data":{"ok":true}}"#);
    }

    #[test]
    fn test_parse_response_rejects_bad_status() {
        assert!(parse_response(r#"{"status":9999,"body":""}"#).is_err());
        assert!(parse_response("not json").is_err());
    }

    #[test]
    fn test_schedule_request_shape() {
        let req = JsRequest::for_schedule(json!({"n": 1}));
        assert_eq!(req.trigger, "schedule");
        assert_eq!(req.state, json!({"n": 1}));
    }
}
