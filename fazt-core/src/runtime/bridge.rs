//! Host bridge
//!
//! The single `__host_call(name, payload)` entry point injected into every
//! isolate. Payloads and results are JSON strings; results are either
//! `{"ok": value}` or `{"err": {code, message, retryable, retryAfter?}}`,
//! which the bootstrap prelude re-throws as JS errors carrying `code`.
//!
//! The isolate runs on a blocking thread; async subsystems are reached with
//! `Handle::block_on`, which also means a host call completes (and its
//! writes commit) before control returns to JS — read-your-writes for free.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::activity::{ActivityLog, Event};
use crate::apps::{self, App};
use crate::error::{Error, Result};
use crate::limits::Limits;
use crate::net::{EgressProxy, FetchOptions};
use crate::realtime::RealtimeBus;
use crate::scheduler::workers::{WorkerCtx, WorkerPool};
use crate::scheduler::{parse_delay, Scheduler};
use crate::storage::{FindOptions, Scope, Storage};
use crate::vfs::Vfs;

use super::budget::Budget;

/// Max console lines captured per execution.
const MAX_CONSOLE_LINES: usize = 200;

/// Max length of one captured console line.
const MAX_CONSOLE_LINE_LEN: usize = 4096;

/// The authenticated caller, as exposed to JS.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeUser {
    pub id: String,
    pub username: String,
    pub role: String,
}

/// A captured console line.
#[derive(Debug, Clone)]
pub struct ConsoleLine {
    pub level: String,
    pub message: String,
}

/// Everything a host call can reach.
pub struct HostBridge {
    pub app: App,
    pub user: Option<BridgeUser>,
    pub budget: Budget,
    pub handle: tokio::runtime::Handle,
    pub limits: Arc<Limits>,
    pub storage: Storage,
    pub vfs: Arc<Vfs>,
    pub proxy: Arc<EgressProxy>,
    pub scheduler: Scheduler,
    pub workers: Option<Arc<WorkerPool>>,
    pub realtime: Arc<RealtimeBus>,
    pub activity: ActivityLog,
    pub db: sqlx::SqlitePool,
    pub console: Mutex<Vec<ConsoleLine>>,
    pub net_calls: AtomicU32,
    /// Present only inside worker executions.
    pub worker_ctx: Option<WorkerCtx>,
}

impl HostBridge {
    /// Dispatch one host call. Never panics; every failure becomes the
    /// error envelope.
    pub fn dispatch(&self, name: &str, payload: &str) -> String {
        let payload: Value = serde_json::from_str(payload).unwrap_or(Value::Null);
        match self.dispatch_inner(name, &payload) {
            Ok(value) => json!({ "ok": value }).to_string(),
            Err(error) => {
                let (code, message, retryable, retry_after) = match &error {
                    Error::Net(net) => (
                        net.code,
                        net.message.clone(),
                        net.retryable,
                        net.retry_after_secs,
                    ),
                    other => (
                        other.kind().code(),
                        other.to_string(),
                        other.retryable(),
                        None,
                    ),
                };
                let mut err = json!({
                    "code": code,
                    "message": message,
                    "retryable": retryable,
                });
                if let Some(secs) = retry_after {
                    err["retryAfter"] = json!(secs);
                }
                json!({ "err": err }).to_string()
            }
        }
    }

    fn dispatch_inner(&self, name: &str, payload: &Value) -> Result<Value> {
        match name {
            "console" => self.op_console(payload),
            "app.info" => Ok(json!({ "id": self.app.id, "name": self.app.name })),
            "env.get" => self.op_env_get(payload),
            "auth.user" => Ok(match &self.user {
                Some(user) => serde_json::to_value(user).unwrap_or(Value::Null),
                None => Value::Null,
            }),
            "module.source" => self.op_module_source(payload),

            "private.read" => self.op_private_read(payload),
            "private.exists" => self.op_private_exists(payload),
            "private.list" => {
                let listed = self.block_on(self.vfs.list_private(&self.app.id))?;
                Ok(json!(listed))
            }

            "net.fetch" => self.op_net_fetch(payload),

            "schedule" => self.op_schedule(payload),
            "schedule.cancel" => {
                let id = str_field(payload, "id")?;
                self.block_on(self.scheduler.cancel(&self.app.id, &id))?;
                Ok(Value::Null)
            }
            "schedule.jobs" => {
                let jobs = self.block_on(self.scheduler.list(&self.app.id))?;
                Ok(serde_json::to_value(jobs).map_err(|e| Error::Internal(e.to_string()))?)
            }

            "worker.spawn" => self.op_worker_spawn(payload),
            "worker.cancel" => {
                let id = str_field(payload, "id")?;
                let workers = self.workers()?;
                self.block_on(workers.cancel(&id))?;
                Ok(Value::Null)
            }
            "worker.list" => {
                let workers = self.workers()?;
                let jobs = self.block_on(workers.list(&self.app.id))?;
                Ok(serde_json::to_value(jobs).map_err(|e| Error::Internal(e.to_string()))?)
            }

            "realtime.broadcast" => {
                let channel = str_field(payload, "channel")?;
                let msg = payload.get("msg").cloned().unwrap_or(Value::Null);
                let count = self.realtime.broadcast(&self.app.id, &channel, msg.to_string());
                Ok(json!(count))
            }

            "analytics.track" => {
                let event_name = str_field(payload, "event")?;
                let mut event = Event::new("analytics", event_name);
                event.app_id = Some(self.app.id.clone());
                event.user_id = self.user.as_ref().map(|u| u.id.clone());
                event.details = payload.get("props").cloned();
                self.activity.record(event);
                Ok(Value::Null)
            }

            "job.progress" => {
                let ctx = self.worker()?;
                let fraction = payload.get("fraction").and_then(Value::as_f64).unwrap_or(0.0);
                self.block_on(ctx.progress(fraction))?;
                Ok(Value::Null)
            }
            "job.checkpoint" => {
                let ctx = self.worker()?;
                let state = payload.get("state").cloned().unwrap_or(Value::Null);
                self.block_on(ctx.checkpoint(&state))?;
                Ok(Value::Null)
            }
            "job.getCheckpoint" => {
                let ctx = self.worker()?;
                Ok(self.block_on(ctx.get_checkpoint())?.unwrap_or(Value::Null))
            }
            "job.cancelled" => {
                let ctx = self.worker()?;
                Ok(json!(ctx.cancelled.is_cancelled()))
            }
            "job.sleep" => self.op_job_sleep(payload),

            _ if name.starts_with("app.") || name.starts_with("user.") => {
                self.op_storage(name, payload)
            }

            other => Err(Error::BadRequest(format!("unknown host call: {other}"))),
        }
    }

    // ------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }

    fn scope_for(&self, name: &str) -> Result<Scope> {
        if name.starts_with("user.") {
            let user = self
                .user
                .as_ref()
                .ok_or_else(|| Error::Unauthorized("fazt.app.user.* requires a session".to_string()))?;
            Ok(Scope::User(user.id.clone()))
        } else {
            Ok(Scope::Shared)
        }
    }

    fn worker(&self) -> Result<&WorkerCtx> {
        self.worker_ctx
            .as_ref()
            .ok_or_else(|| Error::BadRequest("job.* is only available inside workers".to_string()))
    }

    fn workers(&self) -> Result<Arc<WorkerPool>> {
        self.workers
            .clone()
            .ok_or_else(|| Error::Internal("worker pool not wired".to_string()))
    }

    // ------------------------------------------------------------------
    // ops
    // ------------------------------------------------------------------

    fn op_console(&self, payload: &Value) -> Result<Value> {
        let level = payload.get("level").and_then(Value::as_str).unwrap_or("log").to_string();
        let mut message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        message.truncate(MAX_CONSOLE_LINE_LEN);
        let mut lines = self.console.lock().expect("console buffer poisoned");
        if lines.len() < MAX_CONSOLE_LINES {
            lines.push(ConsoleLine { level, message });
        }
        Ok(Value::Null)
    }

    fn op_env_get(&self, payload: &Value) -> Result<Value> {
        let name = str_field(payload, "name")?;
        let value = self.block_on(apps::get_env(&self.db, &self.app.id, &name))?;
        Ok(value.map(Value::String).unwrap_or(Value::Null))
    }

    fn op_module_source(&self, payload: &Value) -> Result<Value> {
        let path = str_field(payload, "path")?;
        if !path.starts_with("api/") || path.contains("..") {
            return Err(Error::BadRequest(format!("module outside api/: {path}")));
        }
        let file = self
            .block_on(self.vfs.read(&self.app.id, &path))?
            .ok_or_else(|| Error::NotFound(format!("module {path}")))?;
        Ok(Value::String(String::from_utf8_lossy(&file.bytes).into_owned()))
    }

    fn op_private_read(&self, payload: &Value) -> Result<Value> {
        let path = str_field(payload, "path")?;
        let file = self.block_on(self.vfs.read_private(&self.app.id, &path))?;
        Ok(match file {
            Some(file) => Value::String(String::from_utf8_lossy(&file.bytes).into_owned()),
            None => Value::Null,
        })
    }

    fn op_private_exists(&self, payload: &Value) -> Result<Value> {
        let path = str_field(payload, "path")?;
        let file = self.block_on(self.vfs.read_private(&self.app.id, &path))?;
        Ok(json!(file.is_some()))
    }

    fn op_net_fetch(&self, payload: &Value) -> Result<Value> {
        if self.worker_ctx.is_some() {
            return Err(Error::Forbidden("workers have no egress access".to_string()));
        }
        let calls = self.net_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if calls > self.limits.net.max_calls {
            return Err(crate::error::NetError::limit(format!(
                "request exceeded {} outbound calls",
                self.limits.net.max_calls
            ))
            .into());
        }

        let url = str_field(payload, "url")?;
        let mut opts = FetchOptions {
            method: payload.get("method").and_then(Value::as_str).map(str::to_string),
            auth: payload.get("auth").and_then(Value::as_str).map(str::to_string),
            ..Default::default()
        };
        if let Some(headers) = payload.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    opts.headers.push((name.clone(), value.to_string()));
                }
            }
        }
        if let Some(body) = payload.get("body").and_then(Value::as_str) {
            opts.body = Some(body.as_bytes().to_vec());
        }

        let response = self
            .block_on(self.proxy.fetch(&self.app.id, &url, opts, &self.budget))
            .map_err(Error::Net)?;

        let headers: serde_json::Map<String, Value> = response
            .headers
            .into_iter()
            .map(|(name, value)| (name, Value::String(value)))
            .collect();
        Ok(json!({
            "status": response.status,
            "headers": headers,
            "body": String::from_utf8_lossy(&response.body).into_owned(),
            "fromCache": response.from_cache,
        }))
    }

    fn op_schedule(&self, payload: &Value) -> Result<Value> {
        let delay = parse_delay(payload.get("delay").unwrap_or(&Value::Null))?;
        let state = payload.get("state").cloned().unwrap_or(Value::Null);
        let id = self.block_on(self.scheduler.schedule(&self.app.id, delay, &state))?;
        Ok(Value::String(id))
    }

    fn op_worker_spawn(&self, payload: &Value) -> Result<Value> {
        let path = str_field(payload, "path")?;
        let opts = payload.get("opts").cloned().unwrap_or(json!({}));
        let workers = self.workers()?;
        let id = self.block_on(workers.spawn(&self.app.id, &path, opts))?;
        Ok(Value::String(id))
    }

    fn op_job_sleep(&self, payload: &Value) -> Result<Value> {
        let ctx = self.worker()?;
        let ms = payload.get("ms").and_then(Value::as_u64).unwrap_or(0);
        let deadline = std::time::Instant::now() + Duration::from_millis(ms);
        // Sleep in slices so cancellation interrupts promptly.
        while std::time::Instant::now() < deadline {
            if ctx.cancelled.is_cancelled() {
                break;
            }
            std::thread::sleep(Duration::from_millis(25).min(
                deadline.saturating_duration_since(std::time::Instant::now()),
            ));
        }
        Ok(Value::Null)
    }

    fn op_storage(&self, name: &str, payload: &Value) -> Result<Value> {
        let scope = self.scope_for(name)?;
        let op = name.split_once('.').map(|(_, rest)| rest).unwrap_or(name);
        let app_id = &self.app.id;

        match op {
            "kv.set" => {
                let key = str_field(payload, "key")?;
                let value = payload.get("value").cloned().unwrap_or(Value::Null);
                let ttl = payload.get("ttl").and_then(Value::as_u64);
                self.block_on(self.storage.kv_set(app_id, &scope, &key, &value, ttl))?;
                Ok(Value::Null)
            }
            "kv.get" => {
                let key = str_field(payload, "key")?;
                Ok(self
                    .block_on(self.storage.kv_get(app_id, &scope, &key))?
                    .unwrap_or(Value::Null))
            }
            "kv.delete" => {
                let key = str_field(payload, "key")?;
                self.block_on(self.storage.kv_delete(app_id, &scope, &key))?;
                Ok(Value::Null)
            }
            "kv.list" => {
                let prefix = payload.get("prefix").and_then(Value::as_str).unwrap_or("");
                let keys = self.block_on(self.storage.kv_list(app_id, &scope, prefix))?;
                Ok(json!(keys))
            }

            "ds.insert" => {
                let collection = str_field(payload, "collection")?;
                let doc = payload.get("doc").cloned().unwrap_or(Value::Null);
                self.block_on(self.storage.ds_insert(app_id, &scope, &collection, doc))
            }
            "ds.find" => {
                let collection = str_field(payload, "collection")?;
                let filter = payload.get("filter").cloned().unwrap_or(json!({}));
                let opts = FindOptions::from_value(payload.get("opts").unwrap_or(&Value::Null));
                let docs =
                    self.block_on(self.storage.ds_find(app_id, &scope, &collection, &filter, &opts))?;
                Ok(Value::Array(docs))
            }
            "ds.findOne" => {
                let collection = str_field(payload, "collection")?;
                let filter = payload.get("filter").cloned().unwrap_or(json!({}));
                Ok(self
                    .block_on(self.storage.ds_find_one(app_id, &scope, &collection, &filter))?
                    .unwrap_or(Value::Null))
            }
            "ds.update" => {
                let collection = str_field(payload, "collection")?;
                let filter = payload.get("filter").cloned().unwrap_or(json!({}));
                let patch = payload
                    .get("patch")
                    .cloned()
                    .ok_or_else(|| Error::BadRequest("update requires a patch".to_string()))?;
                let count = self.block_on(
                    self.storage.ds_update(app_id, &scope, &collection, &filter, &patch),
                )?;
                Ok(json!(count))
            }
            "ds.delete" => {
                let collection = str_field(payload, "collection")?;
                let filter = payload.get("filter").cloned().unwrap_or(json!({}));
                let count =
                    self.block_on(self.storage.ds_delete(app_id, &scope, &collection, &filter))?;
                Ok(json!(count))
            }

            "s3.put" => {
                let path = str_field(payload, "path")?;
                let data = str_field(payload, "data")?;
                let content_type =
                    payload.get("contentType").and_then(Value::as_str).map(str::to_string);
                self.block_on(self.storage.blob_put(
                    app_id,
                    &scope,
                    &path,
                    data.into_bytes(),
                    content_type,
                ))?;
                Ok(Value::Null)
            }
            "s3.get" => {
                let path = str_field(payload, "path")?;
                Ok(match self.block_on(self.storage.blob_get(app_id, &scope, &path))? {
                    Some((bytes, content_type)) => json!({
                        "data": String::from_utf8_lossy(&bytes).into_owned(),
                        "contentType": content_type,
                    }),
                    None => Value::Null,
                })
            }
            "s3.delete" => {
                let path = str_field(payload, "path")?;
                self.block_on(self.storage.blob_delete(app_id, &scope, &path))?;
                Ok(Value::Null)
            }
            "s3.list" => {
                let prefix = payload.get("prefix").and_then(Value::as_str).unwrap_or("");
                let entries = self.block_on(self.storage.blob_list(app_id, &scope, prefix))?;
                Ok(serde_json::to_value(entries).map_err(|e| Error::Internal(e.to_string()))?)
            }

            other => Err(Error::BadRequest(format!("unknown storage op: {other}"))),
        }
    }

    /// Drain captured console lines.
    pub fn take_console(&self) -> Vec<ConsoleLine> {
        std::mem::take(&mut *self.console.lock().expect("console buffer poisoned"))
    }
}

fn str_field(payload: &Value, field: &str) -> Result<String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::BadRequest(format!("missing field: {field}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_envelope_shape() {
        let err = Error::Unauthorized("nope".to_string());
        let (code, retryable) = (err.kind().code(), err.retryable());
        assert_eq!(code, "UNAUTHORIZED");
        assert!(!retryable);
    }

    #[test]
    fn test_str_field() {
        let payload = json!({"key": "k"});
        assert_eq!(str_field(&payload, "key").unwrap(), "k");
        assert!(str_field(&payload, "missing").is_err());
    }
}
