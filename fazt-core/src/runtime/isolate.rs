//! Isolate execution
//!
//! One fresh QuickJS runtime + context per execution, torn down when the
//! call ends, so no state can leak between requests. Cancellation is
//! cooperative: the interrupt handler trips once the budget deadline (plus
//! a grace window) passes or the owning cancellation token fires.

use rquickjs::{CatchResultExt, Context, Function, Runtime as QjsRuntime};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::bridge::HostBridge;
use crate::error::{Error, Result};

/// The prelude evaluated before user code.
const BOOTSTRAP: &str = include_str!("bootstrap.js");

/// What to run after user code is loaded.
pub enum IsolateJob {
    /// Call `__dispatch(requestJson)`; the returned JSON is the response.
    Http { request_json: String },
    /// Call `__runWorker(infoJson)`; no return value.
    Worker { info_json: String },
}

/// Run one isolate to completion on the current (blocking) thread.
pub fn run(
    source: &str,
    job: IsolateJob,
    bridge: &Arc<HostBridge>,
    deadline: Option<Instant>,
    cancel: Option<CancellationToken>,
) -> Result<Option<String>> {
    let qrt = QjsRuntime::new()
        .map_err(|e| Error::Internal(format!("isolate creation failed: {e}")))?;
    qrt.set_memory_limit(bridge.limits.runtime.max_memory as usize);

    {
        let cancel = cancel.clone();
        qrt.set_interrupt_handler(Some(Box::new(move || {
            let past_deadline = deadline.map(|d| Instant::now() >= d).unwrap_or(false);
            let cancelled = cancel.as_ref().map(CancellationToken::is_cancelled).unwrap_or(false);
            past_deadline || cancelled
        })));
    }

    let context = Context::full(&qrt)
        .map_err(|e| Error::Internal(format!("context creation failed: {e}")))?;

    let outcome: std::result::Result<Option<String>, String> = context.with(|ctx| {
        let bridge_for_call = bridge.clone();
        let host_call = Function::new(ctx.clone(), move |name: String, payload: String| {
            bridge_for_call.dispatch(&name, &payload)
        })
        .map_err(|e| format!("host binding failed: {e}"))?;
        ctx.globals()
            .set("__host_call", host_call)
            .map_err(|e| format!("host binding failed: {e}"))?;

        ctx.eval::<(), _>(BOOTSTRAP)
            .catch(&ctx)
            .map_err(|e| format!("bootstrap failed: {e}"))?;

        ctx.eval::<(), _>(source.as_bytes())
            .catch(&ctx)
            .map_err(|e| format!("{e}"))?;

        match job {
            IsolateJob::Http { request_json } => {
                let dispatch: Function = ctx
                    .globals()
                    .get("__dispatch")
                    .map_err(|e| format!("dispatch missing: {e}"))?;
                let response: String = dispatch
                    .call((request_json,))
                    .catch(&ctx)
                    .map_err(|e| format!("{e}"))?;
                Ok(Some(response))
            }
            IsolateJob::Worker { info_json } => {
                let run_worker: Function = ctx
                    .globals()
                    .get("__runWorker")
                    .map_err(|e| format!("worker entry missing: {e}"))?;
                run_worker
                    .call::<_, ()>((info_json,))
                    .catch(&ctx)
                    .map_err(|e| format!("{e}"))?;
                Ok(None)
            }
        }
    });

    match outcome {
        Ok(result) => Ok(result),
        Err(detail) => {
            // An expired budget means the interrupt fired; everything else
            // is a genuine script failure. The detail (with stack) goes to
            // the app log, never to the client.
            if bridge.budget.expired()
                || cancel.map(|c| c.is_cancelled()).unwrap_or(false)
            {
                Err(Error::Timeout("execution exceeded its time budget".to_string()))
            } else {
                tracing::debug!(app = %bridge.app.id, error = %detail, "script error");
                Err(Error::Internal(detail))
            }
        }
    }
}
