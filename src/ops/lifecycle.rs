//! Lifecycle commands: init, validate, plan, apply, destroy.
//!
//! Every argument vector goes through the sanitizer before it is built and
//! every output line goes through the session's redaction rules before it
//! reaches the caller, buffered or streamed. Lifecycle runs are serialized
//! per session; a second request while one is in flight is rejected rather
//! than queued, so a stale destroy can never fire later by surprise.

use crate::api::registry::{Op, OpCtx};
use crate::errors::AppError;
use crate::ops::{bool_param, contained_for_write, opt_str_param, project_spec, settings};
use crate::runner::{self, CommandSpec};
use crate::security::sanitizer;
use crate::session::Session;
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn run_timeout(ctx: &OpCtx) -> Duration {
    Duration::from_secs(ctx.cfg.limits.run_timeout_s)
}

/// Collect `-var name=value` tokens: request-supplied values first, then
/// stored sensitive values for names the request did not mention. Both go
/// through name and type-aware value validation.
fn variable_args(
    spec: &mut CommandSpec,
    session: &Session,
    params: &serde_json::Value,
) -> Result<(), AppError> {
    let types: BTreeMap<String, String> = params
        .get("variable_types")
        .and_then(|v| v.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    let type_of = |name: &str| types.get(name).map(|s| s.as_str()).unwrap_or("string");

    let mut rendered: BTreeMap<String, String> = BTreeMap::new();
    if let Some(vars) = params.get("variables").and_then(|v| v.as_object()) {
        for (name, value) in vars {
            sanitizer::variable_name(name)?;
            rendered.insert(name.clone(), sanitizer::variable_value(value, type_of(name))?);
        }
    }
    for (name, secret) in session.secret_pairs() {
        if rendered.contains_key(&name) {
            continue;
        }
        sanitizer::variable_name(&name)?;
        let value = serde_json::Value::String(secret.to_string());
        rendered.insert(name.clone(), sanitizer::variable_value(&value, type_of(&name))?);
    }

    for (name, value) in rendered {
        spec.push_arg("-var")?;
        spec.push_arg(format!("{name}={value}"))?;
    }
    Ok(())
}

fn backend_config_args(
    spec: &mut CommandSpec,
    params: &serde_json::Value,
) -> Result<(), AppError> {
    if let Some(config) = params.get("backend_config").and_then(|v| v.as_object()) {
        for (key, value) in config {
            sanitizer::variable_name(key)?;
            let rendered = sanitizer::variable_value(value, "string")?;
            spec.push_arg(format!("-backend-config={key}={rendered}"))?;
        }
    }
    Ok(())
}

fn build_spec(
    ctx: &OpCtx,
    session: &Session,
    op: &'static str,
    params: &serde_json::Value,
) -> Result<CommandSpec, AppError> {
    let mut spec = project_spec(&ctx.cfg, session, run_timeout(ctx))?;
    spec.push_arg(op)?;
    match op {
        "validate" => {
            spec.push_arg("-no-color")?;
        }
        "init" => {
            spec.push_args(["-input=false", "-no-color"])?;
            backend_config_args(&mut spec, params)?;
        }
        "plan" => {
            spec.push_args(["-input=false", "-no-color"])?;
            variable_args(&mut spec, session, params)?;
            if let Some(out_file) = opt_str_param(params, "out_file") {
                let target = contained_for_write(&session.root, Path::new(out_file))?;
                spec.push_arg(format!("-out={}", target.display()))?;
            }
        }
        "apply" | "destroy" => {
            spec.push_args(["-input=false", "-no-color"])?;
            if bool_param(params, "auto_approve") {
                spec.push_arg("-auto-approve")?;
            }
            variable_args(&mut spec, session, params)?;
        }
        _ => return Err(AppError::Internal(format!("unknown lifecycle op {op}"))),
    }
    Ok(spec)
}

async fn run_buffered(
    ctx: &OpCtx,
    op: &'static str,
    params: serde_json::Value,
) -> Result<serde_json::Value, AppError> {
    let session = ctx.session()?;
    let _guard = session
        .run_lock
        .clone()
        .try_lock_owned()
        .map_err(|_| AppError::RunInProgress)?;

    let spec = build_spec(ctx, &session, op, &params)?;
    let running = runner::spawn(&spec, session.rules(), settings(&ctx.cfg))?;
    session.set_active(Some(running.cancel.clone()));
    let result = running.wait().await;
    session.set_active(None);

    tracing::info!(
        op = op,
        exit_code = ?result.exit_code,
        timed_out = result.timed_out,
        cancelled = result.cancelled,
        duration_ms = result.duration_ms,
        "lifecycle run finished"
    );
    serde_json::to_value(&result).map_err(|e| AppError::Internal(e.to_string()))
}

async fn run_streaming(
    ctx: &OpCtx,
    op: &'static str,
    params: serde_json::Value,
) -> Result<crate::server::StreamBody, AppError> {
    use futures::StreamExt;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    let session = ctx.session()?;
    let guard = session
        .run_lock
        .clone()
        .try_lock_owned()
        .map_err(|_| AppError::RunInProgress)?;

    // build and spawn before the response starts so spawn/validation
    // failures surface as plain errors, not half-open streams
    let spec = build_spec(ctx, &session, op, &params)?;
    let mut running = runner::spawn(&spec, session.rules(), settings(&ctx.cfg))?;
    session.set_active(Some(running.cancel.clone()));

    let (tx, rx) = mpsc::channel::<String>(64);
    let session_for_task = Arc::clone(&session);
    tokio::spawn(async move {
        let _ = tx.send(line(json!({"event": "start", "op": op}))).await;
        while let Some(out) = running.lines.recv().await {
            let event = json!({"event": "line", "stream": out.stream, "text": out.text});
            if tx.send(line(event)).await.is_err() {
                // client went away; cancel rather than run headless
                running.cancel.cancel();
                break;
            }
        }
        let result = running.wait().await;
        session_for_task.set_active(None);
        // the run is finalized; release the lock before the stream closes
        drop(guard);
        tracing::info!(
            op = op,
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            cancelled = result.cancelled,
            duration_ms = result.duration_ms,
            "lifecycle run finished"
        );
        let _ = tx
            .send(line(json!({"event": "end", "result": result.summary_json()})))
            .await;
    });

    Ok(axum::body::Body::from_stream(
        ReceiverStream::new(rx).map(Ok::<_, std::io::Error>),
    ))
}

fn line(v: serde_json::Value) -> String {
    format!("{v}\n")
}

fn lifecycle_capabilities(with_vars: bool, with_approve: bool) -> serde_json::Value {
    let mut properties = json!({});
    if with_vars {
        properties["variables"] = json!({"type": "object"});
        properties["variable_types"] = json!({"type": "object"});
    }
    if with_approve {
        properties["auto_approve"] = json!({"type": "boolean"});
    }
    json!({
        "input": {"type": "object", "properties": properties},
        "output": {"type": "object", "properties": {
            "exit_code": {"type": ["integer", "null"]},
            "stdout": {"type": "string"},
            "stderr": {"type": "string"},
            "duration_ms": {"type": "integer"},
            "timed_out": {"type": "boolean"},
            "cancelled": {"type": "boolean"},
            "truncated": {"type": "boolean"},
        }},
    })
}

macro_rules! lifecycle_op {
    ($ty:ident, $name:literal, $vars:expr, $approve:expr) => {
        pub struct $ty;

        #[async_trait]
        impl Op for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn capabilities(&self) -> serde_json::Value {
                lifecycle_capabilities($vars, $approve)
            }

            async fn call(
                &self,
                ctx: &OpCtx,
                params: serde_json::Value,
            ) -> Result<serde_json::Value, AppError> {
                run_buffered(ctx, $name, params).await
            }

            async fn call_stream(
                &self,
                ctx: &OpCtx,
                params: serde_json::Value,
            ) -> Result<crate::server::StreamBody, AppError> {
                run_streaming(ctx, $name, params).await
            }
        }
    };
}

lifecycle_op!(InitOp, "init", false, false);
lifecycle_op!(ValidateOp, "validate", false, false);
lifecycle_op!(PlanOp, "plan", true, false);
lifecycle_op!(ApplyOp, "apply", true, true);
lifecycle_op!(DestroyOp, "destroy", true, true);

/// Cancel the in-flight lifecycle run, if any.
pub struct RunCancelOp;

#[async_trait]
impl Op for RunCancelOp {
    fn name(&self) -> &'static str {
        "run_cancel"
    }

    fn capabilities(&self) -> serde_json::Value {
        json!({
            "input": {"type": "object"},
            "output": {"type": "object", "properties": {"cancelled": {"type": "boolean"}}},
        })
    }

    async fn call(
        &self,
        ctx: &OpCtx,
        _params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let session = ctx.session()?;
        Ok(json!({"cancelled": session.cancel_active()}))
    }
}
