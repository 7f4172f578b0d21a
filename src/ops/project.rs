//! Opening and closing project sessions, plus the binary version probe.

use crate::api::registry::{Op, OpCtx};
use crate::errors::AppError;
use crate::ops::{resolve_binary, settings, str_param};
use crate::runner::{self, CommandSpec};
use crate::security::redact::RuleSet;
use crate::security::sanitizer;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Validate the path, require at least one `.tf` file, and make the
/// project the active session. Any previously open project is persisted
/// and its secrets are zeroized.
pub struct ProjectOpenOp;

#[async_trait]
impl Op for ProjectOpenOp {
    fn name(&self) -> &'static str {
        "project_open"
    }

    fn capabilities(&self) -> serde_json::Value {
        json!({
            "input": {"type": "object", "required": ["path"], "properties": {"path": {"type": "string"}}},
            "output": {"type": "object", "properties": {
                "root": {"type": "string"},
                "last_workspace": {"type": "string"},
                "variables": {"type": "object"},
            }},
        })
    }

    async fn call(
        &self,
        ctx: &OpCtx,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let raw = str_param(&params, "path")?;
        let root = sanitizer::project_path(raw, &ctx.cfg.roots.allowed)?;

        let has_tf = std::fs::read_dir(&root)
            .map_err(|e| AppError::Internal(e.to_string()))?
            .flatten()
            .any(|entry| {
                entry.path().extension().map(|e| e == "tf").unwrap_or(false)
            });
        if !has_tf {
            return Err(AppError::invalid(
                "project path",
                "contains no .tf files",
            ));
        }

        let session = ctx
            .sessions
            .open(root, ctx.cfg.redaction.extra_patterns.clone());
        let (last_workspace, variables) = session.with_file(|f| {
            (f.last_workspace.clone(), f.variables.clone())
        });
        Ok(json!({
            "root": session.root.display().to_string(),
            "last_workspace": last_workspace,
            "variables": variables,
        }))
    }
}

pub struct ProjectCloseOp;

#[async_trait]
impl Op for ProjectCloseOp {
    fn name(&self) -> &'static str {
        "project_close"
    }

    fn capabilities(&self) -> serde_json::Value {
        json!({
            "input": {"type": "object"},
            "output": {"type": "object", "properties": {"closed": {"type": "boolean"}}},
        })
    }

    async fn call(
        &self,
        ctx: &OpCtx,
        _params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        Ok(json!({"closed": ctx.sessions.close()}))
    }
}

/// Check that the configured binary exists and report its version line.
/// Needs no open project.
pub struct BinaryVersionOp;

#[async_trait]
impl Op for BinaryVersionOp {
    fn name(&self) -> &'static str {
        "binary_version"
    }

    fn capabilities(&self) -> serde_json::Value {
        json!({
            "input": {"type": "object"},
            "output": {"type": "object", "properties": {
                "installed": {"type": "boolean"},
                "version": {"type": ["string", "null"]},
            }},
        })
    }

    async fn call(
        &self,
        ctx: &OpCtx,
        _params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let binary = match resolve_binary(&ctx.cfg) {
            Ok(binary) => binary,
            Err(_) => return Ok(json!({"installed": false, "version": null})),
        };
        let timeout = Duration::from_secs(ctx.cfg.limits.query_timeout_s);
        let mut spec = CommandSpec::new(binary, None, timeout);
        spec.pass_env = ctx.cfg.terraform.pass_env.clone();
        spec.push_arg("version")?;

        match runner::run(&spec, Arc::new(RuleSet::empty()), settings(&ctx.cfg)).await {
            Ok(result) if result.success() => {
                let version = result.stdout.lines().next().unwrap_or("").to_string();
                Ok(json!({"installed": true, "version": version}))
            }
            _ => Ok(json!({"installed": false, "version": null})),
        }
    }
}
