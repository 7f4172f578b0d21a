//! Workspace commands: list, select, new, delete.
//!
//! These wrap `terraform workspace ...` with the short query timeout. The
//! `default` workspace can be selected but never created or deleted.

use crate::api::registry::{Op, OpCtx};
use crate::errors::AppError;
use crate::ops::{bool_param, query_output, run_query, str_param};
use crate::security::sanitizer;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceInfo {
    pub name: String,
    pub is_current: bool,
}

/// Parse `terraform workspace list` output; the active workspace is
/// prefixed with `* `.
pub fn parse_workspace_list(stdout: &str) -> Vec<WorkspaceInfo> {
    let mut workspaces = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line.strip_prefix("* ") {
            workspaces.push(WorkspaceInfo {
                name: name.trim().to_string(),
                is_current: true,
            });
        } else {
            workspaces.push(WorkspaceInfo {
                name: line.to_string(),
                is_current: false,
            });
        }
    }
    if workspaces.is_empty() {
        workspaces.push(WorkspaceInfo {
            name: "default".to_string(),
            is_current: true,
        });
    }
    workspaces
}

fn name_param(params: &serde_json::Value) -> Result<&str, AppError> {
    let name = str_param(params, "name")?;
    sanitizer::workspace_name(name)?;
    Ok(name)
}

fn protect_default(name: &str, action: &str) -> Result<(), AppError> {
    if name == "default" {
        return Err(AppError::invalid(
            "workspace name",
            format!("the default workspace cannot be {action}"),
        ));
    }
    Ok(())
}

pub struct WorkspaceListOp;

#[async_trait]
impl Op for WorkspaceListOp {
    fn name(&self) -> &'static str {
        "workspace_list"
    }

    fn capabilities(&self) -> serde_json::Value {
        json!({
            "input": {"type": "object"},
            "output": {"type": "object", "properties": {
                "workspaces": {"type": "array"},
                "current": {"type": "string"},
            }},
        })
    }

    async fn call(
        &self,
        ctx: &OpCtx,
        _params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let session = ctx.session()?;
        let result = run_query(ctx, &session, &["workspace", "list"]).await?;
        let stdout = query_output(result)?;
        let workspaces = parse_workspace_list(&stdout);
        let current = workspaces
            .iter()
            .find(|w| w.is_current)
            .map(|w| w.name.clone())
            .unwrap_or_else(|| "default".to_string());
        Ok(json!({"workspaces": workspaces, "current": current}))
    }
}

pub struct WorkspaceSelectOp;

#[async_trait]
impl Op for WorkspaceSelectOp {
    fn name(&self) -> &'static str {
        "workspace_select"
    }

    fn capabilities(&self) -> serde_json::Value {
        workspace_name_capabilities()
    }

    async fn call(
        &self,
        ctx: &OpCtx,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let session = ctx.session()?;
        let name = name_param(&params)?;
        let result = run_query(ctx, &session, &["workspace", "select", name]).await?;
        query_output(result)?;
        session.update_file(|f| f.last_workspace = name.to_string());
        session.save()?;
        Ok(json!({"selected": name}))
    }
}

pub struct WorkspaceNewOp;

#[async_trait]
impl Op for WorkspaceNewOp {
    fn name(&self) -> &'static str {
        "workspace_new"
    }

    fn capabilities(&self) -> serde_json::Value {
        workspace_name_capabilities()
    }

    async fn call(
        &self,
        ctx: &OpCtx,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let session = ctx.session()?;
        let name = name_param(&params)?;
        protect_default(name, "created")?;
        let result = run_query(ctx, &session, &["workspace", "new", name]).await?;
        query_output(result)?;
        session.update_file(|f| f.last_workspace = name.to_string());
        session.save()?;
        Ok(json!({"created": name}))
    }
}

pub struct WorkspaceDeleteOp;

#[async_trait]
impl Op for WorkspaceDeleteOp {
    fn name(&self) -> &'static str {
        "workspace_delete"
    }

    fn capabilities(&self) -> serde_json::Value {
        json!({
            "input": {"type": "object", "required": ["name"], "properties": {
                "name": {"type": "string"},
                "force": {"type": "boolean"},
            }},
            "output": {"type": "object", "properties": {"deleted": {"type": "string"}}},
        })
    }

    async fn call(
        &self,
        ctx: &OpCtx,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let session = ctx.session()?;
        let name = name_param(&params)?;
        protect_default(name, "deleted")?;
        let mut args = vec!["workspace", "delete"];
        if bool_param(&params, "force") {
            args.push("-force");
        }
        args.push(name);
        let result = run_query(ctx, &session, &args).await?;
        query_output(result)?;
        Ok(json!({"deleted": name}))
    }
}

fn workspace_name_capabilities() -> serde_json::Value {
    json!({
        "input": {"type": "object", "required": ["name"], "properties": {"name": {"type": "string"}}},
        "output": {"type": "object"},
    })
}
