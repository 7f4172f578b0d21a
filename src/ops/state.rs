//! Read-only state inspection: resource list, resource details, outputs.

use crate::api::registry::{Op, OpCtx};
use crate::errors::AppError;
use crate::ops::{query_output, run_query, str_param};
use crate::security::sanitizer;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateResource {
    /// Full address, e.g. `module.net.aws_subnet.a`.
    pub address: String,
    pub r#type: String,
    pub name: String,
}

/// Split an address into (type, name) using its last two segments, which
/// also handles module-prefixed addresses.
fn parse_address(address: &str) -> (String, String) {
    let parts: Vec<&str> = address.split('.').collect();
    if parts.len() >= 2 {
        (
            parts[parts.len() - 2].to_string(),
            parts[parts.len() - 1].to_string(),
        )
    } else {
        (address.to_string(), String::new())
    }
}

pub fn parse_state_list(stdout: &str) -> Vec<StateResource> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (r#type, name) = parse_address(line);
            StateResource {
                address: line.to_string(),
                r#type,
                name,
            }
        })
        .collect()
}

pub struct StateListOp;

#[async_trait]
impl Op for StateListOp {
    fn name(&self) -> &'static str {
        "state_list"
    }

    fn capabilities(&self) -> serde_json::Value {
        json!({
            "input": {"type": "object"},
            "output": {"type": "object", "properties": {
                "resources": {"type": "array"},
                "total": {"type": "integer"},
            }},
        })
    }

    async fn call(
        &self,
        ctx: &OpCtx,
        _params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let session = ctx.session()?;
        let result = run_query(ctx, &session, &["state", "list"]).await?;
        let stdout = query_output(result)?;
        let resources = parse_state_list(&stdout);
        Ok(json!({"total": resources.len(), "resources": resources}))
    }
}

pub struct StateShowOp;

#[async_trait]
impl Op for StateShowOp {
    fn name(&self) -> &'static str {
        "state_show"
    }

    fn capabilities(&self) -> serde_json::Value {
        json!({
            "input": {"type": "object", "required": ["address"], "properties": {"address": {"type": "string"}}},
            "output": {"type": "object", "properties": {"details": {"type": "string"}}},
        })
    }

    async fn call(
        &self,
        ctx: &OpCtx,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let session = ctx.session()?;
        let address = str_param(&params, "address")?;
        sanitizer::resource_address(address)?;
        let result =
            run_query(ctx, &session, &["state", "show", "-no-color", address]).await?;
        let details = query_output(result)?;
        Ok(json!({"details": details}))
    }
}

pub struct OutputShowOp;

#[async_trait]
impl Op for OutputShowOp {
    fn name(&self) -> &'static str {
        "output_show"
    }

    fn capabilities(&self) -> serde_json::Value {
        json!({
            "input": {"type": "object"},
            "output": {"type": "object", "properties": {"outputs": {"type": "string"}}},
        })
    }

    async fn call(
        &self,
        ctx: &OpCtx,
        _params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let session = ctx.session()?;
        let result = run_query(ctx, &session, &["output", "-no-color"]).await?;
        let outputs = query_output(result)?;
        Ok(json!({"outputs": outputs}))
    }
}
