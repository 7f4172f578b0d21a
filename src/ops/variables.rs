//! Variable discovery from `.tf` files and tfvars import/export.
//!
//! HCL parsing is delegated to the `hcl` crate; this module only walks the
//! parsed body. Values for variables declared `sensitive` are routed into
//! the session's secret store and never into the project file or a tfvars
//! export.

use crate::api::registry::{Op, OpCtx};
use crate::errors::AppError;
use crate::ops::{contained_existing, contained_for_write, str_param};
use crate::security::sanitizer;
use crate::session::Session;
use async_trait::async_trait;
use hcl::{Body, Expression};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredVariable {
    pub name: String,
    pub r#type: String,
    pub default: Option<serde_json::Value>,
    pub description: String,
    pub sensitive: bool,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredOutput {
    pub name: String,
    pub description: String,
    pub sensitive: bool,
}

#[derive(Debug, Default)]
pub struct Discovery {
    pub variables: Vec<DiscoveredVariable>,
    pub outputs: Vec<DiscoveredOutput>,
    /// Per-file parse failures; discovery continues past them.
    pub errors: Vec<String>,
}

/// Render a type expression the way it was written: `string`,
/// `list(string)`, quoted legacy forms unquoted.
fn type_string(expr: &Expression) -> String {
    match expr {
        Expression::String(s) => s.clone(),
        other => hcl::format::to_string(other).unwrap_or_else(|_| "string".to_string()),
    }
}

fn expr_to_json(expr: &Expression) -> serde_json::Value {
    serde_json::to_value(expr).unwrap_or(serde_json::Value::Null)
}

fn parse_body(body: &Body, discovery: &mut Discovery) {
    for block in body.blocks() {
        let Some(label) = block.labels().first() else {
            continue;
        };
        let name = label.as_str().to_string();
        match block.identifier() {
            "variable" => {
                let mut variable = DiscoveredVariable {
                    name,
                    r#type: "string".to_string(),
                    default: None,
                    description: String::new(),
                    sensitive: false,
                    required: true,
                };
                for attr in block.body().attributes() {
                    match attr.key() {
                        "type" => variable.r#type = type_string(attr.expr()),
                        "default" => {
                            variable.default = Some(expr_to_json(attr.expr()));
                            variable.required = false;
                        }
                        "description" => {
                            if let Expression::String(s) = attr.expr() {
                                variable.description = s.clone();
                            }
                        }
                        "sensitive" => {
                            if let Expression::Bool(b) = attr.expr() {
                                variable.sensitive = *b;
                            }
                        }
                        _ => {}
                    }
                }
                discovery.variables.push(variable);
            }
            "output" => {
                let mut output = DiscoveredOutput {
                    name,
                    description: String::new(),
                    sensitive: false,
                };
                for attr in block.body().attributes() {
                    match attr.key() {
                        "description" => {
                            if let Expression::String(s) = attr.expr() {
                                output.description = s.clone();
                            }
                        }
                        "sensitive" => {
                            if let Expression::Bool(b) = attr.expr() {
                                output.sensitive = *b;
                            }
                        }
                        _ => {}
                    }
                }
                discovery.outputs.push(output);
            }
            _ => {}
        }
    }
}

/// Parse every `*.tf` file in the project root. A parse failure in one
/// file is recorded and does not abort the others.
pub fn discover(root: &Path) -> Result<Discovery, AppError> {
    let mut discovery = Discovery::default();
    let mut tf_files: Vec<_> = fs::read_dir(root)
        .map_err(|e| AppError::Internal(e.to_string()))?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|e| e == "tf").unwrap_or(false))
        .collect();
    tf_files.sort();

    for path in tf_files {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                discovery.errors.push(format!("{file_name}: {e}"));
                continue;
            }
        };
        match hcl::parse(&raw) {
            Ok(body) => parse_body(&body, &mut discovery),
            Err(e) => discovery.errors.push(format!("{file_name}: {e}")),
        }
    }
    Ok(discovery)
}

fn declared_sensitive(root: &Path) -> HashSet<String> {
    discover(root)
        .map(|d| {
            d.variables
                .into_iter()
                .filter(|v| v.sensitive)
                .map(|v| v.name)
                .collect()
        })
        .unwrap_or_default()
}

/// Render a value as an HCL literal for a tfvars line.
fn format_hcl_value(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(format_hcl_value).collect();
            format!("[{}]", rendered.join(", "))
        }
        Value::Object(map) => {
            let rendered: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("\"{}\" = {}", k.replace('"', "\\\""), format_hcl_value(v)))
                .collect();
            format!("{{ {} }}", rendered.join(", "))
        }
    }
}

pub struct VariablesListOp;

#[async_trait]
impl Op for VariablesListOp {
    fn name(&self) -> &'static str {
        "variables_list"
    }

    fn capabilities(&self) -> serde_json::Value {
        json!({
            "input": {"type": "object"},
            "output": {"type": "object", "properties": {
                "variables": {"type": "array"},
                "outputs": {"type": "array"},
                "parse_errors": {"type": "array"},
            }},
        })
    }

    async fn call(
        &self,
        ctx: &OpCtx,
        _params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let session = ctx.session()?;
        let discovery = discover(&session.root)?;
        let saved = session.with_file(|f| f.variables.clone());

        let variables: Vec<serde_json::Value> = discovery
            .variables
            .iter()
            .map(|variable| {
                // saved values are non-sensitive by construction; sensitive
                // entries only report whether a value is held in memory
                let saved_value = if variable.sensitive {
                    None
                } else {
                    saved.get(&variable.name).cloned()
                };
                json!({
                    "name": variable.name,
                    "type": variable.r#type,
                    "default": variable.default,
                    "description": variable.description,
                    "sensitive": variable.sensitive,
                    "required": variable.required,
                    "saved_value": saved_value,
                    "has_secret": session.has_secret(&variable.name),
                })
            })
            .collect();

        Ok(json!({
            "variables": variables,
            "outputs": discovery.outputs,
            "parse_errors": discovery.errors,
        }))
    }
}

pub struct VariablesSetOp;

#[async_trait]
impl Op for VariablesSetOp {
    fn name(&self) -> &'static str {
        "variables_set"
    }

    fn capabilities(&self) -> serde_json::Value {
        json!({
            "input": {"type": "object", "required": ["values"], "properties": {
                "values": {"type": "array", "items": {"type": "object", "required": ["name", "value"], "properties": {
                    "name": {"type": "string"},
                    "value": {},
                    "type": {"type": "string"},
                    "sensitive": {"type": "boolean"},
                }}},
            }},
            "output": {"type": "object", "properties": {
                "stored": {"type": "integer"},
                "sensitive_stored": {"type": "integer"},
            }},
        })
    }

    async fn call(
        &self,
        ctx: &OpCtx,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let session = ctx.session()?;
        let values = params
            .get("values")
            .and_then(|v| v.as_array())
            .ok_or_else(|| AppError::invalid("values", "missing or not an array"))?;

        let mut stored = 0usize;
        let mut sensitive_stored = 0usize;
        for entry in values {
            let name = entry
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| AppError::invalid("variable name", "missing"))?;
            sanitizer::variable_name(name)?;
            let value = entry
                .get("value")
                .ok_or_else(|| AppError::invalid("variable value", "missing"))?;
            let var_type = entry.get("type").and_then(|v| v.as_str()).unwrap_or("string");
            let rendered = sanitizer::variable_value(value, var_type)?;

            let sensitive = entry
                .get("sensitive")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if sensitive {
                session.store_secret(name, rendered);
                // never leave an older plaintext copy behind
                session.update_file(|f| {
                    f.variables.remove(name);
                });
                sensitive_stored += 1;
            } else {
                session.clear_secret(name);
                session.update_file(|f| {
                    f.variables.insert(name.to_string(), value.clone());
                });
                stored += 1;
            }
        }
        session.save()?;
        Ok(json!({"stored": stored, "sensitive_stored": sensitive_stored}))
    }
}

pub struct TfvarsImportOp;

#[async_trait]
impl Op for TfvarsImportOp {
    fn name(&self) -> &'static str {
        "tfvars_import"
    }

    fn capabilities(&self) -> serde_json::Value {
        json!({
            "input": {"type": "object", "required": ["path"], "properties": {"path": {"type": "string"}}},
            "output": {"type": "object", "properties": {
                "values": {"type": "object"},
                "sensitive_stored": {"type": "array"},
            }},
        })
    }

    async fn call(
        &self,
        ctx: &OpCtx,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let session = ctx.session()?;
        let path = contained_existing(&session.root, Path::new(str_param(&params, "path")?))?;
        let raw = fs::read_to_string(&path).map_err(|e| AppError::Op(e.to_string()))?;
        let body = hcl::parse(&raw)
            .map_err(|e| AppError::Op(format!("failed to parse tfvars: {e}")))?;

        let sensitive_names = declared_sensitive(&session.root);
        let mut values: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        let mut sensitive_stored: Vec<String> = Vec::new();

        for attr in body.attributes() {
            let name = attr.key();
            sanitizer::variable_name(name)?;
            let value = expr_to_json(attr.expr());
            if sensitive_names.contains(name) {
                // plaintext from the file goes straight to the secret
                // store, not back over the wire or into the project file
                let rendered = sanitizer::variable_value(&value, "string")?;
                session.store_secret(name, rendered);
                sensitive_stored.push(name.to_string());
            } else {
                values.insert(name.to_string(), value);
            }
        }

        session.update_file(|f| {
            for (name, value) in &values {
                f.variables.insert(name.clone(), value.clone());
            }
        });
        session.save()?;
        Ok(json!({"values": values, "sensitive_stored": sensitive_stored}))
    }
}

pub struct TfvarsExportOp;

#[async_trait]
impl Op for TfvarsExportOp {
    fn name(&self) -> &'static str {
        "tfvars_export"
    }

    fn capabilities(&self) -> serde_json::Value {
        json!({
            "input": {"type": "object", "required": ["path"], "properties": {"path": {"type": "string"}}},
            "output": {"type": "object", "properties": {
                "written": {"type": "integer"},
                "path": {"type": "string"},
            }},
        })
    }

    async fn call(
        &self,
        ctx: &OpCtx,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let session = ctx.session()?;
        let path = contained_for_write(&session.root, Path::new(str_param(&params, "path")?))?;
        let rendered = render_tfvars(&session);
        fs::write(&path, rendered.content)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(json!({"written": rendered.count, "path": path.display().to_string()}))
    }
}

struct RenderedTfvars {
    content: String,
    count: usize,
}

fn render_tfvars(session: &Session) -> RenderedTfvars {
    let sensitive_names = declared_sensitive(&session.root);
    let saved = session.with_file(|f| f.variables.clone());

    let mut lines = Vec::new();
    for (name, value) in &saved {
        if sensitive_names.contains(name) || session.has_secret(name) {
            continue;
        }
        lines.push(format!("{name} = {}", format_hcl_value(value)));
    }
    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    RenderedTfvars {
        content,
        count: lines.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_ctx, test_project};

    const FIXTURE: &str = r#"
variable "region" {
  type        = string
  default     = "us-east-1"
  description = "AWS region"
}

variable "db_password" {
  type      = string
  sensitive = true
}

variable "replicas" {
  type    = number
  default = 2
}

output "endpoint" {
  value       = "ignored"
  description = "service endpoint"
  sensitive   = false
}
"#;

    #[test]
    fn discovers_variables_and_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("variables.tf"), FIXTURE).unwrap();
        let discovery = discover(tmp.path()).unwrap();

        assert_eq!(discovery.variables.len(), 3);
        let region = &discovery.variables[0];
        assert_eq!(region.name, "region");
        assert_eq!(region.r#type, "string");
        assert_eq!(region.default, Some(json!("us-east-1")));
        assert!(!region.required);
        assert!(!region.sensitive);

        let password = &discovery.variables[1];
        assert!(password.sensitive);
        assert!(password.required);

        assert_eq!(discovery.outputs.len(), 1);
        assert_eq!(discovery.outputs[0].name, "endpoint");
        assert!(discovery.errors.is_empty());
    }

    #[test]
    fn bad_file_is_reported_and_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("bad.tf"), "variable \"x\" {").unwrap();
        fs::write(tmp.path().join("good.tf"), FIXTURE).unwrap();
        let discovery = discover(tmp.path()).unwrap();
        assert_eq!(discovery.errors.len(), 1);
        assert!(discovery.errors[0].starts_with("bad.tf"));
        assert_eq!(discovery.variables.len(), 3);
    }

    #[test]
    fn complex_types_render_as_written() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("main.tf"),
            "variable \"tags\" {\n  type = list(string)\n}\n",
        )
        .unwrap();
        let discovery = discover(tmp.path()).unwrap();
        assert_eq!(discovery.variables[0].r#type, "list(string)");
    }

    #[test]
    fn hcl_literals_format() {
        assert_eq!(format_hcl_value(&json!(true)), "true");
        assert_eq!(format_hcl_value(&json!(3)), "3");
        assert_eq!(format_hcl_value(&json!("a \"b\"")), r#""a \"b\"""#);
        assert_eq!(format_hcl_value(&json!(["a", 1])), r#"["a", 1]"#);
        assert_eq!(
            format_hcl_value(&json!({"k": "v"})),
            r#"{ "k" = "v" }"#
        );
    }

    #[tokio::test]
    async fn import_routes_sensitive_values_to_the_store() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path());
        let project = test_project(tmp.path());
        fs::write(project.join("variables.tf"), FIXTURE).unwrap();
        fs::write(
            project.join("dev.tfvars"),
            "region = \"eu-west-1\"\ndb_password = \"hunter2\"\n",
        )
        .unwrap();
        let session = ctx.sessions.open(project, Vec::new());

        let out = TfvarsImportOp
            .call(&ctx, json!({"path": "dev.tfvars"}))
            .await
            .unwrap();
        assert_eq!(out["values"]["region"], "eu-west-1");
        assert!(out["values"].get("db_password").is_none());
        assert_eq!(out["sensitive_stored"][0], "db_password");
        assert!(session.has_secret("db_password"));

        // the plaintext never lands in the project file
        let raw = fs::read_to_string(session.root.join(crate::session::PROJECT_FILE)).unwrap();
        assert!(!raw.contains("hunter2"));
        assert!(raw.contains("eu-west-1"));
    }

    #[tokio::test]
    async fn export_excludes_sensitive_names() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path());
        let project = test_project(tmp.path());
        fs::write(project.join("variables.tf"), FIXTURE).unwrap();
        let session = ctx.sessions.open(project, Vec::new());

        session.update_file(|f| {
            f.variables.insert("region".to_string(), json!("eu-west-1"));
        });
        session.store_secret("db_password", "hunter2".to_string());

        let out = TfvarsExportOp
            .call(&ctx, json!({"path": "out.tfvars"}))
            .await
            .unwrap();
        assert_eq!(out["written"], 1);

        let content = fs::read_to_string(session.root.join("out.tfvars")).unwrap();
        assert_eq!(content, "region = \"eu-west-1\"\n");
        assert!(!content.contains("hunter2"));
    }

    #[tokio::test]
    async fn import_rejects_paths_outside_project() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_ctx(tmp.path());
        ctx.sessions.open(test_project(tmp.path()), Vec::new());
        let err = TfvarsImportOp
            .call(&ctx, json!({"path": "/etc/hosts"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PathOutsideRoot));
    }
}
