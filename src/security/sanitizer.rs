//! Validation of untrusted input before it can reach an argument vector.
//!
//! Every function is pure: it either returns the validated (possibly
//! normalized) value or fails with a typed error naming the field. Callers
//! must not proceed to execution on failure. No value is ever interpolated
//! into a shell line; these checks exist so that what we place into the
//! argument vector is well-formed for the tool itself.

use crate::errors::AppError;
use std::path::{Component, Path, PathBuf};

pub const MAX_VARIABLE_NAME_LEN: usize = 255;
pub const MAX_VARIABLE_VALUE_LEN: usize = 4096;
/// Terraform's own workspace name limit.
pub const MAX_WORKSPACE_NAME_LEN: usize = 90;
pub const MAX_COMMAND_ARG_LEN: usize = 10_000;

/// Shell metacharacters refused in string variable values. The child is
/// spawned without a shell; this is defense in depth against the value
/// being pasted into one downstream.
const BLOCKED_VALUE_CHARS: &[char] = &[';', '|', '&', '$', '`', '\\', '"', '\n', '\r'];

/// Workspace names terraform treats specially or that would be path-like.
const RESERVED_WORKSPACE_NAMES: &[&str] = &[".", ".."];

/// Validate a project directory path against the configured allowed roots.
///
/// The raw input is checked for null bytes, control characters, and
/// parent-traversal segments before resolution; the resolved path must be
/// an existing directory under one of the allowed roots (symlinks are
/// followed by canonicalization, so a link escaping the roots is caught).
pub fn project_path(raw: &str, allowed_roots: &[PathBuf]) -> Result<PathBuf, AppError> {
    if raw.is_empty() {
        return Err(AppError::invalid("project path", "must not be empty"));
    }
    if raw.chars().any(|c| c == '\0' || c.is_control()) {
        return Err(AppError::invalid(
            "project path",
            "contains control characters",
        ));
    }
    let expanded = expand_home(raw);
    if Path::new(&expanded)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(AppError::invalid(
            "project path",
            "contains parent-directory traversal",
        ));
    }
    let canon = dunce::canonicalize(&expanded)
        .map_err(|_| AppError::invalid("project path", "does not exist"))?;
    if !canon.is_dir() {
        return Err(AppError::invalid("project path", "is not a directory"));
    }
    for root in allowed_roots {
        if let Ok(canon_root) = dunce::canonicalize(root) {
            if canon.starts_with(&canon_root) {
                return Ok(canon);
            }
        }
    }
    Err(AppError::PathOutsideRoot)
}

fn expand_home(raw: &str) -> String {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    raw.to_string()
}

/// Terraform variable names: letter or underscore first, then letters,
/// digits, and underscores.
pub fn variable_name(name: &str) -> Result<(), AppError> {
    if name.is_empty() {
        return Err(AppError::invalid("variable name", "must not be empty"));
    }
    if name.len() > MAX_VARIABLE_NAME_LEN {
        return Err(AppError::invalid(
            "variable name",
            format!("longer than {MAX_VARIABLE_NAME_LEN} characters"),
        ));
    }
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AppError::invalid(
            "variable name",
            "must start with a letter or underscore and contain only \
             letters, digits, and underscores",
        ));
    }
    Ok(())
}

/// Validate a variable value against its declared type and render it as the
/// string that goes into a `-var name=value` token.
///
/// Error reasons never include the value itself; the value may be a secret.
pub fn variable_value(value: &serde_json::Value, var_type: &str) -> Result<String, AppError> {
    use serde_json::Value;

    let field = "variable value";
    let rendered_len = match value {
        Value::String(s) => s.len(),
        other => other.to_string().len(),
    };
    if rendered_len > MAX_VARIABLE_VALUE_LEN {
        return Err(AppError::invalid(
            field,
            format!("longer than {MAX_VARIABLE_VALUE_LEN} characters"),
        ));
    }

    let base_type = var_type.split('(').next().unwrap_or(var_type).trim();
    match base_type {
        "bool" => match value {
            Value::Bool(b) => Ok(b.to_string()),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok("true".to_string()),
                "false" | "0" => Ok("false".to_string()),
                _ => Err(AppError::invalid(field, "not a boolean")),
            },
            _ => Err(AppError::invalid(field, "not a boolean")),
        },
        "number" => match value {
            Value::Number(n) => Ok(n.to_string()),
            Value::String(s) if s.parse::<f64>().is_ok() => Ok(s.clone()),
            _ => Err(AppError::invalid(field, "not a number")),
        },
        "list" | "set" | "map" | "object" | "tuple" => match value {
            Value::String(s) => {
                serde_json::from_str::<Value>(s)
                    .map_err(|_| AppError::invalid(field, format!("not valid JSON for {base_type}")))?;
                Ok(s.clone())
            }
            other => serde_json::to_string(other)
                .map_err(|_| AppError::invalid(field, format!("not valid JSON for {base_type}"))),
        },
        _ => {
            // string and anything unrecognized
            let s = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            let blocked: Vec<char> = s
                .chars()
                .filter(|c| BLOCKED_VALUE_CHARS.contains(c))
                .collect();
            if !blocked.is_empty() {
                return Err(AppError::invalid(
                    field,
                    format!("contains forbidden characters: {blocked:?}"),
                ));
            }
            Ok(s)
        }
    }
}

/// Workspace names: alphanumeric, dash, underscore; bounded length; no
/// leading dash; reserved names refused.
pub fn workspace_name(name: &str) -> Result<(), AppError> {
    if name.is_empty() {
        return Err(AppError::invalid("workspace name", "must not be empty"));
    }
    if name.len() > MAX_WORKSPACE_NAME_LEN {
        return Err(AppError::invalid(
            "workspace name",
            format!("longer than {MAX_WORKSPACE_NAME_LEN} characters"),
        ));
    }
    if RESERVED_WORKSPACE_NAMES.contains(&name) {
        return Err(AppError::invalid("workspace name", "is reserved"));
    }
    if name.starts_with('-') {
        return Err(AppError::invalid(
            "workspace name",
            "must not start with a dash",
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AppError::invalid(
            "workspace name",
            "contains characters outside [A-Za-z0-9_-]",
        ));
    }
    Ok(())
}

/// Resource addresses as printed by `terraform state list`, e.g.
/// `aws_instance.web` or `module.net.aws_subnet.a["x"]`.
pub fn resource_address(address: &str) -> Result<(), AppError> {
    if address.is_empty() {
        return Err(AppError::invalid("resource address", "must not be empty"));
    }
    let ok = address.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || matches!(c, '_' | '.' | '[' | ']' | '"' | ':' | '-')
    });
    if !ok {
        return Err(AppError::invalid(
            "resource address",
            "contains characters outside the address grammar",
        ));
    }
    Ok(())
}

/// Final defense-in-depth check applied to every assembled argument token.
pub fn command_arg(arg: &str) -> Result<(), AppError> {
    if arg.contains('\0') {
        return Err(AppError::invalid("command argument", "contains null byte"));
    }
    if arg.len() > MAX_COMMAND_ARG_LEN {
        return Err(AppError::invalid(
            "command argument",
            format!("longer than {MAX_COMMAND_ARG_LEN} characters"),
        ));
    }
    Ok(())
}
