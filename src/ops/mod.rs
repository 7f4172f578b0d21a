pub mod lifecycle;
pub mod project;
pub mod state;
pub mod variables;
pub mod workspace;

use crate::api::registry::OpCtx;
use crate::config::Config;
use crate::errors::AppError;
use crate::runner::{self, CommandSpec, ExecutionResult, RunnerSettings};
use crate::session::Session;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolve the configured binary to an absolute path. A name is looked up
/// on PATH; an explicit path is canonicalized. Failure here is a spawn
/// failure: no process ever existed.
pub fn resolve_binary(cfg: &Config) -> Result<PathBuf, AppError> {
    let name = &cfg.terraform.binary;
    let path = if name.contains('/') || name.contains('\\') {
        PathBuf::from(name)
    } else {
        which::which(name).map_err(|_| AppError::Spawn(format!("{name}: not found on PATH")))?
    };
    dunce::canonicalize(&path).map_err(|_| AppError::Spawn(format!("{name}: not found")))
}

/// Containment check for paths supplied by the caller that must already
/// exist inside the project root (e.g. a tfvars file to import).
pub fn contained_existing(root: &Path, input: &Path) -> Result<PathBuf, AppError> {
    let joined = if input.is_absolute() {
        input.to_path_buf()
    } else {
        root.join(input)
    };
    let canon_root =
        dunce::canonicalize(root).map_err(|e| AppError::Internal(e.to_string()))?;
    let canon = dunce::canonicalize(&joined).map_err(|_| AppError::PathOutsideRoot)?;
    if canon.starts_with(&canon_root) {
        Ok(canon)
    } else {
        Err(AppError::PathOutsideRoot)
    }
}

/// Containment check for paths that will be created (e.g. a plan out file
/// or a tfvars export target): the parent must exist inside the root.
pub fn contained_for_write(root: &Path, input: &Path) -> Result<PathBuf, AppError> {
    let joined = if input.is_absolute() {
        input.to_path_buf()
    } else {
        root.join(input)
    };
    let file_name = joined
        .file_name()
        .ok_or(AppError::invalid("path", "missing file name"))?
        .to_os_string();
    let parent = joined
        .parent()
        .ok_or(AppError::invalid("path", "missing parent directory"))?;
    let canon_root =
        dunce::canonicalize(root).map_err(|e| AppError::Internal(e.to_string()))?;
    let canon_parent = dunce::canonicalize(parent).map_err(|_| AppError::PathOutsideRoot)?;
    if !canon_parent.starts_with(&canon_root) {
        return Err(AppError::PathOutsideRoot);
    }
    Ok(canon_parent.join(file_name))
}

pub fn settings(cfg: &Config) -> RunnerSettings {
    RunnerSettings {
        cancel_grace: Duration::from_millis(cfg.limits.cancel_grace_ms),
        max_capture_bytes: cfg.limits.max_output_kb * 1024,
    }
}

/// Base spec for a terraform invocation inside the project: the binary,
/// `-chdir`, and the environment pass-through list.
pub fn project_spec(
    cfg: &Config,
    session: &Session,
    timeout: Duration,
) -> Result<CommandSpec, AppError> {
    let binary = resolve_binary(cfg)?;
    let mut spec = CommandSpec::new(binary, Some(session.root.clone()), timeout);
    spec.pass_env = cfg.terraform.pass_env.clone();
    spec.push_arg(format!("-chdir={}", session.root.display()))?;
    Ok(spec)
}

/// Run a quick query subcommand (workspace/state/output) with the short
/// timeout, buffered, through the session's redaction rules.
pub async fn run_query(
    ctx: &OpCtx,
    session: &Session,
    args: &[&str],
) -> Result<ExecutionResult, AppError> {
    let timeout = Duration::from_secs(ctx.cfg.limits.query_timeout_s);
    let mut spec = project_spec(&ctx.cfg, session, timeout)?;
    spec.push_args(args.iter().copied())?;
    runner::run(&spec, session.rules(), settings(&ctx.cfg)).await
}

/// Map a failed query to an `Op` error carrying the (already redacted)
/// stderr, without treating nonzero exit as an internal fault.
pub fn query_output(result: ExecutionResult) -> Result<String, AppError> {
    if result.timed_out {
        return Err(AppError::Op("query timed out".into()));
    }
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(AppError::Op(if result.stderr.is_empty() {
            format!("exit code {:?}", result.exit_code)
        } else {
            result.stderr
        }))
    }
}

// ---- param extraction helpers -------------------------------------------

pub fn str_param<'a>(params: &'a serde_json::Value, key: &'static str) -> Result<&'a str, AppError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or(AppError::invalid(key, "missing or not a string"))
}

pub fn opt_str_param<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub fn bool_param(params: &serde_json::Value, key: &str) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}
