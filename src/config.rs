use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub terraform: Terraform,
    pub roots: Roots,
    pub server: Server,
    pub auth: Auth,
    pub limits: Limits,
    #[serde(default)]
    pub redaction: Redaction,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Terraform {
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Environment variables passed through to the child process. Everything
    /// else is cleared before spawning.
    #[serde(default = "default_pass_env")]
    pub pass_env: Vec<String>,
}
fn default_binary() -> String {
    "terraform".to_string()
}
fn default_pass_env() -> Vec<String> {
    ["HOME", "PATH", "USER", "LANG", "TMPDIR"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Directories a project is allowed to live under. A project path that does
/// not resolve into one of these is rejected before any command is built.
#[derive(Debug, Deserialize, Clone)]
pub struct Roots {
    pub allowed: Vec<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Server {
    pub bind_addr: String,
    pub port: u16,
    #[serde(default = "default_base_path")]
    pub base_path: String,
}
fn default_base_path() -> String {
    "/api".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct Auth {
    pub bearer_token: String,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Limits {
    /// Timeout for lifecycle runs (init/validate/plan/apply/destroy).
    #[serde(default = "default_run_timeout")]
    pub run_timeout_s: u64,
    /// Timeout for quick queries (workspace, state, version).
    #[serde(default = "default_query_timeout")]
    pub query_timeout_s: u64,
    /// Grace period between SIGTERM and SIGKILL on cancellation.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_ms: u64,
    #[serde(default = "default_max_output")]
    pub max_output_kb: usize,
    #[serde(default = "default_max_request")]
    pub max_request_kb: usize,
}
fn default_run_timeout() -> u64 {
    300
}
fn default_query_timeout() -> u64 {
    15
}
fn default_cancel_grace() -> u64 {
    2000
}
fn default_max_output() -> usize {
    4096
}
fn default_max_request() -> usize {
    64
}

/// Additional "secret-like" structural patterns, appended to the built-in
/// list in `security::redact`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Redaction {
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)?;
        if path.extension().map(|e| e == "json").unwrap_or(false) {
            Ok(serde_json::from_str(&raw)?)
        } else {
            Ok(toml::from_str(&raw)?)
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.roots.allowed.is_empty() {
            anyhow::bail!("roots.allowed must list at least one directory");
        }
        for root in &self.roots.allowed {
            if !root.is_dir() {
                anyhow::bail!(
                    "allowed root does not exist or is not a directory: {}",
                    root.display()
                );
            }
        }
        if self.terraform.binary.trim().is_empty() {
            anyhow::bail!("terraform.binary must not be empty");
        }
        if self.auth.bearer_token.trim().is_empty() {
            anyhow::bail!("bearer_token must not be empty");
        }
        if self.auth.allowed_origins.is_empty() {
            anyhow::bail!("allowed_origins must not be empty");
        }
        if self.limits.run_timeout_s == 0 {
            anyhow::bail!("run_timeout_s must be > 0");
        }
        if self.limits.query_timeout_s == 0 {
            anyhow::bail!("query_timeout_s must be > 0");
        }
        if self.limits.max_output_kb == 0 {
            anyhow::bail!("max_output_kb must be > 0");
        }
        if self.limits.max_request_kb == 0 {
            anyhow::bail!("max_request_kb must be > 0");
        }
        for pattern in &self.redaction.extra_patterns {
            if let Err(e) = Regex::new(pattern) {
                anyhow::bail!("invalid redaction pattern {pattern:?}: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_config;

    #[test]
    fn validate_accepts_test_config() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        cfg.validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_redaction_pattern() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = test_config(tmp.path());
        cfg.redaction.extra_patterns.push("[unclosed".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = test_config(tmp.path());
        cfg.roots.allowed = vec![tmp.path().join("does-not-exist")];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_parses_toml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("terrapin.toml");
        std::fs::write(
            &path,
            format!(
                r#"
[terraform]
binary = "terraform"

[roots]
allowed = ["{}"]

[server]
bind_addr = "127.0.0.1"
port = 0

[auth]
bearer_token = "t"
allowed_origins = ["http://localhost"]

[limits]
"#,
                tmp.path().display()
            ),
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.limits.run_timeout_s, 300);
        assert_eq!(cfg.server.base_path, "/api");
        cfg.validate().unwrap();
    }
}
