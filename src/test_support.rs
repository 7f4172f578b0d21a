//! Shared fixtures for unit and integration tests.

use crate::api::registry::OpCtx;
use crate::config::{Auth, Config, Limits, Redaction, Roots, Server, Terraform};
use crate::session::SessionSlot;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Config rooted at `root`, with `/bin/echo` standing in for the external
/// binary so tests never need terraform installed.
pub fn test_config(root: &Path) -> Config {
    Config {
        terraform: Terraform {
            binary: "/bin/echo".to_string(),
            pass_env: vec!["PATH".to_string(), "HOME".to_string()],
        },
        roots: Roots {
            allowed: vec![root.to_path_buf()],
        },
        server: Server {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            base_path: "/api".to_string(),
        },
        auth: Auth {
            bearer_token: "t".to_string(),
            allowed_origins: vec!["http://localhost".to_string()],
        },
        limits: Limits {
            run_timeout_s: 10,
            query_timeout_s: 5,
            cancel_grace_ms: 500,
            max_output_kb: 64,
            max_request_kb: 64,
        },
        redaction: Redaction::default(),
    }
}

pub fn test_ctx(root: &Path) -> OpCtx {
    OpCtx {
        cfg: Arc::new(test_config(root)),
        sessions: Arc::new(SessionSlot::new()),
    }
}

/// Create a minimal terraform project directory under `root`.
pub fn test_project(root: &Path) -> PathBuf {
    let project = root.join("project");
    std::fs::create_dir_all(&project).unwrap();
    std::fs::write(project.join("main.tf"), "# empty\n").unwrap();
    dunce::canonicalize(&project).unwrap()
}
