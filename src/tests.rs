#[cfg(test)]
mod integration {
    use crate::api::registry::OpRegistry;
    use crate::security::RateLimiters;
    use crate::server::{build_router, AppState};
    use crate::session::SessionSlot;
    use crate::test_support::test_config;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state(root: &std::path::Path) -> AppState {
        AppState {
            cfg: Arc::new(test_config(root)),
            registry: Arc::new(OpRegistry::new()),
            sessions: Arc::new(SessionSlot::new()),
            rls: RateLimiters::new(100, 100, 100, 100),
        }
    }

    fn authed(req: axum::http::request::Builder) -> axum::http::request::Builder {
        req.header("Origin", "http://localhost")
            .header("Authorization", "Bearer t")
    }

    #[tokio::test]
    async fn capabilities_lists_every_op() {
        let tmp = tempfile::tempdir().unwrap();
        let app = build_router(state(tmp.path()));
        let req = authed(Request::builder().uri("/api/capabilities").method("GET"))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let caps: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let names: Vec<&str> = caps["ops"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|o| o["name"].as_str())
            .collect();
        for expected in [
            "project_open",
            "plan",
            "apply",
            "destroy",
            "workspace_list",
            "state_list",
            "tfvars_import",
            "run_cancel",
        ] {
            assert!(names.contains(&expected), "missing op {expected}");
        }
    }

    #[tokio::test]
    async fn missing_bearer_is_unauthorized() {
        let tmp = tempfile::tempdir().unwrap();
        let app = build_router(state(tmp.path()));
        let req = Request::builder()
            .uri("/api/capabilities")
            .method("GET")
            .header("Origin", "http://localhost")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_origin_is_forbidden() {
        let tmp = tempfile::tempdir().unwrap();
        let app = build_router(state(tmp.path()));
        let req = Request::builder()
            .uri("/healthz")
            .method("GET")
            .header("Origin", "http://evil.example")
            .header("Authorization", "Bearer t")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_op_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let app = build_router(state(tmp.path()));
        let req = authed(Request::builder().uri("/api/call").method("POST"))
            .header("Content-Type", "application/json")
            .body(Body::from(
                serde_json::json!({"id": "1", "op": "no_such_op"}).to_string(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}

#[cfg(all(test, unix))]
mod end_to_end {
    use crate::api::registry::OpRegistry;
    use crate::security::RateLimiters;
    use crate::server::{build_router, AppState};
    use crate::session::SessionSlot;
    use crate::test_support::{test_config, test_project};
    use serde_json::json;
    use std::sync::Arc;

    async fn spawn_server(root: &std::path::Path) -> String {
        let state = AppState {
            cfg: Arc::new(test_config(root)),
            registry: Arc::new(OpRegistry::new()),
            sessions: Arc::new(SessionSlot::new()),
            rls: RateLimiters::new(100, 100, 100, 100),
        };
        let app = build_router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn call(
        client: &reqwest::Client,
        base: &str,
        op: &str,
        params: serde_json::Value,
        stream: bool,
    ) -> reqwest::Response {
        client
            .post(format!("{base}/api/call"))
            .header("Origin", "http://localhost")
            .header("Authorization", "Bearer t")
            .json(&json!({"id": "1", "op": op, "params": params, "stream": stream}))
            .send()
            .await
            .unwrap()
    }

    /// A registered sensitive value passed through a spawned process must
    /// reach the listener as the marker only.
    #[tokio::test]
    async fn registered_secret_never_crosses_the_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let project = test_project(tmp.path());
        let base = spawn_server(tmp.path()).await;
        let client = reqwest::Client::new();

        let resp = call(
            &client,
            &base,
            "project_open",
            json!({"path": project.to_str().unwrap()}),
            false,
        )
        .await;
        assert_eq!(resp.status(), 200);

        let resp = call(
            &client,
            &base,
            "variables_set",
            json!({"values": [{"name": "token", "value": "secret-token-123", "sensitive": true}]}),
            false,
        )
        .await;
        assert_eq!(resp.status(), 200);

        // /bin/echo prints the whole argument vector, secret included; the
        // redactor must catch it before the stream does
        let resp = call(&client, &base, "plan", json!({}), true).await;
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some("application/x-ndjson")
        );
        let body = resp.text().await.unwrap();
        assert!(!body.contains("secret-token-123"), "secret leaked: {body}");
        assert!(body.contains("[REDACTED]"));
        assert!(body.contains(r#""event":"start""#));
        assert!(body.contains(r#""event":"end""#));

        // buffered result path is redacted the same way
        let resp = call(&client, &base, "plan", json!({}), false).await;
        let payload: serde_json::Value = resp.json().await.unwrap();
        let stdout = payload["result"]["stdout"].as_str().unwrap();
        assert!(!stdout.contains("secret-token-123"));
        assert!(stdout.contains("[REDACTED]"));
    }
}

#[cfg(all(test, unix))]
mod run_serialization {
    use crate::api::registry::{Op, OpCtx};
    use crate::errors::AppError;
    use crate::ops::lifecycle::{PlanOp, RunCancelOp};
    use crate::session::SessionSlot;
    use crate::test_support::{test_config, test_project};
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use std::time::Duration;

    fn slow_binary(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("fake-terraform");
        std::fs::write(&path, "#!/bin/sh\nsleep 2\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn concurrent_run_is_rejected_and_cancel_unblocks() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = test_config(tmp.path());
        cfg.terraform.binary = slow_binary(tmp.path()).to_str().unwrap().to_string();
        let ctx = OpCtx {
            cfg: Arc::new(cfg),
            sessions: Arc::new(SessionSlot::new()),
        };
        ctx.sessions.open(test_project(tmp.path()), Vec::new());

        let first_ctx = ctx.clone();
        let first = tokio::spawn(async move { PlanOp.call(&first_ctx, json!({})).await });
        tokio::time::sleep(Duration::from_millis(300)).await;

        let err = PlanOp.call(&ctx, json!({})).await.unwrap_err();
        assert!(matches!(err, AppError::RunInProgress));

        let out = RunCancelOp.call(&ctx, json!({})).await.unwrap();
        assert_eq!(out["cancelled"], true);

        let result = first.await.unwrap().unwrap();
        assert_eq!(result["cancelled"], true);
        assert_eq!(result["exit_code"], serde_json::Value::Null);

        // the lock is free again
        let err_or_ok = PlanOp.call(&ctx, json!({})).await;
        assert!(!matches!(err_or_ok, Err(AppError::RunInProgress)));
    }
}
