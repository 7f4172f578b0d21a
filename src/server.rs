use crate::{
    api::{
        registry::{CallRequest, OpCtx, OpRegistry},
        types::{Capabilities, OpInfo},
    },
    config::Config,
    errors::{into_response, AppError},
    security,
    session::SessionSlot,
};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub registry: Arc<OpRegistry>,
    pub sessions: Arc<SessionSlot>,
    pub rls: security::RateLimiters,
}

pub type StreamBody = axum::body::Body;

pub async fn serve(cfg: Config, registry: OpRegistry) -> anyhow::Result<()> {
    let shared = AppState {
        cfg: Arc::new(cfg),
        registry: Arc::new(registry),
        sessions: Arc::new(SessionSlot::new()),
        rls: security::RateLimiters::new(20, 40, 10, 20),
    };

    let app = build_router(shared.clone());

    let addr: std::net::SocketAddr =
        format!("{}:{}", shared.cfg.server.bind_addr, shared.cfg.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let sessions = shared.sessions.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // zeroize any held secrets before the process exits
    sessions.close();
    Ok(())
}

pub fn build_router(shared: AppState) -> Router {
    let base = shared.cfg.server.base_path.clone();
    use tower_http::limit::RequestBodyLimitLayer;
    let limit_bytes = shared.cfg.limits.max_request_kb * 1024;
    Router::new()
        .route("/healthz", get(health))
        .route(&format!("{base}/capabilities"), get(capabilities))
        .route(
            &format!("{base}/call"),
            post(call).layer(RequestBodyLimitLayer::new(limit_bytes)),
        )
        .with_state(shared)
}

async fn health(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    match authorize(&state, &headers) {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))).into_response(),
        Err(e) => into_response(e).into_response(),
    }
}

async fn capabilities(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(e) = authorize(&state, &headers) {
        return into_response(e).into_response();
    }
    let ops: Vec<OpInfo> = state
        .registry
        .list_names()
        .into_iter()
        .filter_map(|name| {
            state.registry.get(&name).map(|op| OpInfo {
                name,
                input_schema: op.capabilities()["input"].clone(),
                output_schema: op.capabilities()["output"].clone(),
            })
        })
        .collect();
    let caps = Capabilities {
        api_version: "1.0",
        ops,
        streaming: true,
    };
    (StatusCode::OK, Json(caps)).into_response()
}

async fn call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CallRequest>,
) -> Response {
    use std::time::Instant;
    let started = Instant::now();
    let request_id = uuid::Uuid::new_v4().to_string();
    let origin = headers
        .get("Origin")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let token = security::extract_bearer(&headers);
    let token_present = token.is_some();

    let deny = |e: AppError| {
        audit(
            &request_id,
            &origin,
            token_present,
            &req.op,
            "deny",
            e.code(),
            started.elapsed().as_millis() as u64,
            None,
        );
        into_response(e).into_response()
    };

    if let Err(e) = authorize(&state, &headers) {
        return deny(e);
    }
    if let Err(e) = security::content_length_ok(&headers, state.cfg.limits.max_request_kb) {
        return deny(e);
    }
    if let Err(e) = state.rls.check(token.as_deref()) {
        return deny(e);
    }

    let Some(op) = state.registry.get(&req.op) else {
        return deny(AppError::NotFound);
    };
    let ctx = OpCtx {
        cfg: state.cfg.clone(),
        sessions: state.sessions.clone(),
    };

    if req.stream {
        match op.call_stream(&ctx, req.params).await {
            Ok(body) => {
                audit(
                    &request_id,
                    &origin,
                    token_present,
                    &req.op,
                    "allow",
                    "OK",
                    started.elapsed().as_millis() as u64,
                    Some(true),
                );
                (
                    StatusCode::OK,
                    [(axum::http::header::CONTENT_TYPE, "application/x-ndjson")],
                    body,
                )
                    .into_response()
            }
            Err(e) => {
                audit(
                    &request_id,
                    &origin,
                    token_present,
                    &req.op,
                    "error",
                    e.code(),
                    started.elapsed().as_millis() as u64,
                    Some(true),
                );
                into_response(e).into_response()
            }
        }
    } else {
        match op.call(&ctx, req.params).await {
            Ok(result) => {
                // audit sizes and outcomes only; payload content never
                // reaches the log sink
                audit_result(
                    &request_id,
                    &origin,
                    token_present,
                    &req.op,
                    &result,
                    started.elapsed().as_millis() as u64,
                );
                let payload = json!({"id": req.id, "result": result});
                (StatusCode::OK, Json(payload)).into_response()
            }
            Err(e) => {
                audit(
                    &request_id,
                    &origin,
                    token_present,
                    &req.op,
                    "error",
                    e.code(),
                    started.elapsed().as_millis() as u64,
                    Some(false),
                );
                let body =
                    json!({"id": req.id, "error": {"code": e.code(), "message": e.to_string()}});
                (e.status(), Json(body)).into_response()
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn audit(
    request_id: &str,
    origin: &str,
    token_present: bool,
    op: &str,
    decision: &str,
    code: &str,
    duration_ms: u64,
    streaming: Option<bool>,
) {
    tracing::info!(
        request_id = request_id,
        origin = origin,
        token_present = token_present,
        op = op,
        decision = decision,
        code = code,
        duration_ms = duration_ms,
        streaming = ?streaming,
        "audit"
    );
}

fn audit_result(
    request_id: &str,
    origin: &str,
    token_present: bool,
    op: &str,
    result: &serde_json::Value,
    duration_ms: u64,
) {
    let exit_code = result.get("exit_code").and_then(|v| v.as_i64());
    let timed_out = result.get("timed_out").and_then(|v| v.as_bool());
    let cancelled = result.get("cancelled").and_then(|v| v.as_bool());
    let stdout_len = result
        .get("stdout")
        .and_then(|v| v.as_str())
        .map(|s| s.len());
    let stderr_len = result
        .get("stderr")
        .and_then(|v| v.as_str())
        .map(|s| s.len());
    tracing::info!(
        request_id = request_id,
        origin = origin,
        token_present = token_present,
        op = op,
        decision = "allow",
        code = "OK",
        duration_ms = duration_ms,
        exit_code = exit_code,
        timed_out = timed_out,
        cancelled = cancelled,
        stdout_len = stdout_len,
        stderr_len = stderr_len,
        "audit"
    );
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    security::require_bearer(headers, &state.cfg.auth.bearer_token)?;
    security::check_origin(headers, &state.cfg.auth.allowed_origins)?;
    Ok(())
}
