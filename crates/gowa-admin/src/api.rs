//! Admin HTTP API.
//!
//! Bearer-authenticated JSON surface over the instance manager. Every
//! response carries `request_id` and `timestamp`; errors use the stable
//! `{error, message, request_id, timestamp}` envelope. Requests run under
//! a 60 s timeout and a panic-recovery layer: a panicking handler becomes
//! a logged 500, never a dead control plane.

use crate::audit::{AuditEntry, AuditLogger, AuditResult};
use crate::cleanup::{run_cleanup, CleanupRequest};
use crate::instances::{validate_port, InstanceManager};
use crate::metrics;
use crate::supervisor::Supervisor;
use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use gowa_core::{AdminConfig, GatewayError, InstanceOverrides};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::warn;
use uuid::Uuid;

/// Per-request id, honored from `X-Request-Id` or generated.
#[derive(Clone)]
pub struct RequestId(pub String);

#[derive(Clone)]
pub struct AdminState {
    pub config: Arc<AdminConfig>,
    pub manager: Arc<InstanceManager>,
    pub supervisor: Arc<dyn Supervisor>,
    pub audit: AuditLogger,
    pub started: Instant,
}

impl AdminState {
    pub fn new(
        config: AdminConfig,
        supervisor: Arc<dyn Supervisor>,
        audit: AuditLogger,
    ) -> Self {
        let manager = Arc::new(InstanceManager::new(config.clone(), Arc::clone(&supervisor)));
        Self {
            config: Arc::new(config),
            manager,
            supervisor,
            audit,
            started: Instant::now(),
        }
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route(
            "/admin/instances",
            post(create_instance).get(list_instances),
        )
        .route(
            "/admin/instances/{port}",
            get(get_instance)
                .patch(update_instance)
                .delete(delete_instance),
        )
        .route("/admin/cleanup", post(cleanup))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_text))
        .layer(middleware::from_fn(request_context))
        .layer(TimeoutLayer::new(Duration::from_secs(60)))
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

/// Request-id propagation, per-request metrics, and response tagging.
async fn request_context(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let mut response = next.run(request).await;

    metrics::ADMIN_REQUESTS
        .with_label_values(&[method.as_str(), &path, response.status().as_str()])
        .inc();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

// --- response helpers ------------------------------------------------------

fn envelope(request_id: &str, mut body: Value) -> Value {
    if let Some(map) = body.as_object_mut() {
        map.insert("request_id".into(), json!(request_id));
        map.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
    }
    body
}

fn ok(request_id: &str, status: StatusCode, body: Value) -> Response {
    (status, Json(envelope(request_id, body))).into_response()
}

fn fail(request_id: &str, error: &GatewayError) -> Response {
    if matches!(
        error,
        GatewayError::SupervisorUnreachable(_)
            | GatewayError::SupervisorTimeout(_)
            | GatewayError::Supervisor(_)
    ) {
        metrics::SUPERVISOR_ERRORS.inc();
    }
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({
        "error": error.machine_code(),
        "message": error.to_string(),
    });
    (status, Json(envelope(request_id, body))).into_response()
}

fn check_auth(headers: &HeaderMap, token: &str) -> Result<(), GatewayError> {
    let value = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::Unauthorized)?;
    match value.strip_prefix("Bearer ") {
        Some(presented) if constant_time_eq(presented, token) => Ok(()),
        _ => Err(GatewayError::Unauthorized),
    }
}

/// Constant-time comparison to keep token checks timing-safe.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

fn parse_json<T: for<'de> Deserialize<'de> + Default>(body: &Bytes) -> Result<T, GatewayError> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| GatewayError::InvalidInput(format!("invalid JSON body: {e}")))
}

fn parse_path_port(raw: &str) -> Result<u16, GatewayError> {
    let port: i64 = raw
        .parse()
        .map_err(|_| GatewayError::InvalidInput(format!("invalid port '{raw}'")))?;
    validate_port(port)
}

async fn audit_op(
    state: &AdminState,
    action: &str,
    port: Option<u16>,
    request_id: &str,
    started: Instant,
    error: Option<&GatewayError>,
) {
    let entry = AuditEntry {
        action: action.to_string(),
        port,
        request_id: request_id.to_string(),
        result: if error.is_none() {
            AuditResult::Ok
        } else {
            AuditResult::Error
        },
        error: error.map(|e| e.to_string()),
        duration_ms: started.elapsed().as_millis() as i64,
    };
    if let Err(e) = state.audit.log(&entry).await {
        warn!(action, "audit write failed: {e}");
    }
}

// --- instance handlers -----------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct CreateInstanceRequest {
    port: Option<i64>,
    #[serde(flatten)]
    overrides: InstanceOverrides,
}

async fn create_instance(
    State(state): State<AdminState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.admin_token) {
        return fail(&request_id, &e);
    }
    let started = Instant::now();

    let result = async {
        let request: CreateInstanceRequest = parse_json(&body)?;
        let port = request
            .port
            .ok_or_else(|| GatewayError::InvalidInput("port is required".into()))?;
        let port = validate_port(port)?;
        let instance = state.manager.create(port, request.overrides).await?;
        Ok::<_, GatewayError>(instance)
    }
    .await;

    match result {
        Ok(instance) => {
            audit_op(
                &state,
                "create_instance",
                Some(instance.port),
                &request_id,
                started,
                None,
            )
            .await;
            ok(
                &request_id,
                StatusCode::CREATED,
                json!({ "instance": instance }),
            )
        }
        Err(e) => {
            audit_op(&state, "create_instance", None, &request_id, started, Some(&e)).await;
            fail(&request_id, &e)
        }
    }
}

async fn list_instances(
    State(state): State<AdminState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.admin_token) {
        return fail(&request_id, &e);
    }
    match state.manager.list().await {
        Ok(instances) => ok(
            &request_id,
            StatusCode::OK,
            json!({ "instances": instances }),
        ),
        Err(e) => fail(&request_id, &e),
    }
}

async fn get_instance(
    State(state): State<AdminState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(port): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.admin_token) {
        return fail(&request_id, &e);
    }
    let result = async {
        let port = parse_path_port(&port)?;
        state.manager.get(port).await
    }
    .await;
    match result {
        Ok(instance) => ok(&request_id, StatusCode::OK, json!({ "instance": instance })),
        Err(e) => fail(&request_id, &e),
    }
}

async fn update_instance(
    State(state): State<AdminState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(port): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.admin_token) {
        return fail(&request_id, &e);
    }
    let started = Instant::now();

    let port = match parse_path_port(&port) {
        Ok(port) => port,
        Err(e) => return fail(&request_id, &e),
    };
    let result = async {
        let overrides: InstanceOverrides = parse_json(&body)?;
        state.manager.update(port, overrides).await
    }
    .await;

    match result {
        Ok(instance) => {
            audit_op(
                &state,
                "update_instance",
                Some(port),
                &request_id,
                started,
                None,
            )
            .await;
            ok(&request_id, StatusCode::OK, json!({ "instance": instance }))
        }
        Err(e) => {
            audit_op(
                &state,
                "update_instance",
                Some(port),
                &request_id,
                started,
                Some(&e),
            )
            .await;
            fail(&request_id, &e)
        }
    }
}

async fn delete_instance(
    State(state): State<AdminState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(port): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.admin_token) {
        return fail(&request_id, &e);
    }
    let started = Instant::now();

    let port = match parse_path_port(&port) {
        Ok(port) => port,
        Err(e) => return fail(&request_id, &e),
    };
    match state.manager.delete(port).await {
        Ok(()) => {
            audit_op(
                &state,
                "delete_instance",
                Some(port),
                &request_id,
                started,
                None,
            )
            .await;
            ok(
                &request_id,
                StatusCode::OK,
                json!({ "deleted": true, "port": port }),
            )
        }
        Err(e) => {
            audit_op(
                &state,
                "delete_instance",
                Some(port),
                &request_id,
                started,
                Some(&e),
            )
            .await;
            fail(&request_id, &e)
        }
    }
}

// --- cleanup ---------------------------------------------------------------

async fn cleanup(
    State(state): State<AdminState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = check_auth(&headers, &state.config.admin_token) {
        return fail(&request_id, &e);
    }

    let request: CleanupRequest = match parse_json(&body) {
        Ok(request) => request,
        Err(e) => return fail(&request_id, &e),
    };

    let directories = request
        .directories
        .filter(|dirs| !dirs.is_empty())
        .unwrap_or_else(|| state.config.cleanup_directories.clone());
    if directories.is_empty() {
        return fail(
            &request_id,
            &GatewayError::InvalidInput(
                "no cleanup directories configured; pass `directories` in the request".into(),
            ),
        );
    }

    let retention_days = request
        .retention_days
        .unwrap_or(state.config.cleanup_retention_days);
    let dry_run = request.dry_run.unwrap_or(false);

    let summary = tokio::task::spawn_blocking(move || {
        run_cleanup(&directories, retention_days, dry_run)
    })
    .await;

    match summary {
        Ok(summary) => ok(&request_id, StatusCode::OK, json!({ "cleanup": summary })),
        Err(e) => fail(
            &request_id,
            &GatewayError::Supervisor(format!("cleanup task failed: {e}")),
        ),
    }
}

// --- health & metrics ------------------------------------------------------

async fn healthz(
    State(state): State<AdminState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> Response {
    ok(
        &request_id,
        StatusCode::OK,
        json!({
            "status": "healthy",
            "uptime_secs": state.started.elapsed().as_secs(),
        }),
    )
}

async fn readyz(
    State(state): State<AdminState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> Response {
    match state.supervisor.ping().await {
        Ok(()) => ok(&request_id, StatusCode::OK, json!({ "status": "ready" })),
        Err(e) => {
            metrics::SUPERVISOR_ERRORS.inc();
            let body = json!({
                "error": "supervisor_unreachable",
                "message": e.to_string(),
            });
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(envelope(&request_id, body)),
            )
                .into_response()
        }
    }
}

async fn metrics_text() -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::render(),
    )
        .into_response()
}
