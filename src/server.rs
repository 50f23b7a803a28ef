//! Worker HTTP surface.
//!
//! Thin routing over the device registry: device CRUD, login artifacts,
//! and a send endpoint. Device-scoped requests resolve their target via
//! the `X-Device-Id` header, the `device_id` query parameter, or the
//! sole-device fallback.

use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use gowa_core::{GatewayError, Jid, WorkerConfig};
use gowa_device::{DeviceHandle, DeviceRegistry, LoginArtifact, LoginMethod};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;

#[derive(Clone)]
pub struct WorkerState {
    pub registry: Arc<DeviceRegistry>,
    pub config: Arc<WorkerConfig>,
}

pub fn router(state: WorkerState) -> Router {
    let base_path = state.config.base_path.clone();
    let api = Router::new()
        .route("/health", get(health))
        .route("/devices", get(list_devices).post(create_device))
        .route("/devices/login", post(login_qr))
        .route("/devices/login/code", post(login_code))
        .route("/devices/reconnect", post(reconnect))
        .route("/devices/logout", post(logout))
        .route("/send/message", post(send_message))
        .layer(middleware::from_fn_with_state(state.clone(), basic_auth))
        .layer(CatchPanicLayer::new())
        .with_state(state);

    if base_path.is_empty() || base_path == "/" {
        api
    } else {
        Router::new().nest(&base_path, api)
    }
}

fn fail(error: &GatewayError) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({
            "error": error.machine_code(),
            "message": error.to_string(),
        })),
    )
        .into_response()
}

/// Worker basic auth: enabled when `GOWA_BASIC_AUTH` carries pairs.
async fn basic_auth(
    State(state): State<WorkerState>,
    request: Request,
    next: Next,
) -> Response {
    let pairs = state.config.basic_auth_pairs();
    if pairs.is_empty() {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|v| BASE64.decode(v).ok())
        .and_then(|raw| String::from_utf8(raw).ok());

    let authorized = presented
        .as_deref()
        .and_then(|creds| creds.split_once(':'))
        .map(|(user, pass)| {
            pairs
                .iter()
                .any(|(u, p)| u == user && p == pass)
        })
        .unwrap_or(false);

    if authorized {
        next.run(request).await
    } else {
        fail(&GatewayError::Unauthorized)
    }
}

async fn resolve(
    state: &WorkerState,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Result<Arc<DeviceHandle>, GatewayError> {
    let header = headers.get("x-device-id").and_then(|v| v.to_str().ok());
    let query = params.get("device_id").map(String::as_str);
    state.registry.resolve(header, query).await
}

async fn health(State(state): State<WorkerState>) -> Response {
    let devices = state.registry.list().await;
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "devices": devices.len() })),
    )
        .into_response()
}

async fn list_devices(State(state): State<WorkerState>) -> Response {
    let devices = state.registry.list().await;
    (StatusCode::OK, Json(json!({ "devices": devices }))).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct CreateDeviceRequest {
    device_id: Option<String>,
}

async fn create_device(State(state): State<WorkerState>, body: Bytes) -> Response {
    let request: CreateDeviceRequest = if body.is_empty() {
        CreateDeviceRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return fail(&GatewayError::InvalidInput(format!("invalid JSON body: {e}")))
            }
        }
    };

    match state.registry.create(request.device_id).await {
        Ok(device) => (StatusCode::CREATED, Json(json!({ "device": device }))).into_response(),
        Err(e) => fail(&e),
    }
}

async fn login_qr(
    State(state): State<WorkerState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let device = match resolve(&state, &headers, &params).await {
        Ok(device) => device,
        Err(e) => return fail(&e),
    };

    match state.registry.login(&device.id, LoginMethod::Qr).await {
        Ok(LoginArtifact::QrPng(png)) => (
            StatusCode::OK,
            Json(json!({
                "device_id": device.id,
                "qr_png_base64": BASE64.encode(&png),
            })),
        )
            .into_response(),
        Ok(LoginArtifact::PairCode(_)) => fail(&GatewayError::Transport(
            "unexpected pairing code from a QR login".into(),
        )),
        Err(e) => fail(&e),
    }
}

async fn login_code(
    State(state): State<WorkerState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let device = match resolve(&state, &headers, &params).await {
        Ok(device) => device,
        Err(e) => return fail(&e),
    };

    let Some(phone) = params.get("phone").filter(|p| !p.is_empty()).cloned() else {
        return fail(&GatewayError::InvalidInput(
            "phone query parameter is required for pairing-code login".into(),
        ));
    };

    match state
        .registry
        .login(&device.id, LoginMethod::Code { phone })
        .await
    {
        Ok(LoginArtifact::PairCode(code)) => (
            StatusCode::OK,
            Json(json!({
                "device_id": device.id,
                "pair_code": code,
            })),
        )
            .into_response(),
        Ok(LoginArtifact::QrPng(_)) => fail(&GatewayError::Transport(
            "unexpected QR artifact from a pairing-code login".into(),
        )),
        Err(e) => fail(&e),
    }
}

async fn reconnect(
    State(state): State<WorkerState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let device = match resolve(&state, &headers, &params).await {
        Ok(device) => device,
        Err(e) => return fail(&e),
    };
    match state.registry.reconnect(&device.id).await {
        Ok(new_state) => (
            StatusCode::OK,
            Json(json!({ "device_id": device.id, "state": new_state })),
        )
            .into_response(),
        Err(e) => fail(&e),
    }
}

async fn logout(
    State(state): State<WorkerState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let device = match resolve(&state, &headers, &params).await {
        Ok(device) => device,
        Err(e) => return fail(&e),
    };
    match state.registry.logout(&device.id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "device_id": device.id, "logged_out": true })),
        )
            .into_response(),
        Err(e) => fail(&e),
    }
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    /// Full JID, or bare digits for a phone number.
    phone: String,
    message: String,
}

async fn send_message(
    State(state): State<WorkerState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let device = match resolve(&state, &headers, &params).await {
        Ok(device) => device,
        Err(e) => return fail(&e),
    };

    let request: SendMessageRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return fail(&GatewayError::InvalidInput(format!("invalid JSON body: {e}"))),
    };
    if request.message.is_empty() {
        return fail(&GatewayError::InvalidInput("message must not be empty".into()));
    }

    let to: Jid = if request.phone.contains('@') {
        match request.phone.parse() {
            Ok(jid) => jid,
            Err(_) => {
                return fail(&GatewayError::InvalidInput(format!(
                    "invalid JID '{}'",
                    request.phone
                )))
            }
        }
    } else {
        Jid::pn(request.phone.clone())
    };

    match state.registry.send_text(&device, &to, &request.message).await {
        Ok(message_id) => (
            StatusCode::OK,
            Json(json!({
                "device_id": device.id,
                "message_id": message_id,
                "status": "sent",
            })),
        )
            .into_response(),
        Err(e) => fail(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use gowa_device::testing::MockTransportFactory;
    use gowa_device::ConnectionState;
    use gowa_storage::ChatStorage;
    use gowa_webhook::{WebhookConfig, WebhookDispatcher};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn worker(config: WorkerConfig) -> (Router, WorkerState, Arc<MockTransportFactory>) {
        let storage = ChatStorage::open(None).await.unwrap();
        let webhooks = WebhookDispatcher::new(WebhookConfig::from_worker(&config)).unwrap();
        let factory = MockTransportFactory::new();
        let registry = DeviceRegistry::new(
            storage,
            Arc::clone(&factory) as Arc<dyn gowa_device::transport::TransportFactory>,
            webhooks,
            config.clone(),
        );
        let state = WorkerState {
            registry,
            config: Arc::new(config),
        };
        (router(state.clone()), state, factory)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(path: &str, body: &str) -> Request<Body> {
        Request::post(path)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn create_then_list_shows_the_device() {
        let (app, _, _) = worker(WorkerConfig::default()).await;

        let response = app
            .clone()
            .oneshot(post_json("/devices", r#"{"device_id": "main"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(Request::get("/devices").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let devices = json["devices"].as_array().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0]["device_id"], "main");
        assert_eq!(devices[0]["state"], "registered");
    }

    #[tokio::test]
    async fn duplicate_device_is_conflict() {
        let (app, _, _) = worker(WorkerConfig::default()).await;
        app.clone()
            .oneshot(post_json("/devices", r#"{"device_id": "main"}"#))
            .await
            .unwrap();
        let response = app
            .oneshot(post_json("/devices", r#"{"device_id": "main"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn sole_device_fallback_sends_without_header() {
        let (app, state, factory) = worker(WorkerConfig::default()).await;

        state.registry.create(Some("solo".into())).await.unwrap();
        state.registry.reconnect("solo").await.unwrap();
        let handle = state.registry.get("solo").await.unwrap();
        handle.set_state(ConnectionState::LoggedIn).await;

        let response = app
            .oneshot(post_json(
                "/send/message",
                r#"{"phone": "5511999887766", "message": "hello"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["device_id"], "solo");
        assert!(json["message_id"].as_str().unwrap().starts_with("SENT"));

        let transport = factory.transport("solo").unwrap();
        assert_eq!(transport.sent_texts().len(), 1);
    }

    #[tokio::test]
    async fn two_devices_require_an_explicit_id() {
        let (app, state, _) = worker(WorkerConfig::default()).await;
        state.registry.create(Some("a".into())).await.unwrap();
        state.registry.create(Some("b".into())).await.unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                "/send/message",
                r#"{"phone": "5511999887766", "message": "hello"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "device_id_required");

        // Header selects the device, which is not logged in yet.
        let request = Request::post("/send/message")
            .header("Content-Type", "application/json")
            .header("X-Device-Id", "a")
            .body(Body::from(
                r#"{"phone": "5511999887766", "message": "hello"}"#,
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = body_json(response).await;
        assert_eq!(json["error"], "device_not_logged_in");
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let (app, _, _) = worker(WorkerConfig::default()).await;
        let request = Request::post("/devices/reconnect")
            .header("X-Device-Id", "ghost")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"], "device_not_found");
    }

    #[tokio::test]
    async fn logout_removes_the_device() {
        let (app, state, _) = worker(WorkerConfig::default()).await;
        state.registry.create(Some("solo".into())).await.unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::post("/devices/logout")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/devices").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert!(json["devices"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn basic_auth_guards_the_surface() {
        let mut config = WorkerConfig::default();
        config.basic_auth = "admin:pw".into();
        let (app, _, _) = worker(config).await;

        let response = app
            .clone()
            .oneshot(Request::get("/devices").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let credentials = BASE64.encode("admin:pw");
        let response = app
            .oneshot(
                Request::get("/devices")
                    .header("Authorization", format!("Basic {credentials}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn base_path_mounts_the_api() {
        let mut config = WorkerConfig::default();
        config.base_path = "/gateway".into();
        let (app, _, _) = worker(config).await;

        let response = app
            .clone()
            .oneshot(Request::get("/gateway/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pairing_code_login_over_http() {
        let (app, state, _) = worker(WorkerConfig::default()).await;
        state.registry.create(Some("solo".into())).await.unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::post("/devices/login/code?phone=5511999887766")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["pair_code"], "ABCD-1234");

        // The code route requires a phone number.
        let response = app
            .oneshot(
                Request::post("/devices/login/code")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"], "invalid_input");
    }
}
