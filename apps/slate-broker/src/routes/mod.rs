mod admin;
mod auth;
mod devices;
mod instances;

use axum::{
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::metrics;
use crate::state::{AppState, StateError};

pub use auth::AuthToken;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        // Device-facing: registration and token lifecycle.
        .route("/auth/devices/register", post(devices::register_device))
        .route("/auth/devices/token", post(devices::authenticate_device))
        .route("/auth/devices/refresh", post(devices::refresh_access_token))
        .route(
            "/auth/devices/renew-refresh",
            post(devices::renew_refresh_token),
        )
        .route("/auth/devices/status", get(devices::device_auth_status))
        // Device-facing: polling, frames, inputs.
        .route("/devices/:device_id/state", get(devices::poll_state))
        .route(
            "/devices/:device_id/frames/:frame_id",
            get(devices::fetch_frame),
        )
        .route(
            "/devices/:device_id/frames/:frame_id/ack",
            post(devices::acknowledge_frame),
        )
        .route("/devices/:device_id/inputs", post(devices::submit_input))
        // Backend-facing callbacks.
        .route(
            "/instances/:instance_id/frames",
            post(instances::submit_frame),
        )
        .route(
            "/instances/:instance_id/notify",
            post(instances::notify_change),
        )
        // Admin glue.
        .route(
            "/admin/hlss-types",
            get(admin::list_hlss_types).post(admin::create_hlss_type),
        )
        .route(
            "/admin/hlss-types/:type_id",
            get(admin::get_hlss_type).patch(admin::update_hlss_type),
        )
        .route(
            "/admin/instances",
            get(admin::list_instances).post(admin::create_instance),
        )
        .route(
            "/admin/instances/:instance_id",
            get(admin::get_instance).delete(admin::delete_instance),
        )
        .route(
            "/admin/instances/:instance_id/initialize",
            post(admin::initialize_instance),
        )
        .route(
            "/admin/instances/:instance_id/refresh-status",
            post(admin::refresh_instance_status),
        )
        .route(
            "/admin/instances/:instance_id/request-render",
            post(admin::request_render),
        )
        .route("/admin/devices", get(admin::list_devices))
        .route("/admin/devices/pending", get(admin::pending_devices))
        .route("/admin/devices/:device_id", get(admin::get_device))
        .route(
            "/admin/devices/:device_id/authorize",
            post(admin::authorize_device),
        )
        .route(
            "/admin/devices/:device_id/reject",
            post(admin::reject_device),
        )
        .route(
            "/admin/devices/:device_id/revoke",
            post(admin::revoke_device),
        )
        .route(
            "/admin/devices/:device_id/reauthorize",
            post(admin::reauthorize_device),
        )
        .route(
            "/admin/devices/:device_id/assign-instance",
            post(admin::assign_instance),
        )
        .route(
            "/admin/devices/:device_id/instances/:instance_id",
            axum::routing::delete(admin::unassign_instance),
        )
        .route(
            "/admin/devices/:device_id/set-active-instance",
            post(admin::set_active_instance),
        )
        .route("/admin/input-events", get(admin::input_events))
        .route("/admin/status", get(admin::system_status))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

async fn metrics_endpoint() -> String {
    metrics::export_prometheus()
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden(&'static str),
    NotFound(&'static str),
    Conflict(&'static str),
    BadRequest(String),
    BadGateway(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use axum::http::StatusCode;
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(ApiErrorBody {
                    error: "unauthorized",
                    message: None,
                }),
            )
                .into_response(),
            ApiError::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                Json(ApiErrorBody {
                    error: "forbidden",
                    message: Some(msg.to_string()),
                }),
            )
                .into_response(),
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                Json(ApiErrorBody {
                    error: "not_found",
                    message: Some(msg.to_string()),
                }),
            )
                .into_response(),
            ApiError::Conflict(msg) => (
                StatusCode::CONFLICT,
                Json(ApiErrorBody {
                    error: "conflict",
                    message: Some(msg.to_string()),
                }),
            )
                .into_response(),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Json(ApiErrorBody {
                    error: "bad_request",
                    message: Some(msg),
                }),
            )
                .into_response(),
            ApiError::BadGateway(msg) => (
                StatusCode::BAD_GATEWAY,
                Json(ApiErrorBody {
                    error: "backend_unavailable",
                    message: Some(msg),
                }),
            )
                .into_response(),
        }
    }
}

fn map_state_err(err: StateError) -> ApiError {
    match err {
        StateError::DeviceNotFound => ApiError::NotFound("device not found"),
        StateError::InstanceNotFound => ApiError::NotFound("instance not found"),
        StateError::FrameNotFound => ApiError::NotFound("frame not found"),
        StateError::TypeNotFound => ApiError::NotFound("hlss type not found"),
        StateError::AssignmentNotFound => ApiError::NotFound("assignment not found"),
        StateError::InvalidAssignment(msg) => ApiError::BadRequest(msg),
        StateError::Invalid(msg) => ApiError::BadRequest(msg),
        StateError::Auth(_)
        | StateError::InvalidCredentials
        | StateError::SessionRevoked
        | StateError::UnknownSubject => ApiError::Unauthorized,
        StateError::Forbidden(msg) => ApiError::Forbidden(msg),
        StateError::Conflict(msg) => ApiError::Conflict(msg),
        StateError::Backend(e) => {
            error!(error = %e, "backend call failed");
            ApiError::BadGateway(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::{self, Body},
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tokio::sync::Mutex;
    use tower::util::ServiceExt;

    use slate_frame::FrameDelta;
    use slate_wire::{
        HlssInitRequest, HlssInitResponse, HlssStatusResponse, InputEvent,
    };

    use crate::config::AppConfig;
    use crate::hlss::{HlssEndpoint, HlssError, HlssTransport};
    use crate::state::AppState;

    use super::build_router;

    /// Fake HLSS backend: records forwarded inputs, answers initialization
    /// and status queries, and can be flipped into failure modes.
    #[derive(Default)]
    struct RecordingTransport {
        forwarded: Mutex<Vec<(String, InputEvent)>>,
        fail_init: AtomicBool,
        fail_inputs: AtomicBool,
        needs_configuration: AtomicBool,
        status_ready: AtomicBool,
    }

    #[async_trait]
    impl HlssTransport for RecordingTransport {
        async fn initialize(
            &self,
            _endpoint: &HlssEndpoint,
            request: &HlssInitRequest,
        ) -> Result<HlssInitResponse, HlssError> {
            if self.fail_init.load(Ordering::SeqCst) {
                return Err(HlssError::Timeout);
            }
            let needs_configuration = self.needs_configuration.load(Ordering::SeqCst);
            Ok(HlssInitResponse {
                status: "initialized".into(),
                needs_configuration,
                configuration_url: needs_configuration
                    .then(|| format!("https://hlss.local/{}/configure", request.instance_id)),
            })
        }

        async fn status(
            &self,
            _endpoint: &HlssEndpoint,
            instance_id: &str,
        ) -> Result<HlssStatusResponse, HlssError> {
            Ok(HlssStatusResponse {
                instance_id: instance_id.to_string(),
                ready: self.status_ready.load(Ordering::SeqCst),
                needs_configuration: false,
                configuration_url: None,
                active_screen: None,
            })
        }

        async fn forward_input(
            &self,
            _endpoint: &HlssEndpoint,
            instance_id: &str,
            event: &InputEvent,
        ) -> Result<(), HlssError> {
            if self.fail_inputs.load(Ordering::SeqCst) {
                return Err(HlssError::Connect("connection refused".into()));
            }
            self.forwarded
                .lock()
                .await
                .push((instance_id.to_string(), event.clone()));
            Ok(())
        }

        async fn request_render(
            &self,
            _endpoint: &HlssEndpoint,
            _instance_id: &str,
        ) -> Result<(), HlssError> {
            Ok(())
        }
    }

    fn test_app() -> (axum::Router, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport {
            status_ready: AtomicBool::new(true),
            ..RecordingTransport::default()
        });
        let config = AppConfig {
            token_secret: Some("router-test-secret".into()),
            ..AppConfig::default()
        };
        let state = AppState::new(&config).with_transport(transport.clone());
        (build_router(state), transport)
    }

    async fn send_json(
        app: &axum::Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn send_bytes(
        app: &axum::Router,
        uri: &str,
        token: &str,
        bytes: Vec<u8>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/octet-stream")
            .body(Body::from(bytes))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    async fn fetch_bytes(app: &axum::Router, uri: &str, token: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    /// Register a device, authorize it, and walk the token exchange.
    /// Returns (device_id, access_token).
    async fn onboard_device(
        app: &axum::Router,
        hardware_id: &str,
        partial_refresh: bool,
    ) -> (String, String) {
        let display = json!({
            "width": 200,
            "height": 100,
            "bit_depth": 8,
            "partial_refresh": partial_refresh,
        });
        let (status, registered) = send_json(
            app,
            "POST",
            "/auth/devices/register",
            None,
            Some(json!({
                "hardware_id": hardware_id,
                "firmware_version": "1.0.0",
                "display": display,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let device_id = registered["device_id"].as_str().unwrap().to_string();
        let device_secret = registered["device_secret"].as_str().unwrap().to_string();

        let (status, _) = send_json(
            app,
            "POST",
            &format!("/admin/devices/{device_id}/authorize"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, authed) = send_json(
            app,
            "POST",
            "/auth/devices/token",
            None,
            Some(json!({
                "hardware_id": hardware_id,
                "device_secret": device_secret,
                "firmware_version": "1.0.0",
                "display": display,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(authed["auth_status"], "authorized");
        let refresh_token = authed["refresh_token"].as_str().unwrap().to_string();

        let (status, refreshed) = send_json(
            app,
            "POST",
            "/auth/devices/refresh",
            Some(&refresh_token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let access_token = refreshed["access_token"].as_str().unwrap().to_string();
        (device_id, access_token)
    }

    /// Register the demo HLSS type and create one 200x100 instance.
    /// Returns (instance_id, instance_access_token).
    async fn create_instance(app: &axum::Router, name: &str) -> (String, String) {
        let (status, _) = send_json(
            app,
            "POST",
            "/admin/hlss-types",
            None,
            Some(json!({
                "type_id": "demo",
                "name": "Demo HLSS",
                "base_url": "http://hlss.local/api",
            })),
        )
        .await;
        // The type may already exist when a test creates several instances.
        assert!(status == StatusCode::CREATED || status == StatusCode::CONFLICT);

        let (status, instance) = send_json(
            app,
            "POST",
            "/admin/instances",
            None,
            Some(json!({
                "name": name,
                "hlss_type_id": "demo",
                "display_width": 200,
                "display_height": 100,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(instance["lifecycle"], "ready");
        (
            instance["instance_id"].as_str().unwrap().to_string(),
            instance["access_token"].as_str().unwrap().to_string(),
        )
    }

    #[tokio::test]
    async fn full_delivery_pipeline() {
        let (app, _transport) = test_app();
        let (device_id, access) = onboard_device(&app, "ESP32_ABC123", true).await;
        let (instance_id, instance_token) = create_instance(&app, "Dashboard").await;

        let (status, _) = send_json(
            &app,
            "POST",
            &format!("/admin/devices/{device_id}/assign-instance"),
            None,
            Some(json!({ "instance_id": instance_id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // No frame yet: nothing pending.
        let (status, poll) = send_json(
            &app,
            "GET",
            &format!("/devices/{device_id}/state"),
            Some(&access),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(poll["action"], "NOOP");
        assert_eq!(poll["active_instance_id"], instance_id.as_str());

        // Backend submits the first frame: offered as a full refresh.
        let frame_a = vec![0u8; 200 * 100];
        let (status, submitted) = send_bytes(
            &app,
            &format!("/instances/{instance_id}/frames"),
            &instance_token,
            frame_a.clone(),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let frame_a_id = submitted["frame_id"].as_str().unwrap().to_string();

        let (_, poll) = send_json(
            &app,
            "GET",
            &format!("/devices/{device_id}/state"),
            Some(&access),
            None,
        )
        .await;
        assert_eq!(poll["action"], "FETCH_FRAME");
        assert_eq!(poll["pending_frame"]["frame_id"], frame_a_id.as_str());
        assert!(poll["pending_delta"].is_null());
        assert_eq!(poll["ack_required"], true);

        let (status, fetched) = fetch_bytes(
            &app,
            &format!("/devices/{device_id}/frames/{frame_a_id}"),
            &access,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched, frame_a);

        let (status, _) = send_json(
            &app,
            "POST",
            &format!("/devices/{device_id}/frames/{frame_a_id}/ack"),
            Some(&access),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Acknowledged: the next poll is empty.
        let (_, poll) = send_json(
            &app,
            "GET",
            &format!("/devices/{device_id}/state"),
            Some(&access),
            None,
        )
        .await;
        assert_eq!(poll["action"], "NOOP");

        // A frame differing only in a 100x50 window arrives.
        let mut frame_b = frame_a.clone();
        for row in 25..75 {
            for col in 40..140 {
                frame_b[row * 200 + col] = 0xF0;
            }
        }
        let (status, _) = send_bytes(
            &app,
            &format!("/instances/{instance_id}/frames"),
            &instance_token,
            frame_b.clone(),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, poll) = send_json(
            &app,
            "GET",
            &format!("/devices/{device_id}/state"),
            Some(&access),
            None,
        )
        .await;
        assert_eq!(poll["action"], "FETCH_FRAME");
        let delta: FrameDelta = serde_json::from_value(poll["pending_delta"].clone()).unwrap();
        assert_eq!(delta.regions.len(), 1);
        assert_eq!(
            (
                delta.regions[0].x,
                delta.regions[0].y,
                delta.regions[0].width,
                delta.regions[0].height
            ),
            (40, 25, 100, 50)
        );
        assert_eq!(delta.apply(&frame_a), frame_b);

        // Poll idempotence: re-polling without an ack repeats the offer.
        let (_, poll_again) = send_json(
            &app,
            "GET",
            &format!("/devices/{device_id}/state"),
            Some(&access),
            None,
        )
        .await;
        assert_eq!(poll, poll_again);

        let frame_b_id = poll["pending_frame"]["frame_id"].as_str().unwrap();
        let (status, _) = send_json(
            &app,
            "POST",
            &format!("/devices/{device_id}/frames/{frame_b_id}/ack"),
            Some(&access),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, poll) = send_json(
            &app,
            "GET",
            &format!("/devices/{device_id}/state"),
            Some(&access),
            None,
        )
        .await;
        assert_eq!(poll["action"], "NOOP");
    }

    #[tokio::test]
    async fn duplicate_submission_returns_same_frame() {
        let (app, _transport) = test_app();
        let (instance_id, instance_token) = create_instance(&app, "Dedup").await;

        let bytes = vec![7u8; 200 * 100];
        let (status, first) = send_bytes(
            &app,
            &format!("/instances/{instance_id}/frames"),
            &instance_token,
            bytes.clone(),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, second) = send_bytes(
            &app,
            &format!("/instances/{instance_id}/frames"),
            &instance_token,
            bytes,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["frame_id"], second["frame_id"]);
    }

    #[tokio::test]
    async fn context_switch_cycles_and_is_never_forwarded() {
        let (app, transport) = test_app();
        let (device_id, access) = onboard_device(&app, "ESP32_CYCLE", false).await;
        let (inst_1, _) = create_instance(&app, "First").await;
        let (inst_2, _) = create_instance(&app, "Second").await;

        for instance_id in [&inst_1, &inst_2] {
            let (status, _) = send_json(
                &app,
                "POST",
                &format!("/admin/devices/{device_id}/assign-instance"),
                None,
                Some(json!({ "instance_id": instance_id })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        // First assignment became active automatically.
        let (_, device) = send_json(&app, "GET", &format!("/admin/devices/{device_id}"), None, None).await;
        assert_eq!(device["active_instance_id"], inst_1.as_str());

        let event = |button: &str| {
            json!({
                "button": button,
                "event_type": "PRESS",
                "timestamp": "2025-06-01T12:00:00Z",
            })
        };

        let (status, routed) = send_json(
            &app,
            "POST",
            &format!("/devices/{device_id}/inputs"),
            Some(&access),
            Some(event("HL_RIGHT")),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(routed["routed_instance_id"], inst_2.as_str());
        assert_eq!(routed["forwarded"], false);

        // An ordinary button goes to the (new) active instance's backend.
        let (status, routed) = send_json(
            &app,
            "POST",
            &format!("/devices/{device_id}/inputs"),
            Some(&access),
            Some(event("BTN_1")),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(routed["forwarded"], true);

        // The backend saw exactly one event, and it was not the context
        // switch.
        let forwarded = transport.forwarded.lock().await;
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].0, inst_2);
        assert_eq!(forwarded[0].1.button.as_str(), "BTN_1");
    }

    #[tokio::test]
    async fn input_forward_failure_is_a_warning_not_an_error() {
        let (app, transport) = test_app();
        let (device_id, access) = onboard_device(&app, "ESP32_WARN", false).await;
        let (instance_id, _) = create_instance(&app, "Flaky").await;
        let (status, _) = send_json(
            &app,
            "POST",
            &format!("/admin/devices/{device_id}/assign-instance"),
            None,
            Some(json!({ "instance_id": instance_id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        transport.fail_inputs.store(true, Ordering::SeqCst);
        let (status, routed) = send_json(
            &app,
            "POST",
            &format!("/devices/{device_id}/inputs"),
            Some(&access),
            Some(json!({
                "button": "ENTER",
                "event_type": "PRESS",
                "timestamp": "2025-06-01T12:00:00Z",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(routed["forwarded"], false);
        assert!(routed["warning"].as_str().unwrap().contains("not delivered"));
    }

    #[tokio::test]
    async fn device_endpoints_require_matching_token() {
        let (app, _transport) = test_app();
        let (device_id, access) = onboard_device(&app, "ESP32_AUTH", false).await;
        let (other_device, _) = onboard_device(&app, "ESP32_OTHER", false).await;

        let (status, _) = send_json(
            &app,
            "GET",
            &format!("/devices/{device_id}/state"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // A valid token for another device is rejected.
        let (status, _) = send_json(
            &app,
            "GET",
            &format!("/devices/{other_device}/state"),
            Some(&access),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn revocation_invalidates_refresh_but_not_access() {
        let (app, _transport) = test_app();
        let display = json!({
            "width": 200, "height": 100, "bit_depth": 8, "partial_refresh": false,
        });
        let (_, registered) = send_json(
            &app,
            "POST",
            "/auth/devices/register",
            None,
            Some(json!({
                "hardware_id": "ESP32_REVOKE",
                "firmware_version": "1.0.0",
                "display": display,
            })),
        )
        .await;
        let device_id = registered["device_id"].as_str().unwrap().to_string();
        let secret = registered["device_secret"].as_str().unwrap().to_string();
        send_json(
            &app,
            "POST",
            &format!("/admin/devices/{device_id}/authorize"),
            None,
            None,
        )
        .await;
        let (_, authed) = send_json(
            &app,
            "POST",
            "/auth/devices/token",
            None,
            Some(json!({
                "hardware_id": "ESP32_REVOKE",
                "device_secret": secret,
                "firmware_version": "1.0.0",
                "display": display,
            })),
        )
        .await;
        let refresh = authed["refresh_token"].as_str().unwrap().to_string();
        let (_, refreshed) =
            send_json(&app, "POST", "/auth/devices/refresh", Some(&refresh), None).await;
        let access = refreshed["access_token"].as_str().unwrap().to_string();

        let (status, _) = send_json(
            &app,
            "POST",
            &format!("/admin/devices/{device_id}/revoke"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // The refresh token issued before revocation no longer works.
        let (status, _) =
            send_json(&app, "POST", "/auth/devices/refresh", Some(&refresh), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // The already-issued access token keeps working until expiry.
        let (status, _) = send_json(
            &app,
            "GET",
            &format!("/devices/{device_id}/state"),
            Some(&access),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // And the device cannot re-authenticate while revoked.
        let (status, _) = send_json(
            &app,
            "POST",
            "/auth/devices/token",
            None,
            Some(json!({
                "hardware_id": "ESP32_REVOKE",
                "device_secret": secret,
                "firmware_version": "1.0.0",
                "display": display,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn failed_initialization_leaves_instance_retryable() {
        let (app, transport) = test_app();
        transport.fail_init.store(true, Ordering::SeqCst);

        send_json(
            &app,
            "POST",
            "/admin/hlss-types",
            None,
            Some(json!({
                "type_id": "demo",
                "name": "Demo HLSS",
                "base_url": "http://hlss.local/api",
            })),
        )
        .await;
        let (status, instance) = send_json(
            &app,
            "POST",
            "/admin/instances",
            None,
            Some(json!({ "name": "Slow", "hlss_type_id": "demo" })),
        )
        .await;
        // The instance is created even though initialization failed.
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(instance["lifecycle"], "initializing");
        assert!(instance["last_error"].as_str().unwrap().contains("timed out"));
        let instance_id = instance["instance_id"].as_str().unwrap().to_string();

        // Explicit admin retry succeeds once the backend recovers.
        transport.fail_init.store(false, Ordering::SeqCst);
        transport.needs_configuration.store(true, Ordering::SeqCst);
        let (status, instance) = send_json(
            &app,
            "POST",
            &format!("/admin/instances/{instance_id}/initialize"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(instance["lifecycle"], "needs_configuration");
        assert!(instance["configuration_url"]
            .as_str()
            .unwrap()
            .contains("/configure"));

        // A status refresh confirms the user finished configuration.
        let (status, instance) = send_json(
            &app,
            "POST",
            &format!("/admin/instances/{instance_id}/refresh-status"),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(instance["lifecycle"], "ready");
    }

    #[tokio::test]
    async fn frame_submission_requires_instance_token() {
        let (app, _transport) = test_app();
        let (instance_id, _) = create_instance(&app, "Secured").await;
        let (_other_instance, other_token) = create_instance(&app, "Other").await;

        let request = Request::builder()
            .method("POST")
            .uri(format!("/instances/{instance_id}/frames"))
            .body(Body::from(vec![0u8; 16]))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // A token for a different instance is rejected.
        let (status, _) = send_bytes(
            &app,
            &format!("/instances/{instance_id}/frames"),
            &other_token,
            vec![0u8; 16],
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
