use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use slate_frame::FrameDelta;
use slate_wire::{
    AuthStatusResponse, DeviceAuthRequest, DeviceAuthResponse, DeviceRegistration,
    DeviceRegistrationResponse, FrameRef, InputEvent, PollAction, RefreshRenewalResponse,
    TokenRefreshResponse,
};

use crate::state::{AppState, PendingUpdate};

use super::{map_state_err, ApiError, ApiResult, AuthToken};

/// Poll response. `pending_delta` is set when the device declared
/// partial-refresh support and a delta applies; otherwise the device fetches
/// the referenced frame in full. Either way the offer repeats until the
/// frame is acknowledged.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceStateResponse {
    pub action: PollAction,
    pub active_instance_id: Option<String>,
    pub pending_frame: Option<FrameRef>,
    pub pending_delta: Option<FrameDelta>,
    pub ack_required: bool,
    pub poll_after_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InputAckResponse {
    pub routed_instance_id: Option<String>,
    pub forwarded: bool,
    pub warning: Option<String>,
}

/// POST /auth/devices/register - unauthenticated self-registration.
pub async fn register_device(
    State(state): State<AppState>,
    Json(registration): Json<DeviceRegistration>,
) -> Result<(StatusCode, Json<DeviceRegistrationResponse>), ApiError> {
    let response = state
        .register_device(registration)
        .await
        .map_err(map_state_err)?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// POST /auth/devices/token - exchange hardware credentials for a refresh
/// token (or a pending status while awaiting authorization).
pub async fn authenticate_device(
    State(state): State<AppState>,
    Json(request): Json<DeviceAuthRequest>,
) -> ApiResult<DeviceAuthResponse> {
    let response = state
        .authenticate_device(request)
        .await
        .map_err(map_state_err)?;
    Ok(Json(response))
}

/// POST /auth/devices/refresh - refresh token in, access token out.
pub async fn refresh_access_token(
    State(state): State<AppState>,
    token: AuthToken,
) -> ApiResult<TokenRefreshResponse> {
    let response = state
        .refresh_access_token(token.as_str())
        .await
        .map_err(map_state_err)?;
    Ok(Json(response))
}

/// POST /auth/devices/renew-refresh - rotate the refresh token.
pub async fn renew_refresh_token(
    State(state): State<AppState>,
    token: AuthToken,
) -> ApiResult<RefreshRenewalResponse> {
    let response = state
        .renew_refresh_token(token.as_str())
        .await
        .map_err(map_state_err)?;
    Ok(Json(response))
}

/// GET /auth/devices/status
pub async fn device_auth_status(
    State(state): State<AppState>,
    token: AuthToken,
) -> ApiResult<AuthStatusResponse> {
    let response = state
        .device_auth_status(token.as_str())
        .await
        .map_err(map_state_err)?;
    Ok(Json(response))
}

/// GET /devices/{device_id}/state - the poll endpoint.
pub async fn poll_state(
    State(state): State<AppState>,
    token: AuthToken,
    Path(device_id): Path<String>,
) -> ApiResult<DeviceStateResponse> {
    state
        .verify_device_access(token.as_str(), &device_id)
        .map_err(map_state_err)?;
    let outcome = state.poll_device(&device_id).await.map_err(map_state_err)?;

    let mut response = DeviceStateResponse {
        action: PollAction::Noop,
        active_instance_id: outcome.active_instance_id,
        pending_frame: None,
        pending_delta: None,
        ack_required: false,
        poll_after_ms: outcome.poll_after_ms,
    };
    match outcome.pending {
        None => {}
        Some(PendingUpdate::Full(frame)) => {
            response.action = PollAction::FetchFrame;
            response.pending_frame = Some(frame_ref(&frame));
            response.ack_required = true;
        }
        Some(PendingUpdate::Partial { frame, delta }) => {
            response.action = PollAction::FetchFrame;
            response.pending_frame = Some(frame_ref(&frame));
            response.pending_delta = Some(delta);
            response.ack_required = true;
        }
    }
    Ok(Json(response))
}

/// GET /devices/{device_id}/frames/{frame_id} - raw frame bytes.
pub async fn fetch_frame(
    State(state): State<AppState>,
    token: AuthToken,
    Path((device_id, frame_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    state
        .verify_device_access(token.as_str(), &device_id)
        .map_err(map_state_err)?;
    let frame = state.frame_bytes(&frame_id).map_err(map_state_err)?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        frame.bytes.clone(),
    )
        .into_response())
}

/// POST /devices/{device_id}/frames/{frame_id}/ack - advance delivery state.
pub async fn acknowledge_frame(
    State(state): State<AppState>,
    token: AuthToken,
    Path((device_id, frame_id)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    state
        .verify_device_access(token.as_str(), &device_id)
        .map_err(map_state_err)?;
    state
        .acknowledge_frame(&device_id, &frame_id)
        .await
        .map_err(map_state_err)?;
    Ok(Json(serde_json::json!({ "acknowledged": true })))
}

/// POST /devices/{device_id}/inputs - submit a button event. Always 202;
/// a forwarding failure is reported in the body, never as an error status.
pub async fn submit_input(
    State(state): State<AppState>,
    token: AuthToken,
    Path(device_id): Path<String>,
    Json(event): Json<InputEvent>,
) -> Result<(StatusCode, Json<InputAckResponse>), ApiError> {
    state
        .verify_device_access(token.as_str(), &device_id)
        .map_err(map_state_err)?;
    let routing = state
        .handle_input(&device_id, event)
        .await
        .map_err(map_state_err)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(InputAckResponse {
            routed_instance_id: routing.instance_id,
            forwarded: routing.forwarded,
            warning: routing.warning,
        }),
    ))
}

fn frame_ref(frame: &slate_frame::Frame) -> FrameRef {
    FrameRef {
        frame_id: frame.frame_id.clone(),
        hash: frame.hash.clone(),
        width: frame.width,
        height: frame.height,
    }
}
