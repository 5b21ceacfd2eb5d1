use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use bytes::Bytes;

use slate_wire::FrameSubmitResponse;

use crate::state::AppState;

use super::{map_state_err, ApiError, AuthToken};

/// POST /instances/{instance_id}/frames - frame submission by the backend.
/// The body is the raw framebuffer; identical retries collapse onto the
/// stored frame and return the same reference.
pub async fn submit_frame(
    State(state): State<AppState>,
    token: AuthToken,
    Path(instance_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<FrameSubmitResponse>), ApiError> {
    let put = state
        .submit_frame(&instance_id, token.as_str(), body.to_vec())
        .await
        .map_err(map_state_err)?;
    let status = if put.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(FrameSubmitResponse {
            frame_id: put.frame.frame_id.clone(),
            hash: put.frame.hash.clone(),
            created_at: put.frame.created_at,
        }),
    ))
}

/// POST /instances/{instance_id}/notify - change notification callback.
pub async fn notify_change(
    State(state): State<AppState>,
    token: AuthToken,
    Path(instance_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .notify_change(&instance_id, token.as_str())
        .await
        .map_err(map_state_err)?;
    Ok(StatusCode::ACCEPTED)
}
