//! Thin admin glue over the state operations: HLSS type registry, instance
//! lifecycle, device authorization and assignments. No dashboard lives here.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::state::{
    AppState, DeviceView, HlssTypeUpdate, HlssTypeView, InputEventRecord, InstanceView,
    NewHlssType, NewInstance, SystemStatus,
};

use super::{map_state_err, ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct AssignInstanceRequest {
    pub instance_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SetActiveInstanceRequest {
    pub instance_id: String,
}

#[derive(Debug, Deserialize)]
pub struct InputLogQuery {
    pub limit: Option<usize>,
}

// -- hlss types -------------------------------------------------------------

pub async fn create_hlss_type(
    State(state): State<AppState>,
    Json(body): Json<NewHlssType>,
) -> Result<(StatusCode, Json<HlssTypeView>), ApiError> {
    let view = state.create_hlss_type(body).map_err(map_state_err)?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn list_hlss_types(State(state): State<AppState>) -> Json<Vec<HlssTypeView>> {
    Json(state.list_hlss_types())
}

pub async fn get_hlss_type(
    State(state): State<AppState>,
    Path(type_id): Path<String>,
) -> ApiResult<HlssTypeView> {
    let view = state.get_hlss_type(&type_id).map_err(map_state_err)?;
    Ok(Json(view))
}

pub async fn update_hlss_type(
    State(state): State<AppState>,
    Path(type_id): Path<String>,
    Json(body): Json<HlssTypeUpdate>,
) -> ApiResult<HlssTypeView> {
    let view = state
        .update_hlss_type(&type_id, body)
        .map_err(map_state_err)?;
    Ok(Json(view))
}

// -- instances --------------------------------------------------------------

pub async fn create_instance(
    State(state): State<AppState>,
    Json(body): Json<NewInstance>,
) -> Result<(StatusCode, Json<InstanceView>), ApiError> {
    let view = state.create_instance(body).await.map_err(map_state_err)?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn list_instances(State(state): State<AppState>) -> Json<Vec<InstanceView>> {
    Json(state.list_instances().await)
}

pub async fn get_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<InstanceView> {
    let view = state.get_instance(&instance_id).await.map_err(map_state_err)?;
    Ok(Json(view))
}

pub async fn delete_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .delete_instance(&instance_id)
        .await
        .map_err(map_state_err)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn initialize_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<InstanceView> {
    let view = state
        .initialize_instance(&instance_id)
        .await
        .map_err(map_state_err)?;
    Ok(Json(view))
}

pub async fn refresh_instance_status(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<InstanceView> {
    let view = state
        .refresh_instance_status(&instance_id)
        .await
        .map_err(map_state_err)?;
    Ok(Json(view))
}

pub async fn request_render(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state
        .request_render(&instance_id)
        .await
        .map_err(map_state_err)?;
    Ok(Json(serde_json::json!({ "requested": true })))
}

// -- devices ----------------------------------------------------------------

pub async fn list_devices(State(state): State<AppState>) -> Json<Vec<DeviceView>> {
    Json(state.list_devices().await)
}

pub async fn pending_devices(State(state): State<AppState>) -> Json<Vec<DeviceView>> {
    Json(state.pending_devices().await)
}

pub async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<DeviceView> {
    let view = state.get_device(&device_id).await.map_err(map_state_err)?;
    Ok(Json(view))
}

pub async fn authorize_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let status = state
        .authorize_device(&device_id)
        .await
        .map_err(map_state_err)?;
    Ok(Json(serde_json::json!({
        "device_id": device_id,
        "auth_status": status,
    })))
}

pub async fn reject_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let status = state.reject_device(&device_id).await.map_err(map_state_err)?;
    Ok(Json(serde_json::json!({
        "device_id": device_id,
        "auth_status": status,
    })))
}

pub async fn revoke_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let status = state.revoke_device(&device_id).await.map_err(map_state_err)?;
    Ok(Json(serde_json::json!({
        "device_id": device_id,
        "auth_status": status,
    })))
}

pub async fn reauthorize_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let status = state
        .reauthorize_device(&device_id)
        .await
        .map_err(map_state_err)?;
    Ok(Json(serde_json::json!({
        "device_id": device_id,
        "auth_status": status,
    })))
}

// -- assignments ------------------------------------------------------------

pub async fn assign_instance(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(body): Json<AssignInstanceRequest>,
) -> ApiResult<DeviceView> {
    let view = state
        .assign_instance(&device_id, &body.instance_id)
        .await
        .map_err(map_state_err)?;
    Ok(Json(view))
}

pub async fn unassign_instance(
    State(state): State<AppState>,
    Path((device_id, instance_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .unassign_instance(&device_id, &instance_id)
        .await
        .map_err(map_state_err)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_active_instance(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(body): Json<SetActiveInstanceRequest>,
) -> ApiResult<DeviceView> {
    let view = state
        .set_active_instance(&device_id, &body.instance_id)
        .await
        .map_err(map_state_err)?;
    Ok(Json(view))
}

// -- system -----------------------------------------------------------------

pub async fn system_status(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(state.system_status().await)
}

pub async fn input_events(
    State(state): State<AppState>,
    Query(query): Query<InputLogQuery>,
) -> Json<Vec<InputEventRecord>> {
    Json(state.recent_inputs(query.limit.unwrap_or(100)).await)
}
