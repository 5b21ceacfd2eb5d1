//! Control-plane state for the slate broker.
//!
//! All records live in an in-memory arena: every device and instance is an
//! `Arc<Mutex<…>>` entry in a sharded map, so mutations are serialized per
//! record and never contend across unrelated devices or instances. The
//! broker state is authoritative for device identity, authorization,
//! assignments, and delivery progress; frame bytes live in the frame store.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use slate_frame::{Frame, FrameDelta, FrameStore, PutResult, RefreshPlan};
use slate_wire::{
    AuthStatus, AuthStatusResponse, Button, DeviceAuthRequest, DeviceAuthResponse,
    DeviceRegistration, DeviceRegistrationResponse, DisplayCapabilities, HlssCallbacks,
    HlssInitRequest, InputEvent, InputEventKind, RefreshRenewalResponse, TokenRefreshResponse,
};

use crate::config::AppConfig;
use crate::hlss::{HlssEndpoint, HlssError, HlssTransport, HttpHlssTransport};
use crate::metrics;
use crate::tokens::{TokenAuthority, TokenError, TokenKind};

const DEFAULT_DISPLAY_WIDTH: u32 = 800;
const DEFAULT_DISPLAY_HEIGHT: u32 = 480;
const DEFAULT_DISPLAY_BIT_DEPTH: u8 = 4;

#[derive(Clone)]
pub struct AppState {
    devices: Arc<DashMap<String, Arc<Mutex<DeviceRecord>>>>,
    hardware_index: Arc<DashMap<String, String>>,
    instances: Arc<DashMap<String, Arc<Mutex<InstanceRecord>>>>,
    hlss_types: Arc<DashMap<String, HlssTypeRecord>>,
    input_log: Arc<Mutex<Vec<InputEventRecord>>>,
    frames: Arc<FrameStore>,
    tokens: Arc<TokenAuthority>,
    transport: Arc<dyn HlssTransport>,
    public_base_url: String,
    poll_interval_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("device not found")]
    DeviceNotFound,
    #[error("instance not found")]
    InstanceNotFound,
    #[error("frame not found")]
    FrameNotFound,
    #[error("hlss type not found")]
    TypeNotFound,
    #[error("assignment not found")]
    AssignmentNotFound,
    #[error("invalid assignment: {0}")]
    InvalidAssignment(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("authentication rejected: {0}")]
    Auth(#[from] TokenError),
    #[error("invalid device credentials")]
    InvalidCredentials,
    #[error("refresh session revoked")]
    SessionRevoked,
    #[error("unknown token subject")]
    UnknownSubject,
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("conflict: {0}")]
    Conflict(&'static str),
    #[error("backend unavailable: {0}")]
    Backend(#[from] HlssError),
}

#[derive(Debug, Clone)]
struct DeviceRecord {
    device_id: String,
    hardware_id: String,
    device_secret: String,
    firmware_version: String,
    display: DisplayCapabilities,
    auth_status: AuthStatus,
    current_refresh_jti: Option<String>,
    current_frame_id: Option<String>,
    active_instance_id: Option<String>,
    /// Assigned instances in creation order; cycling walks this ring.
    assignments: Vec<String>,
    created_at: DateTime<Utc>,
    authorized_at: Option<DateTime<Utc>>,
    last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceLifecycle {
    Pending,
    Initializing,
    NeedsConfiguration,
    Ready,
}

#[derive(Debug, Clone)]
struct InstanceRecord {
    instance_id: String,
    name: String,
    type_id: String,
    access_token: String,
    display: DisplayCapabilities,
    lifecycle: InstanceLifecycle,
    configuration_url: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    initialized_at: Option<DateTime<Utc>>,
    change_notified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct HlssTypeRecord {
    type_id: String,
    name: String,
    description: Option<String>,
    base_url: String,
    auth_token: Option<String>,
    default_width: Option<u32>,
    default_height: Option<u32>,
    default_bit_depth: Option<u8>,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl HlssTypeRecord {
    fn endpoint(&self) -> HlssEndpoint {
        HlssEndpoint {
            base_url: self.base_url.clone(),
            auth_token: self.auth_token.clone(),
        }
    }
}

/// Append-only input audit record.
#[derive(Debug, Clone, Serialize)]
pub struct InputEventRecord {
    pub device_id: String,
    pub instance_id: Option<String>,
    pub button: Button,
    pub event_type: InputEventKind,
    pub event_timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub forwarded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleDirection {
    Forward,
    Backward,
}

/// Result of routing one input event.
#[derive(Debug, Clone)]
pub struct InputRouting {
    /// The instance the event was routed to (for context switches, the
    /// newly active instance).
    pub instance_id: Option<String>,
    pub forwarded: bool,
    pub warning: Option<String>,
}

/// What a poll found for the device.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub active_instance_id: Option<String>,
    pub pending: Option<PendingUpdate>,
    pub poll_after_ms: u64,
}

#[derive(Debug, Clone)]
pub enum PendingUpdate {
    Full(Arc<Frame>),
    Partial { frame: Arc<Frame>, delta: FrameDelta },
}

// ---------------------------------------------------------------------------
// Admin request / view types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct NewHlssType {
    pub type_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub base_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub default_width: Option<u32>,
    #[serde(default)]
    pub default_height: Option<u32>,
    #[serde(default)]
    pub default_bit_depth: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HlssTypeUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
    pub default_width: Option<u32>,
    pub default_height: Option<u32>,
    pub default_bit_depth: Option<u8>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewInstance {
    pub name: String,
    pub hlss_type_id: String,
    #[serde(default)]
    pub display_width: Option<u32>,
    #[serde(default)]
    pub display_height: Option<u32>,
    #[serde(default)]
    pub display_bit_depth: Option<u8>,
    #[serde(default = "default_true")]
    pub auto_initialize: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlssTypeView {
    pub type_id: String,
    pub name: String,
    pub description: Option<String>,
    pub base_url: String,
    pub default_width: Option<u32>,
    pub default_height: Option<u32>,
    pub default_bit_depth: Option<u8>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl HlssTypeView {
    fn from_record(record: &HlssTypeRecord) -> Self {
        Self {
            type_id: record.type_id.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            base_url: record.base_url.clone(),
            default_width: record.default_width,
            default_height: record.default_height,
            default_bit_depth: record.default_bit_depth,
            is_active: record.is_active,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceView {
    pub instance_id: String,
    pub name: String,
    pub type_id: String,
    pub access_token: String,
    pub lifecycle: InstanceLifecycle,
    pub configuration_url: Option<String>,
    pub last_error: Option<String>,
    pub display: DisplayCapabilities,
    pub created_at: DateTime<Utc>,
    pub initialized_at: Option<DateTime<Utc>>,
    pub change_notified_at: Option<DateTime<Utc>>,
}

impl InstanceView {
    fn from_record(record: &InstanceRecord) -> Self {
        Self {
            instance_id: record.instance_id.clone(),
            name: record.name.clone(),
            type_id: record.type_id.clone(),
            access_token: record.access_token.clone(),
            lifecycle: record.lifecycle,
            configuration_url: record.configuration_url.clone(),
            last_error: record.last_error.clone(),
            display: record.display,
            created_at: record.created_at,
            initialized_at: record.initialized_at,
            change_notified_at: record.change_notified_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceView {
    pub device_id: String,
    pub hardware_id: String,
    pub firmware_version: String,
    pub auth_status: AuthStatus,
    pub display: DisplayCapabilities,
    pub active_instance_id: Option<String>,
    pub assigned_instances: Vec<String>,
    pub current_frame_id: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DeviceView {
    fn from_record(record: &DeviceRecord) -> Self {
        Self {
            device_id: record.device_id.clone(),
            hardware_id: record.hardware_id.clone(),
            firmware_version: record.firmware_version.clone(),
            auth_status: record.auth_status,
            display: record.display,
            active_instance_id: record.active_instance_id.clone(),
            assigned_instances: record.assignments.clone(),
            current_frame_id: record.current_frame_id.clone(),
            last_seen_at: record.last_seen_at,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub devices: usize,
    pub instances: usize,
    pub instances_ready: usize,
    pub instances_needs_configuration: usize,
    pub instances_uninitialized: usize,
    pub active_types: usize,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

impl AppState {
    pub fn new(config: &AppConfig) -> Self {
        let transport = Arc::new(HttpHlssTransport::new(StdDuration::from_secs(
            config.hlss_timeout_secs,
        )));
        Self::with_transport_inner(config, transport)
    }

    /// Swap the HLSS transport; used by tests to run against a fake backend.
    pub fn with_transport(mut self, transport: Arc<dyn HlssTransport>) -> Self {
        self.transport = transport;
        self
    }

    fn with_transport_inner(config: &AppConfig, transport: Arc<dyn HlssTransport>) -> Self {
        Self {
            devices: Arc::new(DashMap::new()),
            hardware_index: Arc::new(DashMap::new()),
            instances: Arc::new(DashMap::new()),
            hlss_types: Arc::new(DashMap::new()),
            input_log: Arc::new(Mutex::new(Vec::new())),
            frames: Arc::new(FrameStore::new()),
            tokens: Arc::new(TokenAuthority::from_config(config)),
            transport,
            public_base_url: config.public_base_url.clone(),
            poll_interval_ms: config.poll_interval_ms,
        }
    }

    // -- device registration and token lifecycle ---------------------------

    pub async fn register_device(
        &self,
        registration: DeviceRegistration,
    ) -> Result<DeviceRegistrationResponse, StateError> {
        if self.hardware_index.contains_key(&registration.hardware_id) {
            return Err(StateError::Conflict("hardware id already registered"));
        }
        let (device_id, device_secret) = self.insert_pending_device(&registration);
        info!(
            device = %device_id,
            hardware = %registration.hardware_id,
            "device registered, awaiting authorization"
        );
        Ok(DeviceRegistrationResponse {
            device_id,
            device_secret,
            auth_status: AuthStatus::Pending,
            message: "Device registered. Waiting for admin authorization.".into(),
        })
    }

    /// Exchange hardware credentials for a refresh token. Unknown hardware
    /// self-registers as pending rather than erroring, so a factory-fresh
    /// device can simply retry until an admin authorizes it.
    pub async fn authenticate_device(
        &self,
        request: DeviceAuthRequest,
    ) -> Result<DeviceAuthResponse, StateError> {
        let device_id = match self.hardware_index.get(&request.hardware_id) {
            Some(entry) => entry.value().clone(),
            None => {
                let registration = DeviceRegistration {
                    hardware_id: request.hardware_id.clone(),
                    firmware_version: request.firmware_version.clone(),
                    display: request.display,
                };
                let (device_id, _) = self.insert_pending_device(&registration);
                return Ok(DeviceAuthResponse {
                    device_id,
                    refresh_token: String::new(),
                    refresh_token_expires_in: 0,
                    auth_status: AuthStatus::Pending,
                    message: "Device registered and pending authorization.".into(),
                });
            }
        };

        let handle = self.device_handle(&device_id)?;
        let mut device = handle.lock().await;
        if device.device_secret != request.device_secret {
            return Err(StateError::InvalidCredentials);
        }
        if device.firmware_version != request.firmware_version {
            device.firmware_version = request.firmware_version.clone();
        }
        match device.auth_status {
            AuthStatus::Pending => Ok(DeviceAuthResponse {
                device_id: device.device_id.clone(),
                refresh_token: String::new(),
                refresh_token_expires_in: 0,
                auth_status: AuthStatus::Pending,
                message: "Device pending authorization.".into(),
            }),
            AuthStatus::Rejected => Err(StateError::Forbidden("device access rejected")),
            AuthStatus::Revoked => Err(StateError::Forbidden("device access revoked")),
            AuthStatus::Authorized => {
                let issued = self.tokens.issue(&device.device_id, TokenKind::DeviceRefresh);
                device.current_refresh_jti = issued.jti.clone();
                Ok(DeviceAuthResponse {
                    device_id: device.device_id.clone(),
                    refresh_token: issued.token,
                    refresh_token_expires_in: issued.expires_in,
                    auth_status: AuthStatus::Authorized,
                    message: "Authentication successful.".into(),
                })
            }
        }
    }

    /// Exchange a refresh token for a short-lived access token. The stored
    /// session identifier must match: issuing a new refresh token (or a
    /// revocation) invalidates every older one.
    pub async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenRefreshResponse, StateError> {
        let claims = self.tokens.verify(refresh_token, TokenKind::DeviceRefresh)?;
        let handle = self
            .devices
            .get(&claims.sub)
            .map(|entry| entry.value().clone())
            .ok_or(StateError::UnknownSubject)?;
        let device = handle.lock().await;
        if claims.jti.is_none() || claims.jti != device.current_refresh_jti {
            return Err(StateError::SessionRevoked);
        }
        let issued = self.tokens.issue(&device.device_id, TokenKind::DeviceAccess);
        Ok(TokenRefreshResponse {
            access_token: issued.token,
            token_type: "bearer".into(),
            expires_in: issued.expires_in,
        })
    }

    /// Rotate the refresh token using a valid access token. Overwrites the
    /// stored session identifier, invalidating the previous refresh token.
    pub async fn renew_refresh_token(
        &self,
        access_token: &str,
    ) -> Result<RefreshRenewalResponse, StateError> {
        let claims = self.tokens.verify(access_token, TokenKind::DeviceAccess)?;
        let handle = self
            .devices
            .get(&claims.sub)
            .map(|entry| entry.value().clone())
            .ok_or(StateError::UnknownSubject)?;
        let mut device = handle.lock().await;
        let issued = self.tokens.issue(&device.device_id, TokenKind::DeviceRefresh);
        device.current_refresh_jti = issued.jti.clone();
        Ok(RefreshRenewalResponse {
            refresh_token: issued.token,
            expires_in: issued.expires_in,
        })
    }

    pub async fn device_auth_status(
        &self,
        access_token: &str,
    ) -> Result<AuthStatusResponse, StateError> {
        let claims = self.tokens.verify(access_token, TokenKind::DeviceAccess)?;
        let handle = self
            .devices
            .get(&claims.sub)
            .map(|entry| entry.value().clone())
            .ok_or(StateError::UnknownSubject)?;
        let device = handle.lock().await;
        Ok(AuthStatusResponse {
            device_id: device.device_id.clone(),
            auth_status: device.auth_status,
            authorized_at: device.authorized_at,
        })
    }

    /// Check a device access token against the device a request targets.
    /// Access tokens are stateless: signature and subject are all that is
    /// verified, so a token stays usable until its natural expiry.
    pub fn verify_device_access(&self, token: &str, device_id: &str) -> Result<(), StateError> {
        let claims = self.tokens.verify(token, TokenKind::DeviceAccess)?;
        if claims.sub != device_id {
            return Err(StateError::Forbidden("token does not match device"));
        }
        Ok(())
    }

    fn insert_pending_device(&self, registration: &DeviceRegistration) -> (String, String) {
        let device_id = new_id("dev");
        let device_secret = new_secret();
        let record = DeviceRecord {
            device_id: device_id.clone(),
            hardware_id: registration.hardware_id.clone(),
            device_secret: device_secret.clone(),
            firmware_version: registration.firmware_version.clone(),
            display: registration.display,
            auth_status: AuthStatus::Pending,
            current_refresh_jti: None,
            current_frame_id: None,
            active_instance_id: None,
            assignments: Vec::new(),
            created_at: Utc::now(),
            authorized_at: None,
            last_seen_at: None,
        };
        self.devices
            .insert(device_id.clone(), Arc::new(Mutex::new(record)));
        self.hardware_index
            .insert(registration.hardware_id.clone(), device_id.clone());
        (device_id, device_secret)
    }

    // -- device authorization (admin) --------------------------------------

    pub async fn authorize_device(&self, device_id: &str) -> Result<AuthStatus, StateError> {
        let handle = self.device_handle(device_id)?;
        let mut device = handle.lock().await;
        if device.auth_status != AuthStatus::Authorized {
            device.auth_status = AuthStatus::Authorized;
            device.authorized_at = Some(Utc::now());
            info!(device = %device_id, "device authorized");
        }
        Ok(device.auth_status)
    }

    pub async fn reject_device(&self, device_id: &str) -> Result<AuthStatus, StateError> {
        let handle = self.device_handle(device_id)?;
        let mut device = handle.lock().await;
        device.auth_status = AuthStatus::Rejected;
        Ok(device.auth_status)
    }

    /// Revoke device access: clears the stored refresh session identifier so
    /// every previously issued refresh token stops working. Idempotent.
    /// Already-issued access tokens keep working until they expire.
    pub async fn revoke_device(&self, device_id: &str) -> Result<AuthStatus, StateError> {
        let handle = self.device_handle(device_id)?;
        let mut device = handle.lock().await;
        device.auth_status = AuthStatus::Revoked;
        device.current_refresh_jti = None;
        info!(device = %device_id, "device access revoked");
        Ok(device.auth_status)
    }

    pub async fn reauthorize_device(&self, device_id: &str) -> Result<AuthStatus, StateError> {
        let handle = self.device_handle(device_id)?;
        let mut device = handle.lock().await;
        if device.auth_status != AuthStatus::Authorized {
            device.auth_status = AuthStatus::Authorized;
            device.authorized_at = Some(Utc::now());
            // Force a fresh token exchange.
            device.current_refresh_jti = None;
        }
        Ok(device.auth_status)
    }

    pub async fn list_devices(&self) -> Vec<DeviceView> {
        let handles: Vec<_> = self.devices.iter().map(|e| e.value().clone()).collect();
        let mut views = Vec::with_capacity(handles.len());
        for handle in handles {
            views.push(DeviceView::from_record(&*handle.lock().await));
        }
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        views
    }

    pub async fn pending_devices(&self) -> Vec<DeviceView> {
        self.list_devices()
            .await
            .into_iter()
            .filter(|d| d.auth_status == AuthStatus::Pending)
            .collect()
    }

    pub async fn get_device(&self, device_id: &str) -> Result<DeviceView, StateError> {
        let handle = self.device_handle(device_id)?;
        let device = handle.lock().await;
        Ok(DeviceView::from_record(&device))
    }

    // -- assignment registry ------------------------------------------------

    /// Assign an instance to a device. Idempotent; the first assignment for
    /// a device becomes active automatically.
    pub async fn assign_instance(
        &self,
        device_id: &str,
        instance_id: &str,
    ) -> Result<DeviceView, StateError> {
        if !self.instances.contains_key(instance_id) {
            return Err(StateError::InstanceNotFound);
        }
        let handle = self.device_handle(device_id)?;
        let mut device = handle.lock().await;
        if !device.assignments.iter().any(|id| id == instance_id) {
            device.assignments.push(instance_id.to_string());
            if device.active_instance_id.is_none() {
                device.active_instance_id = Some(instance_id.to_string());
            }
        }
        Ok(DeviceView::from_record(&device))
    }

    /// Remove an assignment. If it was active, the next remaining assignment
    /// in creation order becomes active, or none if the list is empty.
    pub async fn unassign_instance(
        &self,
        device_id: &str,
        instance_id: &str,
    ) -> Result<DeviceView, StateError> {
        let handle = self.device_handle(device_id)?;
        let mut device = handle.lock().await;
        let before = device.assignments.len();
        device.assignments.retain(|id| id != instance_id);
        if device.assignments.len() == before {
            return Err(StateError::AssignmentNotFound);
        }
        if device.active_instance_id.as_deref() == Some(instance_id) {
            device.active_instance_id = device.assignments.first().cloned();
        }
        Ok(DeviceView::from_record(&device))
    }

    pub async fn set_active_instance(
        &self,
        device_id: &str,
        instance_id: &str,
    ) -> Result<DeviceView, StateError> {
        let handle = self.device_handle(device_id)?;
        let mut device = handle.lock().await;
        if !device.assignments.iter().any(|id| id == instance_id) {
            return Err(StateError::InvalidAssignment(format!(
                "instance '{instance_id}' is not assigned to device '{device_id}'"
            )));
        }
        device.active_instance_id = Some(instance_id.to_string());
        Ok(DeviceView::from_record(&device))
    }

    /// Move the active selection to the neighbouring assignment, wrapping
    /// around. A no-op with fewer than two assignments.
    pub async fn cycle_active(
        &self,
        device_id: &str,
        direction: CycleDirection,
    ) -> Result<Option<String>, StateError> {
        let handle = self.device_handle(device_id)?;
        let mut device = handle.lock().await;
        Ok(cycle_assignments(&mut device, direction))
    }

    // -- hlss types ----------------------------------------------------------

    pub fn create_hlss_type(&self, new: NewHlssType) -> Result<HlssTypeView, StateError> {
        if self.hlss_types.contains_key(&new.type_id) {
            return Err(StateError::Conflict("hlss type already registered"));
        }
        let record = HlssTypeRecord {
            type_id: new.type_id.clone(),
            name: new.name,
            description: new.description,
            base_url: new.base_url.trim_end_matches('/').to_string(),
            auth_token: new.auth_token,
            default_width: new.default_width,
            default_height: new.default_height,
            default_bit_depth: new.default_bit_depth,
            is_active: true,
            created_at: Utc::now(),
        };
        let view = HlssTypeView::from_record(&record);
        self.hlss_types.insert(new.type_id, record);
        Ok(view)
    }

    pub fn list_hlss_types(&self) -> Vec<HlssTypeView> {
        let mut views: Vec<_> = self
            .hlss_types
            .iter()
            .map(|entry| HlssTypeView::from_record(entry.value()))
            .collect();
        views.sort_by(|a, b| a.type_id.cmp(&b.type_id));
        views
    }

    pub fn get_hlss_type(&self, type_id: &str) -> Result<HlssTypeView, StateError> {
        self.hlss_types
            .get(type_id)
            .map(|entry| HlssTypeView::from_record(entry.value()))
            .ok_or(StateError::TypeNotFound)
    }

    pub fn update_hlss_type(
        &self,
        type_id: &str,
        update: HlssTypeUpdate,
    ) -> Result<HlssTypeView, StateError> {
        let mut entry = self
            .hlss_types
            .get_mut(type_id)
            .ok_or(StateError::TypeNotFound)?;
        let record = entry.value_mut();
        if let Some(name) = update.name {
            record.name = name;
        }
        if let Some(description) = update.description {
            record.description = Some(description);
        }
        if let Some(base_url) = update.base_url {
            record.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(auth_token) = update.auth_token {
            record.auth_token = Some(auth_token);
        }
        if let Some(width) = update.default_width {
            record.default_width = Some(width);
        }
        if let Some(height) = update.default_height {
            record.default_height = Some(height);
        }
        if let Some(bit_depth) = update.default_bit_depth {
            record.default_bit_depth = Some(bit_depth);
        }
        if let Some(is_active) = update.is_active {
            record.is_active = is_active;
        }
        Ok(HlssTypeView::from_record(record))
    }

    // -- instance lifecycle --------------------------------------------------

    pub async fn create_instance(&self, new: NewInstance) -> Result<InstanceView, StateError> {
        let hlss_type = self.type_record(&new.hlss_type_id)?;
        if !hlss_type.is_active {
            return Err(StateError::Invalid(format!(
                "hlss type '{}' is not active",
                new.hlss_type_id
            )));
        }

        let instance_id = new_id("inst");
        let access_token = self
            .tokens
            .issue(&instance_id, TokenKind::InstanceAccess)
            .token;
        let display = DisplayCapabilities {
            width: new
                .display_width
                .or(hlss_type.default_width)
                .unwrap_or(DEFAULT_DISPLAY_WIDTH),
            height: new
                .display_height
                .or(hlss_type.default_height)
                .unwrap_or(DEFAULT_DISPLAY_HEIGHT),
            bit_depth: new
                .display_bit_depth
                .or(hlss_type.default_bit_depth)
                .unwrap_or(DEFAULT_DISPLAY_BIT_DEPTH),
            partial_refresh: false,
        };
        let record = InstanceRecord {
            instance_id: instance_id.clone(),
            name: new.name,
            type_id: hlss_type.type_id.clone(),
            access_token,
            display,
            lifecycle: InstanceLifecycle::Pending,
            configuration_url: None,
            last_error: None,
            created_at: Utc::now(),
            initialized_at: None,
            change_notified_at: None,
        };
        self.instances
            .insert(instance_id.clone(), Arc::new(Mutex::new(record)));

        if new.auto_initialize {
            // The instance is usable for admin retry even when the first
            // initialization attempt fails.
            if let Err(err) = self.initialize_instance(&instance_id).await {
                warn!(instance = %instance_id, error = %err, "auto-initialization failed");
            }
        }
        self.get_instance(&instance_id).await
    }

    pub async fn list_instances(&self) -> Vec<InstanceView> {
        let handles: Vec<_> = self.instances.iter().map(|e| e.value().clone()).collect();
        let mut views = Vec::with_capacity(handles.len());
        for handle in handles {
            views.push(InstanceView::from_record(&*handle.lock().await));
        }
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        views
    }

    pub async fn get_instance(&self, instance_id: &str) -> Result<InstanceView, StateError> {
        let handle = self.instance_handle(instance_id)?;
        let instance = handle.lock().await;
        Ok(InstanceView::from_record(&instance))
    }

    /// Initialize (or re-initialize) an instance with its backend. Safe to
    /// repeat: a failed attempt leaves the record at `initializing` with the
    /// error recorded, and nothing is rolled back.
    pub async fn initialize_instance(&self, instance_id: &str) -> Result<InstanceView, StateError> {
        let handle = self.instance_handle(instance_id)?;
        let (type_id, display) = {
            let mut instance = handle.lock().await;
            instance.lifecycle = InstanceLifecycle::Initializing;
            (instance.type_id.clone(), instance.display)
        };
        let hlss_type = self.type_record(&type_id)?;
        let request = HlssInitRequest {
            instance_id: instance_id.to_string(),
            callbacks: self.callbacks_for(instance_id),
            display,
        };

        let result = self.transport.initialize(&hlss_type.endpoint(), &request).await;

        let mut instance = handle.lock().await;
        match result {
            Ok(response) if response.status == "initialized" => {
                instance.lifecycle = if response.needs_configuration {
                    InstanceLifecycle::NeedsConfiguration
                } else {
                    InstanceLifecycle::Ready
                };
                instance.configuration_url = response
                    .needs_configuration
                    .then_some(response.configuration_url)
                    .flatten();
                instance.initialized_at = Some(Utc::now());
                instance.last_error = None;
                info!(
                    instance = %instance_id,
                    lifecycle = ?instance.lifecycle,
                    "instance initialized with backend"
                );
                Ok(InstanceView::from_record(&instance))
            }
            Ok(response) => {
                let err = HlssError::Protocol(format!(
                    "unexpected initialization status \"{}\"",
                    response.status
                ));
                instance.last_error = Some(err.to_string());
                Err(StateError::Backend(err))
            }
            Err(err) => {
                warn!(instance = %instance_id, error = %err, "instance initialization failed");
                instance.last_error = Some(err.to_string());
                Err(StateError::Backend(err))
            }
        }
    }

    /// Re-query the backend's status and apply it. This is the manual escape
    /// hatch for a missed change notification; the broker never polls
    /// backends on its own.
    pub async fn refresh_instance_status(
        &self,
        instance_id: &str,
    ) -> Result<InstanceView, StateError> {
        let handle = self.instance_handle(instance_id)?;
        let type_id = handle.lock().await.type_id.clone();
        let hlss_type = self.type_record(&type_id)?;

        let status = self
            .transport
            .status(&hlss_type.endpoint(), instance_id)
            .await?;

        let mut instance = handle.lock().await;
        instance.lifecycle = if status.ready {
            InstanceLifecycle::Ready
        } else if status.needs_configuration {
            InstanceLifecycle::NeedsConfiguration
        } else {
            InstanceLifecycle::Initializing
        };
        instance.configuration_url = status.configuration_url;
        Ok(InstanceView::from_record(&instance))
    }

    /// Ask the backend to render (or re-send) its current frame.
    pub async fn request_render(&self, instance_id: &str) -> Result<(), StateError> {
        let handle = self.instance_handle(instance_id)?;
        let type_id = handle.lock().await.type_id.clone();
        let hlss_type = self.type_record(&type_id)?;
        self.transport
            .request_render(&hlss_type.endpoint(), instance_id)
            .await?;
        Ok(())
    }

    /// Delete an instance: removes it from every device's assignment set
    /// (repairing the active selection), drops its frames, then the record.
    pub async fn delete_instance(&self, instance_id: &str) -> Result<(), StateError> {
        if self.instances.remove(instance_id).is_none() {
            return Err(StateError::InstanceNotFound);
        }
        let handles: Vec<_> = self.devices.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            let mut device = handle.lock().await;
            device.assignments.retain(|id| id != instance_id);
            if device.active_instance_id.as_deref() == Some(instance_id) {
                device.active_instance_id = device.assignments.first().cloned();
            }
        }
        self.frames.remove_instance(instance_id);
        info!(instance = %instance_id, "instance deleted");
        Ok(())
    }

    // -- frame pipeline ------------------------------------------------------

    /// Accept a frame from a backend. The instance access credential must
    /// match the submission path.
    pub async fn submit_frame(
        &self,
        instance_id: &str,
        token: &str,
        bytes: Vec<u8>,
    ) -> Result<PutResult, StateError> {
        let claims = self.tokens.verify(token, TokenKind::InstanceAccess)?;
        if claims.sub != instance_id {
            return Err(StateError::Forbidden("token does not match instance"));
        }
        if bytes.is_empty() {
            return Err(StateError::Invalid("frame body is empty".into()));
        }
        let handle = self.instance_handle(instance_id)?;
        let (width, height) = {
            let instance = handle.lock().await;
            (instance.display.width, instance.display.height)
        };
        let put = self.frames.put(instance_id, bytes, width, height);
        metrics::FRAMES_SUBMITTED
            .with_label_values(&[instance_id])
            .inc();
        if put.deduplicated {
            metrics::FRAMES_DEDUPLICATED
                .with_label_values(&[instance_id])
                .inc();
            debug!(instance = %instance_id, frame = %put.frame.frame_id, "duplicate frame submission collapsed");
        } else {
            debug!(instance = %instance_id, frame = %put.frame.frame_id, "frame stored");
        }
        Ok(put)
    }

    /// Backend change notification: records the dirty marker. Delivery is
    /// still driven entirely by the hash comparison at poll time.
    pub async fn notify_change(&self, instance_id: &str, token: &str) -> Result<(), StateError> {
        let claims = self.tokens.verify(token, TokenKind::InstanceAccess)?;
        if claims.sub != instance_id {
            return Err(StateError::Forbidden("token does not match instance"));
        }
        let handle = self.instance_handle(instance_id)?;
        let mut instance = handle.lock().await;
        instance.change_notified_at = Some(Utc::now());
        debug!(instance = %instance_id, "backend signalled a pending change");
        Ok(())
    }

    /// Answer a device poll: offer the active instance's latest frame when
    /// it differs (by content hash) from the last acknowledged one. Re-polls
    /// without an acknowledgement keep returning the same offer.
    pub async fn poll_device(&self, device_id: &str) -> Result<PollOutcome, StateError> {
        metrics::DEVICE_POLLS.inc();
        let handle = self.device_handle(device_id)?;
        let mut device = handle.lock().await;
        device.last_seen_at = Some(Utc::now());
        let poll_after_ms = self.poll_interval_ms;

        let Some(instance_id) = device.active_instance_id.clone() else {
            return Ok(PollOutcome {
                active_instance_id: None,
                pending: None,
                poll_after_ms,
            });
        };
        let Some(latest) = self.frames.latest(&instance_id) else {
            return Ok(PollOutcome {
                active_instance_id: Some(instance_id),
                pending: None,
                poll_after_ms,
            });
        };
        let previous = device
            .current_frame_id
            .as_deref()
            .and_then(|id| self.frames.get(id));
        if previous
            .as_ref()
            .is_some_and(|frame| frame.hash == latest.hash)
        {
            return Ok(PollOutcome {
                active_instance_id: Some(instance_id),
                pending: None,
                poll_after_ms,
            });
        }

        let pending = match RefreshPlan::plan(
            previous.as_deref(),
            &latest,
            device.display.partial_refresh,
        ) {
            RefreshPlan::Full => {
                metrics::FRAME_DELIVERIES.with_label_values(&["full"]).inc();
                PendingUpdate::Full(latest)
            }
            RefreshPlan::Partial(delta) => {
                metrics::FRAME_DELIVERIES
                    .with_label_values(&["partial"])
                    .inc();
                PendingUpdate::Partial {
                    frame: latest,
                    delta,
                }
            }
        };
        Ok(PollOutcome {
            active_instance_id: Some(instance_id),
            pending: Some(pending),
            poll_after_ms,
        })
    }

    /// The sole mechanism advancing delivery state: the device confirms the
    /// frame it has drawn.
    pub async fn acknowledge_frame(
        &self,
        device_id: &str,
        frame_id: &str,
    ) -> Result<(), StateError> {
        let frame = self.frames.get(frame_id).ok_or(StateError::FrameNotFound)?;
        let handle = self.device_handle(device_id)?;
        let mut device = handle.lock().await;
        device.current_frame_id = Some(frame.frame_id.clone());
        Ok(())
    }

    pub fn frame_bytes(&self, frame_id: &str) -> Result<Arc<Frame>, StateError> {
        self.frames.get(frame_id).ok_or(StateError::FrameNotFound)
    }

    // -- input routing -------------------------------------------------------

    /// Route one input event. Context-switch buttons cycle the device's
    /// active assignment locally and are never forwarded; everything else is
    /// forwarded to the active instance's backend, fire-and-forget. The
    /// event is appended to the audit log in every case.
    pub async fn handle_input(
        &self,
        device_id: &str,
        event: InputEvent,
    ) -> Result<InputRouting, StateError> {
        metrics::INPUTS_RECEIVED.inc();

        if event.button.is_context_switch() {
            let direction = if event.button == Button::HlRight {
                CycleDirection::Forward
            } else {
                CycleDirection::Backward
            };
            let active = self.cycle_active(device_id, direction).await?;
            self.record_input(device_id, None, &event, false).await;
            return Ok(InputRouting {
                instance_id: active,
                forwarded: false,
                warning: None,
            });
        }

        let handle = self.device_handle(device_id)?;
        let target = {
            let mut device = handle.lock().await;
            device.last_seen_at = Some(Utc::now());
            device.active_instance_id.clone()
        };
        let Some(instance_id) = target else {
            self.record_input(device_id, None, &event, false).await;
            return Ok(InputRouting {
                instance_id: None,
                forwarded: false,
                warning: Some("device has no active instance".into()),
            });
        };

        let endpoint = self.endpoint_for_instance(&instance_id).await?;
        let result = self
            .transport
            .forward_input(&endpoint, &instance_id, &event)
            .await;
        let forwarded = result.is_ok();
        let warning = match &result {
            Ok(()) => {
                metrics::INPUTS_FORWARDED.inc();
                None
            }
            Err(err) => {
                metrics::INPUT_FORWARD_FAILURES.inc();
                warn!(
                    device = %device_id,
                    instance = %instance_id,
                    error = %err,
                    "input forwarding failed"
                );
                Some(format!("input not delivered: {err}"))
            }
        };
        self.record_input(device_id, Some(&instance_id), &event, forwarded)
            .await;
        Ok(InputRouting {
            instance_id: Some(instance_id),
            forwarded,
            warning,
        })
    }

    pub async fn recent_inputs(&self, limit: usize) -> Vec<InputEventRecord> {
        let log = self.input_log.lock().await;
        log.iter().rev().take(limit).cloned().collect()
    }

    pub async fn system_status(&self) -> SystemStatus {
        let instances = self.list_instances().await;
        SystemStatus {
            devices: self.devices.len(),
            instances: instances.len(),
            instances_ready: instances
                .iter()
                .filter(|i| i.lifecycle == InstanceLifecycle::Ready)
                .count(),
            instances_needs_configuration: instances
                .iter()
                .filter(|i| i.lifecycle == InstanceLifecycle::NeedsConfiguration)
                .count(),
            instances_uninitialized: instances
                .iter()
                .filter(|i| {
                    matches!(
                        i.lifecycle,
                        InstanceLifecycle::Pending | InstanceLifecycle::Initializing
                    )
                })
                .count(),
            active_types: self
                .hlss_types
                .iter()
                .filter(|entry| entry.value().is_active)
                .count(),
        }
    }

    // -- helpers -------------------------------------------------------------

    fn device_handle(&self, device_id: &str) -> Result<Arc<Mutex<DeviceRecord>>, StateError> {
        self.devices
            .get(device_id)
            .map(|entry| entry.value().clone())
            .ok_or(StateError::DeviceNotFound)
    }

    fn instance_handle(&self, instance_id: &str) -> Result<Arc<Mutex<InstanceRecord>>, StateError> {
        self.instances
            .get(instance_id)
            .map(|entry| entry.value().clone())
            .ok_or(StateError::InstanceNotFound)
    }

    fn type_record(&self, type_id: &str) -> Result<HlssTypeRecord, StateError> {
        self.hlss_types
            .get(type_id)
            .map(|entry| entry.value().clone())
            .ok_or(StateError::TypeNotFound)
    }

    async fn endpoint_for_instance(&self, instance_id: &str) -> Result<HlssEndpoint, StateError> {
        let handle = self.instance_handle(instance_id)?;
        let type_id = handle.lock().await.type_id.clone();
        Ok(self.type_record(&type_id)?.endpoint())
    }

    fn callbacks_for(&self, instance_id: &str) -> HlssCallbacks {
        let base = &self.public_base_url;
        HlssCallbacks {
            frames: format!("{base}/instances/{instance_id}/frames"),
            inputs: format!("{base}/instances/{instance_id}/inputs"),
            notify: format!("{base}/instances/{instance_id}/notify"),
        }
    }

    async fn record_input(
        &self,
        device_id: &str,
        instance_id: Option<&str>,
        event: &InputEvent,
        forwarded: bool,
    ) {
        let mut log = self.input_log.lock().await;
        log.push(InputEventRecord {
            device_id: device_id.to_string(),
            instance_id: instance_id.map(str::to_string),
            button: event.button,
            event_type: event.event_type,
            event_timestamp: event.timestamp,
            received_at: Utc::now(),
            forwarded,
        });
    }
}

/// Advance the active assignment to the neighbouring entry, wrapping. The
/// device record lock held by the caller is the per-device serialization
/// scope for concurrent cycles.
fn cycle_assignments(device: &mut DeviceRecord, direction: CycleDirection) -> Option<String> {
    let count = device.assignments.len();
    if count < 2 {
        return device.active_instance_id.clone();
    }
    let current = device
        .active_instance_id
        .as_ref()
        .and_then(|active| device.assignments.iter().position(|id| id == active))
        .unwrap_or(0);
    let next = match direction {
        CycleDirection::Forward => (current + 1) % count,
        CycleDirection::Backward => (current + count - 1) % count,
    };
    device.active_instance_id = Some(device.assignments[next].clone());
    device.active_instance_id.clone()
}

fn new_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..12])
}

fn new_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
