//! Slate wire contract: the types shared between the broker, device
//! firmware, and HLSS backends.
//!
//! Covers:
//! - display descriptors and the physical button map
//! - device registration and token exchange payloads
//! - the poll protocol (actions, frame references)
//! - the broker/HLSS initialization and status contract

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Physical display characteristics a device reports at registration.
///
/// Instances inherit these (or HLSS-type defaults) so backends render at the
/// right geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayCapabilities {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    #[serde(default)]
    pub partial_refresh: bool,
}

/// Hardware buttons on the device bezel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Button {
    #[serde(rename = "BTN_1")]
    Btn1,
    #[serde(rename = "BTN_2")]
    Btn2,
    #[serde(rename = "BTN_3")]
    Btn3,
    #[serde(rename = "BTN_4")]
    Btn4,
    #[serde(rename = "BTN_5")]
    Btn5,
    #[serde(rename = "BTN_6")]
    Btn6,
    #[serde(rename = "BTN_7")]
    Btn7,
    #[serde(rename = "BTN_8")]
    Btn8,
    #[serde(rename = "ENTER")]
    Enter,
    #[serde(rename = "ESC")]
    Esc,
    #[serde(rename = "HL_LEFT")]
    HlLeft,
    #[serde(rename = "HL_RIGHT")]
    HlRight,
}

impl Button {
    /// Context-switch buttons are handled by the broker itself and are never
    /// forwarded to a backend.
    pub fn is_context_switch(self) -> bool {
        matches!(self, Button::HlLeft | Button::HlRight)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Button::Btn1 => "BTN_1",
            Button::Btn2 => "BTN_2",
            Button::Btn3 => "BTN_3",
            Button::Btn4 => "BTN_4",
            Button::Btn5 => "BTN_5",
            Button::Btn6 => "BTN_6",
            Button::Btn7 => "BTN_7",
            Button::Btn8 => "BTN_8",
            Button::Enter => "ENTER",
            Button::Esc => "ESC",
            Button::HlLeft => "HL_LEFT",
            Button::HlRight => "HL_RIGHT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputEventKind {
    Press,
    Release,
    LongPress,
}

/// A single button event as submitted by a device and forwarded to HLSS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputEvent {
    pub button: Button,
    pub event_type: InputEventKind,
    pub timestamp: DateTime<Utc>,
}

/// What the device should do after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollAction {
    Noop,
    FetchFrame,
    Sleep,
}

/// Reference to a stored frame the device can fetch by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRef {
    pub frame_id: String,
    pub hash: String,
    pub width: u32,
    pub height: u32,
}

/// Device authorization lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Pending,
    Authorized,
    Rejected,
    Revoked,
}

impl AuthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthStatus::Pending => "pending",
            AuthStatus::Authorized => "authorized",
            AuthStatus::Rejected => "rejected",
            AuthStatus::Revoked => "revoked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub hardware_id: String,
    pub firmware_version: String,
    pub display: DisplayCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRegistrationResponse {
    pub device_id: String,
    pub device_secret: String,
    pub auth_status: AuthStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthRequest {
    pub hardware_id: String,
    pub device_secret: String,
    pub firmware_version: String,
    pub display: DisplayCapabilities,
}

/// Response to a token exchange. `refresh_token` is empty while the device
/// is still pending authorization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthResponse {
    pub device_id: String,
    pub refresh_token: String,
    pub refresh_token_expires_in: u64,
    pub auth_status: AuthStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRefreshResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRenewalResponse {
    pub refresh_token: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatusResponse {
    pub device_id: String,
    pub auth_status: AuthStatus,
    pub authorized_at: Option<DateTime<Utc>>,
}

/// Response returned to a backend after a frame submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameSubmitResponse {
    pub frame_id: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Broker-to-HLSS contract
// ---------------------------------------------------------------------------

/// Callback URLs handed to an HLSS backend at initialization, scoped to one
/// instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlssCallbacks {
    /// Where the backend submits rendered frames.
    pub frames: String,
    /// Where the broker delivers forwarded inputs.
    pub inputs: String,
    /// Where the backend signals "state changed, a new frame may follow".
    pub notify: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlssInitRequest {
    pub instance_id: String,
    pub callbacks: HlssCallbacks,
    pub display: DisplayCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlssInitResponse {
    /// Must be `"initialized"`; anything else is treated as a failure.
    pub status: String,
    #[serde(default)]
    pub needs_configuration: bool,
    #[serde(default)]
    pub configuration_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlssStatusResponse {
    pub instance_id: String,
    pub ready: bool,
    #[serde(default)]
    pub needs_configuration: bool,
    #[serde(default)]
    pub configuration_url: Option<String>,
    #[serde(default)]
    pub active_screen: Option<String>,
}
