//! Control-plane message types.
//!
//! These travel as JSON text messages over the WebSocket links, one
//! key-tagged object per message (`{"connect_request": {...}}`) — which
//! is exactly what an externally tagged serde enum produces.
//! Pure data — no I/O.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One control-plane message, tagged by its single top-level key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMsg {
    // -- Logon (control and media links share the tag) --
    ConnectRequest(ConnectRequest),
    ConnectResponse(ConnectResponse),

    // -- Conference membership --
    ConnectToConferenceRequest {
        tag: String,
    },
    ConnectToConferenceResponse(ConferenceResponse),
    DisconnectFromConference {},

    // -- Device lifecycle --
    DeviceParams(DeviceParams),
    DeviceConnect(DeviceConnect),
    DeviceDisconnect {
        device_id: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<u32>,
    },
    RendererDisconnect {
        device_id: u32,
        ssrc: u32,
    },

    // -- Chat passthrough (persistence is out of scope) --
    DeliveryMessages(Value),

    // -- Keepalive / teardown --
    Ping {},
    Disconnect {},
}

impl ControlMsg {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

// ---------------------------------------------------------------------------
// Logon
// ---------------------------------------------------------------------------

/// Logon payload. The control link authenticates with credentials; media
/// links present the access token issued by the control logon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// Media-link `channel_type` for WSM payload traffic.
pub const CHANNEL_TYPE_WSM: u8 = 1;

impl ConnectRequest {
    pub fn control(login: &str, password: &str, client_version: u32) -> Self {
        Self {
            login: Some(login.to_owned()),
            password: Some(password.to_owned()),
            client_version: Some(client_version),
            ..Self::default()
        }
    }

    pub fn media(access_token: &str) -> Self {
        Self {
            channel_type: Some(CHANNEL_TYPE_WSM),
            access_token: Some(access_token.to_owned()),
            ..Self::default()
        }
    }
}

/// Logon acknowledgment. Media links send it empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectResponse {
    #[serde(default)]
    pub result: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
}

/// `connect_response.result` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResult {
    Ok,
    BadCredentials,
    StaleClient,
    Redirect,
    NoSlots,
    ServerError,
    IpBanned,
    Unknown(u8),
}

impl From<u8> for ConnectResult {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Ok,
            2 => Self::BadCredentials,
            3 => Self::StaleClient,
            4 => Self::Redirect,
            5 => Self::NoSlots,
            6 => Self::ServerError,
            7 => Self::IpBanned,
            other => Self::Unknown(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Conference
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConferenceResponse {
    #[serde(default)]
    pub result: u8,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub name: String,
}

/// `connect_to_conference_response.result` value for success.
pub const CONFERENCE_OK: u8 = 1;

// ---------------------------------------------------------------------------
// Device lifecycle
// ---------------------------------------------------------------------------

/// Device announcement. The client sends it with zeroed `id`/`ssrc`; the
/// server answers with both assigned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceParams {
    #[serde(default)]
    pub id: u32,
    #[serde(default)]
    pub ssrc: u32,
    pub device_type: u8,
    #[serde(default)]
    pub ord: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub resolution: u32,
    #[serde(default)]
    pub color_space: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
}

/// `device_connect.connect_type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectType {
    /// Our own announced device was created server-side; the notice
    /// carries the stream identity to attach with.
    CreatedDevice = 1,
    /// A remote stream exists that we should render.
    Renderer = 2,
}

impl TryFrom<u8> for ConnectType {
    type Error = u8;
    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            1 => Ok(Self::CreatedDevice),
            2 => Ok(Self::Renderer),
            other => Err(other),
        }
    }
}

/// Device lifecycle notice, in both directions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConnect {
    pub connect_type: u8,
    pub device_type: u8,
    pub device_id: u32,
    #[serde(default)]
    pub client_id: u32,
    #[serde(default)]
    pub author_ssrc: u32,
    #[serde(default)]
    pub receiver_ssrc: u32,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub secure_key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub resolution: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Non-zero when the notice describes our own stream echoed back.
    #[serde(default)]
    pub my: u8,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
