//! Envelope and payload definitions
//! These are the wire types shared by the mesh and the backend connection

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default shot range when a peer omits it
pub const DEFAULT_SHOT_RANGE_M: f64 = 40.0;

/// `{"type": ..., "payload": {...}}` envelope carried by both transports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    /// A peer's self-reported location and heading
    Presence(PresencePayload),
    /// A fire action
    Shot(ShotPayload),
    /// A resolved hit
    Hit(HitPayload),
    /// Liveness probe
    Ping(PingPayload),
    /// Backend reply to a ping
    Pong(PingPayload),
    /// Backend: someone joined the lobby
    Join(JoinPayload),
    /// Backend: someone left the lobby
    Leave(LeavePayload),
    /// Backend: full lobby roster sent right after connecting
    State(StatePayload),
    /// Backend: request rejected
    Error(ErrorPayload),
}

impl Envelope {
    /// Decode one envelope; unknown types and malformed payloads are errors
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn decode_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Wire name of this envelope's type (for logging)
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Presence(_) => "presence",
            Envelope::Shot(_) => "shot",
            Envelope::Hit(_) => "hit",
            Envelope::Ping(_) => "ping",
            Envelope::Pong(_) => "pong",
            Envelope::Join(_) => "join",
            Envelope::Leave(_) => "leave",
            Envelope::State(_) => "state",
            Envelope::Error(_) => "error",
        }
    }
}

/// Presence payload
///
/// The backend relays presence in its own player shape (`id`, `last_seen`),
/// so both spellings are accepted on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    #[serde(alias = "id")]
    pub player_id: Uuid,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    /// Degrees, 0-360
    pub heading: f64,
    #[serde(default)]
    pub zone_key: Option<String>,
    #[serde(default)]
    pub zone_label: Option<String>,
    #[serde(alias = "last_seen")]
    pub ts: DateTime<Utc>,
}

/// Shot payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotPayload {
    pub from_id: Uuid,
    pub heading: f64,
    #[serde(default = "default_range")]
    pub range_m: f64,
    #[serde(default)]
    pub target_id: Option<Uuid>,
    pub ts: DateTime<Utc>,
}

fn default_range() -> f64 {
    DEFAULT_SHOT_RANGE_M
}

/// Hit payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitPayload {
    pub from_id: Uuid,
    pub to_id: Uuid,
    pub distance_m: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPayload {
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub player_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeavePayload {
    pub player_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePayload {
    #[serde(default)]
    pub players: Vec<PresencePayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default = "default_error_code")]
    pub code: String,
}

fn default_error_code() -> String {
    "bad_request".to_string()
}
