//! Presence records and the derived player view

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::{GeoPoint, Zone};
use crate::protocol::PresencePayload;

/// Distance below which a peer is linked (meters, exclusive)
pub const LINKED_RADIUS_M: f64 = 10.0;

/// Distance below which a peer is in range (meters, exclusive)
pub const IN_RANGE_RADIUS_M: f64 = 25.0;

/// Distance reported while the local location is unknown
pub const UNKNOWN_DISTANCE_M: f64 = 99_999.0;

/// Which transport a record arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Mesh,
    Backend,
}

/// Latest known presence of one peer, as seen by one source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceRecord {
    pub peer_id: Uuid,
    pub display_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub heading: f64,
    pub zone_key: String,
    pub zone_label: String,
    /// Local receipt time (remote clocks are not trusted for liveness)
    pub last_seen: DateTime<Utc>,
    pub source: Source,
}

impl PresenceRecord {
    /// Build a record from an inbound payload. Missing zone fields are
    /// derived from the coordinates.
    pub fn from_payload(payload: PresencePayload, source: Source, received_at: DateTime<Utc>) -> Self {
        let location = GeoPoint::new(payload.lat, payload.lon);
        let zone = Zone::of(&location);
        Self {
            peer_id: payload.player_id,
            display_name: payload.name,
            latitude: payload.lat,
            longitude: payload.lon,
            heading: payload.heading,
            zone_key: payload.zone_key.unwrap_or(zone.key),
            zone_label: payload.zone_label.unwrap_or(zone.label),
            last_seen: received_at,
            source,
        }
    }

    pub fn location(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// Per-source presence map, keyed by the peer's declared ID
pub type PresenceMap = HashMap<Uuid, PresenceRecord>;

/// Proximity classification of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    Linked,
    InRange,
    OutOfRange,
}

impl PlayerStatus {
    pub fn for_distance(distance_m: f64) -> Self {
        if distance_m < LINKED_RADIUS_M {
            PlayerStatus::Linked
        } else if distance_m < IN_RANGE_RADIUS_M {
            PlayerStatus::InRange
        } else {
            PlayerStatus::OutOfRange
        }
    }
}

/// View entity computed fresh from a record and the local location
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Player {
    pub id: Uuid,
    pub name: String,
    pub status: PlayerStatus,
    pub distance_m: f64,
    pub heading: f64,
    pub zone_key: String,
    pub zone_label: String,
    pub last_seen: DateTime<Utc>,
    pub source: Source,
}
