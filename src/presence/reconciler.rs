//! Roster reconciliation - merges the per-source maps into one view
//!
//! Source priority (same peer ID present in both maps):
//!
//! | mesh | backend | roster entry |
//! |------|---------|--------------|
//! | yes  | yes     | mesh         |
//! | yes  | no      | mesh         |
//! | no   | yes     | backend      |
//!
//! Mesh wins even when the backend record is newer. Proximity is treated as
//! the more trustworthy signal; this is a policy choice open to revisit.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::record::{Player, PlayerStatus, PresenceMap, PresenceRecord, UNKNOWN_DISTANCE_M};
use crate::geo::GeoPoint;
use crate::util::time::STALE_AFTER;

/// Merged, de-duplicated peers visible to the local player
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    entries: HashMap<Uuid, PresenceRecord>,
}

impl Roster {
    /// Remove one peer (used to hide the local player)
    pub fn exclude(mut self, peer_id: &Uuid) -> Self {
        self.entries.remove(peer_id);
        self
    }

    pub fn records(&self) -> impl Iterator<Item = &PresenceRecord> {
        self.entries.values()
    }
}

/// Merge both source maps. Pure and idempotent: the roster is rebuilt from
/// scratch on every call.
pub fn merge(backend: &PresenceMap, mesh: &PresenceMap) -> Roster {
    let mut entries = backend.clone();
    for (peer_id, record) in mesh {
        entries.insert(*peer_id, record.clone());
    }
    Roster { entries }
}

/// Whether a record is still inside the staleness window at `now`
pub fn is_fresh(record: &PresenceRecord, now: DateTime<Utc>) -> bool {
    match (now - record.last_seen).to_std() {
        Ok(age) => age < STALE_AFTER,
        // last_seen in the future: treat as just seen
        Err(_) => true,
    }
}

/// Derive the player list: stale records dropped, distances computed from
/// the local location, sorted nearest first.
pub fn derive_players(roster: &Roster, local: Option<&GeoPoint>, now: DateTime<Utc>) -> Vec<Player> {
    let mut players: Vec<Player> = roster
        .records()
        .filter(|record| is_fresh(record, now))
        .map(|record| {
            let distance_m = local
                .map(|here| here.distance_to(&record.location()))
                .unwrap_or(UNKNOWN_DISTANCE_M);
            Player {
                id: record.peer_id,
                name: record.display_name.clone(),
                status: PlayerStatus::for_distance(distance_m),
                distance_m,
                heading: record.heading,
                zone_key: record.zone_key.clone(),
                zone_label: record.zone_label.clone(),
                last_seen: record.last_seen,
                source: record.source,
            }
        })
        .collect();

    players.sort_by(|a, b| {
        a.distance_m
            .total_cmp(&b.distance_m)
            .then_with(|| a.id.cmp(&b.id))
    });
    players
}
