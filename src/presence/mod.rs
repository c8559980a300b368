//! Presence tracking - per-source records and the merged roster

pub mod reconciler;
pub mod record;

pub use reconciler::{derive_players, merge, Roster};
pub use record::{Player, PlayerStatus, PresenceMap, PresenceRecord, Source};
