//! Transports - the LAN mesh, the backend realtime connection, and the
//! backend lobby API
//!
//! Both realtime transports own their presence map exclusively and publish
//! full snapshots as `TransportEvent`s into one channel drained by the
//! orchestrator. Every event carries the epoch of the session that produced
//! it so events from a stopped session can be discarded.

pub mod backend;
pub mod link;
pub mod lobby;
pub mod mesh;

pub use backend::{BackendStatus, BackendTransport};
pub use link::{Delivery, LinkEvent, MeshLink, SessionState, UdpMeshLink, UdpMeshLinkConfig};
pub use lobby::{LobbyClient, LobbyError, LobbyInfo};
pub use mesh::MeshTransport;

use crate::discovery::BackendEndpoint;
use crate::presence::{PresenceMap, Source};
use crate::protocol::HitPayload;

/// Transient, user-facing happenings (never part of roster state)
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Hit(HitPayload),
    Joined { name: String },
    Error { message: String },
}

/// Everything transports and discovery report to the orchestrator
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Full snapshot of one source's presence map
    Presence {
        source: Source,
        epoch: u64,
        records: PresenceMap,
    },
    /// Mesh peers with a live session (display only)
    MeshPeers { epoch: u64, connected: Vec<String> },
    /// Backend connection state change
    BackendStatus { epoch: u64, status: BackendStatus },
    Notice {
        source: Source,
        epoch: u64,
        notice: Notice,
    },
    /// Discovery resolved (or recalled) a backend address
    Endpoint(BackendEndpoint),
}
