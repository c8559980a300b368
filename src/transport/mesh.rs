//! Mesh transport - presence and shots over the ad-hoc medium
//!
//! Outbound presence and pings go best-effort; shots and hits go reliably.
//! Inbound presence is keyed by the peer ID declared in the payload, not by
//! the medium's session identity, so it correlates with the backend view.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::link::{Delivery, LinkError, LinkEvent, MeshLink, SessionState};
use super::{Notice, TransportEvent};
use crate::presence::{PresenceMap, PresenceRecord, Source};
use crate::protocol::{Envelope, FrameSealer};
use crate::util::time::now_utc;

/// Link event queue depth
const LINK_QUEUE: usize = 256;

struct Session {
    epoch: u64,
    pump: JoinHandle<()>,
}

/// Mesh transport over a `MeshLink`
pub struct MeshTransport {
    link: Arc<dyn MeshLink>,
    sealer: FrameSealer,
    events: mpsc::Sender<TransportEvent>,
    next_epoch: AtomicU64,
    session: Mutex<Option<Session>>,
}

impl MeshTransport {
    pub fn new(link: Arc<dyn MeshLink>, secret: &str, events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            link,
            sealer: FrameSealer::new(secret),
            events,
            next_epoch: AtomicU64::new(1),
            session: Mutex::new(None),
        }
    }

    /// Start the medium and the inbound pump. Returns the session epoch.
    /// Idempotent while running.
    pub fn start(&self) -> Result<u64, LinkError> {
        let mut session = self.session.lock();
        if let Some(running) = session.as_ref() {
            return Ok(running.epoch);
        }

        let (link_tx, link_rx) = mpsc::channel(LINK_QUEUE);
        self.link.start(link_tx)?;

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let pump = tokio::spawn(pump(link_rx, self.sealer.clone(), epoch, self.events.clone()));

        info!(epoch, "Mesh transport started");
        *session = Some(Session { epoch, pump });
        Ok(epoch)
    }

    /// Disconnect every peer and drop all mesh presence state
    pub fn stop(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        // The presence map lives in the pump; aborting it drops the map
        session.pump.abort();
        self.link.stop();
        info!(epoch = session.epoch, "Mesh transport stopped");
    }

    pub fn is_running(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Send an envelope with the delivery mode its type calls for
    pub fn send(&self, envelope: &Envelope) {
        if !self.is_running() {
            return;
        }
        let delivery = match envelope {
            Envelope::Shot(_) | Envelope::Hit(_) => Delivery::Reliable,
            _ => Delivery::Unreliable,
        };
        match self.sealer.seal(envelope) {
            Ok(frame) => self.link.send(frame, delivery),
            Err(e) => warn!(kind = envelope.kind(), error = %e, "Failed to seal mesh frame"),
        }
    }
}

/// Translate link events into transport events. Owns the mesh presence map.
async fn pump(
    mut link_rx: mpsc::Receiver<LinkEvent>,
    sealer: FrameSealer,
    epoch: u64,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut presence = PresenceMap::new();
    let mut connected: BTreeSet<String> = BTreeSet::new();

    while let Some(event) = link_rx.recv().await {
        let outbound = match event {
            LinkEvent::Session { peer, state } => {
                debug!(peer = %peer, ?state, "Mesh session transition");
                match state {
                    SessionState::Connected => {
                        connected.insert(peer);
                    }
                    SessionState::Connecting | SessionState::Disconnected => {
                        connected.remove(&peer);
                    }
                }
                Some(TransportEvent::MeshPeers {
                    epoch,
                    connected: connected.iter().cloned().collect(),
                })
            }
            LinkEvent::Frame { peer, frame } => match sealer.open(&frame) {
                Ok(envelope) => handle_envelope(envelope, &peer, epoch, &mut presence),
                Err(e) => {
                    debug!(peer = %peer, error = %e, "Dropping mesh frame");
                    None
                }
            },
        };

        if let Some(outbound) = outbound {
            if events.send(outbound).await.is_err() {
                break;
            }
        }
    }
}

fn handle_envelope(
    envelope: Envelope,
    peer: &str,
    epoch: u64,
    presence: &mut PresenceMap,
) -> Option<TransportEvent> {
    match envelope {
        Envelope::Presence(payload) => {
            let record = PresenceRecord::from_payload(payload, Source::Mesh, now_utc());
            presence.insert(record.peer_id, record);
            Some(TransportEvent::Presence {
                source: Source::Mesh,
                epoch,
                records: presence.clone(),
            })
        }
        Envelope::Hit(hit) => Some(TransportEvent::Notice {
            source: Source::Mesh,
            epoch,
            notice: Notice::Hit(hit),
        }),
        Envelope::Shot(shot) => {
            debug!(peer = %peer, from_id = %shot.from_id, "Mesh shot observed");
            None
        }
        other => {
            debug!(peer = %peer, kind = other.kind(), "Ignoring mesh envelope");
            None
        }
    }
}
