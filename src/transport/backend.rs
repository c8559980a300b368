//! Backend realtime transport
//!
//! One WebSocket per lobby session. The connection task owns the backend
//! presence map, answers nothing on its own and never reconnects: any
//! receive error ends the session with `BackendStatus::Error` and the
//! orchestrator decides what happens next.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::{Notice, TransportEvent};
use crate::presence::{PresenceMap, PresenceRecord, Source};
use crate::protocol::{Envelope, PingPayload};
use crate::util::time::{now_utc, HEARTBEAT_INTERVAL};

/// Outbound envelope queue depth
const OUTBOUND_QUEUE: usize = 64;

/// Grace period for a clean close before the task is aborted
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Backend connection state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BackendStatus {
    Disconnected,
    Connecting,
    Connected,
    Error { message: String },
}

impl BackendStatus {
    pub fn error(message: impl Into<String>) -> Self {
        BackendStatus::Error {
            message: message.into(),
        }
    }
}

struct Connection {
    epoch: u64,
    outbound: mpsc::Sender<Envelope>,
    task: JoinHandle<()>,
}

/// WebSocket transport to the backend
pub struct BackendTransport {
    events: mpsc::Sender<TransportEvent>,
    next_epoch: AtomicU64,
    connection: Mutex<Option<Connection>>,
}

impl BackendTransport {
    pub fn new(events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            events,
            next_epoch: AtomicU64::new(1),
            connection: Mutex::new(None),
        }
    }

    /// Open a session to `url`, replacing any current one. Returns the
    /// session epoch carried by every event it produces.
    pub fn connect(&self, url: Url) -> u64 {
        self.disconnect();

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let task = tokio::spawn(run_connection(url, epoch, outbound_rx, self.events.clone()));

        *self.connection.lock() = Some(Connection {
            epoch,
            outbound,
            task,
        });
        epoch
    }

    /// Close the session and drop its presence state. Safe to repeat.
    pub fn disconnect(&self) {
        let Some(connection) = self.connection.lock().take() else {
            return;
        };
        // Dropping the queue asks the task to send a close frame
        drop(connection.outbound);
        let mut task = connection.task;
        tokio::spawn(async move {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        });
        info!(epoch = connection.epoch, "Backend disconnected");
    }

    /// Fire-and-forget; dropped when there is no session or the queue is full
    pub fn send(&self, envelope: Envelope) {
        let connection = self.connection.lock();
        let Some(connection) = connection.as_ref() else {
            return;
        };
        if let Err(e) = connection.outbound.try_send(envelope) {
            debug!(epoch = connection.epoch, error = %e, "Backend send dropped");
        }
    }
}

async fn run_connection(
    url: Url,
    epoch: u64,
    mut outbound: mpsc::Receiver<Envelope>,
    events: mpsc::Sender<TransportEvent>,
) {
    let status = |status: BackendStatus| TransportEvent::BackendStatus { epoch, status };

    if events.send(status(BackendStatus::Connecting)).await.is_err() {
        return;
    }
    debug!(epoch, url = %url, "Connecting to backend");

    let (ws, _) = match connect_async(url.as_str()).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!(epoch, error = %e, "Backend connection failed");
            let _ = events.send(status(BackendStatus::error(e.to_string()))).await;
            return;
        }
    };
    info!(epoch, "Backend connected");
    if events.send(status(BackendStatus::Connected)).await.is_err() {
        return;
    }

    let (mut sink, mut stream) = ws.split();
    let mut presence = PresenceMap::new();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    let failure = loop {
        tokio::select! {
            inbound = stream.next() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Close(_))) | None => break "connection closed by backend".to_string(),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break e.to_string(),
                };
                let envelope = match Envelope::decode(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        debug!(epoch, error = %e, "Dropping backend message");
                        continue;
                    }
                };
                for event in handle_envelope(envelope, epoch, &mut presence) {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            queued = outbound.recv() => {
                let Some(envelope) = queued else {
                    // Disconnect requested
                    let _ = sink.close().await;
                    return;
                };
                match envelope.encode() {
                    Ok(text) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            break e.to_string();
                        }
                    }
                    Err(e) => warn!(epoch, kind = envelope.kind(), error = %e, "Failed to encode envelope"),
                }
            }
            _ = heartbeat.tick() => {
                let ping = Envelope::Ping(PingPayload { ts: now_utc() });
                if let Ok(text) = ping.encode() {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        break e.to_string();
                    }
                }
            }
        }
    };

    warn!(epoch, error = %failure, "Backend connection lost");
    let _ = events.send(status(BackendStatus::error(failure))).await;
}

/// Apply one inbound envelope to the backend map; returns events to publish
fn handle_envelope(envelope: Envelope, epoch: u64, presence: &mut PresenceMap) -> Vec<TransportEvent> {
    let snapshot = |presence: &PresenceMap| TransportEvent::Presence {
        source: Source::Backend,
        epoch,
        records: presence.clone(),
    };
    let notice = |notice: Notice| TransportEvent::Notice {
        source: Source::Backend,
        epoch,
        notice,
    };

    match envelope {
        Envelope::Presence(payload) => {
            let record = PresenceRecord::from_payload(payload, Source::Backend, now_utc());
            presence.insert(record.peer_id, record);
            vec![snapshot(presence)]
        }
        Envelope::State(state) => {
            let received_at = now_utc();
            for payload in state.players {
                let record = PresenceRecord::from_payload(payload, Source::Backend, received_at);
                presence.insert(record.peer_id, record);
            }
            vec![snapshot(presence)]
        }
        Envelope::Leave(leave) => {
            if presence.remove(&leave.player_id).is_some() {
                vec![snapshot(presence)]
            } else {
                Vec::new()
            }
        }
        Envelope::Hit(hit) => vec![notice(Notice::Hit(hit))],
        Envelope::Join(join) => vec![notice(Notice::Joined { name: join.name })],
        Envelope::Error(error) => vec![notice(Notice::Error {
            message: error.message,
        })],
        Envelope::Pong(_) | Envelope::Ping(_) | Envelope::Shot(_) => Vec::new(),
    }
}
