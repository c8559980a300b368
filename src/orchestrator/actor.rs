//! Orchestrator actor: the single owner of client state

use std::sync::Arc;

use rand::{distributions::Alphanumeric, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{
    Command, ConnectivityMode, LobbyState, OrchestratorConfig, OrchestratorError, OrchestratorHandle,
    OrchestratorView, Reply, SensorPort, SensorReading,
};
use crate::discovery::{BackendDiscovery, BackendEndpoint};
use crate::geo::{GeoPoint, Zone};
use crate::presence::{derive_players, merge, Player, PresenceMap, Source};
use crate::protocol::{Envelope, HitPayload, PresencePayload, ShotPayload, DEFAULT_SHOT_RANGE_M};
use crate::targeting::{FireOutcome, TargetingEngine};
use crate::transport::{
    BackendStatus, BackendTransport, LobbyClient, LobbyError, LobbyInfo, MeshLink, MeshTransport,
    Notice, TransportEvent,
};
use crate::util::time::{now_utc, Backoff, BROADCAST_INTERVAL, HEADING_SIM_INTERVAL};

const COMMAND_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 256;
const SENSOR_QUEUE: usize = 16;
const LOBBY_QUEUE: usize = 4;

/// Prefix and length of lobby codes assigned without a backend
const LOCAL_CODE_PREFIX: &str = "LOCAL-";
const LOCAL_CODE_LEN: usize = 4;

struct Inbox {
    commands: mpsc::Receiver<Command>,
    events: mpsc::Receiver<TransportEvent>,
    sensors: mpsc::Receiver<SensorReading>,
    lobby: mpsc::Receiver<LobbyOutcome>,
}

/// Backend lobby call running off the actor task
struct PendingLobby {
    request: u64,
    task: JoinHandle<()>,
    reply: Reply<LobbyState>,
}

struct LobbyOutcome {
    request: u64,
    result: Result<LobbyInfo, LobbyError>,
}

/// The actor. Build with `new`, then drive `run` on a task.
pub struct Orchestrator {
    core: Core,
    inbox: Inbox,
}

struct Core {
    config: OrchestratorConfig,
    mesh: MeshTransport,
    backend: BackendTransport,
    discovery: BackendDiscovery,
    lobby_client: LobbyClient,
    sensor: Arc<dyn SensorPort>,
    sensor_tx: mpsc::Sender<SensorReading>,
    lobby_tx: mpsc::Sender<LobbyOutcome>,
    view_tx: watch::Sender<OrchestratorView>,
    rng: ChaCha8Rng,

    scanning: bool,
    mode: ConnectivityMode,
    lobby: Option<LobbyState>,
    pending_lobby: Option<PendingLobby>,
    next_lobby_request: u64,
    location: Option<GeoPoint>,
    location_gap_logged: bool,
    mesh_records: PresenceMap,
    backend_records: PresenceMap,
    mesh_epoch: Option<u64>,
    backend_epoch: Option<u64>,
    mesh_peers: Vec<String>,
    mesh_error: Option<String>,
    backend_status: BackendStatus,
    endpoint: Option<BackendEndpoint>,
    players: Vec<Player>,
    targeting: TargetingEngine,
    notice: Option<String>,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        link: Arc<dyn MeshLink>,
        sensor: Arc<dyn SensorPort>,
    ) -> (Self, OrchestratorHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, events) = mpsc::channel(EVENT_QUEUE);
        let (sensor_tx, sensors) = mpsc::channel(SENSOR_QUEUE);
        let (lobby_tx, lobby) = mpsc::channel(LOBBY_QUEUE);
        let (view_tx, view_rx) = watch::channel(OrchestratorView::initial(&config));

        let core = Core {
            mesh: MeshTransport::new(link, &config.mesh_secret, event_tx.clone()),
            backend: BackendTransport::new(event_tx.clone()),
            discovery: BackendDiscovery::new(config.discovery.clone(), event_tx),
            lobby_client: LobbyClient::new(),
            sensor,
            sensor_tx,
            lobby_tx,
            view_tx,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            scanning: false,
            mode: config.mode,
            lobby: None,
            pending_lobby: None,
            next_lobby_request: 0,
            location: None,
            location_gap_logged: false,
            mesh_records: PresenceMap::new(),
            backend_records: PresenceMap::new(),
            mesh_epoch: None,
            backend_epoch: None,
            mesh_peers: Vec::new(),
            mesh_error: None,
            backend_status: BackendStatus::Disconnected,
            endpoint: None,
            players: Vec::new(),
            targeting: TargetingEngine::new(config.seed),
            notice: None,
            backoff: Backoff::new(),
            reconnect_at: None,
            config,
        };

        let handle = OrchestratorHandle {
            commands: command_tx,
            view: view_rx,
        };
        (
            Self {
                core,
                inbox: Inbox {
                    commands,
                    events,
                    sensors,
                    lobby,
                },
            },
            handle,
        )
    }

    /// Serve commands until every handle is dropped, then stop everything
    pub async fn run(self) {
        let Orchestrator { mut core, mut inbox } = self;

        let mut broadcast = tokio::time::interval(BROADCAST_INTERVAL);
        broadcast.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut drift = tokio::time::interval(HEADING_SIM_INTERVAL);
        drift.set_missed_tick_behavior(MissedTickBehavior::Skip);

        if core.mode == ConnectivityMode::MeshAndBackend {
            core.start_discovery();
        }
        info!(player_id = %core.config.player_id, mode = ?core.mode, "Orchestrator running");

        loop {
            let reconnect_at = core.reconnect_at;
            tokio::select! {
                command = inbox.commands.recv() => match command {
                    Some(command) => core.handle_command(command),
                    None => break,
                },
                Some(event) = inbox.events.recv() => core.handle_event(event),
                Some(reading) = inbox.sensors.recv() => core.handle_reading(reading),
                Some(outcome) = inbox.lobby.recv() => core.finish_lobby_request(outcome),
                _ = broadcast.tick(), if core.scanning => core.broadcast(),
                _ = drift.tick(), if core.scanning && core.targeting.is_simulating() => {
                    core.targeting.tick_simulation();
                    core.publish();
                }
                _ = tokio::time::sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    core.reconnect_at = None;
                    core.connect_backend();
                    core.publish();
                }
            }
        }

        core.stop();
        core.discovery.stop();
        info!("Orchestrator stopped");
    }
}

impl Core {
    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                self.start();
                let _ = reply.send(Ok(()));
            }
            Command::Stop(reply) => {
                self.stop();
                let _ = reply.send(Ok(()));
            }
            Command::SetMode(mode, reply) => {
                self.set_mode(mode);
                let _ = reply.send(Ok(()));
            }
            Command::Sensor(reading) => self.handle_reading(reading),
            Command::CreateLobby { name, mode, reply } => self.create_lobby(name, mode, reply),
            Command::JoinLobby { code, reply } => self.join_lobby(code, reply),
            Command::LeaveLobby(reply) => {
                self.leave_lobby();
                let _ = reply.send(Ok(()));
            }
            Command::Fire(reply) => {
                let outcome = self.fire();
                let _ = reply.send(Ok(outcome));
            }
        }
    }

    fn start(&mut self) {
        if self.scanning {
            return;
        }
        self.scanning = true;
        self.sensor.start(self.sensor_tx.clone());

        match self.mesh.start() {
            Ok(epoch) => {
                self.mesh_epoch = Some(epoch);
                self.mesh_error = None;
            }
            Err(e) => {
                error!(error = %e, "Mesh transport failed to start");
                self.mesh_error = Some(e.to_string());
            }
        }

        if self.mode == ConnectivityMode::MeshAndBackend {
            self.start_discovery();
            self.connect_backend();
        }
        info!(mode = ?self.mode, "Scanning started");
        self.publish();
    }

    fn stop(&mut self) {
        self.cancel_lobby_request();
        if !self.scanning {
            return;
        }
        self.scanning = false;
        self.sensor.stop();

        self.mesh.stop();
        self.mesh_epoch = None;
        self.mesh_records.clear();
        self.mesh_peers.clear();

        self.disconnect_backend();
        self.discovery.stop();
        self.location_gap_logged = false;

        info!("Scanning stopped");
        self.refresh();
    }

    fn set_mode(&mut self, mode: ConnectivityMode) {
        if mode == self.mode {
            return;
        }
        self.mode = mode;
        info!(mode = ?mode, "Connectivity mode changed");

        match mode {
            ConnectivityMode::MeshAndBackend => {
                self.start_discovery();
                self.connect_backend();
            }
            ConnectivityMode::MeshOnly => {
                self.cancel_lobby_request();
                self.disconnect_backend();
                self.discovery.stop();
            }
        }
        self.refresh();
    }

    fn start_discovery(&mut self) {
        if let Err(e) = self.discovery.start() {
            warn!(error = %e, "Backend discovery unavailable");
        }
        if self.endpoint.is_none() {
            self.endpoint = self.discovery.current();
        }
    }

    /// Backend traffic flows only while scanning in backend mode inside a
    /// backend-issued lobby
    fn wants_backend(&self) -> bool {
        self.scanning
            && self.mode == ConnectivityMode::MeshAndBackend
            && self.lobby.as_ref().is_some_and(|lobby| !lobby.local)
    }

    fn connect_backend(&mut self) {
        if !self.wants_backend() {
            return;
        }
        let (Some(endpoint), Some(lobby)) = (&self.endpoint, &self.lobby) else {
            debug!("No backend endpoint yet, staying mesh-only");
            return;
        };

        let url = endpoint.realtime_url(&lobby.code, self.config.player_id, &self.config.player_name);
        info!(endpoint = %endpoint, lobby = %lobby.code, "Connecting to backend");

        let epoch = self.backend.connect(url);
        self.backend_epoch = Some(epoch);
        self.backend_records.clear();
        self.backend_status = BackendStatus::Connecting;
        self.reconnect_at = None;
    }

    fn disconnect_backend(&mut self) {
        self.backend.disconnect();
        self.backend_epoch = None;
        self.backend_records.clear();
        self.backend_status = BackendStatus::Disconnected;
        self.reconnect_at = None;
        self.backoff.reset();
    }

    fn epoch_of(&self, source: Source) -> Option<u64> {
        match source {
            Source::Mesh => self.mesh_epoch,
            Source::Backend => self.backend_epoch,
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Presence {
                source,
                epoch,
                records,
            } => {
                if self.epoch_of(source) != Some(epoch) {
                    return;
                }
                match source {
                    Source::Mesh => self.mesh_records = records,
                    Source::Backend => self.backend_records = records,
                }
                self.refresh();
            }
            TransportEvent::MeshPeers { epoch, connected } => {
                if self.mesh_epoch != Some(epoch) {
                    return;
                }
                self.mesh_peers = connected;
                self.publish();
            }
            TransportEvent::BackendStatus { epoch, status } => {
                if self.backend_epoch != Some(epoch) {
                    return;
                }
                match &status {
                    BackendStatus::Connected => self.backoff.reset(),
                    BackendStatus::Error { message } if self.wants_backend() => {
                        let delay = self.backoff.next_delay();
                        warn!(error = %message, retry_in_ms = delay.as_millis() as u64, "Backend session failed");
                        self.reconnect_at = Some(Instant::now() + delay);
                    }
                    _ => {}
                }
                self.backend_status = status;
                self.publish();
            }
            TransportEvent::Notice {
                source,
                epoch,
                notice,
            } => {
                if self.epoch_of(source) != Some(epoch) {
                    return;
                }
                if let Some(text) = self.describe(notice) {
                    info!(notice = %text, "Notice");
                    self.notice = Some(text);
                    self.publish();
                }
            }
            TransportEvent::Endpoint(endpoint) => {
                let changed = self.endpoint.as_ref() != Some(&endpoint);
                self.endpoint = Some(endpoint);
                if changed || self.backend_epoch.is_none() {
                    self.connect_backend();
                }
                self.publish();
            }
        }
    }

    fn describe(&self, notice: Notice) -> Option<String> {
        match notice {
            Notice::Hit(hit) if hit.to_id == self.config.player_id => {
                let shooter = self
                    .players
                    .iter()
                    .find(|p| p.id == hit.from_id)
                    .map(|p| p.name.as_str())
                    .unwrap_or("someone");
                Some(format!("Hit by {shooter} at {:.0} m", hit.distance_m))
            }
            Notice::Hit(_) => None,
            Notice::Joined { name } => Some(format!("{name} joined")),
            Notice::Error { message } => Some(message),
        }
    }

    fn handle_reading(&mut self, reading: SensorReading) {
        match reading {
            SensorReading::Location(point) => {
                self.location = Some(point);
                self.refresh();
            }
            SensorReading::LocationLost => {
                self.location = None;
                self.refresh();
            }
            SensorReading::Heading(heading) => {
                self.targeting.update_heading(heading);
                self.publish();
            }
        }
    }

    /// Rebuild the roster and player list from both source views
    fn refresh(&mut self) {
        let roster = merge(&self.backend_records, &self.mesh_records).exclude(&self.config.player_id);
        self.players = derive_players(&roster, self.location.as_ref(), now_utc());
        self.targeting.set_players(&self.players);
        self.publish();
    }

    /// Broadcast tick: refresh for lazy eviction, then advertise presence
    fn broadcast(&mut self) {
        self.refresh();

        let Some(location) = self.location else {
            if !self.location_gap_logged {
                info!("No location fix, presence broadcast paused");
                self.location_gap_logged = true;
            }
            return;
        };
        self.location_gap_logged = false;

        let zone = Zone::of(&location);
        let envelope = Envelope::Presence(PresencePayload {
            player_id: self.config.player_id,
            name: self.config.player_name.clone(),
            lat: location.lat,
            lon: location.lon,
            heading: self.targeting.heading(),
            zone_key: Some(zone.key),
            zone_label: Some(zone.label),
            ts: now_utc(),
        });

        self.mesh.send(&envelope);
        if self.backend_epoch.is_some() {
            self.backend.send(envelope);
        }
    }

    fn fire(&mut self) -> FireOutcome {
        let outcome = self.targeting.fire();
        let now = now_utc();
        let me = self.config.player_id;

        let shot = Envelope::Shot(ShotPayload {
            from_id: me,
            heading: outcome.heading,
            range_m: DEFAULT_SHOT_RANGE_M,
            target_id: outcome.target_id,
            ts: now,
        });
        self.mesh.send(&shot);
        if self.backend_epoch.is_some() {
            self.backend.send(shot);
        }

        if let (Some(to_id), Some(distance_m)) = (outcome.target_id, outcome.distance_m) {
            // No referee on the mesh: the shooter announces its own hits
            self.mesh.send(&Envelope::Hit(HitPayload {
                from_id: me,
                to_id,
                distance_m,
                ts: now,
            }));
        }
        info!(
            hit = outcome.is_hit(),
            target = ?outcome.target_name,
            shots = outcome.stats.shots,
            streak = outcome.stats.streak,
            "Fired"
        );

        self.publish();
        outcome
    }

    fn local_code(&mut self) -> String {
        let suffix: String = (&mut self.rng)
            .sample_iter(&Alphanumeric)
            .take(LOCAL_CODE_LEN)
            .map(|b| char::from(b).to_ascii_uppercase())
            .collect();
        format!("{LOCAL_CODE_PREFIX}{suffix}")
    }

    fn require_endpoint(&mut self) -> Result<BackendEndpoint, OrchestratorError> {
        if let Some(endpoint) = self.endpoint.clone().or_else(|| self.discovery.current()) {
            return Ok(endpoint);
        }
        warn!("Lobby request without a backend endpoint");
        self.backend_status = BackendStatus::error("no backend endpoint");
        self.publish();
        Err(OrchestratorError::NoBackend)
    }

    fn lobby_failed(&mut self, e: LobbyError) -> OrchestratorError {
        warn!(error = %e, "Lobby request failed");
        self.backend_status = BackendStatus::error(e.to_string());
        self.publish();
        OrchestratorError::Lobby(e)
    }

    fn enter_lobby(&mut self, lobby: LobbyState) {
        info!(lobby = %lobby.code, local = lobby.local, "Entered lobby");
        self.disconnect_backend();
        self.lobby = Some(lobby);
        self.connect_backend();
        self.publish();
    }

    /// Run a backend lobby call on its own task; the reply is resolved when
    /// the outcome comes back through the inbox
    fn spawn_lobby_request<F>(&mut self, call: F, reply: Reply<LobbyState>)
    where
        F: std::future::Future<Output = Result<LobbyInfo, LobbyError>> + Send + 'static,
    {
        self.cancel_lobby_request();
        self.next_lobby_request += 1;
        let request = self.next_lobby_request;
        let outcomes = self.lobby_tx.clone();
        let task = tokio::spawn(async move {
            let result = call.await;
            let _ = outcomes.send(LobbyOutcome { request, result }).await;
        });
        self.pending_lobby = Some(PendingLobby { request, task, reply });
    }

    fn cancel_lobby_request(&mut self) {
        if let Some(pending) = self.pending_lobby.take() {
            pending.task.abort();
            let _ = pending.reply.send(Err(OrchestratorError::Cancelled));
            debug!(request = pending.request, "Lobby request cancelled");
        }
    }

    fn finish_lobby_request(&mut self, outcome: LobbyOutcome) {
        if self.pending_lobby.as_ref().map(|p| p.request) != Some(outcome.request) {
            debug!(request = outcome.request, "Dropping superseded lobby outcome");
            return;
        }
        let Some(pending) = self.pending_lobby.take() else {
            return;
        };
        let result = match outcome.result {
            Ok(info) => {
                let lobby = LobbyState {
                    code: info.code,
                    name: info.name,
                    mode: info.mode,
                    local: false,
                };
                self.enter_lobby(lobby.clone());
                Ok(lobby)
            }
            Err(e) => Err(self.lobby_failed(e)),
        };
        let _ = pending.reply.send(result);
    }

    fn create_lobby(&mut self, name: String, mode: String, reply: Reply<LobbyState>) {
        self.cancel_lobby_request();
        match self.mode {
            ConnectivityMode::MeshOnly => {
                let lobby = LobbyState {
                    code: self.local_code(),
                    name,
                    mode,
                    local: true,
                };
                self.enter_lobby(lobby.clone());
                let _ = reply.send(Ok(lobby));
            }
            ConnectivityMode::MeshAndBackend => {
                let endpoint = match self.require_endpoint() {
                    Ok(endpoint) => endpoint,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                let client = self.lobby_client.clone();
                let (player_id, player_name) = (self.config.player_id, self.config.player_name.clone());
                self.spawn_lobby_request(
                    async move {
                        client
                            .create_lobby(&endpoint, &name, &mode, player_id, &player_name)
                            .await
                    },
                    reply,
                );
            }
        }
    }

    fn join_lobby(&mut self, code: String, reply: Reply<LobbyState>) {
        let code = code.trim().to_ascii_uppercase();
        if code.is_empty() {
            let _ = reply.send(Err(OrchestratorError::InvalidLobbyCode));
            return;
        }
        self.cancel_lobby_request();

        match self.mode {
            ConnectivityMode::MeshOnly => {
                let lobby = LobbyState {
                    name: code.clone(),
                    code,
                    mode: String::new(),
                    local: true,
                };
                self.enter_lobby(lobby.clone());
                let _ = reply.send(Ok(lobby));
            }
            ConnectivityMode::MeshAndBackend => {
                let endpoint = match self.require_endpoint() {
                    Ok(endpoint) => endpoint,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                let client = self.lobby_client.clone();
                let (player_id, player_name) = (self.config.player_id, self.config.player_name.clone());
                self.spawn_lobby_request(
                    async move { client.join_lobby(&endpoint, &code, player_id, &player_name).await },
                    reply,
                );
            }
        }
    }

    fn leave_lobby(&mut self) {
        self.cancel_lobby_request();
        let Some(lobby) = self.lobby.take() else {
            return;
        };
        if !lobby.local {
            if let Some(endpoint) = self.endpoint.clone() {
                // Best-effort; the client timeout bounds the task
                let client = self.lobby_client.clone();
                let player_id = self.config.player_id;
                let code = lobby.code.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.leave_lobby(&endpoint, &code, player_id).await {
                        warn!(lobby = %code, error = %e, "Lobby leave failed");
                    }
                });
            }
        }
        self.disconnect_backend();
        info!(lobby = %lobby.code, "Left lobby");
        self.refresh();
    }

    fn view(&self) -> OrchestratorView {
        OrchestratorView {
            player_id: self.config.player_id,
            player_name: self.config.player_name.clone(),
            scanning: self.scanning,
            mode: self.mode,
            lobby: self.lobby.clone(),
            location: self.location,
            zone: self.location.as_ref().map(Zone::of),
            heading: self.targeting.heading(),
            heading_simulated: self.targeting.is_simulating(),
            players: self.players.clone(),
            aim: self.targeting.aim().clone(),
            stats: self.targeting.stats().clone(),
            mesh_peers: self.mesh_peers.clone(),
            mesh_error: self.mesh_error.clone(),
            backend_status: self.backend_status.clone(),
            backend_endpoint: self.endpoint.as_ref().map(ToString::to_string),
            notice: self.notice.clone(),
        }
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.view());
    }
}
