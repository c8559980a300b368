//! Connectivity orchestrator
//!
//! One actor task owns every piece of mutable client state: connectivity
//! mode, lobby, local location, both presence source views, and the
//! targeting engine. Transports, discovery and sensors feed it through
//! channels; callers talk to it through an `OrchestratorHandle` and read
//! the published `OrchestratorView` from a watch channel.

mod actor;
pub mod sensors;

pub use actor::Orchestrator;
pub use sensors::{SensorPort, SensorReading, StaticSensor};

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::discovery::DiscoveryConfig;
use crate::geo::{GeoPoint, Zone};
use crate::presence::Player;
use crate::targeting::{AimAssistState, FireOutcome, FireStats};
use crate::transport::{BackendStatus, LobbyError};

/// Which transports are enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityMode {
    MeshOnly,
    MeshAndBackend,
}

impl FromStr for ConnectivityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mesh_only" | "mesh" => Ok(ConnectivityMode::MeshOnly),
            "mesh_and_backend" | "backend" => Ok(ConnectivityMode::MeshAndBackend),
            other => Err(format!("unknown connectivity mode: {other}")),
        }
    }
}

/// Lobby the local player is in
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LobbyState {
    pub code: String,
    pub name: String,
    pub mode: String,
    /// Assigned locally in mesh-only mode; the backend never saw it
    pub local: bool,
}

/// Static inputs for the actor
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub player_id: Uuid,
    pub player_name: String,
    pub mode: ConnectivityMode,
    pub mesh_secret: String,
    pub discovery: DiscoveryConfig,
    /// Seed for heading simulation and local lobby codes
    pub seed: u64,
}

/// Snapshot published after every state change
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorView {
    pub player_id: Uuid,
    pub player_name: String,
    pub scanning: bool,
    pub mode: ConnectivityMode,
    pub lobby: Option<LobbyState>,
    pub location: Option<GeoPoint>,
    pub zone: Option<Zone>,
    pub heading: f64,
    pub heading_simulated: bool,
    pub players: Vec<Player>,
    pub aim: AimAssistState,
    pub stats: FireStats,
    pub mesh_peers: Vec<String>,
    pub mesh_error: Option<String>,
    pub backend_status: BackendStatus,
    pub backend_endpoint: Option<String>,
    /// Transient user-facing message (hits, joins, errors)
    pub notice: Option<String>,
}

impl OrchestratorView {
    fn initial(config: &OrchestratorConfig) -> Self {
        Self {
            player_id: config.player_id,
            player_name: config.player_name.clone(),
            scanning: false,
            mode: config.mode,
            lobby: None,
            location: None,
            zone: None,
            heading: 0.0,
            heading_simulated: true,
            players: Vec::new(),
            aim: AimAssistState::none(),
            stats: FireStats::default(),
            mesh_peers: Vec::new(),
            mesh_error: None,
            backend_status: BackendStatus::Disconnected,
            backend_endpoint: None,
            notice: None,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, OrchestratorError>>;

/// Requests handled by the actor
pub(crate) enum Command {
    Start(Reply<()>),
    Stop(Reply<()>),
    SetMode(ConnectivityMode, Reply<()>),
    Sensor(SensorReading),
    CreateLobby {
        name: String,
        mode: String,
        reply: Reply<LobbyState>,
    },
    JoinLobby {
        code: String,
        reply: Reply<LobbyState>,
    },
    LeaveLobby(Reply<()>),
    Fire(Reply<FireOutcome>),
}

/// Cloneable front door to the actor
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<OrchestratorView>,
}

impl OrchestratorHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| OrchestratorError::Closed)?;
        rx.await.map_err(|_| OrchestratorError::Closed)?
    }

    /// Begin scanning: sensors, mesh, discovery (backend mode), broadcasts
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        self.request(Command::Start).await
    }

    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        self.request(Command::Stop).await
    }

    pub async fn set_mode(&self, mode: ConnectivityMode) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::SetMode(mode, reply)).await
    }

    /// Push a sensor reading (same path as the sensor port)
    pub async fn push_reading(&self, reading: SensorReading) -> Result<(), OrchestratorError> {
        self.commands
            .send(Command::Sensor(reading))
            .await
            .map_err(|_| OrchestratorError::Closed)
    }

    pub async fn create_lobby(&self, name: String, mode: String) -> Result<LobbyState, OrchestratorError> {
        self.request(|reply| Command::CreateLobby { name, mode, reply }).await
    }

    pub async fn join_lobby(&self, code: String) -> Result<LobbyState, OrchestratorError> {
        self.request(|reply| Command::JoinLobby { code, reply }).await
    }

    pub async fn leave_lobby(&self) -> Result<(), OrchestratorError> {
        self.request(Command::LeaveLobby).await
    }

    pub async fn fire(&self) -> Result<FireOutcome, OrchestratorError> {
        self.request(Command::Fire).await
    }

    /// Latest published snapshot
    pub fn view(&self) -> OrchestratorView {
        self.view.borrow().clone()
    }
}

/// Orchestrator errors
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("No backend endpoint known yet")]
    NoBackend,

    #[error("Lobby request failed: {0}")]
    Lobby(#[from] LobbyError),

    #[error("Invalid lobby code")]
    InvalidLobbyCode,

    #[error("Lobby request cancelled")]
    Cancelled,

    #[error("Orchestrator is not running")]
    Closed,
}
