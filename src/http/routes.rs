//! HTTP route definitions

use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::app::AppState;
use crate::geo::GeoPoint;
use crate::orchestrator::{ConnectivityMode, LobbyState, OrchestratorError, OrchestratorView, SensorReading};
use crate::targeting::FireOutcome;
use crate::util::time::uptime_secs;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // Loopback surface for a local UI process
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let control_routes = Router::new()
        .route("/v1/snapshot", get(snapshot_handler))
        .route("/v1/start", post(start_handler))
        .route("/v1/stop", post(stop_handler))
        .route("/v1/mode", post(mode_handler))
        .route("/v1/sensor", post(sensor_handler))
        .route("/v1/lobby", post(create_lobby_handler))
        .route("/v1/lobby/join", post(join_lobby_handler))
        .route("/v1/lobby/leave", post(leave_lobby_handler))
        .route("/v1/fire", post(fire_handler));

    Router::new()
        .route("/health", get(health_handler))
        .merge(control_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    player_id: Uuid,
    scanning: bool,
    players: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let view = state.orchestrator.view();

    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        player_id: view.player_id,
        scanning: view.scanning,
        players: view.players.len(),
    })
}

// ============================================================================
// Lifecycle endpoints
// ============================================================================

async fn snapshot_handler(State(state): State<AppState>) -> Json<OrchestratorView> {
    Json(state.orchestrator.view())
}

async fn start_handler(State(state): State<AppState>) -> Result<Json<OrchestratorView>, AppError> {
    state.orchestrator.start().await?;
    Ok(Json(state.orchestrator.view()))
}

async fn stop_handler(State(state): State<AppState>) -> Result<Json<OrchestratorView>, AppError> {
    state.orchestrator.stop().await?;
    Ok(Json(state.orchestrator.view()))
}

#[derive(Deserialize)]
struct ModeRequest {
    mode: ConnectivityMode,
}

async fn mode_handler(
    State(state): State<AppState>,
    Json(req): Json<ModeRequest>,
) -> Result<Json<OrchestratorView>, AppError> {
    state.orchestrator.set_mode(req.mode).await?;
    Ok(Json(state.orchestrator.view()))
}

// ============================================================================
// Sensor endpoint
// ============================================================================

#[derive(Deserialize)]
struct SensorRequest {
    lat: Option<f64>,
    lon: Option<f64>,
    heading: Option<f64>,
    #[serde(default)]
    location_lost: bool,
}

#[derive(Serialize)]
struct SensorResponse {
    accepted: usize,
}

async fn sensor_handler(
    State(state): State<AppState>,
    Json(req): Json<SensorRequest>,
) -> Result<(StatusCode, Json<SensorResponse>), AppError> {
    let mut readings = Vec::new();
    match (req.lat, req.lon) {
        (Some(lat), Some(lon)) => readings.push(SensorReading::Location(GeoPoint::new(lat, lon))),
        (None, None) if req.location_lost => readings.push(SensorReading::LocationLost),
        (None, None) => {}
        _ => return Err(AppError::BadRequest("lat and lon must be sent together".to_string())),
    }
    if let Some(heading) = req.heading {
        readings.push(SensorReading::Heading(heading));
    }

    let accepted = readings.len();
    for reading in readings {
        state.orchestrator.push_reading(reading).await?;
    }
    Ok((StatusCode::ACCEPTED, Json(SensorResponse { accepted })))
}

// ============================================================================
// Lobby endpoints
// ============================================================================

#[derive(Deserialize)]
struct CreateLobbyRequest {
    name: String,
    #[serde(default = "default_game_mode")]
    mode: String,
}

fn default_game_mode() -> String {
    "tag".to_string()
}

async fn create_lobby_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateLobbyRequest>,
) -> Result<Json<LobbyState>, AppError> {
    let lobby = state.orchestrator.create_lobby(req.name, req.mode).await?;
    Ok(Json(lobby))
}

#[derive(Deserialize)]
struct JoinLobbyRequest {
    code: String,
}

async fn join_lobby_handler(
    State(state): State<AppState>,
    Json(req): Json<JoinLobbyRequest>,
) -> Result<Json<LobbyState>, AppError> {
    let lobby = state.orchestrator.join_lobby(req.code).await?;
    Ok(Json(lobby))
}

async fn leave_lobby_handler(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    state.orchestrator.leave_lobby().await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Targeting endpoint
// ============================================================================

async fn fire_handler(State(state): State<AppState>) -> Result<Json<FireOutcome>, AppError> {
    let outcome = state.orchestrator.fire().await?;
    Ok(Json(outcome))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<OrchestratorError> for AppError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::InvalidLobbyCode => AppError::BadRequest(e.to_string()),
            OrchestratorError::NoBackend | OrchestratorError::Cancelled => AppError::Unavailable(e.to_string()),
            OrchestratorError::Lobby(_) => AppError::Upstream(e.to_string()),
            OrchestratorError::Closed => AppError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::discovery::DiscoveryConfig;
    use crate::orchestrator::{Orchestrator, OrchestratorConfig, StaticSensor};
    use crate::transport::link::testing::ChannelLink;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        state: AppState,
        _dir: tempfile::TempDir,
    }

    fn app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_lookup(|_| None).unwrap();
        let orchestrator_config = OrchestratorConfig {
            player_id: Uuid::new_v4(),
            player_name: config.player_name.clone(),
            mode: config.mode,
            mesh_secret: config.mesh_secret.clone(),
            discovery: DiscoveryConfig {
                cache_path: dir.path().join("backend.json"),
                seed: None,
                mdns_enabled: false,
            },
            seed: 1,
        };
        let (orchestrator, handle) = Orchestrator::new(
            orchestrator_config,
            Arc::new(ChannelLink::default()),
            Arc::new(StaticSensor::none()),
        );
        tokio::spawn(orchestrator.run());

        let state = AppState::new(config, handle);
        TestApp {
            router: build_router(state.clone()),
            state,
            _dir: dir,
        }
    }

    async fn call(app: &TestApp, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        // Extractor rejections come back as plain text
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["scanning"], false);
    }

    #[tokio::test]
    async fn start_stop_and_mode_round_trip() {
        let app = app();

        let (status, body) = call(&app, Method::POST, "/v1/start", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scanning"], true);

        let (status, body) = call(&app, Method::POST, "/v1/mode", Some(json!({"mode": "mesh_and_backend"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "mesh_and_backend");

        let (_, body) = call(&app, Method::POST, "/v1/stop", None).await;
        assert_eq!(body["scanning"], false);

        let (status, body) = call(&app, Method::POST, "/v1/mode", Some(json!({"mode": "smoke_signals"}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body.as_str().is_some_and(|text| text.contains("smoke_signals")));
    }

    #[tokio::test]
    async fn mesh_only_lobby_flow() {
        let app = app();

        let (status, body) = call(&app, Method::POST, "/v1/lobby", Some(json!({"name": "Park"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["code"].as_str().unwrap().starts_with("LOCAL-"));
        assert_eq!(body["local"], true);

        let (status, body) = call(&app, Method::POST, "/v1/lobby/join", Some(json!({"code": ""}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = call(&app, Method::POST, "/v1/lobby/leave", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, snapshot) = call(&app, Method::GET, "/v1/snapshot", None).await;
        assert!(snapshot["lobby"].is_null());
    }

    #[tokio::test]
    async fn backend_lobby_without_endpoint_is_unavailable() {
        let app = app();
        call(&app, Method::POST, "/v1/mode", Some(json!({"mode": "mesh_and_backend"}))).await;

        let (status, _) = call(&app, Method::POST, "/v1/lobby", Some(json!({"name": "Park"}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn sensor_readings_are_validated_and_applied() {
        let app = app();

        let (status, _) = call(&app, Method::POST, "/v1/sensor", Some(json!({"lat": 1.0}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/sensor",
            Some(json!({"lat": 37.7749, "lon": -122.4194, "heading": 45.0})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], 2);

        let view = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let view = app.state.orchestrator.view();
                if view.location.is_some() && !view.heading_simulated {
                    return view;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(view.heading, 45.0);
        assert_eq!(view.zone.map(|z| z.key), Some("37775:-122419".to_string()));
    }

    #[tokio::test]
    async fn fire_returns_outcome() {
        let app = app();
        let (status, body) = call(&app, Method::POST, "/v1/fire", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stats"]["shots"], 1);
        assert!(body["target_id"].is_null());
    }
}
