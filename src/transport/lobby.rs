//! Backend lobby API client
//!
//! Lobbies are owned by the backend; the core only creates, joins and
//! leaves them and keeps the returned code and mode.

use std::time::Duration;

use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::discovery::BackendEndpoint;

/// Upper bound on a whole lobby call, connect through body
pub const LOBBY_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Lobby as returned by create/join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbyInfo {
    pub lobby_id: Uuid,
    pub code: String,
    pub name: String,
    pub mode: String,
}

#[derive(Debug, Serialize)]
struct CreateLobbyRequest<'a> {
    name: &'a str,
    mode: &'a str,
    host_id: Uuid,
    host_name: &'a str,
}

#[derive(Debug, Serialize)]
struct JoinLobbyRequest<'a> {
    player_id: Uuid,
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct LeaveLobbyRequest {
    player_id: Uuid,
}

/// HTTP client for `/v1/lobbies`
#[derive(Clone)]
pub struct LobbyClient {
    client: Client,
    timeout: Duration,
}

impl LobbyClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            timeout: LOBBY_REQUEST_TIMEOUT,
        }
    }

    async fn post<T: Serialize, R: DeserializeOwned>(&self, url: Url, body: &T) -> Result<R, LobbyError> {
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(LobbyError::Request)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LobbyError::Api { status: status.as_u16(), body });
        }

        response.json().await.map_err(LobbyError::Parse)
    }

    /// Create a lobby hosted by the local player
    pub async fn create_lobby(
        &self,
        endpoint: &BackendEndpoint,
        name: &str,
        mode: &str,
        host_id: Uuid,
        host_name: &str,
    ) -> Result<LobbyInfo, LobbyError> {
        let url = endpoint.api_url(&["v1", "lobbies"]);
        let body = CreateLobbyRequest {
            name,
            mode,
            host_id,
            host_name,
        };
        self.post(url, &body).await
    }

    /// Join an existing lobby by code
    pub async fn join_lobby(
        &self,
        endpoint: &BackendEndpoint,
        code: &str,
        player_id: Uuid,
        name: &str,
    ) -> Result<LobbyInfo, LobbyError> {
        let url = endpoint.api_url(&["v1", "lobbies", code, "join"]);
        self.post(url, &JoinLobbyRequest { player_id, name }).await
    }

    /// Leave a lobby; the response body is not inspected
    pub async fn leave_lobby(
        &self,
        endpoint: &BackendEndpoint,
        code: &str,
        player_id: Uuid,
    ) -> Result<(), LobbyError> {
        let url = endpoint.api_url(&["v1", "lobbies", code, "leave"]);
        let _: serde_json::Value = self.post(url, &LeaveLobbyRequest { player_id }).await?;
        Ok(())
    }
}

impl Default for LobbyClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Lobby API errors
#[derive(Debug, thiserror::Error)]
pub enum LobbyError {
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse response: {0}")]
    Parse(#[source] reqwest::Error),
}
