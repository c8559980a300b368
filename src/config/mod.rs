//! Configuration module - environment variable parsing

use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use crate::discovery::BackendEndpoint;
use crate::geo::GeoPoint;
use crate::orchestrator::ConnectivityMode;

/// Client configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Local display name
    pub player_name: String,
    /// Connectivity mode at launch
    pub mode: ConnectivityMode,
    /// Lobby to join once started
    pub lobby_code: Option<String>,

    /// UDP/TCP port of the LAN mesh
    pub mesh_port: u16,
    /// Datagram broadcast target
    pub mesh_broadcast: Ipv4Addr,
    /// Shared key for mesh frame authentication
    pub mesh_secret: String,

    /// Explicit backend base URL; seeds discovery
    pub backend_url: Option<BackendEndpoint>,
    /// Where the last resolved backend address is kept
    pub discovery_cache_path: PathBuf,
    /// Browse mDNS for the backend
    pub mdns_enabled: bool,

    /// Local control/status API binding address
    pub api_addr: SocketAddr,

    /// Fixed sensor feed (no platform sensors on this host)
    pub static_location: Option<GeoPoint>,
    pub static_heading: Option<f64>,

    /// Start scanning at launch
    pub auto_start: bool,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let static_location = match (
            parse_opt(&var, "STATIC_LAT")?,
            parse_opt(&var, "STATIC_LON")?,
        ) {
            (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("STATIC_LON")),
            (None, Some(_)) => return Err(ConfigError::Missing("STATIC_LAT")),
        };

        let backend_url = match var("BACKEND_URL") {
            Some(raw) => Some(BackendEndpoint::parse(&raw).map_err(|_| ConfigError::Invalid("BACKEND_URL"))?),
            None => None,
        };

        Ok(Self {
            player_name: var("PLAYER_NAME").unwrap_or_else(|| "Player".to_string()),
            mode: parse_or(&var, "CONNECTIVITY_MODE", ConnectivityMode::MeshOnly)?,
            lobby_code: var("LOBBY_CODE"),

            mesh_port: parse_or(&var, "MESH_PORT", 47800)?,
            mesh_broadcast: parse_or(&var, "MESH_BROADCAST_ADDR", Ipv4Addr::BROADCAST)?,
            mesh_secret: var("MESH_SECRET").unwrap_or_else(|| "guttertheory-mesh".to_string()),

            backend_url,
            discovery_cache_path: var("DISCOVERY_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".guttertheory-backend.json")),
            mdns_enabled: parse_or(&var, "MDNS_ENABLED", true)?,

            api_addr: parse_or(&var, "API_ADDR", SocketAddr::from(([127, 0, 0, 1], 8787)))?,

            static_location,
            static_heading: parse_opt(&var, "STATIC_HEADING")?,

            auto_start: parse_or(&var, "AUTO_START", true)?,
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn parse_opt<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError> {
    var(key)
        .map(|raw| raw.trim().parse().map_err(|_| ConfigError::Invalid(key)))
        .transpose()
}

fn parse_or<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError> {
    Ok(parse_opt(var, key)?.unwrap_or(default))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.player_name, "Player");
        assert_eq!(config.mode, ConnectivityMode::MeshOnly);
        assert_eq!(config.mesh_port, 47800);
        assert_eq!(config.mesh_broadcast, Ipv4Addr::BROADCAST);
        assert_eq!(config.api_addr, SocketAddr::from(([127, 0, 0, 1], 8787)));
        assert!(config.auto_start);
        assert!(config.mdns_enabled);
        assert!(config.backend_url.is_none());
        assert!(config.static_location.is_none());
    }

    #[test]
    fn values_are_parsed() {
        let config = load(&[
            ("CONNECTIVITY_MODE", "mesh_and_backend"),
            ("MESH_PORT", "5000"),
            ("BACKEND_URL", "http://10.0.0.4:8000/"),
            ("STATIC_LAT", "37.5"),
            ("STATIC_LON", "-122.25"),
            ("STATIC_HEADING", "90"),
            ("AUTO_START", "false"),
            ("LOBBY_CODE", "AB12"),
        ])
        .unwrap();
        assert_eq!(config.mode, ConnectivityMode::MeshAndBackend);
        assert_eq!(config.mesh_port, 5000);
        assert_eq!(config.backend_url.unwrap().to_string(), "http://10.0.0.4:8000");
        assert_eq!(config.static_location, Some(GeoPoint::new(37.5, -122.25)));
        assert_eq!(config.static_heading, Some(90.0));
        assert!(!config.auto_start);
        assert_eq!(config.lobby_code.as_deref(), Some("AB12"));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        assert!(matches!(load(&[("MESH_PORT", "lots")]), Err(ConfigError::Invalid("MESH_PORT"))));
        assert!(matches!(
            load(&[("CONNECTIVITY_MODE", "carrier-pigeon")]),
            Err(ConfigError::Invalid("CONNECTIVITY_MODE"))
        ));
        assert!(matches!(load(&[("BACKEND_URL", "ftp://x")]), Err(ConfigError::Invalid("BACKEND_URL"))));
        assert!(matches!(load(&[("STATIC_LAT", "1.0")]), Err(ConfigError::Missing("STATIC_LON"))));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = load(&[("LOBBY_CODE", "  "), ("PLAYER_NAME", "")]).unwrap();
        assert!(config.lobby_code.is_none());
        assert_eq!(config.player_name, "Player");
    }
}
