//! Backend address and the URLs derived from it

use std::fmt;
use std::net::IpAddr;

use url::Url;
use uuid::Uuid;

/// Base `http(s)://host:port` of a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
    base: Url,
}

impl BackendEndpoint {
    /// Parse a base URL; only http and https are accepted, path and query
    /// are discarded
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let mut base = Url::parse(raw).map_err(EndpointError::Parse)?;
        match base.scheme() {
            "http" | "https" => {}
            other => return Err(EndpointError::Scheme(other.to_string())),
        }
        if base.host_str().is_none() {
            return Err(EndpointError::MissingHost);
        }
        base.set_path("/");
        base.set_query(None);
        base.set_fragment(None);
        Ok(Self { base })
    }

    /// Compose from a resolved service address
    pub fn from_host_port(host: IpAddr, port: u16) -> Result<Self, EndpointError> {
        let authority = match host {
            IpAddr::V4(v4) => format!("{}:{}", v4, port),
            IpAddr::V6(v6) => format!("[{}]:{}", v6, port),
        };
        Self::parse(&format!("http://{}", authority))
    }

    /// REST URL under the base, one path segment per element
    pub fn api_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.clear().extend(segments);
        }
        url
    }

    /// Realtime URL: scheme swapped to ws/wss, path `/v1/ws/{code}`,
    /// query `player_id` and `name`
    pub fn realtime_url(&self, lobby_code: &str, player_id: Uuid, name: &str) -> Url {
        let mut url = self.api_url(&["v1", "ws", lobby_code]);
        let scheme = if self.base.scheme() == "https" { "wss" } else { "ws" };
        // http/https -> ws/wss is always a permitted scheme change
        let _ = url.set_scheme(scheme);
        url.query_pairs_mut()
            .clear()
            .append_pair("player_id", &player_id.to_string())
            .append_pair("name", name);
        url
    }
}

impl fmt::Display for BackendEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base.as_str().trim_end_matches('/'))
    }
}

/// Endpoint errors
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Invalid backend URL: {0}")]
    Parse(#[source] url::ParseError),

    #[error("Unsupported backend scheme: {0}")]
    Scheme(String),

    #[error("Backend URL has no host")]
    MissingHost,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn parse_strips_path_and_query() {
        let endpoint = BackendEndpoint::parse("http://10.0.0.5:8000/some/path?x=1#frag").unwrap();
        assert_eq!(endpoint.to_string(), "http://10.0.0.5:8000");
    }

    #[test]
    fn non_http_schemes_are_rejected() {
        assert!(matches!(
            BackendEndpoint::parse("ftp://host"),
            Err(EndpointError::Scheme(_))
        ));
        assert!(BackendEndpoint::parse("not a url").is_err());
    }

    #[test]
    fn realtime_url_swaps_scheme_and_sets_query() {
        let id = Uuid::new_v4();
        let endpoint = BackendEndpoint::parse("http://10.0.0.5:8000/ignored").unwrap();
        let url = endpoint.realtime_url("AB12", id, "Ada Lovelace");

        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/v1/ws/AB12");
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            query,
            vec![
                ("player_id".to_string(), id.to_string()),
                ("name".to_string(), "Ada Lovelace".to_string()),
            ]
        );

        let secure = BackendEndpoint::parse("https://game.example").unwrap();
        assert_eq!(secure.realtime_url("X", id, "a").scheme(), "wss");
    }

    #[test]
    fn api_url_escapes_segments() {
        let endpoint = BackendEndpoint::parse("http://h:1").unwrap();
        let url = endpoint.api_url(&["v1", "lobbies", "A B", "join"]);
        assert_eq!(url.as_str(), "http://h:1/v1/lobbies/A%20B/join");
    }

    #[test]
    fn host_port_composition() {
        let v4 = BackendEndpoint::from_host_port(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), 8000).unwrap();
        assert_eq!(v4.to_string(), "http://192.168.1.20:8000");

        let v6 = BackendEndpoint::from_host_port(IpAddr::V6(Ipv6Addr::LOCALHOST), 8000).unwrap();
        assert_eq!(v6.to_string(), "http://[::1]:8000");
    }
}
