//! Last-known backend address, persisted across restarts

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::endpoint::BackendEndpoint;

#[derive(Debug, Serialize, Deserialize)]
struct CachedEndpoint {
    base_url: String,
}

/// JSON file holding the last resolved endpoint
#[derive(Debug, Clone)]
pub struct EndpointCache {
    path: PathBuf,
}

impl EndpointCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cached endpoint; a missing or corrupt file yields `None`
    pub fn load(&self) -> Option<BackendEndpoint> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "No cached backend endpoint");
                return None;
            }
        };
        let cached: CachedEndpoint = match serde_json::from_str(&text) {
            Ok(cached) => cached,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring corrupt endpoint cache");
                return None;
            }
        };
        BackendEndpoint::parse(&cached.base_url).ok()
    }

    pub fn store(&self, endpoint: &BackendEndpoint) -> Result<(), CacheError> {
        let cached = CachedEndpoint {
            base_url: endpoint.to_string(),
        };
        let text = serde_json::to_string_pretty(&cached).map_err(CacheError::Encode)?;
        fs::write(&self.path, text).map_err(CacheError::Io)
    }
}

/// Cache errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Failed to write endpoint cache: {0}")]
    Io(#[source] std::io::Error),

    #[error("Failed to encode endpoint cache: {0}")]
    Encode(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EndpointCache::new(dir.path().join("backend.json"));
        assert_eq!(cache.load(), None);

        let endpoint = BackendEndpoint::parse("http://10.1.1.1:8000").unwrap();
        cache.store(&endpoint).unwrap();
        assert_eq!(cache.load(), Some(endpoint));
    }

    #[test]
    fn corrupt_cache_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(EndpointCache::new(path).load(), None);
    }
}
