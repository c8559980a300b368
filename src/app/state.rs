//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::orchestrator::OrchestratorHandle;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: OrchestratorHandle,
}

impl AppState {
    pub fn new(config: Config, orchestrator: OrchestratorHandle) -> Self {
        Self {
            config: Arc::new(config),
            orchestrator,
        }
    }
}
