//! Shared application state.

use crate::config::Config;
use std::sync::Arc;
use tabterm_core::{ExecutionService, PtyExecutionService, SessionManager};

/// Shared application state.
pub struct AppState {
    pub session_manager: Arc<SessionManager>,
    pub config: Config,
}

impl AppState {
    /// State backed by local PTYs and the SQLite store from `config`.
    pub fn new(config: Config) -> tabterm_core::Result<Self> {
        let service: Arc<dyn ExecutionService> = Arc::new(PtyExecutionService::new());
        let session_manager = Arc::new(SessionManager::new(config.session_config(), service)?);
        Ok(Self::with_manager(config, session_manager))
    }

    pub fn with_manager(config: Config, session_manager: Arc<SessionManager>) -> Self {
        Self {
            session_manager,
            config,
        }
    }
}
