//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use localfarm_relay::{CompletionProvider, RelayEngine};

use crate::config::Config;
use crate::db::sqlite::SqliteStore;
use crate::middleware::auth::IdentityResolver;

/// State shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Append-only chat history.
    pub store: Arc<SqliteStore>,
    /// Relays chat completions; shares `store` and the provider handle.
    pub engine: RelayEngine<SqliteStore>,
    /// Maps request credentials to a user.
    pub identity: Arc<dyn IdentityResolver>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: SqliteStore,
        provider: Arc<dyn CompletionProvider>,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        let store = Arc::new(store);
        let engine = RelayEngine::new(Arc::clone(&store), provider, config.relay_options());
        Self {
            config: Arc::new(config),
            store,
            engine,
            identity,
        }
    }

    pub fn provider(&self) -> &dyn CompletionProvider {
        self.engine.provider().as_ref()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
