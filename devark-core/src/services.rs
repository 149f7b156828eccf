//! Service container
//!
//! One struct owns every core service, constructed once at activation and
//! passed by reference. Tests build the same container over in-memory
//! stores and scripted providers instead of reaching for globals.

use crate::bus::handlers::{
    AnalysisHandler, AuthHandler, HistoryHandler, ProviderHandler, SavedPromptHandler,
    SyncHandler,
};
use crate::bus::MessageBus;
use crate::config::ConfigStore;
use crate::error::{Error, Result};
use crate::scoring::{ProviderRegistry, ScoringPipeline};
use crate::sessions::SessionAggregator;
use crate::store::history::PromptHistoryStore;
use crate::store::saved::SavedPromptStore;
use crate::store::token::TokenStore;
use crate::store::{FileKeyValueStore, KeyValueStore};
use crate::sync::{HttpSyncBackend, SyncEngine};
use std::sync::Arc;

/// Everything the core needs, wired together.
pub struct Services {
    pub config: ConfigStore,
    pub tokens: Arc<TokenStore>,
    pub providers: Arc<ProviderRegistry>,
    pub scoring: Arc<ScoringPipeline>,
    pub history: Arc<PromptHistoryStore>,
    pub saved: Arc<SavedPromptStore>,
    pub sessions: Arc<SessionAggregator>,
}

impl Services {
    /// Build over explicit stores and session sources (tests inject fakes
    /// here).
    pub fn build(
        config: ConfigStore,
        kv: Arc<dyn KeyValueStore>,
        sessions: SessionAggregator,
    ) -> Result<Self> {
        let tokens = Arc::new(TokenStore::new(config.clone()));
        let providers = Arc::new(ProviderRegistry::from_config(config.clone(), &tokens)?);

        let history = Arc::new(PromptHistoryStore::new(kv.clone()));
        history.initialize()?;
        let saved = Arc::new(SavedPromptStore::new(kv));
        saved.initialize()?;

        Ok(Self {
            config,
            tokens,
            providers,
            scoring: Arc::new(ScoringPipeline::new()),
            history,
            saved,
            sessions: Arc::new(sessions),
        })
    }

    /// Build over the on-disk stores and the locally installed tools.
    pub fn open_default() -> Result<Self> {
        let config = ConfigStore::open_default()?;
        let kv = Arc::new(FileKeyValueStore::open_default()?);
        Self::build(config, kv, SessionAggregator::open_default())
    }

    /// A sync engine over the configured backend; requires a stored token.
    pub fn sync_engine(&self) -> Result<SyncEngine> {
        let config = self.config.get();
        let api_url = config
            .api_url
            .ok_or_else(|| Error::Config("apiUrl is not configured".to_string()))?;
        let token = self
            .tokens
            .get_token()
            .ok_or_else(|| Error::Auth("no token stored".to_string()))?;
        Ok(SyncEngine::new(Box::new(HttpSyncBackend::new(
            &api_url, &token,
        )?)))
    }

    /// Register the core handlers on a bus. The caller adds its own chrome
    /// handlers, then calls `set_initialized` to drain the queue.
    pub fn register_handlers(&self, bus: &mut MessageBus) {
        bus.register_handler(Box::new(ProviderHandler::new(self.providers.clone())));
        bus.register_handler(Box::new(HistoryHandler::new(self.history.clone())));
        bus.register_handler(Box::new(SavedPromptHandler::new(self.saved.clone())));
        bus.register_handler(Box::new(AuthHandler::new(self.tokens.clone())));
        bus.register_handler(Box::new(AnalysisHandler::new(
            self.providers.clone(),
            self.scoring.clone(),
            self.history.clone(),
        )));
        if let Ok(engine) = self.sync_engine() {
            bus.register_handler(Box::new(SyncHandler::new(
                Arc::new(engine),
                self.sessions.clone(),
            )));
        }
    }
}
