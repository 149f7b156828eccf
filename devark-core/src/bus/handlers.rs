//! Core message handlers
//!
//! Bindings from protocol messages to the underlying services. A UI shell
//! registers these on its bus and adds its own chrome handlers on top.

use crate::bus::{Message, MessageHandler, MessageType};
use crate::error::{Error, Result};
use crate::scoring::{ProviderRegistry, ScoringPipeline};
use crate::sessions::{SessionAggregator, SessionFilter};
use crate::store::history::PromptHistoryStore;
use crate::store::saved::SavedPromptStore;
use crate::store::token::TokenStore;
use crate::sync::{SyncEngine, SyncOptions};
use crate::types::{PromptDetectedEvent, SessionSource};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn data_str<'a>(message: &'a Message, key: &str) -> Result<&'a str> {
    message
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidInput(format!("missing `{}` field", key)))
}

// ============================================
// Providers
// ============================================

pub struct ProviderHandler {
    registry: Arc<ProviderRegistry>,
}

impl ProviderHandler {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }
}

const PROVIDER_TYPES: &[MessageType] = &[
    MessageType::GetProviders,
    MessageType::GetActiveProvider,
    MessageType::SetActiveProvider,
    MessageType::GetProviderModels,
    MessageType::DetectProviders,
];

impl MessageHandler for ProviderHandler {
    fn owned_types(&self) -> &[MessageType] {
        PROVIDER_TYPES
    }

    fn handle(&mut self, message: &Message) -> Result<Option<Message>> {
        match message.message_type {
            MessageType::GetProviders | MessageType::DetectProviders => {
                let statuses: Vec<Value> = self
                    .registry
                    .detect_all()
                    .into_iter()
                    .map(|(id, status)| {
                        json!({
                            "id": id,
                            "available": status.available,
                            "reason": status.reason,
                        })
                    })
                    .collect();
                Ok(Some(Message::with_data(
                    message.message_type,
                    json!({ "providers": statuses }),
                )))
            }
            MessageType::GetActiveProvider => {
                let id = self.registry.active().map(|p| p.id().to_string()).ok();
                Ok(Some(Message::with_data(
                    MessageType::GetActiveProvider,
                    json!({ "id": id }),
                )))
            }
            MessageType::SetActiveProvider => {
                let id = data_str(message, "id")?;
                self.registry.set_active(id)?;
                Ok(Some(Message::with_data(
                    MessageType::SetActiveProvider,
                    json!({ "id": id }),
                )))
            }
            MessageType::GetProviderModels => {
                let id = data_str(message, "id")?;
                let provider = self
                    .registry
                    .get(id)
                    .ok_or_else(|| Error::InvalidInput(format!("unknown provider: {}", id)))?;
                let models = provider.list_models()?;
                Ok(Some(Message::with_data(
                    MessageType::GetProviderModels,
                    json!({ "id": id, "models": models }),
                )))
            }
            _ => Ok(None),
        }
    }
}

// ============================================
// History
// ============================================

pub struct HistoryHandler {
    history: Arc<PromptHistoryStore>,
}

impl HistoryHandler {
    pub fn new(history: Arc<PromptHistoryStore>) -> Self {
        Self { history }
    }
}

const HISTORY_TYPES: &[MessageType] = &[
    MessageType::GetHistory,
    MessageType::ClearHistory,
    MessageType::GetDailyStats,
];

impl MessageHandler for HistoryHandler {
    fn owned_types(&self) -> &[MessageType] {
        HISTORY_TYPES
    }

    fn handle(&mut self, message: &Message) -> Result<Option<Message>> {
        match message.message_type {
            MessageType::GetHistory => Ok(Some(Message::with_data(
                MessageType::GetHistory,
                json!({ "prompts": self.history.history() }),
            ))),
            MessageType::ClearHistory => {
                self.history.clear()?;
                Ok(Some(Message::with_data(
                    MessageType::ClearHistory,
                    json!({ "cleared": true }),
                )))
            }
            MessageType::GetDailyStats => Ok(Some(Message::with_data(
                MessageType::GetDailyStats,
                serde_json::to_value(self.history.daily_stats())?,
            ))),
            _ => Ok(None),
        }
    }
}

// ============================================
// Saved prompts
// ============================================

pub struct SavedPromptHandler {
    saved: Arc<SavedPromptStore>,
}

impl SavedPromptHandler {
    pub fn new(saved: Arc<SavedPromptStore>) -> Self {
        Self { saved }
    }
}

const SAVED_TYPES: &[MessageType] = &[
    MessageType::GetSavedPrompts,
    MessageType::SavePrompt,
    MessageType::DeleteSavedPrompt,
    MessageType::SearchSavedPrompts,
    MessageType::GetTags,
    MessageType::GetFolders,
];

impl MessageHandler for SavedPromptHandler {
    fn owned_types(&self) -> &[MessageType] {
        SAVED_TYPES
    }

    fn handle(&mut self, message: &Message) -> Result<Option<Message>> {
        match message.message_type {
            MessageType::GetSavedPrompts => {
                let project_id = message
                    .data
                    .as_ref()
                    .and_then(|d| d.get("projectId"))
                    .and_then(Value::as_str);
                Ok(Some(Message::with_data(
                    MessageType::GetSavedPrompts,
                    json!({ "prompts": self.saved.list(project_id) }),
                )))
            }
            MessageType::SavePrompt => {
                let text = data_str(message, "text")?;
                let tags = message
                    .data
                    .as_ref()
                    .and_then(|d| d.get("tags"))
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let folder = message
                    .data
                    .as_ref()
                    .and_then(|d| d.get("folder"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let project_id = message
                    .data
                    .as_ref()
                    .and_then(|d| d.get("projectId"))
                    .and_then(Value::as_str)
                    .map(str::to_string);

                let outcome = self.saved.save(text, tags, folder, project_id)?;
                Ok(Some(Message::with_data(
                    MessageType::SavePrompt,
                    json!({ "prompt": outcome.prompt, "nearCap": outcome.near_cap }),
                )))
            }
            MessageType::DeleteSavedPrompt => {
                let id = data_str(message, "id")?;
                let removed = self.saved.delete(id)?;
                Ok(Some(Message::with_data(
                    MessageType::DeleteSavedPrompt,
                    json!({ "removed": removed }),
                )))
            }
            MessageType::SearchSavedPrompts => {
                let query = data_str(message, "query")?;
                Ok(Some(Message::with_data(
                    MessageType::SearchSavedPrompts,
                    json!({ "prompts": self.saved.search(query) }),
                )))
            }
            MessageType::GetTags => Ok(Some(Message::with_data(
                MessageType::GetTags,
                json!({ "tags": self.saved.tags() }),
            ))),
            MessageType::GetFolders => Ok(Some(Message::with_data(
                MessageType::GetFolders,
                json!({ "folders": self.saved.folders() }),
            ))),
            _ => Ok(None),
        }
    }
}

// ============================================
// Auth
// ============================================

pub struct AuthHandler {
    tokens: Arc<TokenStore>,
}

impl AuthHandler {
    pub fn new(tokens: Arc<TokenStore>) -> Self {
        Self { tokens }
    }
}

const AUTH_TYPES: &[MessageType] = &[
    MessageType::StoreToken,
    MessageType::ClearToken,
    MessageType::HasToken,
    MessageType::GetAuthStatus,
];

impl MessageHandler for AuthHandler {
    fn owned_types(&self) -> &[MessageType] {
        AUTH_TYPES
    }

    fn handle(&mut self, message: &Message) -> Result<Option<Message>> {
        match message.message_type {
            MessageType::StoreToken => {
                let token = data_str(message, "token")?;
                self.tokens.store_token(token)?;
                Ok(Some(Message::with_data(
                    MessageType::StoreToken,
                    json!({ "stored": true }),
                )))
            }
            MessageType::ClearToken => {
                self.tokens.clear_token()?;
                Ok(Some(Message::with_data(
                    MessageType::ClearToken,
                    json!({ "cleared": true }),
                )))
            }
            MessageType::HasToken | MessageType::GetAuthStatus => Ok(Some(Message::with_data(
                message.message_type,
                json!({ "authenticated": self.tokens.has_token() }),
            ))),
            _ => Ok(None),
        }
    }
}

// ============================================
// Analysis
// ============================================

/// Scores prompts on request from the UI.
///
/// Cancellation is cooperative: `cancelLoading` raises a flag that is
/// honored before the provider call starts (a call already on the wire
/// runs to completion). Scoring failures become an `analysisFailed`
/// event, never an unscored history entry.
pub struct AnalysisHandler {
    registry: Arc<ProviderRegistry>,
    pipeline: Arc<ScoringPipeline>,
    history: Arc<PromptHistoryStore>,
    cancel: Arc<AtomicBool>,
}

impl AnalysisHandler {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        pipeline: Arc<ScoringPipeline>,
        history: Arc<PromptHistoryStore>,
    ) -> Self {
        Self {
            registry,
            pipeline,
            history,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The abort flag surfaced through `cancelLoading`.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }
}

const ANALYSIS_TYPES: &[MessageType] = &[MessageType::AnalyzePrompt, MessageType::CancelLoading];

impl MessageHandler for AnalysisHandler {
    fn owned_types(&self) -> &[MessageType] {
        ANALYSIS_TYPES
    }

    fn handle(&mut self, message: &Message) -> Result<Option<Message>> {
        match message.message_type {
            MessageType::CancelLoading => {
                self.cancel.store(true, Ordering::SeqCst);
                Ok(Some(Message::with_data(
                    MessageType::CancelLoading,
                    json!({ "cancelled": true }),
                )))
            }
            MessageType::AnalyzePrompt => {
                if self.cancel.swap(false, Ordering::SeqCst) {
                    return Ok(Some(Message::with_data(
                        MessageType::AnalyzePrompt,
                        json!({ "cancelled": true }),
                    )));
                }

                let text = data_str(message, "text")?;
                let source = message
                    .data
                    .as_ref()
                    .and_then(|d| d.get("source"))
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<SessionSource>().ok())
                    .unwrap_or(SessionSource::Claude);
                let session_id = message
                    .data
                    .as_ref()
                    .and_then(|d| d.get("sessionId"))
                    .and_then(Value::as_str)
                    .unwrap_or("manual")
                    .to_string();

                let event = PromptDetectedEvent {
                    source,
                    session_id,
                    text: text.to_string(),
                    timestamp: Utc::now(),
                    context: None,
                    skip_reason: None,
                };

                let provider = self.registry.active()?;
                match self.pipeline.analyze(provider, &event) {
                    Ok(Some(analyzed)) => {
                        self.history.add_prompt(analyzed.clone())?;
                        Ok(Some(Message::with_data(
                            MessageType::AnalyzePrompt,
                            json!({ "prompt": analyzed }),
                        )))
                    }
                    Ok(None) => Ok(Some(Message::with_data(
                        MessageType::AnalyzePrompt,
                        json!({ "skipped": true }),
                    ))),
                    Err(e) => Ok(Some(Message::with_data(
                        MessageType::AnalysisFailed,
                        json!({ "message": e.to_string() }),
                    ))),
                }
            }
            _ => Ok(None),
        }
    }
}

// ============================================
// Cloud sync
// ============================================

pub struct SyncHandler {
    engine: Arc<SyncEngine>,
    aggregator: Arc<SessionAggregator>,
    cancel: Arc<AtomicBool>,
}

impl SyncHandler {
    pub fn new(engine: Arc<SyncEngine>, aggregator: Arc<SessionAggregator>) -> Self {
        Self {
            engine,
            aggregator,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

const SYNC_TYPES: &[MessageType] = &[
    MessageType::SyncNow,
    MessageType::CancelSync,
    MessageType::GetSyncStatus,
];

impl MessageHandler for SyncHandler {
    fn owned_types(&self) -> &[MessageType] {
        SYNC_TYPES
    }

    fn handle(&mut self, message: &Message) -> Result<Option<Message>> {
        match message.message_type {
            MessageType::GetSyncStatus => Ok(Some(Message::with_data(
                MessageType::GetSyncStatus,
                serde_json::to_value(self.engine.status())?,
            ))),
            MessageType::CancelSync => {
                self.cancel.store(true, Ordering::SeqCst);
                Ok(Some(Message::with_data(
                    MessageType::CancelSync,
                    json!({ "cancelled": true }),
                )))
            }
            MessageType::SyncNow => {
                self.cancel.store(false, Ordering::SeqCst);

                let projects = message
                    .data
                    .as_ref()
                    .and_then(|d| d.get("projects"))
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect::<Vec<_>>()
                    });
                let options = SyncOptions {
                    projects,
                    since: None,
                    until: None,
                };

                let listed = self.aggregator.list_sessions(Some(&SessionFilter::default()));
                let mut candidates = Vec::new();
                for session in listed {
                    match self.aggregator.get_messages(session.source, &session.id) {
                        Ok(messages) => candidates.push((session, messages)),
                        Err(e) => {
                            tracing::warn!(session_id = %session.id, error = %e, "Skipping unreadable session");
                        }
                    }
                }

                let report =
                    self.engine
                        .sync(&candidates, &options, |_, _, _| {}, &self.cancel)?;
                if report.success {
                    Ok(Some(Message::with_data(
                        MessageType::SyncNow,
                        serde_json::to_value(&report)?,
                    )))
                } else {
                    Ok(Some(Message::with_data(
                        MessageType::UploadFailed,
                        serde_json::to_value(&report)?,
                    )))
                }
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::BufferedSender;
    use crate::bus::MessageBus;
    use crate::store::MemoryKeyValueStore;
    use std::sync::Mutex;

    fn saved_handler() -> SavedPromptHandler {
        let store = SavedPromptStore::new(Arc::new(MemoryKeyValueStore::new()));
        store.initialize().unwrap();
        SavedPromptHandler::new(Arc::new(store))
    }

    #[test]
    fn save_and_search_through_the_bus() {
        let (sender, sent) = BufferedSender::new();
        let mut bus = MessageBus::new(Box::new(sender));
        bus.register_handler(Box::new(saved_handler()));
        bus.set_initialized();

        bus.dispatch(Message::with_data(
            MessageType::SavePrompt,
            json!({ "text": "always add tests", "tags": ["tdd"] }),
        ));
        bus.dispatch(Message::with_data(
            MessageType::SearchSavedPrompts,
            json!({ "query": "TESTS" }),
        ));

        let replies = sent.lock().unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].message_type, MessageType::SavePrompt);
        let found = replies[1].data.as_ref().unwrap()["prompts"]
            .as_array()
            .unwrap()
            .len();
        assert_eq!(found, 1);
    }

    #[test]
    fn missing_fields_become_invalid_input_errors() {
        let (sender, sent) = BufferedSender::new();
        let mut bus = MessageBus::new(Box::new(sender));
        bus.register_handler(Box::new(saved_handler()));
        bus.set_initialized();

        bus.dispatch(Message::new(MessageType::SavePrompt));

        let replies = sent.lock().unwrap();
        assert_eq!(replies[0].message_type, MessageType::Error);
        assert_eq!(replies[0].data.as_ref().unwrap()["name"], "InvalidInput");
    }

    struct CannedProvider {
        response: std::result::Result<&'static str, &'static str>,
    }

    impl crate::scoring::LlmProvider for CannedProvider {
        fn id(&self) -> &'static str {
            "canned"
        }
        fn detect(&self) -> crate::scoring::ProviderStatus {
            crate::scoring::ProviderStatus {
                available: true,
                reason: None,
            }
        }
        fn list_models(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
        fn generate(
            &self,
            _req: &crate::scoring::GenerateRequest,
        ) -> Result<crate::scoring::GenerateResponse> {
            match self.response {
                Ok(text) => Ok(crate::scoring::GenerateResponse {
                    text: text.to_string(),
                    tokens_used: None,
                }),
                Err(msg) => Err(Error::Llm(msg.to_string())),
            }
        }
    }

    fn analysis_bus(
        response: std::result::Result<&'static str, &'static str>,
    ) -> (MessageBus, Arc<Mutex<Vec<Message>>>, Arc<PromptHistoryStore>) {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::ConfigStore::open(&dir.path().join("config.json")).unwrap();
        let registry = Arc::new(ProviderRegistry::with_providers(
            config,
            vec![Box::new(CannedProvider { response })],
        ));
        let history = Arc::new(PromptHistoryStore::new(Arc::new(MemoryKeyValueStore::new())));
        history.initialize().unwrap();

        let (sender, sent) = BufferedSender::new();
        let mut bus = MessageBus::new(Box::new(sender));
        bus.register_handler(Box::new(AnalysisHandler::new(
            registry,
            Arc::new(ScoringPipeline::new()),
            history.clone(),
        )));
        bus.set_initialized();
        (bus, sent, history)
    }

    const CANNED_SCORE: &str = r#"{
        "specificity": 8, "context": 6, "intent": 9,
        "actionability": 7, "constraints": 5
    }"#;

    #[test]
    fn analyze_prompt_persists_and_replies() {
        let (mut bus, sent, history) = analysis_bus(Ok(CANNED_SCORE));
        bus.dispatch(Message::with_data(
            MessageType::AnalyzePrompt,
            json!({ "text": "fix the flaky retry test", "source": "cursor", "sessionId": "c1" }),
        ));

        let replies = sent.lock().unwrap();
        assert_eq!(replies[0].message_type, MessageType::AnalyzePrompt);
        assert_eq!(history.history().len(), 1);
        assert_eq!(history.daily_stats().analyzed_today, 1);
    }

    #[test]
    fn analysis_failure_is_a_domain_event_not_an_error() {
        let (mut bus, sent, history) = analysis_bus(Err("provider is down"));
        bus.dispatch(Message::with_data(
            MessageType::AnalyzePrompt,
            json!({ "text": "anything" }),
        ));

        let replies = sent.lock().unwrap();
        assert_eq!(replies[0].message_type, MessageType::AnalysisFailed);
        // Nothing persisted on failure
        assert!(history.history().is_empty());
    }

    #[test]
    fn cancel_loading_aborts_next_analysis() {
        let (mut bus, sent, history) = analysis_bus(Ok(CANNED_SCORE));
        bus.dispatch(Message::new(MessageType::CancelLoading));
        bus.dispatch(Message::with_data(
            MessageType::AnalyzePrompt,
            json!({ "text": "will be cancelled" }),
        ));

        let replies = sent.lock().unwrap();
        assert_eq!(replies[1].message_type, MessageType::AnalyzePrompt);
        assert_eq!(replies[1].data.as_ref().unwrap()["cancelled"], true);
        assert!(history.history().is_empty());
    }

    #[test]
    fn history_handler_round_trip() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let history = PromptHistoryStore::new(kv);
        history.initialize().unwrap();

        let (sender, sent) = BufferedSender::new();
        let mut bus = MessageBus::new(Box::new(sender));
        bus.register_handler(Box::new(HistoryHandler::new(Arc::new(history))));
        bus.set_initialized();

        bus.dispatch(Message::new(MessageType::GetDailyStats));
        let replies = sent.lock().unwrap();
        assert_eq!(replies[0].message_type, MessageType::GetDailyStats);
        assert_eq!(replies[0].data.as_ref().unwrap()["analyzedToday"], 0);
    }
}
