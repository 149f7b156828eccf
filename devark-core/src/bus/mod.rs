//! Typed message bus
//!
//! The single request-response surface between the core and any UI shell.
//! Every message is `{type, data?}` with a closed set of type tags; dispatch
//! is a first-match over registered handlers.
//!
//! Messages arriving before handler initialization completes are queued iff
//! their type is handler-dependent (the whitelist below); everything else is
//! rejected with an "unknown type" warning. This closes the startup race
//! where the UI asks for providers or coaching status while the stores are
//! still loading.
//!
//! Handlers never throw across the bus: errors are caught, logged once, and
//! answered with an `error` message carrying `{name, message}`.

pub mod handlers;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Closed set of message type tags.
///
/// Every variant except the lifecycle ones at the bottom is
/// handler-dependent: it cannot be answered until initialization has
/// finished, so pre-init arrivals queue instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    // Scoring and analysis
    AnalyzePrompt,
    AnalyzeSession,
    ReanalyzePrompt,
    ImprovePrompt,
    ScoreDraft,
    CancelLoading,
    GetAnalysisStatus,

    // Providers
    GetProviders,
    GetActiveProvider,
    SetActiveProvider,
    GetProviderModels,
    SetProviderModel,
    SetProviderEndpoint,
    SetProviderApiKey,
    ClearProviderApiKey,
    TestProvider,
    DetectProviders,

    // History and stats
    GetHistory,
    ClearHistory,
    DeleteHistoryEntry,
    GetPromptDetail,
    ExportHistory,
    GetDailyStats,
    ResetDailyStats,

    // Saved prompts
    GetSavedPrompts,
    SavePrompt,
    UpdateSavedPrompt,
    DeleteSavedPrompt,
    SearchSavedPrompts,
    GetTags,
    GetFolders,
    MovePromptToFolder,
    TagPrompt,
    UntagPrompt,

    // Sessions
    GetSessions,
    GetSessionMessages,
    GetActiveSession,
    GetSessionDuration,
    RefreshSessions,

    // Detection
    GetDetectionStatus,
    SetDetectionEnabled,
    SetAutoAnalyze,
    RestartDetection,
    InstallHooks,
    RemoveHooks,

    // Cloud sync
    SyncNow,
    CancelSync,
    GetSyncStatus,
    GetSyncSelection,
    SetSyncSelection,
    GetKnownSessions,

    // Auth and token vault
    SignIn,
    SignOut,
    GetAuthStatus,
    StoreToken,
    ClearToken,
    HasToken,

    // Config
    GetConfig,
    UpdateConfig,
    GetApiUrl,
    SetApiUrl,

    // Goals and coaching
    GetGoals,
    SetGoal,
    GetGoalProgress,
    GetCoachingStatus,
    GetCoachingTips,
    DismissCoachingTip,

    // Onboarding and shell chrome
    GetOnboardingState,
    SetOnboardingComplete,
    OpenExternal,
    CopyToClipboard,
    ShowNotification,
    ConfirmAction,

    // Lifecycle — answered at the top level, never queued
    Ping,
    GetVersion,
    Log,

    // Outbound-only events
    Error,
    AnalysisFailed,
    UploadFailed,
}

impl MessageType {
    /// Whether this type requires initialized handlers (and therefore
    /// queues when it arrives early).
    pub fn is_handler_dependent(&self) -> bool {
        !matches!(
            self,
            MessageType::Ping
                | MessageType::GetVersion
                | MessageType::Log
                | MessageType::Error
                | MessageType::AnalysisFailed
                | MessageType::UploadFailed
        )
    }
}

/// The wire envelope: `{type, data?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Message {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            data: None,
        }
    }

    pub fn with_data(message_type: MessageType, data: serde_json::Value) -> Self {
        Self {
            message_type,
            data: Some(data),
        }
    }

    /// The error reply every failed handler produces.
    pub fn error(name: &str, message: &str) -> Self {
        Self::with_data(
            MessageType::Error,
            serde_json::json!({ "name": name, "message": message }),
        )
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A component that answers a declared set of message types.
pub trait MessageHandler: Send {
    /// The types this handler owns; dispatch is first-match.
    fn owned_types(&self) -> &[MessageType];

    /// Answer one message. Errors are converted to `error` replies by the
    /// bus, never propagated.
    fn handle(&mut self, message: &Message) -> Result<Option<Message>>;
}

/// Send side toward the UI. Null-safe: once the owning panel is disposed,
/// sends become silent no-ops.
pub trait MessageSender: Send {
    fn send(&self, message: Message);
}

/// Production sender wrapping a panel callback; `dispose` makes every
/// further send a no-op.
pub struct PanelSender {
    inner: Mutex<Option<Box<dyn Fn(Message) + Send>>>,
}

impl PanelSender {
    pub fn new<F>(send: F) -> Self
    where
        F: Fn(Message) + Send + 'static,
    {
        Self {
            inner: Mutex::new(Some(Box::new(send))),
        }
    }

    pub fn dispose(&self) {
        *self.inner.lock().expect("sender lock") = None;
    }
}

impl MessageSender for PanelSender {
    fn send(&self, message: Message) {
        if let Some(send) = self.inner.lock().expect("sender lock").as_ref() {
            send(message);
        }
    }
}

/// What the bus did with an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler (or the top level) answered it
    Handled,
    /// Queued until initialization completes
    Queued,
    /// Rejected with an "unknown type" warning
    Rejected,
}

/// The bus: handler registry, init queue, and reply routing.
pub struct MessageBus {
    handlers: Vec<Box<dyn MessageHandler>>,
    sender: Box<dyn MessageSender>,
    initialized: bool,
    queued: VecDeque<Message>,
    version: String,
}

impl MessageBus {
    pub fn new(sender: Box<dyn MessageSender>) -> Self {
        Self {
            handlers: Vec::new(),
            sender,
            initialized: false,
            queued: VecDeque::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn register_handler(&mut self, handler: Box<dyn MessageHandler>) {
        self.handlers.push(handler);
    }

    /// Mark initialization complete and drain everything that queued.
    pub fn set_initialized(&mut self) {
        self.initialized = true;
        let queued: Vec<Message> = self.queued.drain(..).collect();
        for message in queued {
            self.dispatch(message);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Route one message. Replies go out through the sender.
    pub fn dispatch(&mut self, message: Message) -> DispatchOutcome {
        // Top-level types are answered regardless of init state
        if let Some(reply) = self.answer_top_level(&message) {
            self.sender.send(reply);
            return DispatchOutcome::Handled;
        }

        if !self.initialized {
            if message.message_type.is_handler_dependent() {
                self.queued.push_back(message);
                return DispatchOutcome::Queued;
            }
            tracing::warn!(message_type = ?message.message_type, "Unknown message type before init");
            self.sender.send(Message::error(
                "UnknownMessageType",
                &format!("unknown type: {:?}", message.message_type),
            ));
            return DispatchOutcome::Rejected;
        }

        let owner = self
            .handlers
            .iter_mut()
            .find(|h| h.owned_types().contains(&message.message_type));

        match owner {
            Some(handler) => {
                match handler.handle(&message) {
                    Ok(Some(reply)) => self.sender.send(reply),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(
                            message_type = ?message.message_type,
                            error = %e,
                            "Handler failed"
                        );
                        self.sender.send(Message::error(error_name(&e), &e.to_string()));
                    }
                }
                DispatchOutcome::Handled
            }
            None => {
                tracing::warn!(message_type = ?message.message_type, "Unknown message type");
                self.sender.send(Message::error(
                    "UnknownMessageType",
                    &format!("unknown type: {:?}", message.message_type),
                ));
                DispatchOutcome::Rejected
            }
        }
    }

    fn answer_top_level(&self, message: &Message) -> Option<Message> {
        match message.message_type {
            MessageType::Ping => Some(Message::new(MessageType::Ping)),
            MessageType::GetVersion => Some(Message::with_data(
                MessageType::GetVersion,
                serde_json::json!({ "version": self.version }),
            )),
            MessageType::Log => {
                if let Some(data) = &message.data {
                    tracing::info!(payload = %data, "UI log message");
                }
                // Log is fire-and-forget
                Some(Message::new(MessageType::Log))
            }
            _ => None,
        }
    }
}

fn error_name(e: &crate::error::Error) -> &'static str {
    use crate::error::Error;
    match e {
        Error::Database(_) => "DatabaseError",
        Error::Io(_) => "IoError",
        Error::Parse { .. } => "ParseError",
        Error::Json(_) => "JsonError",
        Error::Config(_) => "ConfigError",
        Error::Llm(_) => "LlmError",
        Error::Auth(_) => "AuthError",
        Error::Quota(_) => "QuotaError",
        Error::InvalidInput(_) => "InvalidInput",
        Error::SessionNotFound(_) => "SessionNotFound",
        Error::Sync(_) => "SyncError",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    /// Sender double that records everything.
    pub struct BufferedSender {
        pub sent: Arc<Mutex<Vec<Message>>>,
    }

    impl BufferedSender {
        pub fn new() -> (Self, Arc<Mutex<Vec<Message>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (Self { sent: sent.clone() }, sent)
        }
    }

    impl MessageSender for BufferedSender {
        fn send(&self, message: Message) {
            self.sent.lock().unwrap().push(message);
        }
    }

    struct EchoHandler {
        owned: Vec<MessageType>,
        fail: bool,
    }

    impl MessageHandler for EchoHandler {
        fn owned_types(&self) -> &[MessageType] {
            &self.owned
        }
        fn handle(&mut self, message: &Message) -> Result<Option<Message>> {
            if self.fail {
                return Err(crate::error::Error::Quota("cap reached".to_string()));
            }
            Ok(Some(Message::with_data(
                message.message_type,
                serde_json::json!({ "echo": true }),
            )))
        }
    }

    #[test]
    fn whitelist_is_large_and_closed() {
        // The handler-dependent whitelist covers the documented protocol
        let all = [
            MessageType::AnalyzePrompt,
            MessageType::GetProviders,
            MessageType::GetHistory,
            MessageType::GetCoachingStatus,
            MessageType::SyncNow,
        ];
        for t in all {
            assert!(t.is_handler_dependent());
        }
        assert!(!MessageType::Ping.is_handler_dependent());
        assert!(!MessageType::Error.is_handler_dependent());
        assert!(!MessageType::AnalysisFailed.is_handler_dependent());
    }

    #[test]
    fn serde_tags_are_camel_case() {
        let msg = Message::with_data(MessageType::GetProviders, serde_json::json!({"x": 1}));
        let raw = serde_json::to_string(&msg).unwrap();
        assert!(raw.contains(r#""type":"getProviders""#));

        let parsed = Message::parse(&raw).unwrap();
        assert_eq!(parsed, msg);

        // Unknown tags fail to parse; the set is closed
        assert!(Message::parse(r#"{"type":"madeUpThing"}"#).is_err());
    }

    #[test]
    fn pre_init_whitelisted_messages_queue_and_drain() {
        let (sender, sent) = BufferedSender::new();
        let mut bus = MessageBus::new(Box::new(sender));
        bus.register_handler(Box::new(EchoHandler {
            owned: vec![MessageType::GetProviders],
            fail: false,
        }));

        let outcome = bus.dispatch(Message::new(MessageType::GetProviders));
        assert_eq!(outcome, DispatchOutcome::Queued);
        assert!(sent.lock().unwrap().is_empty());

        bus.set_initialized();
        let replies = sent.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].message_type, MessageType::GetProviders);
        // No "unknown type" warning was emitted
        assert!(replies
            .iter()
            .all(|m| m.message_type != MessageType::Error));
    }

    #[test]
    fn top_level_types_answer_before_init() {
        let (sender, sent) = BufferedSender::new();
        let mut bus = MessageBus::new(Box::new(sender));

        assert_eq!(
            bus.dispatch(Message::new(MessageType::Ping)),
            DispatchOutcome::Handled
        );
        assert_eq!(
            bus.dispatch(Message::new(MessageType::GetVersion)),
            DispatchOutcome::Handled
        );
        let replies = sent.lock().unwrap();
        assert_eq!(replies.len(), 2);
        assert!(replies[1].data.as_ref().unwrap()["version"].is_string());
    }

    #[test]
    fn handler_errors_become_error_replies() {
        let (sender, sent) = BufferedSender::new();
        let mut bus = MessageBus::new(Box::new(sender));
        bus.register_handler(Box::new(EchoHandler {
            owned: vec![MessageType::SavePrompt],
            fail: true,
        }));
        bus.set_initialized();

        let outcome = bus.dispatch(Message::new(MessageType::SavePrompt));
        assert_eq!(outcome, DispatchOutcome::Handled);

        let replies = sent.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].message_type, MessageType::Error);
        let data = replies[0].data.as_ref().unwrap();
        assert_eq!(data["name"], "QuotaError");
        assert!(data["message"].as_str().unwrap().contains("cap reached"));
    }

    #[test]
    fn unowned_types_are_rejected_after_init() {
        let (sender, sent) = BufferedSender::new();
        let mut bus = MessageBus::new(Box::new(sender));
        bus.set_initialized();

        let outcome = bus.dispatch(Message::new(MessageType::GetGoals));
        assert_eq!(outcome, DispatchOutcome::Rejected);
        assert_eq!(
            sent.lock().unwrap()[0].message_type,
            MessageType::Error
        );
    }

    #[test]
    fn first_match_dispatch_order() {
        let (sender, sent) = BufferedSender::new();
        let mut bus = MessageBus::new(Box::new(sender));
        bus.register_handler(Box::new(EchoHandler {
            owned: vec![MessageType::GetHistory],
            fail: true,
        }));
        // Second handler also claims GetHistory but never sees it
        bus.register_handler(Box::new(EchoHandler {
            owned: vec![MessageType::GetHistory],
            fail: false,
        }));
        bus.set_initialized();

        bus.dispatch(Message::new(MessageType::GetHistory));
        assert_eq!(
            sent.lock().unwrap()[0].message_type,
            MessageType::Error
        );
    }

    #[test]
    fn disposed_panel_sender_is_a_silent_noop() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        let sender = PanelSender::new(move |m| r.lock().unwrap().push(m));

        sender.send(Message::new(MessageType::Ping));
        assert_eq!(received.lock().unwrap().len(), 1);

        sender.dispose();
        sender.send(Message::new(MessageType::Ping));
        assert_eq!(received.lock().unwrap().len(), 1);
    }
}
