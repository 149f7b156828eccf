//! Unified prompt detection
//!
//! The detection service owns one adapter per AI tool and delivers a
//! canonical [`PromptDetectedEvent`] exactly once per user prompt, fanned
//! out to every subscriber. Events that should not be scored (empty text,
//! pure slash commands, tool-result markers) are still delivered but carry
//! a skip annotation for the scoring pipeline.
//!
//! ```text
//! ┌──────────────┐     ┌────────────────────────┐     ┌──────────────┐
//! │ state.vscdb  │ ──► │ PromptDetectionService │ ──► │  subscribers │
//! │ queue file   │     │  (dedupe + annotate)   │     │ (scoring, UI)│
//! └──────────────┘     └────────────────────────┘     └──────────────┘
//!                              │
//!                              ▼
//!                    ┌──────────────────────┐
//!                    │  ToolAdapter         │
//!                    │  ├─ CursorPollAdapter│
//!                    │  └─ ClaudeHookAdapter│
//!                    └──────────────────────┘
//! ```

mod adapter;
pub mod claude;
pub mod cursor;
pub mod hooks;

pub use adapter::ToolAdapter;

use crate::config::DetectionConfig;
use crate::prompt;
use crate::types::{PromptDetectedEvent, SessionSource, SkipReason};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Prompt event subscriber.
pub type PromptHandler = Arc<dyn Fn(&PromptDetectedEvent) + Send + Sync>;

/// Coordinates adapters, dedupes, annotates, and fans events out.
pub struct PromptDetectionService {
    adapters: Vec<Box<dyn ToolAdapter>>,
    handlers: Vec<PromptHandler>,
    enabled: bool,
    auto_analyze: bool,
    running: bool,
    duplicate_window: ChronoDuration,
    /// `(source, session, normalized text)` of recently delivered events
    recent: HashMap<(SessionSource, String, String), DateTime<Utc>>,
}

impl PromptDetectionService {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            adapters: Vec::new(),
            handlers: Vec::new(),
            enabled: config.enabled,
            auto_analyze: config.auto_analyze,
            running: false,
            duplicate_window: ChronoDuration::milliseconds(config.duplicate_window_ms as i64),
            recent: HashMap::new(),
        }
    }

    /// Register an adapter; idempotent by source (later registrations of
    /// the same source are dropped).
    pub fn register_adapter(&mut self, adapter: Box<dyn ToolAdapter>) {
        if self.adapters.iter().any(|a| a.source() == adapter.source()) {
            tracing::debug!(source = %adapter.source(), "Adapter already registered");
            return;
        }
        self.adapters.push(adapter);
    }

    /// Initialize every adapter. A failing adapter marks itself unavailable
    /// and is excluded from `start`; the others are untouched.
    pub fn initialize(&mut self) {
        for adapter in &mut self.adapters {
            if let Err(e) = adapter.initialize() {
                tracing::warn!(source = %adapter.source(), error = %e, "Adapter initialization failed");
            }
        }
    }

    /// Start all available adapters. Re-entrant.
    pub fn start(&mut self) {
        if !self.enabled {
            tracing::debug!("Detection disabled, not starting adapters");
            return;
        }
        for adapter in &mut self.adapters {
            if !adapter.is_available() {
                continue;
            }
            if let Err(e) = adapter.start() {
                tracing::warn!(source = %adapter.source(), error = %e, "Adapter start failed");
            }
        }
        self.running = true;
    }

    /// Stop all adapters. Re-entrant; adapters stay registered.
    pub fn stop(&mut self) {
        for adapter in &mut self.adapters {
            adapter.stop();
        }
        self.running = false;
    }

    /// Hot-swap configuration. Disabling stops adapters but keeps them
    /// registered; re-enabling requires a `start` from the caller or the
    /// next `tick` of a running service.
    pub fn update_config(&mut self, enabled: bool, auto_analyze: bool) {
        self.auto_analyze = auto_analyze;
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if enabled {
            if self.running {
                self.start();
            }
        } else {
            let was_running = self.running;
            self.stop();
            // Remember that the caller wanted a running service
            self.running = was_running;
        }
    }

    /// Whether detected prompts should be scored automatically.
    pub fn auto_analyze(&self) -> bool {
        self.auto_analyze
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Subscribe to detected prompts. Multiple subscribers all receive
    /// every event.
    pub fn on_prompt<F>(&mut self, handler: F)
    where
        F: Fn(&PromptDetectedEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(handler));
    }

    /// Drive every available adapter once and fan out what they found.
    ///
    /// Adapter errors are confined to their source. Returns the events that
    /// were delivered (after duplicate suppression).
    pub fn tick(&mut self) -> Vec<PromptDetectedEvent> {
        if !self.enabled {
            return Vec::new();
        }

        let mut collected = Vec::new();
        for adapter in &mut self.adapters {
            if !adapter.is_available() {
                continue;
            }
            match adapter.poll() {
                Ok(events) => collected.extend(events),
                Err(e) => {
                    tracing::warn!(source = %adapter.source(), error = %e, "Adapter poll failed");
                }
            }
        }

        let mut delivered = Vec::new();
        for mut event in collected {
            let normalized = prompt::normalize_prompt(&event.text);
            if self.is_duplicate(event.source, &event.session_id, &normalized, event.timestamp) {
                tracing::debug!(
                    source = %event.source,
                    session_id = %event.session_id,
                    "Suppressed duplicate prompt"
                );
                continue;
            }
            self.recent.insert(
                (event.source, event.session_id.clone(), normalized),
                event.timestamp,
            );

            event.skip_reason = annotate(&event.text);
            for handler in &self.handlers {
                handler(&event);
            }
            delivered.push(event);
        }

        self.prune_recent();
        delivered
    }

    fn is_duplicate(
        &self,
        source: SessionSource,
        session_id: &str,
        normalized: &str,
        at: DateTime<Utc>,
    ) -> bool {
        self.recent
            .get(&(source, session_id.to_string(), normalized.to_string()))
            .map(|prev| at.signed_duration_since(*prev) < self.duplicate_window)
            .unwrap_or(false)
    }

    fn prune_recent(&mut self) {
        let window = self.duplicate_window;
        let now = Utc::now();
        self.recent
            .retain(|_, at| now.signed_duration_since(*at) < window * 2);
    }

    /// Drive the service until `stop_flag` goes false, polling at
    /// `interval_ms`. This is the blocking loop the CLI `watch` command
    /// runs.
    pub fn run_blocking(
        &mut self,
        interval_ms: u64,
        stop_flag: &std::sync::atomic::AtomicBool,
    ) {
        use std::sync::atomic::Ordering;
        let interval = std::time::Duration::from_millis(interval_ms);
        while stop_flag.load(Ordering::SeqCst) {
            self.tick();
            std::thread::sleep(interval);
        }
    }
}

/// Decide whether the scoring pipeline should skip this text.
fn annotate(text: &str) -> Option<SkipReason> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Some(SkipReason::Empty);
    }
    if prompt::is_slash_command(trimmed) {
        return Some(SkipReason::SlashCommand);
    }
    if !prompt::is_actual_user_prompt(trimmed) {
        return Some(SkipReason::ToolMarker);
    }
    None
}
