//! Cursor polling adapter
//!
//! Cursor has no hook mechanism worth relying on, so prompts are detected by
//! polling `state.vscdb` (default every 3 s) and diffing per-composer user
//! prompt counts against the previous snapshot. For v9+ composers the new
//! bubble ids identify the new prompts and their text is fetched from the
//! sibling `bubbleId:` rows; legacy composers fall back to the tail of the
//! inline message array.
//!
//! A composer absent from the previous snapshot but updated within the last
//! 10 seconds is treated as one new prompt using its most recent bubble.
//! Snapshots older than 24 hours are discarded to bound memory.

use crate::detect::ToolAdapter;
use crate::error::Result;
use crate::sessions::cursor::{
    bubble_text, composer_updated_at, extract_prompt_count, has_bubble_headers,
    inline_user_texts, user_bubble_ids, CursorDatabase, SqliteCursorDatabase,
};
use crate::types::{PromptDetectedEvent, SessionSource};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// A composer newer than this and unseen by the previous poll counts as one
/// fresh prompt.
const FRESH_COMPOSER_WINDOW_SECS: i64 = 10;

/// Snapshots with no activity for this long are dropped.
const SNAPSHOT_MAX_AGE_HOURS: i64 = 24;

struct ComposerSnapshot {
    prompt_count: usize,
    user_bubbles: HashSet<String>,
    last_activity: DateTime<Utc>,
}

/// Polling adapter over the Cursor KV database.
pub struct CursorPollAdapter {
    db: Option<Box<dyn CursorDatabase>>,
    db_path: Option<PathBuf>,
    available: bool,
    started: bool,
    open_error_logged: bool,
    snapshots: HashMap<String, ComposerSnapshot>,
    /// First poll only seeds snapshots; nothing it sees is "new"
    primed: bool,
}

impl CursorPollAdapter {
    /// Adapter over the default Cursor database location.
    pub fn new() -> Self {
        Self {
            db: None,
            db_path: SqliteCursorDatabase::default_path(),
            available: false,
            started: false,
            open_error_logged: false,
            snapshots: HashMap::new(),
            primed: false,
        }
    }

    /// Adapter over an injected database handle (for tests).
    pub fn with_database(db: Box<dyn CursorDatabase>) -> Self {
        Self {
            db: Some(db),
            db_path: None,
            available: true,
            started: false,
            open_error_logged: false,
            snapshots: HashMap::new(),
            primed: false,
        }
    }

    fn detect_in_composer(
        &self,
        composer_id: &str,
        composer: &Value,
        now: DateTime<Utc>,
    ) -> Result<Vec<PromptDetectedEvent>> {
        let count = extract_prompt_count(composer);
        let bubbles = user_bubble_ids(composer);

        let mut events = Vec::new();

        match self.snapshots.get(composer_id) {
            Some(prev) => {
                if count > prev.prompt_count {
                    let texts = self.new_prompt_texts(composer_id, composer, prev, count)?;
                    for text in texts {
                        events.push(self.event(composer_id, text, now));
                    }
                }
            }
            None if self.primed => {
                let updated = composer_updated_at(composer).unwrap_or(now);
                let age = now.signed_duration_since(updated).num_seconds();
                if (0..=FRESH_COMPOSER_WINDOW_SECS).contains(&age) {
                    if let Some(text) = self.most_recent_user_text(composer_id, composer, &bubbles)?
                    {
                        events.push(self.event(composer_id, text, now));
                    }
                }
            }
            None => {}
        }

        Ok(events)
    }

    /// Texts of prompts added since the previous snapshot.
    fn new_prompt_texts(
        &self,
        composer_id: &str,
        composer: &Value,
        prev: &ComposerSnapshot,
        count: usize,
    ) -> Result<Vec<String>> {
        if has_bubble_headers(composer) && inline_user_texts(composer).is_none() {
            let db = self.db.as_ref().expect("available adapter has a db");
            let mut texts = Vec::new();
            for bubble_id in user_bubble_ids(composer) {
                if prev.user_bubbles.contains(&bubble_id) {
                    continue;
                }
                let text = db
                    .bubble(composer_id, &bubble_id)?
                    .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
                    .map(|b| bubble_text(&b))
                    .unwrap_or_default();
                texts.push(text);
            }
            return Ok(texts);
        }

        // Legacy: take the tail of the inline user messages
        let new = count.saturating_sub(prev.prompt_count);
        let texts = inline_user_texts(composer).unwrap_or_default();
        let skip = texts.len().saturating_sub(new);
        Ok(texts.into_iter().skip(skip).collect())
    }

    fn most_recent_user_text(
        &self,
        composer_id: &str,
        composer: &Value,
        bubbles: &[String],
    ) -> Result<Option<String>> {
        if let Some(texts) = inline_user_texts(composer) {
            return Ok(texts.into_iter().last());
        }
        let Some(bubble_id) = bubbles.last() else {
            return Ok(None);
        };
        let db = self.db.as_ref().expect("available adapter has a db");
        Ok(db
            .bubble(composer_id, bubble_id)?
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .map(|b| bubble_text(&b)))
    }

    fn event(&self, composer_id: &str, text: String, now: DateTime<Utc>) -> PromptDetectedEvent {
        PromptDetectedEvent {
            source: SessionSource::Cursor,
            session_id: composer_id.to_string(),
            text,
            timestamp: now,
            context: Some(serde_json::json!({ "composerId": composer_id })),
            skip_reason: None,
        }
    }
}

impl Default for CursorPollAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolAdapter for CursorPollAdapter {
    fn source(&self) -> SessionSource {
        SessionSource::Cursor
    }

    fn initialize(&mut self) -> Result<()> {
        if self.db.is_some() {
            self.available = true;
            return Ok(());
        }

        let Some(path) = self.db_path.clone() else {
            self.available = false;
            return Ok(());
        };
        if !path.exists() {
            self.available = false;
            tracing::info!(path = %path.display(), "Cursor database not found");
            return Ok(());
        }

        match SqliteCursorDatabase::open(&path) {
            Ok(db) => {
                self.db = Some(Box::new(db));
                self.available = true;
                Ok(())
            }
            Err(e) => {
                self.available = false;
                if !self.open_error_logged {
                    tracing::warn!(path = %path.display(), error = %e, "Cannot open Cursor database");
                    self.open_error_logged = true;
                }
                Err(e)
            }
        }
    }

    fn start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.started = false;
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn poll(&mut self) -> Result<Vec<PromptDetectedEvent>> {
        if !self.started || !self.available {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let entries = {
            let db = self.db.as_ref().expect("available adapter has a db");
            db.composer_entries()?
        };

        let mut events = Vec::new();
        let mut seen = HashSet::new();

        for (composer_id, raw) in entries {
            let composer: Value = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!(composer_id = %composer_id, error = %e, "Malformed composer JSON");
                    continue;
                }
            };

            events.extend(self.detect_in_composer(&composer_id, &composer, now)?);

            seen.insert(composer_id.clone());
            self.snapshots.insert(
                composer_id,
                ComposerSnapshot {
                    prompt_count: extract_prompt_count(&composer),
                    user_bubbles: user_bubble_ids(&composer).into_iter().collect(),
                    last_activity: composer_updated_at(&composer).unwrap_or(now),
                },
            );
        }

        // Bound memory: forget composers gone from the DB or idle for a day
        let cutoff = now - Duration::hours(SNAPSHOT_MAX_AGE_HOURS);
        self.snapshots
            .retain(|id, snap| seen.contains(id) && snap.last_activity >= cutoff);

        self.primed = true;
        Ok(events)
    }
}
