//! Unified session aggregation
//!
//! Composes the Cursor and Claude readers into one ordered view of sessions
//! and messages. Read-through only: the only caching is a sub-second
//! memoization of the merged listing so a single UI render pass sees a
//! consistent snapshot.

pub mod claude;
pub mod cursor;
pub mod duration;

pub use duration::calculate_duration;

use crate::types::{DurationStats, Session, SessionMessage, SessionSource, SessionStatus};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long a merged listing stays memoized.
const MEMO_TTL: Duration = Duration::from_secs(1);

/// Optional listing filter.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Restrict to one source
    pub source: Option<SessionSource>,
    /// Only sessions with activity at or after this instant
    pub since: Option<DateTime<Utc>>,
}

/// Merged read surface over both session sources.
///
/// Errors from either source degrade to that source contributing zero
/// sessions for the call; the other source is unaffected.
pub struct SessionAggregator {
    cursor: Option<cursor::CursorSessionReader>,
    claude: Option<claude::ClaudeSessionReader>,
    memo: Mutex<Option<(Instant, Vec<Session>)>>,
}

impl SessionAggregator {
    pub fn new(
        cursor: Option<cursor::CursorSessionReader>,
        claude: Option<claude::ClaudeSessionReader>,
    ) -> Self {
        Self {
            cursor,
            claude,
            memo: Mutex::new(None),
        }
    }

    /// Open an aggregator over whatever tools are installed locally.
    pub fn open_default() -> Self {
        let cursor = match cursor::CursorSessionReader::open_default() {
            Ok(reader) => reader,
            Err(e) => {
                tracing::warn!(error = %e, "Cursor database unavailable");
                None
            }
        };
        let claude = claude::ClaudeSessionReader::new();
        let claude = claude.is_installed().then_some(claude);
        Self::new(cursor, claude)
    }

    /// Merged session list, sorted by last activity descending, deduped by
    /// `(source, id)`.
    pub fn list_sessions(&self, filter: Option<&SessionFilter>) -> Vec<Session> {
        let mut sessions = self.merged_sessions();

        if let Some(filter) = filter {
            if let Some(source) = filter.source {
                sessions.retain(|s| s.source == source);
            }
            if let Some(since) = filter.since {
                sessions.retain(|s| s.last_activity >= since);
            }
        }

        sessions
    }

    /// Messages for one session, normalized.
    pub fn get_messages(
        &self,
        source: SessionSource,
        session_id: &str,
    ) -> crate::error::Result<Vec<SessionMessage>> {
        match source {
            SessionSource::Cursor => match &self.cursor {
                Some(reader) => reader.messages_for_session(session_id),
                None => Ok(vec![]),
            },
            SessionSource::Claude => match &self.claude {
                Some(reader) => reader.messages_for_session(session_id),
                None => Ok(vec![]),
            },
        }
    }

    /// The most recently active session within the 5-minute window, if any.
    pub fn active_session(&self) -> Option<Session> {
        self.merged_sessions()
            .into_iter()
            .find(|s| s.status == SessionStatus::Active)
    }

    /// Active/idle gap accounting over a message sequence.
    pub fn compute_duration(&self, messages: &[SessionMessage]) -> DurationStats {
        let timestamps: Vec<_> = messages.iter().map(|m| m.timestamp).collect();
        calculate_duration(&timestamps)
    }

    fn merged_sessions(&self) -> Vec<Session> {
        {
            let memo = self.memo.lock().expect("memo lock");
            if let Some((at, sessions)) = memo.as_ref() {
                if at.elapsed() < MEMO_TTL {
                    return sessions.clone();
                }
            }
        }

        let mut sessions = Vec::new();

        if let Some(reader) = &self.cursor {
            match reader.active_sessions() {
                Ok(mut cursor_sessions) => sessions.append(&mut cursor_sessions),
                Err(e) => tracing::warn!(error = %e, "Cursor session listing failed"),
            }
        }
        if let Some(reader) = &self.claude {
            match reader.list_sessions() {
                Ok(mut claude_sessions) => sessions.append(&mut claude_sessions),
                Err(e) => tracing::warn!(error = %e, "Claude session listing failed"),
            }
        }

        let mut seen = HashSet::new();
        sessions.retain(|s| seen.insert((s.source, s.id.clone())));
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));

        let mut memo = self.memo.lock().expect("memo lock");
        *memo = Some((Instant::now(), sessions.clone()));
        sessions
    }
}
