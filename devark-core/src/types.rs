//! Core domain types for devark
//!
//! These types form the canonical model shared by the detection, session,
//! scoring, store, and sync layers.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | A conversation with an AI coding assistant (a Cursor composer or a Claude Code transcript) |
//! | **Message** | A single user or assistant turn inside a session |
//! | **Bubble** | Cursor's v9+ unit of a message, stored in its own KV row |
//! | **AnalyzedPrompt** | A user prompt plus the score the LLM pipeline assigned it |
//! | **Fingerprint** | sha256 of the normalized prompt text, used for cache and sync dedup |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================
// Session source
// ============================================

/// Which AI tool a session (or detected prompt) originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    Cursor,
    Claude,
}

impl SessionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionSource::Cursor => "cursor",
            SessionSource::Claude => "claude",
        }
    }

    /// Returns the display name for this source
    pub fn display_name(&self) -> &'static str {
        match self {
            SessionSource::Cursor => "Cursor",
            SessionSource::Claude => "Claude Code",
        }
    }
}

impl std::fmt::Display for SessionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SessionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cursor" | "Cursor" => Ok(SessionSource::Cursor),
            "claude" | "Claude" => Ok(SessionSource::Claude),
            _ => Err(format!("unknown session source: {}", s)),
        }
    }
}

// ============================================
// Session status
// ============================================

/// Current status of a session based on activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Activity within the last 5 minutes
    Active,
    /// Everything else
    Historical,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Historical => "historical",
        }
    }

    /// Compute status from the last activity time.
    pub fn from_last_activity(last_activity: DateTime<Utc>) -> Self {
        Self::from_last_activity_at(last_activity, Utc::now())
    }

    /// Compute status against an explicit "now" (for tests).
    pub fn from_last_activity_at(last_activity: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        if now.signed_duration_since(last_activity).num_seconds() < 5 * 60 {
            SessionStatus::Active
        } else {
            SessionStatus::Historical
        }
    }
}

// ============================================
// Sessions and messages
// ============================================

/// A session with an AI coding assistant.
///
/// `(source, id)` is globally unique. Sessions are created on first
/// observation and never destroyed by devark; only the underlying tool can
/// remove one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Opaque, source-scoped identifier (composer id or transcript stem)
    pub id: String,
    /// Which tool this session belongs to
    pub source: SessionSource,
    /// Workspace/project display name
    pub workspace_name: String,
    /// Absolute workspace path when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<PathBuf>,
    /// When the session started
    pub start_time: DateTime<Utc>,
    /// Most recent activity timestamp
    pub last_activity: DateTime<Utc>,
    /// Number of user prompts observed
    pub prompt_count: usize,
    /// Computed from `last_activity`
    pub status: SessionStatus,
    /// Optional notable prompt excerpts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlights: Option<Vec<String>>,
}

impl Session {
    /// Update status based on current time.
    pub fn refresh_status(&mut self) {
        self.status = SessionStatus::from_last_activity(self.last_activity);
    }
}

/// Role of a session message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// A single message inside a session, normalized across sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    /// Deterministic id: `{session_id}:{index}` or the bubble id
    pub id: String,
    pub role: MessageRole,
    /// Message text; may be empty for non-text bubbles
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Cursor v9+ bubble id when the message came from a bubble row
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bubble_id: Option<String>,
}

impl SessionMessage {
    /// Whether this message counts as a real user prompt (not a tool-result
    /// marker or empty placeholder).
    pub fn is_user_prompt(&self) -> bool {
        self.role == MessageRole::User && crate::prompt::is_actual_user_prompt(&self.content)
    }
}

// ============================================
// Analyzed prompts
// ============================================

/// Legacy 4-category score detail.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryScores {
    pub clarity: f64,
    pub specificity: f64,
    pub context: f64,
    pub actionability: f64,
}

/// One scored dimension of the V2 breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreDimension {
    /// Clamped to [0, 10]
    pub score: f64,
    /// Fixed rubric weight, sums to 1.0 across the breakdown
    pub weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// V2 five-dimension score breakdown.
///
/// Weights are fixed by the rubric: specificity 20%, context 25%,
/// intent 25%, actionability 15%, constraints 15%.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub specificity: ScoreDimension,
    pub context: ScoreDimension,
    pub intent: ScoreDimension,
    pub actionability: ScoreDimension,
    pub constraints: ScoreDimension,
}

impl ScoreBreakdown {
    /// Weighted sum of the five dimensions, rounded to one decimal.
    pub fn weighted_total(&self) -> f64 {
        let raw = self.specificity.score * self.specificity.weight
            + self.context.score * self.context.weight
            + self.intent.score * self.intent.weight
            + self.actionability.score * self.actionability.weight
            + self.constraints.score * self.constraints.weight;
        (raw * 10.0).round() / 10.0
    }
}

/// A user prompt annotated with its score and provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedPrompt {
    pub id: String,
    pub text: String,
    /// Display-friendly truncation of `text`
    pub truncated_text: String,
    /// Overall score in [0, 10]; the weighted breakdown sum when present
    pub score: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_scores: Option<CategoryScores>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<ScoreBreakdown>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub improved_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub improved_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SessionSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AnalyzedPrompt {
    /// Truncation length used for `truncated_text`.
    pub const TRUNCATE_CHARS: usize = 120;

    pub fn truncate_text(text: &str) -> String {
        let truncated: String = text.chars().take(Self::TRUNCATE_CHARS).collect();
        if truncated.chars().count() < text.chars().count() {
            format!("{}...", truncated)
        } else {
            truncated
        }
    }
}

// ============================================
// Saved prompts
// ============================================

/// A prompt the user saved to their library.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedPrompt {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    /// None means the prompt is global (visible in every project)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

// ============================================
// Daily stats
// ============================================

/// Rolling per-day counters, reset on the first write of a new calendar day.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub analyzed_today: usize,
    pub avg_score: f64,
    /// Calendar day of the last reset, `YYYY-MM-DD`
    pub last_reset_date: String,
}

impl Default for DailyStats {
    fn default() -> Self {
        Self {
            analyzed_today: 0,
            avg_score: 0.0,
            last_reset_date: Utc::now().format("%Y-%m-%d").to_string(),
        }
    }
}

// ============================================
// Prompt detection
// ============================================

/// Why a detected prompt is annotated for the scoring pipeline to skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Trimmed text is empty
    Empty,
    /// The text is purely a slash command (`/commit`, `/review:pr ...`)
    SlashCommand,
    /// Fully bracketed `[Tool ...]` result marker
    ToolMarker,
}

/// Canonical event emitted once per user prompt submitted to any tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptDetectedEvent {
    pub source: SessionSource,
    pub session_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Adapter-specific extras (cwd, trigger, composer metadata)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    /// Set when the scoring pipeline should not score this prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

impl PromptDetectedEvent {
    /// Whether the scoring pipeline should score this event.
    pub fn should_score(&self) -> bool {
        self.skip_reason.is_none()
    }
}

// ============================================
// Duration accounting
// ============================================

/// Result of active/idle gap accounting over a message sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurationStats {
    /// Sum of active gaps, capped at 8 hours
    pub duration_seconds: i64,
    pub active_gaps: usize,
    pub idle_gaps: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_session_status_window() {
        let now = Utc::now();
        assert_eq!(
            SessionStatus::from_last_activity_at(now - Duration::minutes(4), now),
            SessionStatus::Active
        );
        assert_eq!(
            SessionStatus::from_last_activity_at(now - Duration::minutes(5), now),
            SessionStatus::Historical
        );
        assert_eq!(
            SessionStatus::from_last_activity_at(now - Duration::hours(3), now),
            SessionStatus::Historical
        );
    }

    #[test]
    fn test_source_round_trip() {
        assert_eq!("cursor".parse::<SessionSource>(), Ok(SessionSource::Cursor));
        assert_eq!("claude".parse::<SessionSource>(), Ok(SessionSource::Claude));
        assert!("aider".parse::<SessionSource>().is_err());
        assert_eq!(SessionSource::Claude.to_string(), "claude");
    }

    #[test]
    fn test_breakdown_weighted_total() {
        let dim = |score: f64, weight: f64| ScoreDimension {
            score,
            weight,
            feedback: None,
        };
        let breakdown = ScoreBreakdown {
            specificity: dim(8.0, 0.20),
            context: dim(6.0, 0.25),
            intent: dim(9.0, 0.25),
            actionability: dim(7.0, 0.15),
            constraints: dim(5.0, 0.15),
        };
        // 1.6 + 1.5 + 2.25 + 1.05 + 0.75 = 7.15 -> 7.2 (rounded to one decimal)
        assert!((breakdown.weighted_total() - 7.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_truncate_text() {
        let short = "fix the bug";
        assert_eq!(AnalyzedPrompt::truncate_text(short), short);

        let long = "x".repeat(200);
        let truncated = AnalyzedPrompt::truncate_text(&long);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncated.chars().count(), AnalyzedPrompt::TRUNCATE_CHARS + 3);
    }
}
