//! Claude Code session reader
//!
//! Claude Code writes one JSONL transcript per session under
//! `~/.claude/projects/<encoded-path>/<session-id>.jsonl`. Each line is a
//! record carrying a role, content, and timestamp; newer versions nest these
//! under a `message` object. The reader is resilient: malformed lines are
//! skipped with a warning, missing timestamps inherit the last seen value.
//!
//! Listing only considers transcripts modified in the last 30 days; older
//! sessions remain readable by id.

use crate::error::{Error, Result};
use crate::types::{MessageRole, Session, SessionMessage, SessionSource, SessionStatus};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Transcripts older than this are excluded from listings.
const LISTING_WINDOW_DAYS: i64 = 30;

/// Reader over a Claude Code data directory.
pub struct ClaudeSessionReader {
    root: Option<PathBuf>,
}

impl ClaudeSessionReader {
    /// Create a reader over the default root (`~/.claude`).
    pub fn new() -> Self {
        Self {
            root: dirs::home_dir().map(|h| h.join(".claude")),
        }
    }

    /// Create a reader with a custom root (for testing).
    pub fn with_root(root: PathBuf) -> Self {
        Self { root: Some(root) }
    }

    /// Whether the Claude data directory exists at all.
    pub fn is_installed(&self) -> bool {
        self.root.as_ref().map(|r| r.exists()).unwrap_or(false)
    }

    /// Sessions from transcripts modified within the last 30 days, most
    /// recent first.
    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let cutoff = Utc::now() - chrono::Duration::days(LISTING_WINDOW_DAYS);
        let mut sessions = Vec::new();

        for path in self.transcript_files()? {
            let modified = file_modified(&path).unwrap_or_else(Utc::now);
            if modified < cutoff {
                continue;
            }
            match self.read_session(&path) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read transcript");
                }
            }
        }

        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    /// Look up a session by id (file stem), regardless of age.
    pub fn session_by_id(&self, session_id: &str) -> Result<Session> {
        let path = self
            .find_transcript(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        self.read_session(&path)
    }

    /// All messages for a session, in file order.
    pub fn messages_for_session(&self, session_id: &str) -> Result<Vec<SessionMessage>> {
        let path = self
            .find_transcript(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        let parsed = parse_transcript(&path)?;
        Ok(parsed.messages)
    }

    fn transcript_files(&self) -> Result<Vec<PathBuf>> {
        let Some(root) = &self.root else {
            return Ok(vec![]);
        };
        let pattern = root.join("projects/*/*.jsonl");
        let entries =
            glob::glob(&pattern.to_string_lossy()).map_err(|e| Error::Parse {
                tool: "claude".to_string(),
                message: format!("invalid glob pattern: {}", e),
            })?;
        Ok(entries.flatten().collect())
    }

    fn find_transcript(&self, session_id: &str) -> Result<Option<PathBuf>> {
        Ok(self.transcript_files()?.into_iter().find(|p| {
            p.file_stem()
                .and_then(|s| s.to_str())
                .map(|stem| stem == session_id)
                .unwrap_or(false)
        }))
    }

    fn read_session(&self, path: &Path) -> Result<Session> {
        let session_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Parse {
                tool: "claude".to_string(),
                message: format!("transcript has no stem: {}", path.display()),
            })?
            .to_string();

        let parsed = parse_transcript(path)?;
        let fallback = file_modified(path).unwrap_or_else(Utc::now);
        let last_activity = parsed
            .messages
            .last()
            .map(|m| m.timestamp)
            .unwrap_or(fallback);
        let start_time = parsed
            .messages
            .first()
            .map(|m| m.timestamp)
            .unwrap_or(last_activity);

        let workspace_path = parsed.cwd.map(PathBuf::from);
        let workspace_name = workspace_path
            .as_ref()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| "Claude workspace".to_string());

        Ok(Session {
            id: session_id,
            source: SessionSource::Claude,
            workspace_name,
            workspace_path,
            start_time: start_time.min(last_activity),
            last_activity,
            prompt_count: parsed
                .messages
                .iter()
                .filter(|m| m.is_user_prompt())
                .count(),
            status: SessionStatus::from_last_activity(last_activity),
            highlights: None,
        })
    }
}

impl Default for ClaudeSessionReader {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================
// Transcript parsing
// ============================================

/// One transcript line. `#[serde(default)]` keeps malformed or sparse
/// records from failing the whole file.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawTranscriptLine {
    #[serde(rename = "type")]
    record_type: Option<String>,
    role: Option<String>,
    content: Option<Value>,
    timestamp: Option<String>,
    cwd: Option<String>,
    message: Option<RawTranscriptMessage>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawTranscriptMessage {
    role: Option<String>,
    content: Option<Value>,
}

struct ParsedTranscript {
    messages: Vec<SessionMessage>,
    cwd: Option<String>,
}

fn parse_transcript(path: &Path) -> Result<ParsedTranscript> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let session_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();

    let mut messages = Vec::new();
    let mut cwd: Option<String> = None;
    let mut last_timestamp = Utc::now();

    for (line_number, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(path = %path.display(), line = line_number + 1, error = %e, "Read error");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let record: RawTranscriptLine = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(path = %path.display(), line = line_number + 1, error = %e, "Malformed transcript line");
                continue;
            }
        };

        if cwd.is_none() {
            cwd = record.cwd.clone();
        }

        let role_str = record
            .role
            .as_deref()
            .or(record.message.as_ref().and_then(|m| m.role.as_deref()))
            .or(record.record_type.as_deref());
        let role = match role_str {
            Some("user") => MessageRole::User,
            Some("assistant") => MessageRole::Assistant,
            _ => continue,
        };

        let timestamp = record
            .timestamp
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(last_timestamp);
        last_timestamp = timestamp;

        let content_value = record
            .content
            .as_ref()
            .or(record.message.as_ref().and_then(|m| m.content.as_ref()));
        let content = content_value.map(extract_text).unwrap_or_default();

        messages.push(SessionMessage {
            id: format!("{}:{}", session_id, messages.len()),
            role,
            content,
            timestamp,
            bubble_id: None,
        });
    }

    Ok(ParsedTranscript { messages, cwd })
}

/// Extract plain text from a content value: a string, or an array of blocks
/// whose `text` fields are concatenated. Tool-result blocks become the
/// bracketed marker the prompt predicate already knows to reject.
fn extract_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => {
            let mut parts = Vec::new();
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            parts.push(text.to_string());
                        }
                    }
                    Some("tool_result") => parts.push("[Tool result]".to_string()),
                    _ => {}
                }
            }
            parts.join("\n")
        }
        _ => String::new(),
    }
}

fn file_modified(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_transcript(root: &Path, project: &str, session: &str, lines: &[&str]) -> PathBuf {
        let dir = root.join("projects").join(project);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{}.jsonl", session));
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        path
    }

    #[test]
    fn parses_flat_records() {
        let dir = TempDir::new().unwrap();
        write_transcript(
            dir.path(),
            "-home-dev-app",
            "s1",
            &[
                r#"{"role":"user","content":"fix the tests","timestamp":"2026-08-01T10:00:00Z","cwd":"/home/dev/app"}"#,
                r#"{"role":"assistant","content":"done","timestamp":"2026-08-01T10:01:00Z"}"#,
            ],
        );

        let reader = ClaudeSessionReader::with_root(dir.path().to_path_buf());
        let messages = reader.messages_for_session("s1").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "fix the tests");
        assert_eq!(messages[0].id, "s1:0");
    }

    #[test]
    fn parses_nested_message_records() {
        let dir = TempDir::new().unwrap();
        write_transcript(
            dir.path(),
            "-home-dev-app",
            "s2",
            &[
                r#"{"type":"user","message":{"role":"user","content":[{"type":"text","text":"add logging"}]},"timestamp":"2026-08-01T09:00:00Z","cwd":"/home/dev/app"}"#,
                r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"sure"},{"type":"tool_use","name":"Edit"}]},"timestamp":"2026-08-01T09:00:30Z"}"#,
            ],
        );

        let reader = ClaudeSessionReader::with_root(dir.path().to_path_buf());
        let messages = reader.messages_for_session("s2").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "add logging");
        assert_eq!(messages[1].content, "sure");
    }

    #[test]
    fn skips_malformed_lines() {
        let dir = TempDir::new().unwrap();
        write_transcript(
            dir.path(),
            "-p",
            "s3",
            &[
                r#"{"role":"user","content":"first","timestamp":"2026-08-01T08:00:00Z"}"#,
                "{broken json",
                r#"{"role":"user","content":"second","timestamp":"2026-08-01T08:05:00Z"}"#,
            ],
        );

        let reader = ClaudeSessionReader::with_root(dir.path().to_path_buf());
        let messages = reader.messages_for_session("s3").unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn session_metadata_from_transcript() {
        let dir = TempDir::new().unwrap();
        write_transcript(
            dir.path(),
            "-home-dev-webapp",
            "s4",
            &[
                r#"{"role":"user","content":"build it","timestamp":"2026-08-01T08:00:00Z","cwd":"/home/dev/webapp"}"#,
                r#"{"role":"user","content":"[Tool result]","timestamp":"2026-08-01T08:01:00Z"}"#,
                r#"{"role":"assistant","content":"building","timestamp":"2026-08-01T08:02:00Z"}"#,
            ],
        );

        let reader = ClaudeSessionReader::with_root(dir.path().to_path_buf());
        let session = reader.session_by_id("s4").unwrap();
        assert_eq!(session.source, SessionSource::Claude);
        assert_eq!(session.workspace_name, "webapp");
        // Tool-result marker does not count as a prompt
        assert_eq!(session.prompt_count, 1);
        assert!(session.start_time <= session.last_activity);
    }

    #[test]
    fn missing_session_is_not_found() {
        let dir = TempDir::new().unwrap();
        let reader = ClaudeSessionReader::with_root(dir.path().to_path_buf());
        assert!(matches!(
            reader.session_by_id("nope"),
            Err(Error::SessionNotFound(_))
        ));
    }
}
