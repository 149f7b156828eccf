//! Cursor session reader
//!
//! Reads conversations ("composers") out of Cursor's `state.vscdb`, a SQLite
//! key/value store with table `cursorDiskKV(key TEXT, value TEXT)`. Keys of
//! interest:
//!
//! - `composerData:<composerId>` — JSON composer blob
//! - `bubbleId:<composerId>:<bubbleId>` — JSON bubble `{text|content, type?}`
//!
//! The database is only ever opened read-only; Cursor itself is the writer.
//!
//! Three schema generations must be handled transparently:
//!
//! - **Legacy**: messages inline under `messages`/`conversationHistory`/
//!   `conversation` with `role|type` + `content|text|message` fields.
//! - **v9+**: `fullConversationHeadersOnly` carries `{bubbleId, type}` and
//!   the text lives in sibling `bubbleId:` rows.
//! - **Mixed**: a composer carrying both a legacy array and populated
//!   headers. The legacy array wins even when empty — counting 0 prompts is
//!   the documented behavior and is pinned by a test below.

use crate::error::{Error, Result};
use crate::types::{MessageRole, Session, SessionMessage, SessionSource, SessionStatus};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// SQLite read cap; a locked database fails the poll instead of hanging it.
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// Sessions older than this are not listed as active.
const ACTIVE_WINDOW_HOURS: i64 = 24;

/// Inline message array keys in precedence order.
const INLINE_ARRAY_KEYS: [&str; 3] = ["messages", "conversationHistory", "conversation"];

/// Abstract handle over the Cursor KV store so tests can inject fixtures.
pub trait CursorDatabase: Send + Sync {
    /// All `(composer_id, raw_json)` pairs from `composerData:*` keys.
    fn composer_entries(&self) -> Result<Vec<(String, String)>>;

    /// Raw JSON for a single composer, if present.
    fn composer(&self, composer_id: &str) -> Result<Option<String>>;

    /// Raw JSON for one bubble row.
    fn bubble(&self, composer_id: &str, bubble_id: &str) -> Result<Option<String>>;
}

/// Read-only rusqlite implementation over `state.vscdb`.
pub struct SqliteCursorDatabase {
    conn: Mutex<Connection>,
}

impl SqliteCursorDatabase {
    /// Open the database read-only. Fails if the file is missing.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Default location of Cursor's global storage database.
    pub fn default_path() -> Option<PathBuf> {
        let base = if cfg!(target_os = "macos") {
            dirs::home_dir()?.join("Library/Application Support/Cursor")
        } else if cfg!(target_os = "windows") {
            dirs::config_dir()?.join("Cursor")
        } else {
            dirs::config_dir()?.join("Cursor")
        };
        Some(base.join("User/globalStorage/state.vscdb"))
    }

    /// Fetch a KV value that may be stored as TEXT or BLOB.
    fn value_for_key(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("cursor db lock");
        let mut stmt = conn.prepare("SELECT value FROM cursorDiskKV WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => {
                let bytes: Vec<u8> = row
                    .get::<_, Vec<u8>>(0)
                    .or_else(|_| row.get::<_, String>(0).map(String::into_bytes))?;
                Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
            }
            None => Ok(None),
        }
    }
}

impl CursorDatabase for SqliteCursorDatabase {
    fn composer_entries(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().expect("cursor db lock");
        let mut stmt =
            conn.prepare("SELECT key, value FROM cursorDiskKV WHERE key LIKE 'composerData:%'")?;
        let rows = stmt.query_map([], |row| {
            let key: String = row.get(0)?;
            let bytes: Vec<u8> = row
                .get::<_, Vec<u8>>(1)
                .or_else(|_| row.get::<_, String>(1).map(String::into_bytes))?;
            Ok((key, bytes))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, bytes) = row?;
            let composer_id = key.trim_start_matches("composerData:").to_string();
            entries.push((composer_id, String::from_utf8_lossy(&bytes).into_owned()));
        }
        Ok(entries)
    }

    fn composer(&self, composer_id: &str) -> Result<Option<String>> {
        self.value_for_key(&format!("composerData:{}", composer_id))
    }

    fn bubble(&self, composer_id: &str, bubble_id: &str) -> Result<Option<String>> {
        self.value_for_key(&format!("bubbleId:{}:{}", composer_id, bubble_id))
    }
}

/// Session reader over a Cursor database handle.
pub struct CursorSessionReader {
    db: Box<dyn CursorDatabase>,
}

impl CursorSessionReader {
    pub fn new(db: Box<dyn CursorDatabase>) -> Self {
        Self { db }
    }

    /// Open a reader over the default Cursor database, if it exists.
    pub fn open_default() -> Result<Option<Self>> {
        let Some(path) = SqliteCursorDatabase::default_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::new(Box::new(SqliteCursorDatabase::open(&path)?))))
    }

    /// Composers with activity in the last 24 hours, most recent first.
    pub fn active_sessions(&self) -> Result<Vec<Session>> {
        let cutoff = Utc::now() - chrono::Duration::hours(ACTIVE_WINDOW_HOURS);
        let mut sessions = Vec::new();

        for (composer_id, raw) in self.db.composer_entries()? {
            let composer: Value = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(composer_id = %composer_id, error = %e, "Malformed composer JSON, skipping");
                    continue;
                }
            };
            let session = composer_to_session(&composer_id, &composer);
            if session.last_activity >= cutoff {
                sessions.push(session);
            }
        }

        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(sessions)
    }

    /// Look up one composer by id, regardless of age.
    pub fn session_by_id(&self, composer_id: &str) -> Result<Session> {
        let raw = self
            .db
            .composer(composer_id)?
            .ok_or_else(|| Error::SessionNotFound(composer_id.to_string()))?;
        let composer: Value = serde_json::from_str(&raw).map_err(|e| Error::Parse {
            tool: "cursor".to_string(),
            message: format!("composer {}: {}", composer_id, e),
        })?;
        Ok(composer_to_session(composer_id, &composer))
    }

    /// All messages for a composer, normalized and ordered.
    pub fn messages_for_session(&self, composer_id: &str) -> Result<Vec<SessionMessage>> {
        let raw = self
            .db
            .composer(composer_id)?
            .ok_or_else(|| Error::SessionNotFound(composer_id.to_string()))?;
        let composer: Value = serde_json::from_str(&raw).map_err(|e| Error::Parse {
            tool: "cursor".to_string(),
            message: format!("composer {}: {}", composer_id, e),
        })?;

        let base_ts = composer_updated_at(&composer).unwrap_or_else(Utc::now);

        // A present legacy array wins, even when empty
        if let Some(array) = inline_message_array(&composer) {
            return Ok(inline_messages(composer_id, array, base_ts));
        }

        let mut messages = Vec::new();
        if let Some(headers) = composer
            .get("fullConversationHeadersOnly")
            .and_then(Value::as_array)
        {
            for (idx, header) in headers.iter().enumerate() {
                let Some(bubble_id) = header.get("bubbleId").and_then(Value::as_str) else {
                    continue;
                };
                let role = match header.get("type").and_then(Value::as_i64) {
                    Some(1) => MessageRole::User,
                    _ => MessageRole::Assistant,
                };
                let content = match self.db.bubble(composer_id, bubble_id)? {
                    Some(raw_bubble) => serde_json::from_str::<Value>(&raw_bubble)
                        .ok()
                        .map(|b| bubble_text(&b))
                        .unwrap_or_default(),
                    None => String::new(),
                };

                messages.push(SessionMessage {
                    id: bubble_id.to_string(),
                    role,
                    content,
                    // Bubbles carry no timestamps; inherit the composer's
                    // updatedAt perturbed by index to keep ordering stable
                    timestamp: base_ts + chrono::Duration::milliseconds(idx as i64),
                    bubble_id: Some(bubble_id.to_string()),
                });
            }
        }
        Ok(messages)
    }
}

/// Count user prompts in a composer blob.
///
/// Precedence: `messages` → `conversationHistory` → `conversation` →
/// `fullConversationHeadersOnly` filtered by `type == 1` → legacy
/// `promptCount` field. Presence of a key decides, not emptiness.
pub fn extract_prompt_count(composer: &Value) -> usize {
    if let Some(array) = inline_message_array(composer) {
        return array.len();
    }

    if let Some(headers) = composer
        .get("fullConversationHeadersOnly")
        .and_then(Value::as_array)
    {
        return headers
            .iter()
            .filter(|h| h.get("type").and_then(Value::as_i64) == Some(1))
            .count();
    }

    composer
        .get("promptCount")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize
}

/// New-bubble user prompt ids from a v9+ composer, in header order.
pub fn user_bubble_ids(composer: &Value) -> Vec<String> {
    composer
        .get("fullConversationHeadersOnly")
        .and_then(Value::as_array)
        .map(|headers| {
            headers
                .iter()
                .filter(|h| h.get("type").and_then(Value::as_i64) == Some(1))
                .filter_map(|h| h.get("bubbleId").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Whether the composer uses the v9+ bubble schema.
pub fn has_bubble_headers(composer: &Value) -> bool {
    composer
        .get("fullConversationHeadersOnly")
        .and_then(Value::as_array)
        .is_some()
}

/// User message texts from a present inline array, in order. `None` when
/// the composer has no inline array at all (v9+ schema).
pub fn inline_user_texts(composer: &Value) -> Option<Vec<String>> {
    let array = inline_message_array(composer)?;
    Some(
        array
            .iter()
            .filter(|entry| {
                match entry.get("role").and_then(Value::as_str) {
                    Some(role) => role == "user",
                    None => entry.get("type").and_then(Value::as_i64) == Some(1),
                }
            })
            .map(|entry| {
                ["content", "text", "message"]
                    .iter()
                    .find_map(|k| entry.get(*k).and_then(Value::as_str))
                    .unwrap_or("")
                    .to_string()
            })
            .collect(),
    )
}

/// Millisecond-epoch `updatedAt` from a composer blob.
pub fn composer_updated_at(composer: &Value) -> Option<DateTime<Utc>> {
    composer
        .get("updatedAt")
        .and_then(Value::as_i64)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn composer_created_at(composer: &Value) -> Option<DateTime<Utc>> {
    composer
        .get("createdAt")
        .and_then(Value::as_i64)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn composer_to_session(composer_id: &str, composer: &Value) -> Session {
    let last_activity = composer_updated_at(composer).unwrap_or_else(Utc::now);
    let start_time = composer_created_at(composer).unwrap_or(last_activity);

    let workspace_name = composer
        .get("name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("Cursor workspace")
        .to_string();

    Session {
        id: composer_id.to_string(),
        source: SessionSource::Cursor,
        workspace_name,
        workspace_path: composer
            .get("workspacePath")
            .and_then(Value::as_str)
            .map(PathBuf::from),
        start_time: start_time.min(last_activity),
        last_activity,
        prompt_count: extract_prompt_count(composer),
        status: SessionStatus::from_last_activity(last_activity),
        highlights: None,
    }
}

/// The first inline message array present on a composer, if any.
fn inline_message_array(composer: &Value) -> Option<&Vec<Value>> {
    INLINE_ARRAY_KEYS
        .iter()
        .find_map(|key| composer.get(*key).and_then(Value::as_array))
}

fn inline_messages(
    composer_id: &str,
    array: &[Value],
    base_ts: DateTime<Utc>,
) -> Vec<SessionMessage> {
    array
        .iter()
        .enumerate()
        .map(|(idx, entry)| {
            let role = match entry.get("role").and_then(Value::as_str) {
                Some("user") => MessageRole::User,
                Some("assistant") => MessageRole::Assistant,
                _ => match entry.get("type").and_then(Value::as_i64) {
                    Some(1) => MessageRole::User,
                    _ => MessageRole::Assistant,
                },
            };
            let content = ["content", "text", "message"]
                .iter()
                .find_map(|k| entry.get(*k).and_then(Value::as_str))
                .unwrap_or("")
                .to_string();
            let timestamp = entry
                .get("timestamp")
                .and_then(Value::as_i64)
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or(base_ts + chrono::Duration::milliseconds(idx as i64));

            SessionMessage {
                id: format!("{}:{}", composer_id, idx),
                role,
                content,
                timestamp,
                bubble_id: None,
            }
        })
        .collect()
}

/// Extract bubble text from a `bubbleId:` row (`text` preferred over
/// `content`).
pub fn bubble_text(bubble: &Value) -> String {
    ["text", "content"]
        .iter()
        .find_map(|k| bubble.get(*k).and_then(Value::as_str))
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory CursorDatabase fixture.
    pub struct FakeCursorDatabase {
        pub composers: Mutex<HashMap<String, Value>>,
        pub bubbles: Mutex<HashMap<(String, String), Value>>,
    }

    impl FakeCursorDatabase {
        pub fn new() -> Self {
            Self {
                composers: Mutex::new(HashMap::new()),
                bubbles: Mutex::new(HashMap::new()),
            }
        }

        pub fn insert_composer(&self, id: &str, blob: Value) {
            self.composers.lock().unwrap().insert(id.to_string(), blob);
        }

        pub fn insert_bubble(&self, composer_id: &str, bubble_id: &str, blob: Value) {
            self.bubbles
                .lock()
                .unwrap()
                .insert((composer_id.to_string(), bubble_id.to_string()), blob);
        }
    }

    impl CursorDatabase for FakeCursorDatabase {
        fn composer_entries(&self) -> Result<Vec<(String, String)>> {
            Ok(self
                .composers
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect())
        }

        fn composer(&self, composer_id: &str) -> Result<Option<String>> {
            Ok(self
                .composers
                .lock()
                .unwrap()
                .get(composer_id)
                .map(Value::to_string))
        }

        fn bubble(&self, composer_id: &str, bubble_id: &str) -> Result<Option<String>> {
            Ok(self
                .bubbles
                .lock()
                .unwrap()
                .get(&(composer_id.to_string(), bubble_id.to_string()))
                .map(Value::to_string))
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[test]
    fn counts_legacy_array_length() {
        let composer = json!({
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "user", "content": "again"},
            ],
        });
        assert_eq!(extract_prompt_count(&composer), 2);
    }

    #[test]
    fn counts_headers_filtered_by_type() {
        let composer = json!({
            "fullConversationHeadersOnly": [
                {"bubbleId": "b1", "type": 1},
                {"bubbleId": "b2", "type": 2},
                {"bubbleId": "b3", "type": 1},
            ],
        });
        assert_eq!(extract_prompt_count(&composer), 2);
        assert_eq!(user_bubble_ids(&composer), vec!["b1", "b3"]);
    }

    #[test]
    fn counts_zero_when_legacy_array_empty() {
        // Documented precedence: a present legacy array wins even when empty,
        // so a v9+ composer that also carries an empty `conversation` reports
        // zero prompts. Do not change without backend coordination.
        let composer = json!({
            "conversation": [],
            "fullConversationHeadersOnly": [
                {"bubbleId": "b1", "type": 1},
            ],
        });
        assert_eq!(extract_prompt_count(&composer), 0);
    }

    #[test]
    fn falls_back_to_prompt_count_field() {
        assert_eq!(extract_prompt_count(&json!({"promptCount": 7})), 7);
        assert_eq!(extract_prompt_count(&json!({})), 0);
    }

    #[test]
    fn reads_v9_messages_from_bubbles() {
        let db = FakeCursorDatabase::new();
        db.insert_composer(
            "c1",
            json!({
                "updatedAt": now_ms(),
                "fullConversationHeadersOnly": [
                    {"bubbleId": "b1", "type": 1},
                    {"bubbleId": "b2", "type": 2},
                ],
            }),
        );
        db.insert_bubble("c1", "b1", json!({"text": "fix the login bug"}));
        db.insert_bubble("c1", "b2", json!({"text": "on it"}));

        let reader = CursorSessionReader::new(Box::new(db));
        let messages = reader.messages_for_session("c1").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "fix the login bug");
        assert_eq!(messages[0].bubble_id.as_deref(), Some("b1"));
        assert_eq!(messages[1].role, MessageRole::Assistant);
        // Perturbed timestamps preserve ordering
        assert!(messages[0].timestamp < messages[1].timestamp);
    }

    #[test]
    fn reads_legacy_inline_messages() {
        let db = FakeCursorDatabase::new();
        db.insert_composer(
            "c2",
            json!({
                "updatedAt": now_ms(),
                "conversationHistory": [
                    {"type": 1, "text": "add dark mode"},
                    {"type": 2, "text": "sure"},
                ],
            }),
        );

        let reader = CursorSessionReader::new(Box::new(db));
        let messages = reader.messages_for_session("c2").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "c2:0");
        assert_eq!(messages[0].content, "add dark mode");
        assert_eq!(messages[0].role, MessageRole::User);
    }

    #[test]
    fn active_sessions_sorted_and_windowed() {
        let db = FakeCursorDatabase::new();
        db.insert_composer("recent", json!({"updatedAt": now_ms(), "promptCount": 1}));
        db.insert_composer(
            "older",
            json!({"updatedAt": now_ms() - 60_000, "promptCount": 2}),
        );
        db.insert_composer(
            "ancient",
            json!({"updatedAt": now_ms() - 48 * 3600 * 1000, "promptCount": 3}),
        );

        let reader = CursorSessionReader::new(Box::new(db));
        let sessions = reader.active_sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].id, "recent");
        assert_eq!(sessions[1].id, "older");
        assert_eq!(sessions[0].source, SessionSource::Cursor);
    }

    #[test]
    fn session_by_id_missing_is_not_found() {
        let reader = CursorSessionReader::new(Box::new(FakeCursorDatabase::new()));
        assert!(matches!(
            reader.session_by_id("nope"),
            Err(Error::SessionNotFound(_))
        ));
    }
}
