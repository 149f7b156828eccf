//! Cloud session sync
//!
//! Idempotent upload of recent sessions to the devark backend. The backend
//! answers a "known sessions" query keyed by
//! `(source, sessionId, lastMessageHash)`; only sessions whose fingerprint
//! is absent (or whose hash changed) are uploaded. Per-session failures are
//! reported without aborting the batch, and cancellation is checked
//! between sessions so an in-flight upload always runs to completion.

use crate::error::{Error, Result};
use crate::types::{Session, SessionMessage, SessionSource};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-session upload timeout.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a status query result is served from cache.
const STATUS_CACHE_TTL: Duration = Duration::from_secs(10);

/// Transient-failure retries per upload.
const MAX_RETRIES: usize = 3;

// ============================================
// Fingerprints
// ============================================

/// Dedupe key the backend understands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct SessionFingerprint {
    pub source: SessionSource,
    pub session_id: String,
    pub last_message_hash: String,
}

impl SessionFingerprint {
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.source, self.session_id, self.last_message_hash)
    }
}

/// Fingerprint a session by hashing its last message.
pub fn session_fingerprint(session: &Session, messages: &[SessionMessage]) -> SessionFingerprint {
    let mut hasher = Sha256::new();
    if let Some(last) = messages.last() {
        hasher.update(last.content.as_bytes());
        hasher.update(last.timestamp.to_rfc3339().as_bytes());
    }
    SessionFingerprint {
        source: session.source,
        session_id: session.id.clone(),
        last_message_hash: hex::encode(hasher.finalize()),
    }
}

// ============================================
// Backend
// ============================================

/// Sync backend interface; HTTP in production, scripted in tests.
pub trait SyncBackend: Send + Sync {
    /// Which of the given fingerprints the backend already has, as
    /// [`SessionFingerprint::key`] strings.
    fn known_sessions(&self, fingerprints: &[SessionFingerprint]) -> Result<HashSet<String>>;

    /// Upload one session with its messages.
    fn upload_session(&self, session: &Session, messages: &[SessionMessage]) -> Result<()>;
}

/// HTTP backend over the devark API.
pub struct HttpSyncBackend {
    base_url: String,
    http: reqwest::Client,
    runtime: tokio::runtime::Runtime,
}

impl HttpSyncBackend {
    /// Build a client with bearer auth from the token vault.
    pub fn new(base_url: &str, token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| Error::Auth(format!("invalid token for auth header: {e}")))?,
        );

        let http = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Sync(format!("failed to create HTTP client: {e}")))?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Sync(format!("failed to create runtime: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            runtime,
        })
    }

    fn post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        self.runtime.block_on(async {
            let url = format!("{}{}", self.base_url, path);
            let resp = self
                .http
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| Error::Sync(format!("HTTP request failed: {e}")))?;
            let status = resp.status();
            let text = resp
                .text()
                .await
                .map_err(|e| Error::Sync(format!("read body failed: {e}")))?;

            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(Error::Auth("backend rejected the token".to_string()));
            }
            if !status.is_success() {
                return Err(Error::Sync(format!(
                    "API error ({}): {}",
                    status.as_u16(),
                    text
                )));
            }
            if text.is_empty() {
                return Ok(serde_json::json!({}));
            }
            serde_json::from_str(&text).map_err(Error::from)
        })
    }

    /// Retry transient failures with exponential backoff.
    fn post_with_retry(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let mut delay = Duration::from_millis(500);
        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tracing::debug!(path, attempt, "Retrying sync request after {:?}", delay);
                std::thread::sleep(delay);
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }
            match self.post(path, body.clone()) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(path, error = %e, "Transient sync error");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Sync("max retries exceeded".to_string())))
    }
}

impl SyncBackend for HttpSyncBackend {
    fn known_sessions(&self, fingerprints: &[SessionFingerprint]) -> Result<HashSet<String>> {
        let body = serde_json::json!({ "sessions": fingerprints });
        let response = self.post_with_retry("/sync/known-sessions", body)?;

        let known: Vec<SessionFingerprint> = response
            .get("known")
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()?
            .unwrap_or_default();
        Ok(known.iter().map(SessionFingerprint::key).collect())
    }

    fn upload_session(&self, session: &Session, messages: &[SessionMessage]) -> Result<()> {
        let fingerprint = session_fingerprint(session, messages);
        let body = serde_json::json!({
            "session": session,
            "messages": messages,
            "fingerprint": fingerprint,
        });
        self.post_with_retry("/sync/sessions", body)?;
        Ok(())
    }
}

// ============================================
// Engine
// ============================================

/// Where the engine is in its status machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Success,
    Partial,
    Failed,
}

/// Filters applied to the candidate session list.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Restrict to sessions whose workspace name is in this set
    pub projects: Option<Vec<String>>,
    /// Only sessions with activity at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Only sessions with activity at or before this instant
    pub until: Option<DateTime<Utc>>,
}

/// Outcome of one sync batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub success: bool,
    pub sessions_uploaded: usize,
    pub sessions_skipped: usize,
    /// `(session_id, error)` per failed upload
    pub failures: Vec<(String, String)>,
    pub cancelled: bool,
}

/// Current status exposed to the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_outcome: Option<SyncState>,
    pub last_report: Option<SyncReport>,
}

struct EngineState {
    state: SyncState,
    last_outcome: Option<SyncState>,
    last_report: Option<SyncReport>,
    status_cache: Option<(Instant, SyncStatus)>,
}

/// Drives idempotent batched uploads against a backend.
pub struct SyncEngine {
    backend: Box<dyn SyncBackend>,
    state: Mutex<EngineState>,
}

impl SyncEngine {
    pub fn new(backend: Box<dyn SyncBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(EngineState {
                state: SyncState::Idle,
                last_outcome: None,
                last_report: None,
                status_cache: None,
            }),
        }
    }

    /// Run one sync batch.
    ///
    /// `progress` receives `(index, total, session_id)` before each upload.
    /// `cancel` is checked between sessions; setting it mid-upload lets the
    /// current upload finish (preserving idempotency on the backend).
    pub fn sync<F>(
        &self,
        candidates: &[(Session, Vec<SessionMessage>)],
        options: &SyncOptions,
        mut progress: F,
        cancel: &AtomicBool,
    ) -> Result<SyncReport>
    where
        F: FnMut(usize, usize, &str),
    {
        self.set_state(SyncState::Syncing);

        let selected: Vec<&(Session, Vec<SessionMessage>)> = candidates
            .iter()
            .filter(|(session, _)| Self::selected(session, options))
            .collect();

        let fingerprints: Vec<SessionFingerprint> = selected
            .iter()
            .map(|(session, messages)| session_fingerprint(session, messages))
            .collect();

        let known = match self.backend.known_sessions(&fingerprints) {
            Ok(known) => known,
            Err(e) => {
                self.finish(SyncState::Failed, None);
                return Err(e);
            }
        };

        let total = selected.len();
        let mut report = SyncReport {
            success: false,
            sessions_uploaded: 0,
            sessions_skipped: 0,
            failures: Vec::new(),
            cancelled: false,
        };

        for (i, (session, messages)) in selected.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                report.cancelled = true;
                break;
            }

            let fingerprint = &fingerprints[i];
            if known.contains(&fingerprint.key()) {
                report.sessions_skipped += 1;
                continue;
            }

            progress(i, total, &session.id);
            match self.backend.upload_session(session, messages) {
                Ok(()) => report.sessions_uploaded += 1,
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "Session upload failed");
                    report.failures.push((session.id.clone(), e.to_string()));
                }
            }
        }

        report.success = report.failures.is_empty() && !report.cancelled;
        let outcome = if report.cancelled {
            SyncState::Partial
        } else if report.failures.is_empty() {
            SyncState::Success
        } else if report.sessions_uploaded > 0 {
            SyncState::Partial
        } else {
            SyncState::Failed
        };
        self.finish(outcome, Some(report.clone()));

        Ok(report)
    }

    /// Current status; served from a 10-second cache so UI refresh bursts
    /// don't recompute anything.
    pub fn status(&self) -> SyncStatus {
        let mut state = self.state.lock().expect("sync state lock");
        if let Some((at, cached)) = &state.status_cache {
            if at.elapsed() < STATUS_CACHE_TTL {
                return cached.clone();
            }
        }
        let status = SyncStatus {
            state: state.state,
            last_outcome: state.last_outcome,
            last_report: state.last_report.clone(),
        };
        state.status_cache = Some((Instant::now(), status.clone()));
        status
    }

    fn selected(session: &Session, options: &SyncOptions) -> bool {
        if let Some(projects) = &options.projects {
            if !projects.iter().any(|p| p == &session.workspace_name) {
                return false;
            }
        }
        if let Some(since) = options.since {
            if session.last_activity < since {
                return false;
            }
        }
        if let Some(until) = options.until {
            if session.last_activity > until {
                return false;
            }
        }
        true
    }

    fn set_state(&self, new: SyncState) {
        let mut state = self.state.lock().expect("sync state lock");
        state.state = new;
        state.status_cache = None;
    }

    fn finish(&self, outcome: SyncState, report: Option<SyncReport>) {
        let mut state = self.state.lock().expect("sync state lock");
        state.state = SyncState::Idle;
        state.last_outcome = Some(outcome);
        if report.is_some() {
            state.last_report = report;
        }
        state.status_cache = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageRole, SessionStatus};
    use std::sync::atomic::AtomicUsize;

    fn session(id: &str, workspace: &str) -> (Session, Vec<SessionMessage>) {
        let now = Utc::now();
        let session = Session {
            id: id.to_string(),
            source: SessionSource::Claude,
            workspace_name: workspace.to_string(),
            workspace_path: None,
            start_time: now,
            last_activity: now,
            prompt_count: 1,
            status: SessionStatus::Active,
            highlights: None,
        };
        let messages = vec![SessionMessage {
            id: format!("{}:0", id),
            role: MessageRole::User,
            content: format!("prompt in {}", id),
            timestamp: now,
            bubble_id: None,
        }];
        (session, messages)
    }

    /// Backend double: a fixed set of known keys, a counter of uploads, and
    /// optional per-session failures.
    struct ScriptedBackend {
        known: HashSet<String>,
        uploads: AtomicUsize,
        fail_ids: Vec<String>,
    }

    impl ScriptedBackend {
        fn new(known: HashSet<String>) -> Self {
            Self {
                known,
                uploads: AtomicUsize::new(0),
                fail_ids: Vec::new(),
            }
        }
    }

    impl SyncBackend for ScriptedBackend {
        fn known_sessions(&self, _fps: &[SessionFingerprint]) -> Result<HashSet<String>> {
            Ok(self.known.clone())
        }
        fn upload_session(&self, session: &Session, _messages: &[SessionMessage]) -> Result<()> {
            if self.fail_ids.contains(&session.id) {
                return Err(Error::Sync("upload exploded".to_string()));
            }
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn uploads_only_unknown_sessions() {
        let candidates = vec![session("a", "app"), session("b", "app"), session("c", "app")];
        let known: HashSet<String> = candidates[..2]
            .iter()
            .map(|(s, m)| session_fingerprint(s, m).key())
            .collect();

        let engine = SyncEngine::new(Box::new(ScriptedBackend::new(known)));
        let cancel = AtomicBool::new(false);
        let report = engine
            .sync(&candidates, &SyncOptions::default(), |_, _, _| {}, &cancel)
            .unwrap();

        assert!(report.success);
        assert_eq!(report.sessions_uploaded, 1);
        assert_eq!(report.sessions_skipped, 2);
        assert!(report.failures.is_empty());
        assert_eq!(engine.status().last_outcome, Some(SyncState::Success));
        assert_eq!(engine.status().state, SyncState::Idle);
    }

    #[test]
    fn changed_hash_reuploads() {
        let (mut s, mut m) = session("a", "app");
        let old_key = session_fingerprint(&s, &m).key();
        // Session grew a message since the backend last saw it
        m.push(SessionMessage {
            id: "a:1".to_string(),
            role: MessageRole::Assistant,
            content: "new reply".to_string(),
            timestamp: Utc::now(),
            bubble_id: None,
        });
        s.prompt_count = 2;

        let engine = SyncEngine::new(Box::new(ScriptedBackend::new(
            [old_key].into_iter().collect(),
        )));
        let cancel = AtomicBool::new(false);
        let report = engine
            .sync(&[(s, m)], &SyncOptions::default(), |_, _, _| {}, &cancel)
            .unwrap();
        assert_eq!(report.sessions_uploaded, 1);
        assert_eq!(report.sessions_skipped, 0);
    }

    #[test]
    fn per_session_failures_do_not_abort_batch() {
        let candidates = vec![session("a", "app"), session("bad", "app"), session("c", "app")];
        let mut backend = ScriptedBackend::new(HashSet::new());
        backend.fail_ids.push("bad".to_string());

        let engine = SyncEngine::new(Box::new(backend));
        let cancel = AtomicBool::new(false);
        let report = engine
            .sync(&candidates, &SyncOptions::default(), |_, _, _| {}, &cancel)
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.sessions_uploaded, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "bad");
        assert_eq!(engine.status().last_outcome, Some(SyncState::Partial));
    }

    #[test]
    fn project_and_date_filters_apply() {
        let mut old = session("old", "app");
        old.0.last_activity = Utc::now() - chrono::Duration::days(60);
        let candidates = vec![session("a", "app"), session("x", "other"), old];

        let engine = SyncEngine::new(Box::new(ScriptedBackend::new(HashSet::new())));
        let cancel = AtomicBool::new(false);
        let options = SyncOptions {
            projects: Some(vec!["app".to_string()]),
            since: Some(Utc::now() - chrono::Duration::days(7)),
            until: None,
        };
        let report = engine
            .sync(&candidates, &options, |_, _, _| {}, &cancel)
            .unwrap();
        assert_eq!(report.sessions_uploaded, 1);
    }

    #[test]
    fn cancellation_checked_between_sessions() {
        let candidates = vec![session("a", "app"), session("b", "app")];
        let engine = SyncEngine::new(Box::new(ScriptedBackend::new(HashSet::new())));
        let cancel = AtomicBool::new(false);

        let mut first = true;
        let report = engine
            .sync(
                &candidates,
                &SyncOptions::default(),
                |_, _, _| {
                    // Cancel after the first upload starts
                    if first {
                        cancel.store(true, Ordering::SeqCst);
                        first = false;
                    }
                },
                &cancel,
            )
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.sessions_uploaded, 1);
        assert_eq!(engine.status().last_outcome, Some(SyncState::Partial));
    }

    #[test]
    fn status_is_cached() {
        let engine = SyncEngine::new(Box::new(ScriptedBackend::new(HashSet::new())));
        let first = engine.status();
        let second = engine.status();
        assert_eq!(first.state, second.state);
        assert_eq!(first.state, SyncState::Idle);
    }

    #[test]
    fn fingerprint_changes_with_last_message() {
        let (s, m) = session("a", "app");
        let fp1 = session_fingerprint(&s, &m);
        let mut m2 = m.clone();
        m2.push(SessionMessage {
            id: "a:1".to_string(),
            role: MessageRole::User,
            content: "more".to_string(),
            timestamp: Utc::now(),
            bubble_id: None,
        });
        let fp2 = session_fingerprint(&s, &m2);
        assert_ne!(fp1.key(), fp2.key());
    }
}
