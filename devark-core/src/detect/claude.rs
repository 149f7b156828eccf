//! Claude Code hook adapter
//!
//! Claude Code has a first-class hook mechanism, so no polling of its data
//! is needed: installed `UserPromptSubmit`/`Stop` hooks shell out to the
//! `devark-sync` binary, which extracts the prompt from the hook's stdin
//! payload and appends one NDJSON line to a queue file under the devark
//! data directory. This adapter owns the read side of that queue: it tails
//! the file with a byte-offset checkpoint and emits one event per appended
//! prompt line.
//!
//! A truncated queue (offset beyond file size) resets the checkpoint to
//! zero; an incomplete trailing line is left for the next poll.

use crate::detect::{hooks, ToolAdapter};
use crate::error::Result;
use crate::types::{PromptDetectedEvent, SessionSource};
use chrono::{DateTime, Utc};
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The hook trigger that carries a prompt.
pub const TRIGGER_USER_PROMPT_SUBMIT: &str = "UserPromptSubmit";

/// The hook trigger fired when a turn completes.
pub const TRIGGER_STOP: &str = "Stop";

/// One line of the detection queue, written by `devark-sync` and read by
/// this adapter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueRecord {
    pub session_id: Option<String>,
    pub prompt: Option<String>,
    pub cwd: Option<String>,
    pub ts: Option<String>,
    pub trigger: Option<String>,
}

impl QueueRecord {
    /// Build a record from a hook's stdin payload.
    ///
    /// Claude Code hook payloads are JSON objects; the fields we care about
    /// have shifted names across versions, so several spellings are
    /// accepted. A payload that is not JSON at all is treated as the raw
    /// prompt text.
    pub fn from_hook_payload(trigger: &str, payload: &str) -> Self {
        let parsed: Option<serde_json::Value> = serde_json::from_str(payload.trim()).ok();

        let field = |names: &[&str]| -> Option<String> {
            let value = parsed.as_ref()?;
            names
                .iter()
                .find_map(|n| value.get(*n).and_then(serde_json::Value::as_str))
                .map(str::to_string)
        };

        let prompt = field(&["prompt", "userPrompt", "user_prompt", "text"]).or_else(|| {
            if parsed.is_none() && !payload.trim().is_empty() {
                Some(payload.trim().to_string())
            } else {
                None
            }
        });

        Self {
            session_id: field(&["sessionId", "session_id"]),
            prompt,
            cwd: field(&["cwd"]),
            ts: Some(Utc::now().to_rfc3339()),
            trigger: Some(trigger.to_string()),
        }
    }
}

/// Append one record to the queue file, creating it if needed.
pub fn append_queue_record(path: &Path, record: &QueueRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", serde_json::to_string(record)?)?;
    Ok(())
}

/// Where to install the hook scripts on adapter initialization.
#[derive(Debug, Clone)]
pub struct HookInstall {
    /// Project directory whose `.claude/settings.json` receives the hooks
    pub project_dir: PathBuf,
    /// Absolute path of the `devark-sync` binary the hooks invoke
    pub sync_binary: PathBuf,
}

/// Queue-tailing adapter fed by the Claude Code hook scripts.
pub struct ClaudeHookAdapter {
    queue_path: PathBuf,
    install: Option<HookInstall>,
    offset: u64,
    available: bool,
    started: bool,
    dirty: Arc<AtomicBool>,
    watcher: Option<notify::RecommendedWatcher>,
}

impl ClaudeHookAdapter {
    /// Adapter over the default queue path.
    pub fn new(install: Option<HookInstall>) -> Self {
        Self::with_queue(crate::config::queue_path(), install)
    }

    /// Adapter over a specific queue file (for tests).
    pub fn with_queue(queue_path: PathBuf, install: Option<HookInstall>) -> Self {
        Self {
            queue_path,
            install,
            offset: 0,
            available: false,
            started: false,
            dirty: Arc::new(AtomicBool::new(true)),
            watcher: None,
        }
    }

    fn read_new_lines(&mut self) -> Result<Vec<String>> {
        let len = match std::fs::metadata(&self.queue_path) {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(Vec::new()),
        };

        if len < self.offset {
            tracing::warn!(
                path = %self.queue_path.display(),
                offset = self.offset,
                len,
                "Queue truncated, re-reading from start"
            );
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.queue_path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;

        // Stop cleanly before an incomplete trailing line; it will be
        // complete by the next poll
        let complete = match buf.rfind('\n') {
            Some(idx) => &buf[..=idx],
            None => return Ok(Vec::new()),
        };
        self.offset += complete.len() as u64;

        Ok(complete
            .lines()
            .map(str::to_string)
            .filter(|l| !l.trim().is_empty())
            .collect())
    }
}

impl ToolAdapter for ClaudeHookAdapter {
    fn source(&self) -> SessionSource {
        SessionSource::Claude
    }

    fn initialize(&mut self) -> Result<()> {
        if let Some(parent) = self.queue_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !self.queue_path.exists() {
            File::create(&self.queue_path)?;
        }

        // Hook installation failure degrades to manual `install-hooks`,
        // not to an unavailable adapter: the queue may already be fed
        if let Some(install) = &self.install {
            if let Err(e) = hooks::install_claude_hooks(&install.project_dir, &install.sync_binary)
            {
                tracing::warn!(error = %e, "Claude hook installation failed");
            }
        }

        // Only appends after initialization are new prompts
        self.offset = std::fs::metadata(&self.queue_path).map(|m| m.len()).unwrap_or(0);
        self.available = true;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;

        let dirty = self.dirty.clone();
        let file_name = self
            .queue_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()))
                {
                    dirty.store(true, Ordering::SeqCst);
                }
            }
        });

        match watcher {
            Ok(mut w) => {
                if let Some(dir) = self.queue_path.parent() {
                    if let Err(e) = w.watch(dir, RecursiveMode::NonRecursive) {
                        tracing::warn!(error = %e, "Queue watch failed, relying on polls");
                    }
                }
                self.watcher = Some(w);
            }
            Err(e) => {
                // Polling still reads appends; the watcher is just a nudge
                tracing::warn!(error = %e, "Could not create queue watcher");
            }
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.watcher = None;
        self.started = false;
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn poll(&mut self) -> Result<Vec<PromptDetectedEvent>> {
        if !self.started || !self.available {
            return Ok(Vec::new());
        }
        self.dirty.store(false, Ordering::SeqCst);

        let mut events = Vec::new();
        for line in self.read_new_lines()? {
            let record: QueueRecord = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed queue line, skipping");
                    continue;
                }
            };

            let trigger = record.trigger.as_deref().unwrap_or(TRIGGER_USER_PROMPT_SUBMIT);
            if trigger != TRIGGER_USER_PROMPT_SUBMIT {
                continue;
            }
            let Some(text) = record.prompt else {
                continue;
            };

            let timestamp = record
                .ts
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            events.push(PromptDetectedEvent {
                source: SessionSource::Claude,
                session_id: record
                    .session_id
                    .unwrap_or_else(|| "unknown".to_string()),
                text,
                timestamp,
                context: Some(serde_json::json!({
                    "cwd": record.cwd,
                    "trigger": trigger,
                })),
                skip_reason: None,
            });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn adapter_over(dir: &TempDir) -> (ClaudeHookAdapter, PathBuf) {
        let queue = dir.path().join("prompts.ndjson");
        let mut adapter = ClaudeHookAdapter::with_queue(queue.clone(), None);
        adapter.initialize().unwrap();
        adapter.start().unwrap();
        (adapter, queue)
    }

    fn push(queue: &Path, session: &str, prompt: &str, trigger: &str) {
        append_queue_record(
            queue,
            &QueueRecord {
                session_id: Some(session.to_string()),
                prompt: Some(prompt.to_string()),
                cwd: Some("/home/dev/app".to_string()),
                ts: Some(Utc::now().to_rfc3339()),
                trigger: Some(trigger.to_string()),
            },
        )
        .unwrap();
    }

    #[test]
    fn emits_events_for_appended_prompts() {
        let dir = TempDir::new().unwrap();
        let (mut adapter, queue) = adapter_over(&dir);

        assert!(adapter.poll().unwrap().is_empty());

        push(&queue, "s1", "refactor the parser", TRIGGER_USER_PROMPT_SUBMIT);
        push(&queue, "s1", "", TRIGGER_STOP);

        let events = adapter.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, SessionSource::Claude);
        assert_eq!(events[0].session_id, "s1");
        assert_eq!(events[0].text, "refactor the parser");

        // Already-consumed lines are not re-emitted
        assert!(adapter.poll().unwrap().is_empty());
    }

    #[test]
    fn existing_content_is_not_replayed() {
        let dir = TempDir::new().unwrap();
        let queue = dir.path().join("prompts.ndjson");
        push(&queue, "old", "historic prompt", TRIGGER_USER_PROMPT_SUBMIT);

        let mut adapter = ClaudeHookAdapter::with_queue(queue.clone(), None);
        adapter.initialize().unwrap();
        adapter.start().unwrap();

        assert!(adapter.poll().unwrap().is_empty());
        push(&queue, "new", "fresh prompt", TRIGGER_USER_PROMPT_SUBMIT);
        let events = adapter.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id, "new");
    }

    #[test]
    fn truncation_resets_checkpoint() {
        let dir = TempDir::new().unwrap();
        let (mut adapter, queue) = adapter_over(&dir);

        push(&queue, "s1", "one", TRIGGER_USER_PROMPT_SUBMIT);
        assert_eq!(adapter.poll().unwrap().len(), 1);

        // Queue rotated out from under us
        std::fs::write(&queue, "").unwrap();
        push(&queue, "s1", "two", TRIGGER_USER_PROMPT_SUBMIT);

        let events = adapter.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text, "two");
    }

    #[test]
    fn incomplete_trailing_line_waits() {
        let dir = TempDir::new().unwrap();
        let (mut adapter, queue) = adapter_over(&dir);

        let mut file = OpenOptions::new().append(true).open(&queue).unwrap();
        write!(file, r#"{{"sessionId":"s1","prompt":"half"#).unwrap();
        assert!(adapter.poll().unwrap().is_empty());

        writeln!(file, r#"","trigger":"UserPromptSubmit"}}"#).unwrap();
        let events = adapter.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text, "half");
    }

    #[test]
    fn hook_payload_extraction() {
        let record = QueueRecord::from_hook_payload(
            TRIGGER_USER_PROMPT_SUBMIT,
            r#"{"session_id":"abc","prompt":"do the thing","cwd":"/w"}"#,
        );
        assert_eq!(record.session_id.as_deref(), Some("abc"));
        assert_eq!(record.prompt.as_deref(), Some("do the thing"));
        assert_eq!(record.cwd.as_deref(), Some("/w"));

        // Raw text payloads are treated as the prompt itself
        let raw = QueueRecord::from_hook_payload(TRIGGER_USER_PROMPT_SUBMIT, "plain words");
        assert_eq!(raw.prompt.as_deref(), Some("plain words"));

        // Camel-case variant
        let camel = QueueRecord::from_hook_payload(
            TRIGGER_USER_PROMPT_SUBMIT,
            r#"{"sessionId":"x","userPrompt":"hello"}"#,
        );
        assert_eq!(camel.session_id.as_deref(), Some("x"));
        assert_eq!(camel.prompt.as_deref(), Some("hello"));
    }

    #[test]
    fn installs_hooks_on_initialize() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("project");
        std::fs::create_dir_all(&project).unwrap();

        let mut adapter = ClaudeHookAdapter::with_queue(
            dir.path().join("q.ndjson"),
            Some(HookInstall {
                project_dir: project.clone(),
                sync_binary: PathBuf::from("/usr/local/bin/devark-sync"),
            }),
        );
        adapter.initialize().unwrap();

        let settings_path = crate::detect::hooks::claude_settings_path(&project);
        assert!(settings_path.exists());
        let settings: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(settings_path).unwrap()).unwrap();
        assert!(settings["hooks"]["UserPromptSubmit"].is_array());
        assert!(settings["hooks"]["Stop"].is_array());
    }
}
