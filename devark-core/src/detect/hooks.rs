//! Hook script installation
//!
//! Claude Code invokes hooks declared in a per-project
//! `.claude/settings.json` using a matcher-group format:
//!
//! ```text
//! hooks[event] → [matcher_group] → hooks → [handler]
//! ```
//!
//! Cursor reads a flatter per-project `.cursor/hooks.json`:
//!
//! ```text
//! {"version": 1, "hooks": {"<event>": [{"command": "<cmd>"}], ...}}
//! ```
//!
//! Both files belong to the user, so installation merges instead of
//! replacing: existing entries are preserved, our entries are recognized by
//! the sync binary name in the command, and writes are atomic because both
//! tools skip files with JSON errors entirely.

use crate::error::{Error, Result};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// Marker present in every command we install.
const SYNC_BINARY: &str = "devark-sync";

/// Claude hook events we register.
const CLAUDE_EVENTS: [&str; 2] = ["UserPromptSubmit", "Stop"];

/// Cursor hook events we register (optional redundancy; polling is the
/// source of truth).
const CURSOR_EVENTS: [&str; 2] = ["beforeSubmitPrompt", "stop"];

fn hook_command(binary: &Path, trigger: &str) -> String {
    format!("{} --hook-trigger={}", binary.display(), trigger)
}

fn is_our_command(value: &Value) -> bool {
    value
        .get("command")
        .and_then(Value::as_str)
        .map(|c| c.contains(SYNC_BINARY))
        .unwrap_or(false)
}

fn read_json_or_default(path: &Path) -> Value {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|_| json!({})),
        Err(_) => json!({}),
    }
}

fn write_json_atomic(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(value)?;
    // Validate before writing: a broken file disables every hook, not just ours
    serde_json::from_str::<Value>(&content)
        .map_err(|e| Error::Config(format!("generated invalid hook JSON: {}", e)))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Path of the Claude settings file for a project.
pub fn claude_settings_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".claude").join("settings.json")
}

/// Path of the Cursor hooks file for a project.
pub fn cursor_hooks_path(project_dir: &Path) -> PathBuf {
    project_dir.join(".cursor").join("hooks.json")
}

/// Install devark hooks into a project's `.claude/settings.json`.
///
/// Merged, not replaced; existing hook entries are preserved and repeat
/// installation is a no-op. Returns whether the file changed.
pub fn install_claude_hooks(project_dir: &Path, sync_binary: &Path) -> Result<bool> {
    let path = claude_settings_path(project_dir);
    let mut settings = read_json_or_default(&path);

    if settings.get("hooks").is_none() {
        settings["hooks"] = json!({});
    }
    let hooks = settings["hooks"]
        .as_object_mut()
        .ok_or_else(|| Error::Config("settings.json hooks is not an object".to_string()))?;

    let mut changed = false;
    for event in CLAUDE_EVENTS {
        let entries = hooks.entry(event.to_string()).or_insert_with(|| json!([]));
        let Some(array) = entries.as_array_mut() else {
            continue;
        };

        let already_installed = array.iter().any(|group| {
            group
                .get("hooks")
                .and_then(Value::as_array)
                .map(|handlers| handlers.iter().any(is_our_command))
                .unwrap_or(false)
        });
        if already_installed {
            continue;
        }

        array.push(json!({
            "hooks": [{
                "type": "command",
                "command": hook_command(sync_binary, event),
            }]
        }));
        changed = true;
    }

    if changed {
        write_json_atomic(&path, &settings)?;
        tracing::info!(path = %path.display(), "Installed Claude hooks");
    }
    Ok(changed)
}

/// Remove devark hooks from a project's `.claude/settings.json`.
pub fn remove_claude_hooks(project_dir: &Path) -> Result<bool> {
    let path = claude_settings_path(project_dir);
    if !path.exists() {
        return Ok(false);
    }
    let mut settings = read_json_or_default(&path);

    let mut changed = false;
    if let Some(hooks) = settings.get_mut("hooks").and_then(Value::as_object_mut) {
        for (_event, entries) in hooks.iter_mut() {
            if let Some(array) = entries.as_array_mut() {
                let before = array.len();
                array.retain(|group| {
                    !group
                        .get("hooks")
                        .and_then(Value::as_array)
                        .map(|handlers| handlers.iter().any(is_our_command))
                        .unwrap_or(false)
                });
                changed |= array.len() != before;
            }
        }
    }

    if changed {
        write_json_atomic(&path, &settings)?;
    }
    Ok(changed)
}

/// Install devark hooks into a project's `.cursor/hooks.json`.
///
/// Deep-merge by event name, append within arrays, preserve an existing
/// `version`. Returns whether the file changed.
pub fn install_cursor_hooks(project_dir: &Path, sync_binary: &Path) -> Result<bool> {
    let path = cursor_hooks_path(project_dir);
    let mut root = read_json_or_default(&path);

    if root.get("version").is_none() {
        root["version"] = json!(1);
    }
    if root.get("hooks").is_none() {
        root["hooks"] = json!({});
    }
    let hooks = root["hooks"]
        .as_object_mut()
        .ok_or_else(|| Error::Config("hooks.json hooks is not an object".to_string()))?;

    let mut changed = false;
    for event in CURSOR_EVENTS {
        let entries = hooks.entry(event.to_string()).or_insert_with(|| json!([]));
        let Some(array) = entries.as_array_mut() else {
            continue;
        };
        if array.iter().any(is_our_command) {
            continue;
        }
        array.push(json!({ "command": hook_command(sync_binary, event) }));
        changed = true;
    }

    if changed {
        write_json_atomic(&path, &root)?;
        tracing::info!(path = %path.display(), "Installed Cursor hooks");
    }
    Ok(changed)
}
