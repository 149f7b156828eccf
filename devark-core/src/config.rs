//! Configuration store
//!
//! All writable state lives under `~/.devark/`:
//! - `config.json` — UTF-8 JSON config (token, apiUrl, activeProvider, providers.*)
//! - `.key` — 64 hex chars of AES key material, owner read-only
//! - `prompts.ndjson` — the detection queue appended by `devark-sync`
//! - `stores/` — key-value snapshots (history, daily stats, saved prompts)
//! - `logs/` — rolling log files
//!
//! `DEVARK_HOME` overrides the base directory (used heavily by tests).
//!
//! The config file is written atomically (temp + rename) and watched with a
//! 50 ms debounce so rapid editor saves coalesce into one change event.

use crate::error::{Error, Result};
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Debounce window for filesystem change events.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(50);

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Base directory for all devark state: `$DEVARK_HOME` or `~/.devark`.
pub fn devark_dir() -> PathBuf {
    std::env::var_os("DEVARK_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(".devark"))
}

/// Returns the config file path (`~/.devark/config.json`).
pub fn config_path() -> PathBuf {
    devark_dir().join("config.json")
}

/// Returns the encryption key file path (`~/.devark/.key`).
pub fn key_path() -> PathBuf {
    devark_dir().join(".key")
}

/// Returns the detection queue file appended by `devark-sync`.
pub fn queue_path() -> PathBuf {
    devark_dir().join("prompts.ndjson")
}

/// Returns the directory holding key-value store snapshots.
pub fn stores_dir() -> PathBuf {
    devark_dir().join("stores")
}

/// Returns the log directory.
pub fn log_dir() -> PathBuf {
    devark_dir().join("logs")
}

// ============================================
// Config model
// ============================================

/// Main configuration struct, persisted as `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Encrypted auth token as `iv:authTag:ciphertext`, all hex
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Cloud backend base URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Id of the active LLM provider (`ollama`, `openrouter`, `anthropic`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_provider: Option<String>,

    /// Per-provider settings keyed by provider id
    pub providers: HashMap<String, ProviderSettings>,

    /// Prompt detection settings
    pub detection: DetectionConfig,

    /// Logging settings
    pub logging: LoggingConfig,

    /// Unrecognized fields are preserved across writes
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Settings for a single LLM provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    /// API endpoint override (provider default when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Model to use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Reference resolved through the token store ("vault" for the
    /// encrypted token, or an env var name)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_ref: Option<String>,
}

/// Prompt detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectionConfig {
    /// Master switch; when false adapters are stopped but stay registered
    pub enabled: bool,
    /// Score prompts automatically as they are detected
    pub auto_analyze: bool,
    /// Cursor poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Same-text duplicate suppression window in milliseconds
    pub duplicate_window_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_analyze: true,
            poll_interval_ms: default_poll_interval(),
            duplicate_window_ms: default_duplicate_window(),
        }
    }
}

fn default_poll_interval() -> u64 {
    3_000
}

fn default_duplicate_window() -> u64 {
    2_000
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Maximum number of rotated log files to keep
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            max_files: 5,
        }
    }
}

// ============================================
// Config store
// ============================================

/// Shared handle to the on-disk config.
///
/// Loads once into an in-memory cache; every mutation rewrites the file
/// atomically. Clones share the same cache.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<ConfigStoreInner>,
}

struct ConfigStoreInner {
    path: PathBuf,
    cached: Mutex<Config>,
}

impl ConfigStore {
    /// Open the store at the default path, creating the data directory.
    pub fn open_default() -> Result<Self> {
        Self::open(&config_path())
    }

    /// Open the store at a specific path.
    ///
    /// A missing or unparsable file yields defaults rather than an error;
    /// the file is created on the first write.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let config = Self::read_config(path);
        Ok(Self {
            inner: Arc::new(ConfigStoreInner {
                path: path.to_path_buf(),
                cached: Mutex::new(config),
            }),
        })
    }

    fn read_config(path: &Path) -> Config {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Unparsable config, using defaults");
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }

    /// Current config snapshot.
    pub fn get(&self) -> Config {
        self.inner.cached.lock().expect("config lock").clone()
    }

    /// Mutate the config and persist it atomically.
    pub fn update<F>(&self, f: F) -> Result<Config>
    where
        F: FnOnce(&mut Config),
    {
        let mut cached = self.inner.cached.lock().expect("config lock");
        f(&mut cached);
        write_atomic(&self.inner.path, &*cached)?;
        Ok(cached.clone())
    }

    /// Re-read the file into the cache (used by the watcher).
    pub fn reload(&self) -> Config {
        let fresh = Self::read_config(&self.inner.path);
        let mut cached = self.inner.cached.lock().expect("config lock");
        *cached = fresh.clone();
        fresh
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Watch the config file for external changes.
    ///
    /// The callback receives the reloaded config. Events within 50 ms of the
    /// previous one are coalesced. The returned guard keeps the watcher
    /// alive; dropping it stops watching.
    pub fn watch<F>(&self, on_change: F) -> Result<ConfigWatcher>
    where
        F: Fn(Config) + Send + 'static,
    {
        let store = self.clone();
        let file_name = self
            .inner
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| Error::Config("config path has no file name".to_string()))?;
        let last_fire: Mutex<Option<Instant>> = Mutex::new(None);

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                let Ok(event) = res else { return };
                if !event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()))
                {
                    return;
                }

                let mut last = last_fire.lock().expect("watch lock");
                let now = Instant::now();
                if let Some(prev) = *last {
                    if now.duration_since(prev) < WATCH_DEBOUNCE {
                        return;
                    }
                }
                *last = Some(now);
                drop(last);

                on_change(store.reload());
            })
            .map_err(|e| Error::Config(format!("failed to create config watcher: {}", e)))?;

        // Watch the parent directory: atomic renames replace the file inode,
        // which a direct file watch would lose track of.
        let dir = self
            .inner
            .path
            .parent()
            .ok_or_else(|| Error::Config("config path has no parent".to_string()))?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Config(format!("failed to watch config dir: {}", e)))?;

        Ok(ConfigWatcher { _watcher: watcher })
    }
}

/// Guard that keeps a config watcher alive.
pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
}

/// Serialize and write JSON atomically: temp file in the same directory,
/// then rename over the target.
pub(crate) fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::open(&dir.path().join("config.json")).unwrap();
        let config = store.get();
        assert!(config.token.is_none());
        assert!(config.detection.enabled);
        assert_eq!(config.detection.poll_interval_ms, 3_000);
        assert_eq!(config.detection.duplicate_window_ms, 2_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_defaults_when_unparsable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = ConfigStore::open(&path).unwrap();
        assert!(store.get().active_provider.is_none());
    }

    #[test]
    fn test_update_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let store = ConfigStore::open(&path).unwrap();
        store
            .update(|c| {
                c.active_provider = Some("ollama".to_string());
                c.providers.insert(
                    "ollama".to_string(),
                    ProviderSettings {
                        endpoint: Some("http://localhost:11434".to_string()),
                        model: Some("llama3.2".to_string()),
                        api_key_ref: None,
                    },
                );
            })
            .unwrap();

        // A fresh store over the same file sees the write
        let reopened = ConfigStore::open(&path).unwrap();
        let config = reopened.get();
        assert_eq!(config.active_provider.as_deref(), Some("ollama"));
        assert_eq!(
            config.providers["ollama"].model.as_deref(),
            Some("llama3.2")
        );
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"futureFeature": {"x": 1}}"#).unwrap();

        let store = ConfigStore::open(&path).unwrap();
        store
            .update(|c| c.active_provider = Some("anthropic".to_string()))
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["futureFeature"]["x"], 1);
        assert_eq!(raw["activeProvider"], "anthropic");
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::open(&path).unwrap();
        store.update(|_| {}).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
