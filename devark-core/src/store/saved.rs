//! Saved prompt library
//!
//! User-curated prompts with tags, folders, and an optional project scope
//! (`project_id = None` means global). Hard cap of 500 with a soft warning
//! once 400 is crossed.

use crate::error::{Error, Result};
use crate::store::{KeyValueStore, KEY_SAVED_PROMPTS};
use crate::types::SavedPrompt;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

const MAX_SAVED: usize = 500;
const SOFT_WARN_AT: usize = 400;

/// Result of a save, carrying the soft-cap warning.
#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub prompt: SavedPrompt,
    /// True once the library holds more than 400 prompts
    pub near_cap: bool,
}

/// Saved prompts over a key-value store.
pub struct SavedPromptStore {
    kv: Arc<dyn KeyValueStore>,
    prompts: Mutex<Vec<SavedPrompt>>,
}

impl SavedPromptStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn initialize(&self) -> Result<()> {
        let mut prompts = self.prompts.lock().expect("saved lock");
        *prompts = match self.kv.get(KEY_SAVED_PROMPTS)? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Unparsable saved prompts, starting fresh");
                Vec::new()
            }),
            None => Vec::new(),
        };
        Ok(())
    }

    /// Save a new prompt. Fails with a quota error at the hard cap.
    pub fn save(
        &self,
        text: &str,
        tags: Vec<String>,
        folder: Option<String>,
        project_id: Option<String>,
    ) -> Result<SaveOutcome> {
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("prompt text must not be empty".to_string()));
        }

        let mut prompts = self.prompts.lock().expect("saved lock");
        if prompts.len() >= MAX_SAVED {
            return Err(Error::Quota(format!(
                "saved prompt limit of {} reached",
                MAX_SAVED
            )));
        }

        let now = Utc::now();
        let prompt = SavedPrompt {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            tags,
            folder,
            project_id,
            created_at: now,
            last_modified_at: now,
        };
        prompts.push(prompt.clone());
        self.persist(&prompts)?;

        Ok(SaveOutcome {
            prompt,
            near_cap: prompts.len() > SOFT_WARN_AT,
        })
    }

    /// Update text/tags/folder of an existing prompt.
    pub fn update(
        &self,
        id: &str,
        text: Option<String>,
        tags: Option<Vec<String>>,
        folder: Option<Option<String>>,
    ) -> Result<SavedPrompt> {
        let mut prompts = self.prompts.lock().expect("saved lock");
        let prompt = prompts
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::InvalidInput(format!("unknown saved prompt: {}", id)))?;

        if let Some(text) = text {
            prompt.text = text;
        }
        if let Some(tags) = tags {
            prompt.tags = tags;
        }
        if let Some(folder) = folder {
            prompt.folder = folder;
        }
        prompt.last_modified_at = Utc::now();

        let updated = prompt.clone();
        self.persist(&prompts)?;
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut prompts = self.prompts.lock().expect("saved lock");
        let before = prompts.len();
        prompts.retain(|p| p.id != id);
        let removed = prompts.len() != before;
        if removed {
            self.persist(&prompts)?;
        }
        Ok(removed)
    }

    /// Prompts visible in a project: its own plus the global ones.
    pub fn list(&self, project_id: Option<&str>) -> Vec<SavedPrompt> {
        self.prompts
            .lock()
            .expect("saved lock")
            .iter()
            .filter(|p| match (&p.project_id, project_id) {
                (None, _) => true,
                (Some(own), Some(wanted)) => own == wanted,
                (Some(_), None) => false,
            })
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.prompts.lock().expect("saved lock").len()
    }

    /// All tags in use, deduplicated and sorted.
    pub fn tags(&self) -> Vec<String> {
        let prompts = self.prompts.lock().expect("saved lock");
        let set: BTreeSet<String> = prompts.iter().flat_map(|p| p.tags.iter().cloned()).collect();
        set.into_iter().collect()
    }

    /// All folders in use, deduplicated and sorted.
    pub fn folders(&self) -> Vec<String> {
        let prompts = self.prompts.lock().expect("saved lock");
        let set: BTreeSet<String> = prompts.iter().filter_map(|p| p.folder.clone()).collect();
        set.into_iter().collect()
    }

    pub fn by_tag(&self, tag: &str) -> Vec<SavedPrompt> {
        self.prompts
            .lock()
            .expect("saved lock")
            .iter()
            .filter(|p| p.tags.iter().any(|t| t == tag))
            .cloned()
            .collect()
    }

    pub fn by_folder(&self, folder: &str) -> Vec<SavedPrompt> {
        self.prompts
            .lock()
            .expect("saved lock")
            .iter()
            .filter(|p| p.folder.as_deref() == Some(folder))
            .cloned()
            .collect()
    }

    /// Case-insensitive substring search across text and tags.
    pub fn search(&self, query: &str) -> Vec<SavedPrompt> {
        let needle = query.to_lowercase();
        self.prompts
            .lock()
            .expect("saved lock")
            .iter()
            .filter(|p| {
                p.text.to_lowercase().contains(&needle)
                    || p.tags.iter().any(|t| t.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect()
    }

    fn persist(&self, prompts: &[SavedPrompt]) -> Result<()> {
        self.kv
            .set(KEY_SAVED_PROMPTS, &serde_json::to_string(prompts)?)
    }
}
