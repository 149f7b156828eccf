//! Prompt history and daily stats
//!
//! History is a FIFO bounded to 100 entries; anything older than 30 days is
//! purged when the store initializes. Daily stats reset whenever the stored
//! reset date is not today, and the average is recomputed from today's
//! prompts on every write.

use crate::error::Result;
use crate::store::{KeyValueStore, KEY_DAILY_STATS, KEY_PROMPT_HISTORY};
use crate::types::{AnalyzedPrompt, DailyStats};
use chrono::Utc;
use std::sync::{Arc, Mutex};

const MAX_HISTORY: usize = 100;
const MAX_AGE_DAYS: i64 = 30;

struct HistoryState {
    prompts: Vec<AnalyzedPrompt>,
    stats: DailyStats,
}

/// Bounded prompt history over a key-value store.
///
/// Mutations serialize through one lock, so concurrent `add_prompt` calls
/// are linearized: each write persists the snapshot it observed plus its
/// own entry.
pub struct PromptHistoryStore {
    kv: Arc<dyn KeyValueStore>,
    state: Mutex<HistoryState>,
}

impl PromptHistoryStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            state: Mutex::new(HistoryState {
                prompts: Vec::new(),
                stats: DailyStats::default(),
            }),
        }
    }

    /// Load persisted state, purge expired entries, and reset stale daily
    /// stats.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock().expect("history lock");

        state.prompts = match self.kv.get(KEY_PROMPT_HISTORY)? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Unparsable prompt history, starting fresh");
                Vec::new()
            }),
            None => Vec::new(),
        };
        state.stats = match self.kv.get(KEY_DAILY_STATS)? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            None => DailyStats::default(),
        };

        let before = state.prompts.len();
        let cutoff = Utc::now() - chrono::Duration::days(MAX_AGE_DAYS);
        state.prompts.retain(|p| p.timestamp >= cutoff);
        state.prompts.truncate(MAX_HISTORY);

        let purged = before != state.prompts.len();
        let reset = self.roll_daily_stats(&mut state);
        if purged || reset {
            self.persist(&state)?;
        }
        Ok(())
    }

    /// Prepend a scored prompt, trim to the cap, and refresh daily stats.
    pub fn add_prompt(&self, prompt: AnalyzedPrompt) -> Result<()> {
        let mut state = self.state.lock().expect("history lock");

        state.prompts.insert(0, prompt);
        state.prompts.truncate(MAX_HISTORY);

        self.roll_daily_stats(&mut state);
        state.stats.analyzed_today += 1;
        state.stats.avg_score = Self::todays_average(&state.prompts);

        self.persist(&state)
    }

    /// Most recent first.
    pub fn history(&self) -> Vec<AnalyzedPrompt> {
        self.state.lock().expect("history lock").prompts.clone()
    }

    pub fn daily_stats(&self) -> DailyStats {
        self.state.lock().expect("history lock").stats.clone()
    }

    /// Drop all history and today's counters.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().expect("history lock");
        state.prompts.clear();
        state.stats = DailyStats::default();
        self.persist(&state)
    }

    /// Reset stats when the calendar day rolled over. Returns whether a
    /// reset happened.
    fn roll_daily_stats(&self, state: &mut HistoryState) -> bool {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if state.stats.last_reset_date == today {
            return false;
        }
        state.stats = DailyStats {
            analyzed_today: 0,
            avg_score: 0.0,
            last_reset_date: today,
        };
        true
    }

    fn todays_average(prompts: &[AnalyzedPrompt]) -> f64 {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let todays: Vec<f64> = prompts
            .iter()
            .filter(|p| p.timestamp.format("%Y-%m-%d").to_string() == today)
            .map(|p| p.score)
            .collect();
        if todays.is_empty() {
            return 0.0;
        }
        let avg = todays.iter().sum::<f64>() / todays.len() as f64;
        (avg * 10.0).round() / 10.0
    }

    fn persist(&self, state: &HistoryState) -> Result<()> {
        self.kv
            .set(KEY_PROMPT_HISTORY, &serde_json::to_string(&state.prompts)?)?;
        self.kv
            .set(KEY_DAILY_STATS, &serde_json::to_string(&state.stats)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyValueStore;
    use chrono::{DateTime, Duration, Utc};

    fn prompt_at(score: f64, timestamp: DateTime<Utc>) -> AnalyzedPrompt {
        AnalyzedPrompt {
            id: uuid::Uuid::new_v4().to_string(),
            text: "test prompt".to_string(),
            truncated_text: "test prompt".to_string(),
            score,
            timestamp,
            category_scores: None,
            breakdown: None,
            improved_version: None,
            improved_score: None,
            source: None,
            session_id: None,
        }
    }

    fn store() -> (Arc<MemoryKeyValueStore>, PromptHistoryStore) {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let store = PromptHistoryStore::new(kv.clone());
        store.initialize().unwrap();
        (kv, store)
    }

    #[test]
    fn prepends_and_caps_at_one_hundred() {
        let (_kv, store) = store();
        for i in 0..120 {
            store.add_prompt(prompt_at(i as f64 % 10.0, Utc::now())).unwrap();
        }
        let history = store.history();
        assert_eq!(history.len(), 100);
        // Most recent first
        assert!((history[0].score - (119 % 10) as f64).abs() < f64::EPSILON);
    }

    #[test]
    fn initialize_purges_old_entries() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let old = prompt_at(5.0, Utc::now() - Duration::days(45));
        let fresh = prompt_at(7.0, Utc::now());
        kv.set(
            KEY_PROMPT_HISTORY,
            &serde_json::to_string(&vec![fresh.clone(), old]).unwrap(),
        )
        .unwrap();

        let store = PromptHistoryStore::new(kv.clone());
        store.initialize().unwrap();

        let history = store.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, fresh.id);

        // The purge is persisted, not just in memory
        let persisted: Vec<AnalyzedPrompt> =
            serde_json::from_str(&kv.get(KEY_PROMPT_HISTORY).unwrap().unwrap()).unwrap();
        assert_eq!(persisted.len(), 1);
    }

    #[test]
    fn daily_stats_track_todays_average() {
        let (_kv, store) = store();
        store.add_prompt(prompt_at(6.0, Utc::now())).unwrap();
        store.add_prompt(prompt_at(8.0, Utc::now())).unwrap();

        let stats = store.daily_stats();
        assert_eq!(stats.analyzed_today, 2);
        assert!((stats.avg_score - 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stale_reset_date_resets_on_initialize() {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let stale = DailyStats {
            analyzed_today: 12,
            avg_score: 9.1,
            last_reset_date: "2001-01-01".to_string(),
        };
        kv.set(KEY_DAILY_STATS, &serde_json::to_string(&stale).unwrap())
            .unwrap();

        let store = PromptHistoryStore::new(kv);
        store.initialize().unwrap();

        let stats = store.daily_stats();
        assert_eq!(stats.analyzed_today, 0);
        assert!((stats.avg_score - 0.0).abs() < f64::EPSILON);
        assert_eq!(
            stats.last_reset_date,
            Utc::now().format("%Y-%m-%d").to_string()
        );
    }

    #[test]
    fn yesterdays_prompts_do_not_skew_average()  {
        let (_kv, store) = store();
        store
            .add_prompt(prompt_at(1.0, Utc::now() - Duration::days(1)))
            .unwrap();
        store.add_prompt(prompt_at(9.0, Utc::now())).unwrap();

        // Only today's prompt counts toward the average
        let stats = store.daily_stats();
        assert!((stats.avg_score - 9.0).abs() < f64::EPSILON);
    }

    #[test]
    fn clear_empties_history_and_stats() {
        let (kv, store) = store();
        store.add_prompt(prompt_at(5.0, Utc::now())).unwrap();
        store.clear().unwrap();

        assert!(store.history().is_empty());
        assert_eq!(store.daily_stats().analyzed_today, 0);
        let persisted: Vec<AnalyzedPrompt> =
            serde_json::from_str(&kv.get(KEY_PROMPT_HISTORY).unwrap().unwrap()).unwrap();
        assert!(persisted.is_empty());
    }

    #[test]
    fn survives_restart() {
        let kv: Arc<MemoryKeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        {
            let store = PromptHistoryStore::new(kv.clone());
            store.initialize().unwrap();
            store.add_prompt(prompt_at(7.5, Utc::now())).unwrap();
        }

        let store = PromptHistoryStore::new(kv);
        store.initialize().unwrap();
        assert_eq!(store.history().len(), 1);
        assert!((store.history()[0].score - 7.5).abs() < f64::EPSILON);
    }
}
