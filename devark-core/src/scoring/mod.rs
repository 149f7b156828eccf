//! Prompt scoring pipeline
//!
//! Scores a user prompt along five weighted dimensions by asking the active
//! LLM provider for a strict JSON object, parsing it defensively, and
//! caching the result by prompt fingerprint so identical prompts never pay
//! for a second provider call.

pub mod provider;

pub use provider::{
    GenerateRequest, GenerateResponse, LlmProvider, ProviderRegistry, ProviderStatus,
};

use crate::error::{Error, Result};
use crate::prompt;
use crate::types::{AnalyzedPrompt, PromptDetectedEvent, ScoreBreakdown, ScoreDimension};
use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rubric weights; must sum to 1.0.
pub const WEIGHT_SPECIFICITY: f64 = 0.20;
pub const WEIGHT_CONTEXT: f64 = 0.25;
pub const WEIGHT_INTENT: f64 = 0.25;
pub const WEIGHT_ACTIONABILITY: f64 = 0.15;
pub const WEIGHT_CONSTRAINTS: f64 = 0.15;

const CACHE_CAP: usize = 1_000;
const CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Narrative fields from the model are capped to this many characters.
const MAX_NARRATIVE_CHARS: usize = 500;

const SYSTEM_PROMPT: &str = "You are a prompt quality evaluator for AI coding assistants. \
Score the user's prompt on five dimensions, each 0-10: \
specificity (20%): names concrete files, functions, errors, or behaviors; \
context (25%): supplies the background the assistant needs; \
intent (25%): states the desired outcome unambiguously; \
actionability (15%): the assistant can act without guessing; \
constraints (15%): states limits, style, or scope where relevant. \
Return ONLY a JSON object of the form \
{\"specificity\": {\"score\": N, \"feedback\": \"...\"}, \
\"context\": {...}, \"intent\": {...}, \"actionability\": {...}, \
\"constraints\": {...}, \
\"improvedVersion\": \"a rewritten prompt\", \"improvedScore\": N}. \
No prose outside the JSON.";

const RETRY_REMINDER: &str = "Your previous reply was not valid JSON. \
Respond with ONLY the JSON object described above. No markdown fences, no commentary.";

/// A scored prompt, ready to merge into an [`AnalyzedPrompt`].
#[derive(Debug, Clone)]
pub struct ScoredPrompt {
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    pub improved_version: Option<String>,
    pub improved_score: Option<f64>,
    /// True when served from the fingerprint cache
    pub from_cache: bool,
}

struct CacheEntry {
    scored: ScoredPrompt,
    at: Instant,
}

/// Executes the scoring prompt and memoizes results by fingerprint.
pub struct ScoringPipeline {
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl ScoringPipeline {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAP).expect("nonzero cache cap"),
            )),
        }
    }

    /// Score one prompt through the given provider.
    ///
    /// Cache hits skip the provider entirely. A malformed response is
    /// retried once with a stricter reminder; a second failure surfaces as
    /// `Error::Llm` and nothing is cached.
    pub fn score(&self, provider: &dyn LlmProvider, text: &str) -> Result<ScoredPrompt> {
        let key = prompt::fingerprint(text);

        {
            let mut cache = self.cache.lock().expect("score cache lock");
            if let Some(entry) = cache.get(&key) {
                if entry.at.elapsed() < CACHE_TTL {
                    let mut scored = entry.scored.clone();
                    scored.from_cache = true;
                    return Ok(scored);
                }
                cache.pop(&key);
            }
        }

        let user = format!("Prompt to evaluate:\n{}", text);
        let first = provider.generate(&GenerateRequest {
            system: SYSTEM_PROMPT,
            user: &user,
            temperature: 0.2,
            max_tokens: 800,
        })?;

        let scored = match parse_score_response(&first.text) {
            Ok(scored) => scored,
            Err(first_err) => {
                tracing::debug!(error = %first_err, "Score parse failed, retrying with reminder");
                let retry_user = format!("{}\n\n{}", user, RETRY_REMINDER);
                let second = provider.generate(&GenerateRequest {
                    system: SYSTEM_PROMPT,
                    user: &retry_user,
                    temperature: 0.0,
                    max_tokens: 800,
                })?;
                parse_score_response(&second.text).map_err(|e| {
                    Error::Llm(format!("scoring response unparsable after retry: {e}"))
                })?
            }
        };

        let mut cache = self.cache.lock().expect("score cache lock");
        cache.put(
            key,
            CacheEntry {
                scored: scored.clone(),
                at: Instant::now(),
            },
        );
        Ok(scored)
    }

    /// Score a detected prompt into a persistable [`AnalyzedPrompt`].
    ///
    /// Returns `Ok(None)` when the event is annotated to skip scoring.
    pub fn analyze(
        &self,
        provider: &dyn LlmProvider,
        event: &PromptDetectedEvent,
    ) -> Result<Option<AnalyzedPrompt>> {
        if !event.should_score() {
            return Ok(None);
        }

        let scored = self.score(provider, &event.text)?;
        Ok(Some(AnalyzedPrompt {
            id: uuid::Uuid::new_v4().to_string(),
            text: event.text.clone(),
            truncated_text: AnalyzedPrompt::truncate_text(&event.text),
            score: scored.score,
            timestamp: event.timestamp,
            category_scores: None,
            breakdown: Some(scored.breakdown),
            improved_version: scored.improved_version,
            improved_score: scored.improved_score,
            source: Some(event.source),
            session_id: Some(event.session_id.clone()),
        }))
    }
}

impl Default for ScoringPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the model's JSON into a clamped, weighted breakdown.
fn parse_score_response(raw: &str) -> Result<ScoredPrompt> {
    let value = match serde_json::from_str::<Value>(raw) {
        Ok(v) => v,
        Err(_) => {
            let extracted = extract_json_object(raw)?;
            serde_json::from_str::<Value>(&extracted)?
        }
    };

    if !value.is_object() {
        return Err(Error::Llm("scoring response must be a JSON object".to_string()));
    }

    let breakdown = ScoreBreakdown {
        specificity: parse_dimension(&value, "specificity", WEIGHT_SPECIFICITY)?,
        context: parse_dimension(&value, "context", WEIGHT_CONTEXT)?,
        intent: parse_dimension(&value, "intent", WEIGHT_INTENT)?,
        actionability: parse_dimension(&value, "actionability", WEIGHT_ACTIONABILITY)?,
        constraints: parse_dimension(&value, "constraints", WEIGHT_CONSTRAINTS)?,
    };

    let improved_version = value
        .get("improvedVersion")
        .and_then(Value::as_str)
        .map(cap_narrative)
        .filter(|s| !s.is_empty());
    let improved_score = value
        .get("improvedScore")
        .and_then(Value::as_f64)
        .map(|s| s.clamp(0.0, 10.0));

    Ok(ScoredPrompt {
        score: breakdown.weighted_total(),
        breakdown,
        improved_version,
        improved_score,
        from_cache: false,
    })
}

/// One dimension: either a bare number or `{score, feedback}`.
fn parse_dimension(value: &Value, key: &str, weight: f64) -> Result<ScoreDimension> {
    let dim = value
        .get(key)
        .ok_or_else(|| Error::Llm(format!("scoring response missing `{}`", key)))?;

    let (score, feedback) = match dim {
        Value::Number(n) => (n.as_f64().unwrap_or(0.0), None),
        Value::Object(obj) => {
            let score = obj
                .get("score")
                .and_then(Value::as_f64)
                .ok_or_else(|| Error::Llm(format!("`{}` has no numeric score", key)))?;
            let feedback = obj
                .get("feedback")
                .and_then(Value::as_str)
                .map(cap_narrative)
                .filter(|s| !s.is_empty());
            (score, feedback)
        }
        _ => {
            return Err(Error::Llm(format!(
                "`{}` must be a number or an object",
                key
            )))
        }
    };

    Ok(ScoreDimension {
        score: score.clamp(0.0, 10.0),
        weight,
        feedback,
    })
}

fn cap_narrative(s: &str) -> String {
    let trimmed = s.trim();
    trimmed.chars().take(MAX_NARRATIVE_CHARS).collect()
}

/// Pull the outermost `{...}` from a reply that wrapped its JSON in prose
/// or markdown fences.
fn extract_json_object(raw: &str) -> Result<String> {
    let start = raw
        .find('{')
        .ok_or_else(|| Error::Llm("scoring response did not contain a JSON object".to_string()))?;
    let end = raw
        .rfind('}')
        .ok_or_else(|| Error::Llm("scoring response did not contain a JSON object".to_string()))?;
    if end <= start {
        return Err(Error::Llm("scoring response JSON bounds are invalid".to_string()));
    }
    Ok(raw[start..=end].to_string())
}
