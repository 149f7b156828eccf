//! LLM provider abstraction
//!
//! Three interchangeable backends execute the scoring prompt:
//!
//! - `ollama` — a local-host HTTP model server
//! - `openrouter` — a hosted key-router over many models (BYOK)
//! - `anthropic` — the cloud SaaS API (BYOK)
//!
//! Providers expose a synchronous surface; each HTTP implementation owns a
//! current-thread runtime and blocks on its requests, so callers never need
//! an async context.

use crate::config::{ConfigStore, ProviderSettings};
use crate::error::{Error, Result};
use crate::store::token::TokenStore;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::json;
use std::time::Duration;

pub const PROVIDER_OLLAMA: &str = "ollama";
pub const PROVIDER_OPENROUTER: &str = "openrouter";
pub const PROVIDER_ANTHROPIC: &str = "anthropic";

/// Default timeout for `generate` calls.
const GENERATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Short timeout for availability probes.
const DETECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Result of a provider availability check.
#[derive(Debug, Clone)]
pub struct ProviderStatus {
    pub available: bool,
    pub reason: Option<String>,
}

impl ProviderStatus {
    fn ok() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}

/// A completion request.
#[derive(Debug, Clone)]
pub struct GenerateRequest<'a> {
    pub system: &'a str,
    pub user: &'a str,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A completion response.
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub text: String,
    pub tokens_used: Option<u32>,
}

/// Interface implemented by every scoring backend.
pub trait LlmProvider: Send + Sync {
    /// Stable id used in config and the message protocol
    fn id(&self) -> &'static str;

    /// Cheap availability probe (key presence, server reachability)
    fn detect(&self) -> ProviderStatus;

    /// Models the backend can serve
    fn list_models(&self) -> Result<Vec<String>>;

    /// Execute one completion
    fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse>;
}

/// Blocking HTTP executor shared by the provider implementations.
struct HttpExecutor {
    runtime: tokio::runtime::Runtime,
    http: reqwest::Client,
}

impl HttpExecutor {
    fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Llm(format!("failed to build tokio runtime: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(GENERATE_TIMEOUT)
            .build()
            .map_err(|e| Error::Llm(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { runtime, http })
    }

    /// POST JSON and return the parsed body, mapping HTTP failures to
    /// `Error::Llm` with enough detail for retry classification.
    fn post_json(
        &self,
        url: &str,
        headers: HeaderMap,
        body: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.runtime.block_on(async {
            let resp = self
                .http
                .post(url)
                .headers(headers)
                .json(&body)
                .send()
                .await
                .map_err(|e| Error::Llm(format!("request failed: {e}")))?;
            let status = resp.status();
            let text = resp
                .text()
                .await
                .map_err(|e| Error::Llm(format!("read body failed: {e}")))?;
            if !status.is_success() {
                return Err(Error::Llm(format!(
                    "API error ({}): {}",
                    status.as_u16(),
                    text
                )));
            }
            serde_json::from_str(&text).map_err(Error::from)
        })
    }

    fn get_json(&self, url: &str, headers: HeaderMap, timeout: Duration) -> Result<serde_json::Value> {
        self.runtime.block_on(async {
            let resp = self
                .http
                .get(url)
                .headers(headers)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| Error::Llm(format!("request failed: {e}")))?;
            let status = resp.status();
            let text = resp
                .text()
                .await
                .map_err(|e| Error::Llm(format!("read body failed: {e}")))?;
            if !status.is_success() {
                return Err(Error::Llm(format!(
                    "API error ({}): {}",
                    status.as_u16(),
                    text
                )));
            }
            serde_json::from_str(&text).map_err(Error::from)
        })
    }
}

fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

// ============================================
// Ollama (local model server)
// ============================================

pub struct OllamaProvider {
    endpoint: String,
    model: String,
    exec: HttpExecutor,
}

impl OllamaProvider {
    pub const DEFAULT_ENDPOINT: &'static str = "http://localhost:11434";
    pub const DEFAULT_MODEL: &'static str = "llama3.2";

    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        Ok(Self {
            endpoint: settings
                .endpoint
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
            exec: HttpExecutor::new()?,
        })
    }
}

impl LlmProvider for OllamaProvider {
    fn id(&self) -> &'static str {
        PROVIDER_OLLAMA
    }

    fn detect(&self) -> ProviderStatus {
        let url = format!("{}/api/tags", self.endpoint);
        match self.exec.get_json(&url, json_headers(), DETECT_TIMEOUT) {
            Ok(_) => ProviderStatus::ok(),
            Err(e) => ProviderStatus::unavailable(format!("server not reachable: {e}")),
        }
    }

    fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.endpoint);
        let body = self.exec.get_json(&url, json_headers(), DETECT_TIMEOUT)?;
        Ok(body
            .get("models")
            .and_then(|v| v.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse> {
        let url = format!("{}/api/generate", self.endpoint);
        let body = self.exec.post_json(
            &url,
            json_headers(),
            json!({
                "model": self.model,
                "prompt": format!("{}\n\n{}", req.system, req.user),
                "stream": false,
                "options": {
                    "temperature": req.temperature,
                    "num_predict": req.max_tokens,
                },
            }),
        )?;
        let text = body
            .get("response")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Llm("ollama response missing string field `response`".to_string()))?;
        Ok(GenerateResponse {
            text,
            tokens_used: body
                .get("eval_count")
                .and_then(|v| v.as_u64())
                .map(|n| n as u32),
        })
    }
}

// ============================================
// OpenRouter (hosted key-router)
// ============================================

pub struct OpenRouterProvider {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    exec: HttpExecutor,
}

impl OpenRouterProvider {
    pub const DEFAULT_ENDPOINT: &'static str = "https://openrouter.ai/api";
    pub const DEFAULT_MODEL: &'static str = "openai/gpt-4o-mini";

    pub fn new(settings: &ProviderSettings, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            endpoint: settings
                .endpoint
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
            api_key,
            exec: HttpExecutor::new()?,
        })
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| Error::Auth("openrouter api key not configured".to_string()))?;
        let mut headers = json_headers();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| Error::Llm(format!("invalid auth header: {e}")))?,
        );
        Ok(headers)
    }
}

impl LlmProvider for OpenRouterProvider {
    fn id(&self) -> &'static str {
        PROVIDER_OPENROUTER
    }

    fn detect(&self) -> ProviderStatus {
        if self.api_key.is_some() {
            ProviderStatus::ok()
        } else {
            ProviderStatus::unavailable("api key not configured")
        }
    }

    fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/v1/models", self.endpoint);
        let body = self.exec.get_json(&url, self.auth_headers()?, DETECT_TIMEOUT)?;
        Ok(body
            .get("data")
            .and_then(|v| v.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(|n| n.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse> {
        let url = format!("{}/v1/chat/completions", self.endpoint);
        let body = self.exec.post_json(
            &url,
            self.auth_headers()?,
            json!({
                "model": self.model,
                "temperature": req.temperature,
                "max_tokens": req.max_tokens,
                "messages": [
                    { "role": "system", "content": req.system },
                    { "role": "user", "content": req.user },
                ],
            }),
        )?;
        let text = body
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Llm("openrouter response missing choices[0].message.content".to_string())
            })?;
        Ok(GenerateResponse {
            text,
            tokens_used: body
                .get("usage")
                .and_then(|u| u.get("total_tokens"))
                .and_then(|v| v.as_u64())
                .map(|n| n as u32),
        })
    }
}

// ============================================
// Anthropic (cloud SaaS API)
// ============================================

pub struct AnthropicProvider {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    exec: HttpExecutor,
}

impl AnthropicProvider {
    pub const DEFAULT_ENDPOINT: &'static str = "https://api.anthropic.com";
    pub const DEFAULT_MODEL: &'static str = "claude-sonnet-4-5";

    pub fn new(settings: &ProviderSettings, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            endpoint: settings
                .endpoint
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
            api_key,
            exec: HttpExecutor::new()?,
        })
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| Error::Auth("anthropic api key not configured".to_string()))?;
        let mut headers = json_headers();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(key)
                .map_err(|e| Error::Llm(format!("invalid api key header: {e}")))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        Ok(headers)
    }
}

impl LlmProvider for AnthropicProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ANTHROPIC
    }

    fn detect(&self) -> ProviderStatus {
        if self.api_key.is_some() {
            ProviderStatus::ok()
        } else {
            ProviderStatus::unavailable("api key not configured")
        }
    }

    fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/v1/models", self.endpoint);
        let body = self.exec.get_json(&url, self.auth_headers()?, DETECT_TIMEOUT)?;
        Ok(body
            .get("data")
            .and_then(|v| v.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(|n| n.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse> {
        let url = format!("{}/v1/messages", self.endpoint);
        let body = self.exec.post_json(
            &url,
            self.auth_headers()?,
            json!({
                "model": self.model,
                "max_tokens": req.max_tokens,
                "temperature": req.temperature,
                "system": req.system,
                "messages": [{ "role": "user", "content": req.user }],
            }),
        )?;
        let text = body
            .get("content")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|b| b.get("text"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::Llm("anthropic response missing content[0].text".to_string()))?;
        let tokens_used = body.get("usage").and_then(|u| {
            let input = u.get("input_tokens").and_then(|v| v.as_u64())?;
            let output = u.get("output_tokens").and_then(|v| v.as_u64())?;
            Some((input + output) as u32)
        });
        Ok(GenerateResponse { text, tokens_used })
    }
}

// ============================================
// Registry
// ============================================

/// Holds the configured providers and routes to the active one.
///
/// `active_provider` and per-provider settings persist through the config
/// store; API keys resolve through the token store (`apiKeyRef = "vault"`)
/// or an environment variable named by `apiKeyRef`.
pub struct ProviderRegistry {
    providers: Vec<Box<dyn LlmProvider>>,
    config: ConfigStore,
}

impl ProviderRegistry {
    /// Build the standard three providers from config and the token vault.
    pub fn from_config(config: ConfigStore, tokens: &TokenStore) -> Result<Self> {
        let snapshot = config.get();
        let settings = |id: &str| snapshot.providers.get(id).cloned().unwrap_or_default();

        let openrouter_settings = settings(PROVIDER_OPENROUTER);
        let anthropic_settings = settings(PROVIDER_ANTHROPIC);

        let openrouter_key =
            resolve_api_key(&openrouter_settings, tokens, "OPENROUTER_API_KEY");
        let anthropic_key = resolve_api_key(&anthropic_settings, tokens, "ANTHROPIC_API_KEY");

        let providers: Vec<Box<dyn LlmProvider>> = vec![
            Box::new(OllamaProvider::new(&settings(PROVIDER_OLLAMA))?),
            Box::new(OpenRouterProvider::new(&openrouter_settings, openrouter_key)?),
            Box::new(AnthropicProvider::new(&anthropic_settings, anthropic_key)?),
        ];

        Ok(Self { providers, config })
    }

    /// Registry over injected providers (for tests).
    pub fn with_providers(config: ConfigStore, providers: Vec<Box<dyn LlmProvider>>) -> Self {
        Self { providers, config }
    }

    pub fn get(&self, id: &str) -> Option<&dyn LlmProvider> {
        self.providers
            .iter()
            .find(|p| p.id() == id)
            .map(|p| p.as_ref())
    }

    /// The provider to use: the configured one, else the first that
    /// detects as available.
    pub fn active(&self) -> Result<&dyn LlmProvider> {
        if let Some(id) = self.config.get().active_provider {
            return self
                .get(&id)
                .ok_or_else(|| Error::Config(format!("unknown provider: {}", id)));
        }

        self.providers
            .iter()
            .find(|p| p.detect().available)
            .map(|p| p.as_ref())
            .ok_or_else(|| Error::Llm("no LLM provider available".to_string()))
    }

    /// Persist the active provider choice.
    pub fn set_active(&self, id: &str) -> Result<()> {
        if self.get(id).is_none() {
            return Err(Error::InvalidInput(format!("unknown provider: {}", id)));
        }
        self.config
            .update(|c| c.active_provider = Some(id.to_string()))?;
        Ok(())
    }

    /// Availability of every registered provider.
    pub fn detect_all(&self) -> Vec<(String, ProviderStatus)> {
        self.providers
            .iter()
            .map(|p| (p.id().to_string(), p.detect()))
            .collect()
    }
}

fn resolve_api_key(
    settings: &ProviderSettings,
    tokens: &TokenStore,
    default_env: &str,
) -> Option<String> {
    match settings.api_key_ref.as_deref() {
        Some("vault") => tokens.get_token(),
        Some(env_name) => std::env::var(env_name).ok(),
        None => std::env::var(default_env).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_store(dir: &TempDir) -> ConfigStore {
        ConfigStore::open(&dir.path().join("config.json")).unwrap()
    }

    struct StubProvider {
        id: &'static str,
        available: bool,
    }

    impl LlmProvider for StubProvider {
        fn id(&self) -> &'static str {
            self.id
        }
        fn detect(&self) -> ProviderStatus {
            if self.available {
                ProviderStatus::ok()
            } else {
                ProviderStatus::unavailable("stubbed out")
            }
        }
        fn list_models(&self) -> Result<Vec<String>> {
            Ok(vec![format!("{}-model", self.id)])
        }
        fn generate(&self, _req: &GenerateRequest) -> Result<GenerateResponse> {
            Ok(GenerateResponse {
                text: "{}".to_string(),
                tokens_used: None,
            })
        }
    }

    #[test]
    fn active_prefers_configured_provider() {
        let dir = TempDir::new().unwrap();
        let config = config_store(&dir);
        config
            .update(|c| c.active_provider = Some("anthropic".to_string()))
            .unwrap();

        let registry = ProviderRegistry::with_providers(
            config,
            vec![
                Box::new(StubProvider {
                    id: "ollama",
                    available: true,
                }),
                Box::new(StubProvider {
                    id: "anthropic",
                    available: false,
                }),
            ],
        );
        assert_eq!(registry.active().unwrap().id(), "anthropic");
    }

    #[test]
    fn active_falls_back_to_first_available() {
        let dir = TempDir::new().unwrap();
        let registry = ProviderRegistry::with_providers(
            config_store(&dir),
            vec![
                Box::new(StubProvider {
                    id: "ollama",
                    available: false,
                }),
                Box::new(StubProvider {
                    id: "openrouter",
                    available: true,
                }),
            ],
        );
        assert_eq!(registry.active().unwrap().id(), "openrouter");
    }

    #[test]
    fn set_active_rejects_unknown_ids() {
        let dir = TempDir::new().unwrap();
        let registry = ProviderRegistry::with_providers(
            config_store(&dir),
            vec![Box::new(StubProvider {
                id: "ollama",
                available: true,
            })],
        );
        assert!(matches!(
            registry.set_active("made-up"),
            Err(Error::InvalidInput(_))
        ));
        registry.set_active("ollama").unwrap();
        assert_eq!(registry.active().unwrap().id(), "ollama");
    }

    #[test]
    fn detect_all_reports_every_provider() {
        let dir = TempDir::new().unwrap();
        let registry = ProviderRegistry::with_providers(
            config_store(&dir),
            vec![
                Box::new(StubProvider {
                    id: "ollama",
                    available: true,
                }),
                Box::new(StubProvider {
                    id: "anthropic",
                    available: false,
                }),
            ],
        );
        let statuses = registry.detect_all();
        assert_eq!(statuses.len(), 2);
        assert!(statuses[0].1.available);
        assert!(!statuses[1].1.available);
        assert!(statuses[1].1.reason.is_some());
    }
}
