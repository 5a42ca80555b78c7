//! Embedding service with multi-provider fallback.
//!
//! Supports Gemini, OpenAI, and Ollama embedding APIs with automatic fallback
//! when rate limits are hit or providers fail. When no provider is configured
//! every call fails with [`Error::NotConfigured`], which callers can tell
//! apart from a provider failure.
//!
//! # Example
//!
//! ```no_run
//! use recall_embeddings::{EmbeddingService, EmbeddingConfig, EmbeddingProviderConfig};
//!
//! # async fn example() -> Result<(), recall_embeddings::Error> {
//! let config = EmbeddingConfig {
//!     providers: vec![
//!         EmbeddingProviderConfig {
//!             name: "gemini".to_string(),
//!             base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
//!             model: "text-embedding-004".to_string(),
//!             api_key: "your-api-key".to_string(),
//!             priority: 1,
//!         },
//!     ],
//!     dimension: 768,
//! };
//!
//! let service = EmbeddingService::from_config(&config)?;
//! let vector = service.embed("Acme Corp has a budget of $50,000").await?;
//! assert_eq!(vector.len(), service.dimension());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Maximum retries per provider before fallback
const MAX_RETRIES: u32 = 2;

/// Delay between retries (doubles each time)
const RETRY_DELAY_MS: u64 = 500;

// ============================================================================
// Error types
// ============================================================================

/// Errors that can occur in the embedding service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Internal error (HTTP client, parsing, etc.)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Provider API error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider returned 429
    #[error("Rate limit exceeded")]
    RateLimited,

    /// No provider configured at all
    #[error("No embedding providers configured")]
    NotConfigured,

    /// All providers failed
    #[error("All embedding providers failed")]
    AllProvidersFailed,
}

impl Error {
    /// True when the service has no providers, as opposed to a failed call.
    pub fn is_not_configured(&self) -> bool {
        matches!(self, Error::NotConfigured)
    }
}

/// Result type for embedding operations.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Configuration types
// ============================================================================

/// Configuration for the embedding service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// List of embedding providers.
    pub providers: Vec<EmbeddingProviderConfig>,
    /// Dimension every returned vector must have.
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            dimension: 768,
        }
    }
}

/// Configuration for a single embedding provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingProviderConfig {
    /// Provider name (e.g., "gemini", "openai", "ollama").
    pub name: String,
    /// Base URL for the API.
    pub base_url: String,
    /// Model name to use.
    pub model: String,
    /// API key for authentication. Empty for Ollama.
    pub api_key: String,
    /// Priority (lower = higher priority).
    pub priority: u8,
}

// ============================================================================
// Default values
// ============================================================================

/// Get default endpoint for a provider.
pub fn default_endpoint(name: &str) -> String {
    match name {
        "gemini" => "https://generativelanguage.googleapis.com/v1beta".to_string(),
        "ollama" => "http://localhost:11434".to_string(),
        _ => "https://api.openai.com/v1".to_string(),
    }
}

/// Get default model for a provider.
pub fn default_model(name: &str) -> String {
    match name {
        "gemini" => "text-embedding-004".to_string(),
        "ollama" => "nomic-embed-text".to_string(),
        _ => "text-embedding-3-small".to_string(),
    }
}

/// Get default dimension for a model.
pub fn default_dimension(model: &str) -> usize {
    if model.contains("text-embedding-004") || model.contains("embedding-001") {
        768
    } else if model.contains("text-embedding-3-small") || model.contains("text-embedding-ada-002") {
        1536
    } else if model.contains("text-embedding-3-large") {
        3072
    } else if model.contains("nomic-embed-text") || model.contains("mpnet") {
        768
    } else if model.contains("mxbai-embed-large") || model.contains("bge-large") {
        1024
    } else {
        384
    }
}

// ============================================================================
// Provider wire formats
// ============================================================================

/// Embedding APIs this service knows how to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderKind {
    Gemini,
    OpenAi,
    Ollama,
}

impl ProviderKind {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "gemini" => Some(Self::Gemini),
            "openai" => Some(Self::OpenAi),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Provider {
    kind: ProviderKind,
    config: EmbeddingProviderConfig,
}

impl Provider {
    fn name(&self) -> &str {
        &self.config.name
    }

    /// URL, optional bearer token and JSON body for one text.
    fn request(&self, text: &str, dimension: usize) -> (String, Option<&str>, Value) {
        let c = &self.config;
        match self.kind {
            ProviderKind::Gemini => (
                format!("{}/models/{}:embedContent?key={}", c.base_url, c.model, c.api_key),
                None,
                json!({
                    "model": format!("models/{}", c.model),
                    "content": { "parts": [{ "text": text }] }
                }),
            ),
            ProviderKind::OpenAi => (
                format!("{}/embeddings", c.base_url),
                Some(c.api_key.as_str()),
                json!({ "model": c.model, "input": text, "dimensions": dimension }),
            ),
            ProviderKind::Ollama => (
                format!("{}/api/embeddings", c.base_url),
                None,
                json!({ "model": c.model, "prompt": text }),
            ),
        }
    }

    /// Pull the vector out of a successful response body.
    fn vector(&self, body: Value) -> Result<Vec<f32>> {
        if let Some(message) = error_message(&body) {
            return Err(Error::Provider(format!("{}: {}", self.name(), message)));
        }

        let vector = match self.kind {
            ProviderKind::Gemini => body.pointer("/embedding/values"),
            ProviderKind::OpenAi => body.pointer("/data/0/embedding"),
            ProviderKind::Ollama => body.get("embedding"),
        };

        vector
            .cloned()
            .and_then(|v| serde_json::from_value::<Vec<f32>>(v).ok())
            .ok_or_else(|| Error::Internal(format!("No embedding in {} response", self.name())))
    }
}

/// Error text of a provider response, in any of the shapes the APIs use.
fn error_message(body: &Value) -> Option<String> {
    match body.get("error")? {
        Value::String(message) => Some(message.clone()),
        Value::Object(error) => Some(
            error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        ),
        _ => None,
    }
}

// ============================================================================
// Embedding service
// ============================================================================

/// Text embeddings with provider fallback.
///
/// Providers are tried in priority order; each gets a couple of retries on
/// rate limits and transient failures before the next one is tried.
#[derive(Clone)]
pub struct EmbeddingService {
    inner: Arc<EmbeddingServiceInner>,
}

struct EmbeddingServiceInner {
    providers: Vec<Provider>,
    dimension: usize,
    client: Client,
}

impl EmbeddingService {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let mut providers: Vec<Provider> = config
            .providers
            .iter()
            .filter_map(|p| match ProviderKind::parse(&p.name) {
                Some(kind) => Some(Provider {
                    kind,
                    config: EmbeddingProviderConfig {
                        base_url: p.base_url.trim_end_matches('/').to_string(),
                        ..p.clone()
                    },
                }),
                None => {
                    warn!(provider = %p.name, "Unknown embedding provider, ignoring it");
                    None
                }
            })
            .collect();
        providers.sort_by_key(|p| p.config.priority);

        if providers.is_empty() {
            warn!(
                dimension = config.dimension,
                "No embedding providers configured - vector search disabled"
            );
        } else {
            info!(
                providers = ?providers.iter().map(Provider::name).collect::<Vec<_>>(),
                dimension = config.dimension,
                "Embedding service initialized"
            );
        }

        Ok(Self {
            inner: Arc::new(EmbeddingServiceInner {
                providers,
                dimension: config.dimension,
                client,
            }),
        })
    }

    pub fn dimension(&self) -> usize {
        self.inner.dimension
    }

    /// Provider names in the order they are tried.
    pub fn providers(&self) -> Vec<String> {
        self.inner
            .providers
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn has_providers(&self) -> bool {
        !self.inner.providers.is_empty()
    }

    /// Embed one text with the first provider that answers.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.inner.providers.is_empty() {
            return Err(Error::NotConfigured);
        }

        let mut last_error = None;
        for provider in &self.inner.providers {
            match self.embed_with_retries(provider, text).await {
                Ok(vector) => return Ok(vector),
                Err(e) => {
                    warn!(provider = %provider.name(), error = %e, "Embedding provider failed, trying next");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(Error::AllProvidersFailed))
    }

    async fn embed_with_retries(&self, provider: &Provider, text: &str) -> Result<Vec<f32>> {
        let mut delay = Duration::from_millis(RETRY_DELAY_MS);
        let mut attempt = 1;

        loop {
            match self.call(provider, text).await {
                Ok(vector) => return self.check_dimension(provider, vector),
                Err(e) if attempt < MAX_RETRIES && is_retryable(&e) => {
                    debug!(provider = %provider.name(), attempt, delay_ms = delay.as_millis(), "Retrying embedding call");
                    sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn check_dimension(&self, provider: &Provider, vector: Vec<f32>) -> Result<Vec<f32>> {
        if vector.len() != self.inner.dimension {
            return Err(Error::Provider(format!(
                "{} returned {} dimensions, expected {}",
                provider.name(),
                vector.len(),
                self.inner.dimension
            )));
        }
        Ok(vector)
    }

    async fn call(&self, provider: &Provider, text: &str) -> Result<Vec<f32>> {
        let (url, bearer, body) = provider.request(text, self.inner.dimension);

        let mut request = self.inner.client.post(&url).json(&body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Internal(format!("{} request failed: {}", provider.name(), e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited);
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::Internal(format!("Failed to read {} response: {}", provider.name(), e)))?;

        let body = serde_json::from_str::<Value>(&text);
        if !status.is_success() {
            let message = body
                .ok()
                .and_then(|b| error_message(&b))
                .unwrap_or(text);
            return Err(Error::Provider(format!(
                "{} returned {}: {}",
                provider.name(),
                status,
                message
            )));
        }

        let body = body.map_err(|e| {
            Error::Internal(format!("Failed to parse {} response: {}", provider.name(), e))
        })?;
        provider.vector(body)
    }
}

/// Rate limits and transient upstream failures are worth another try.
fn is_retryable(error: &Error) -> bool {
    match error {
        Error::RateLimited => true,
        other => {
            let msg = other.to_string().to_lowercase();
            msg.contains("503") || msg.contains("timeout") || msg.contains("temporarily")
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(name: &str, base_url: &str, priority: u8) -> EmbeddingProviderConfig {
        EmbeddingProviderConfig {
            name: name.to_string(),
            base_url: base_url.to_string(),
            model: default_model(name),
            api_key: "test-key".to_string(),
            priority,
        }
    }

    #[tokio::test]
    async fn test_not_configured_is_distinguishable() {
        let service = EmbeddingService::from_config(&EmbeddingConfig::default()).unwrap();

        assert!(!service.has_providers());
        assert_eq!(service.dimension(), 768);
        let err = service.embed("hello").await.unwrap_err();
        assert!(err.is_not_configured());
    }

    #[tokio::test]
    async fn test_openai_embedding_requests_configured_dimension() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(body_partial_json(json!({ "dimensions": 4 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "embedding": [0.1, 0.2, 0.3, 0.4], "index": 0 }]
            })))
            .mount(&server)
            .await;

        let service = EmbeddingService::from_config(&EmbeddingConfig {
            providers: vec![provider("openai", &server.uri(), 1)],
            dimension: 4,
        })
        .unwrap();

        let vector = service.embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[tokio::test]
    async fn test_falls_back_to_ollama() {
        let failing = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal"))
            .mount(&failing)
            .await;

        let ollama = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embedding": [1.0, 0.0, 0.0]
            })))
            .mount(&ollama)
            .await;

        let service = EmbeddingService::from_config(&EmbeddingConfig {
            providers: vec![
                provider("ollama", &ollama.uri(), 3),
                provider("gemini", &failing.uri(), 1),
            ],
            dimension: 3,
        })
        .unwrap();

        assert_eq!(service.providers(), vec!["gemini", "ollama"]);
        assert_eq!(service.embed("hello").await.unwrap(), vec![1.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embedding": [1.0, 0.0]
            })))
            .mount(&server)
            .await;

        let service = EmbeddingService::from_config(&EmbeddingConfig {
            providers: vec![provider("ollama", &server.uri(), 1)],
            dimension: 3,
        })
        .unwrap();

        let err = service.embed("hello").await.unwrap_err();
        assert!(!err.is_not_configured());
        assert!(err.to_string().contains("expected 3"));
    }

    #[tokio::test]
    async fn test_provider_error_body_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "message": "API key not valid", "code": 400 }
            })))
            .mount(&server)
            .await;

        let service = EmbeddingService::from_config(&EmbeddingConfig {
            providers: vec![provider("gemini", &server.uri(), 1)],
            dimension: 768,
        })
        .unwrap();

        let err = service.embed("hello").await.unwrap_err();
        assert!(err.to_string().contains("API key not valid"));
    }

    #[test]
    fn test_unknown_providers_are_ignored() {
        let service = EmbeddingService::from_config(&EmbeddingConfig {
            providers: vec![provider("cohere", "http://localhost:1", 1)],
            dimension: 768,
        })
        .unwrap();

        assert!(!service.has_providers());
    }

    #[test]
    fn test_error_message_shapes() {
        assert_eq!(
            error_message(&json!({ "error": "model not found" })).as_deref(),
            Some("model not found")
        );
        assert_eq!(
            error_message(&json!({ "error": { "message": "quota" } })).as_deref(),
            Some("quota")
        );
        assert!(error_message(&json!({ "embedding": [1.0] })).is_none());
    }

    #[test]
    fn test_default_dimensions() {
        assert_eq!(default_dimension("text-embedding-004"), 768);
        assert_eq!(default_dimension("text-embedding-3-small"), 1536);
        assert_eq!(default_dimension("text-embedding-3-large"), 3072);
        assert_eq!(default_dimension("unknown-model"), 384);
    }

    #[test]
    fn test_default_endpoints() {
        assert_eq!(
            default_endpoint("gemini"),
            "https://generativelanguage.googleapis.com/v1beta"
        );
        assert_eq!(default_endpoint("openai"), "https://api.openai.com/v1");
        assert_eq!(default_endpoint("ollama"), "http://localhost:11434");
    }
}
