//! Chat completion service with multi-provider fallback.
//!
//! Supports Gemini, Anthropic (Claude), OpenRouter, and OpenAI with automatic
//! fallback when rate limits are hit or providers fail. Both a one-shot
//! `complete` and a chunked `stream` variant are offered.

use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eventsource_stream::Eventsource;
use futures::future;
use futures::stream::{self, Stream, StreamExt};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Maximum retries per provider before fallback
const MAX_RETRIES: u32 = 2;

/// Delay between retries (doubles each time)
const RETRY_DELAY_MS: u64 = 500;

/// Minimum interval between health checks (to avoid costs)
const HEALTH_CHECK_INTERVAL_SECS: u64 = 60;

/// Number of consecutive errors before marking unavailable
const ERROR_THRESHOLD: u32 = 3;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Error types for the LLM service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("No providers configured")]
    NoProviders,

    #[error("Request failed: {0}")]
    Request(String),
}

/// Result type for LLM operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration for an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmProviderConfig {
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub priority: u8,
}

/// Configuration for the LLM service.
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub providers: Vec<LlmProviderConfig>,
}

/// Get default endpoint for a provider
pub fn default_endpoint(name: &str) -> String {
    match name {
        "gemini" => "https://generativelanguage.googleapis.com/v1beta".to_string(),
        "anthropic" => "https://api.anthropic.com/v1".to_string(),
        "openrouter" => "https://openrouter.ai/api/v1".to_string(),
        _ => "https://api.openai.com/v1".to_string(),
    }
}

/// Get default model for a provider
pub fn default_model(name: &str) -> String {
    match name {
        "gemini" => "gemini-1.5-flash".to_string(),
        "anthropic" => "claude-3-5-haiku-20241022".to_string(),
        "openrouter" => "meta-llama/llama-3-8b-instruct:free".to_string(),
        _ => "gpt-4o-mini".to_string(),
    }
}

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling options for a completion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 1024,
        }
    }
}

/// An item of a streamed completion. `Done` is always the last item of a
/// stream that finished normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Done,
}

/// Stream of completion chunks.
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;


#[derive(Debug, Clone)]
struct Provider {
    name: String,
    base_url: String,
    model: String,
    api_key: String,
}

impl From<&LlmProviderConfig> for Provider {
    fn from(config: &LlmProviderConfig) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

impl Provider {
    fn supports_sse(&self) -> bool {
        matches!(self.name.as_str(), "openai" | "openrouter")
    }
}

/// Service for chat completions with multi-provider fallback.
///
/// Tries providers in priority order, automatically falling back
/// on rate limits or failures.
#[derive(Clone)]
pub struct LlmService {
    inner: Arc<LlmServiceInner>,
}

struct LlmServiceInner {
    providers: Vec<Provider>,
    client: Client,
    /// Last error message from LLM call
    last_error: RwLock<Option<String>>,
    /// Consecutive error count
    error_count: AtomicU32,
    /// When we last checked health
    last_health_check: RwLock<Option<Instant>>,
}

/// Response from LLM API
#[derive(Debug, Deserialize)]
struct LlmResponse {
    choices: Option<Vec<Choice>>,
    candidates: Option<Vec<Candidate>>,     // Gemini format
    content: Option<Vec<AnthropicContent>>, // Anthropic format
    error: Option<LlmError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<Message>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: String,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: String,
}

#[derive(Debug, Deserialize)]
struct LlmError {
    message: String,
}

/// Streaming chunk in the OpenAI format
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

impl LlmService {
    /// Create LLM service from config.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Request(format!("Failed to create HTTP client: {}", e)))?;

        let mut sorted = config.providers.clone();
        sorted.sort_by_key(|p| p.priority);
        let providers: Vec<Provider> = sorted.iter().map(Provider::from).collect();

        info!(
            providers = ?providers.iter().map(|p| &p.name).collect::<Vec<_>>(),
            "LLM service initialized from config"
        );

        Ok(Self {
            inner: Arc::new(LlmServiceInner {
                providers,
                client,
                last_error: RwLock::new(None),
                error_count: AtomicU32::new(0),
                last_health_check: RwLock::new(None),
            }),
        })
    }

    /// Check if LLM service is available.
    /// Returns false if no providers configured OR if in error state.
    /// Rate-limits health checks to avoid costs (max once per 60s).
    pub async fn is_available(&self) -> bool {
        if self.inner.providers.is_empty() {
            return false;
        }

        let error_count = self.inner.error_count.load(Ordering::Relaxed);
        if error_count >= ERROR_THRESHOLD {
            let last_check = self.inner.last_health_check.read().await;
            if let Some(last) = *last_check {
                if last.elapsed().as_secs() < HEALTH_CHECK_INTERVAL_SECS {
                    return false;
                }
            }
            // Don't reset here - let the next successful call reset it
        }

        true
    }

    /// Whether any provider is configured at all.
    pub fn has_providers(&self) -> bool {
        !self.inner.providers.is_empty()
    }

    /// Get error info for status endpoint
    pub async fn get_error_info(&self) -> Option<(String, u32)> {
        let error = self.inner.last_error.read().await;
        error.as_ref().map(|msg| {
            let count = self.inner.error_count.load(Ordering::Relaxed);
            (msg.clone(), count)
        })
    }

    /// Get provider names in priority order
    pub fn providers(&self) -> Vec<String> {
        self.inner.providers.iter().map(|p| p.name.clone()).collect()
    }

    async fn record_error(&self, error: &str) {
        let mut last_error = self.inner.last_error.write().await;
        *last_error = Some(error.to_string());
        drop(last_error);

        self.inner.error_count.fetch_add(1, Ordering::Relaxed);

        let mut last_check = self.inner.last_health_check.write().await;
        *last_check = Some(Instant::now());
    }

    async fn clear_error(&self) {
        let mut last_error = self.inner.last_error.write().await;
        *last_error = None;
        drop(last_error);

        self.inner.error_count.store(0, Ordering::Relaxed);
    }

    /// Complete a conversation with automatic provider fallback.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String> {
        if self.inner.providers.is_empty() {
            return Err(Error::NoProviders);
        }

        let mut last_error = None;

        for provider in &self.inner.providers {
            match self.try_provider(provider, messages, options).await {
                Ok(response) => {
                    self.clear_error().await;
                    return Ok(response);
                }
                Err(e) => {
                    warn!(
                        provider = %provider.name,
                        error = %e,
                        "Provider failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        let error_msg = last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "All providers failed".to_string());
        self.record_error(&error_msg).await;

        Err(last_error.unwrap_or(Error::Llm("All providers failed".to_string())))
    }

    /// Stream a completion.
    ///
    /// OpenAI-compatible providers are streamed over server-sent events.
    /// Other providers are completed in one call and yielded as a single
    /// chunk. Fallback only happens before the first chunk is produced.
    pub async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionStream> {
        if self.inner.providers.is_empty() {
            return Err(Error::NoProviders);
        }

        let mut last_error = None;

        for provider in &self.inner.providers {
            let opened = if provider.supports_sse() {
                self.open_sse(provider, messages, options).await
            } else {
                self.try_provider(provider, messages, options)
                    .await
                    .map(single_chunk)
            };

            match opened {
                Ok(stream) => {
                    self.clear_error().await;
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        provider = %provider.name,
                        error = %e,
                        "Provider failed to stream, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        let error_msg = last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "All providers failed".to_string());
        self.record_error(&error_msg).await;

        Err(last_error.unwrap_or(Error::Llm("All providers failed".to_string())))
    }

    /// Try a specific provider with retries.
    async fn try_provider(
        &self,
        provider: &Provider,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String> {
        let mut delay = Duration::from_millis(RETRY_DELAY_MS);

        for attempt in 0..MAX_RETRIES {
            match self.call_provider(provider, messages, options).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if Self::is_retryable(&e) && attempt < MAX_RETRIES - 1 {
                        debug!(
                            provider = %provider.name,
                            attempt,
                            delay_ms = delay.as_millis(),
                            "Retrying after error"
                        );
                        sleep(delay).await;
                        delay *= 2;
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        Err(Error::Llm(format!(
            "Provider {} failed after {} retries",
            provider.name, MAX_RETRIES
        )))
    }

    /// Check if an error is retryable
    fn is_retryable(error: &Error) -> bool {
        let text = error.to_string();
        matches!(error, Error::RateLimitExceeded)
            || text.contains("rate limit")
            || text.contains("429")
            || text.contains("503")
            || text.contains("timeout")
    }

    fn request_for(
        &self,
        provider: &Provider,
        messages: &[ChatMessage],
        options: &CompletionOptions,
        stream: bool,
    ) -> RequestBuilder {
        let (url, mut body) = match provider.name.as_str() {
            "gemini" => build_gemini_request(provider, messages, options),
            "anthropic" => build_anthropic_request(provider, messages, options),
            _ => build_openai_request(provider, messages, options),
        };
        if stream {
            body["stream"] = json!(true);
        }

        let request = self
            .inner
            .client
            .post(&url)
            .header("Content-Type", "application/json");

        let request = match provider.name.as_str() {
            "gemini" => request,
            "anthropic" => request
                .header("x-api-key", &provider.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            _ => request.header("Authorization", format!("Bearer {}", provider.api_key)),
        };

        request.json(&body)
    }

    /// Make the actual API call to a provider.
    async fn call_provider(
        &self,
        provider: &Provider,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String> {
        debug!(
            provider = %provider.name,
            model = %provider.model,
            messages = messages.len(),
            "Calling LLM provider"
        );

        let response = self
            .request_for(provider, messages, options, false)
            .send()
            .await
            .map_err(|e| Error::Request(format!("Request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Request(format!("Failed to read response: {}", e)))?;

        if status.as_u16() == 429 {
            return Err(Error::RateLimitExceeded);
        }

        if !status.is_success() {
            return Err(Error::Llm(format!("Provider returned {}: {}", status, text)));
        }

        parse_response(&provider.name, &text)
    }

    async fn open_sse(
        &self,
        provider: &Provider,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<CompletionStream> {
        debug!(
            provider = %provider.name,
            model = %provider.model,
            "Opening completion stream"
        );

        let response = self
            .request_for(provider, messages, options, true)
            .send()
            .await
            .map_err(|e| Error::Request(format!("Request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(Error::RateLimitExceeded);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Llm(format!("Provider returned {}: {}", status, text)));
        }

        Ok(completion_events(response.bytes_stream()))
    }
}

fn single_chunk(text: String) -> CompletionStream {
    Box::pin(stream::iter(vec![
        Ok(StreamEvent::Delta(text)),
        Ok(StreamEvent::Done),
    ]))
}

/// Completion events from an OpenAI-style SSE body.
///
/// Each event's `data` carries a JSON chunk; `[DONE]` ends the stream. A
/// body that closes without the marker still ends with `Done`, an
/// interrupted one ends with the error.
fn completion_events<S, B, E>(bytes: S) -> CompletionStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let events = bytes
        .eventsource()
        .filter_map(|item| async move {
            match item {
                Ok(event) if event.data.trim() == "[DONE]" => Some(Ok(StreamEvent::Done)),
                Ok(event) => chunk_text(&event.data).map(|text| Ok(StreamEvent::Delta(text))),
                Err(e) => Some(Err(Error::Request(format!("Stream interrupted: {}", e)))),
            }
        })
        .chain(stream::once(async { Ok(StreamEvent::Done) }))
        .scan(false, |finished, item| {
            if *finished {
                return future::ready(None);
            }
            *finished = matches!(item, Ok(StreamEvent::Done) | Err(_));
            future::ready(Some(item))
        });

    Box::pin(events)
}

/// Text delta carried by one streamed chunk, `None` when it has none.
fn chunk_text(data: &str) -> Option<String> {
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            let text: String = chunk
                .choices
                .into_iter()
                .filter_map(|c| c.delta.and_then(|d| d.content))
                .collect();
            (!text.is_empty()).then_some(text)
        }
        Err(e) => {
            debug!(error = %e, "Skipping unparseable stream event");
            None
        }
    }
}

/// Build request for Gemini API
fn build_gemini_request(
    provider: &Provider,
    messages: &[ChatMessage],
    options: &CompletionOptions,
) -> (String, Value) {
    let url = format!(
        "{}/models/{}:generateContent?key={}",
        provider.base_url, provider.model, provider.api_key
    );

    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();

    let contents: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = if m.role == Role::Assistant { "model" } else { "user" };
            json!({ "role": role, "parts": [{ "text": m.content }] })
        })
        .collect();

    let mut body = json!({
        "contents": contents,
        "generationConfig": {
            "maxOutputTokens": options.max_tokens,
            "temperature": options.temperature
        }
    });

    if !system.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system.join("\n\n") }] });
    }

    (url, body)
}

/// Build request for OpenAI-compatible APIs (OpenAI, OpenRouter)
fn build_openai_request(
    provider: &Provider,
    messages: &[ChatMessage],
    options: &CompletionOptions,
) -> (String, Value) {
    let url = format!("{}/chat/completions", provider.base_url);

    let messages: Vec<Value> = messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect();

    let body = json!({
        "model": provider.model,
        "messages": messages,
        "max_tokens": options.max_tokens,
        "temperature": options.temperature
    });

    (url, body)
}

/// Build request for Anthropic Claude API
fn build_anthropic_request(
    provider: &Provider,
    messages: &[ChatMessage],
    options: &CompletionOptions,
) -> (String, Value) {
    let url = format!("{}/messages", provider.base_url);

    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();

    let turns: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect();

    let mut body = json!({
        "model": provider.model,
        "messages": turns,
        "max_tokens": options.max_tokens,
        "temperature": options.temperature
    });

    if !system.is_empty() {
        body["system"] = json!(system.join("\n\n"));
    }

    (url, body)
}

/// Parse response from different API formats
fn parse_response(provider: &str, text: &str) -> Result<String> {
    let response: LlmResponse = serde_json::from_str(text)
        .map_err(|e| Error::Llm(format!("Failed to parse response: {}", e)))?;

    if let Some(error) = response.error {
        return Err(Error::Llm(error.message));
    }

    // Try Anthropic format first
    if let Some(content) = response.content {
        if let Some(content_block) = content.first() {
            return Ok(content_block.text.clone());
        }
    }

    // Try Gemini format
    if let Some(candidates) = response.candidates {
        if let Some(candidate) = candidates.first() {
            if let Some(part) = candidate.content.parts.first() {
                return Ok(part.text.clone());
            }
        }
    }

    // Try OpenAI format
    if let Some(choices) = response.choices {
        if let Some(choice) = choices.first() {
            if let Some(message) = &choice.message {
                return Ok(message.content.clone());
            }
            if let Some(text) = &choice.text {
                return Ok(text.clone());
            }
        }
    }

    Err(Error::Llm(format!("No content in {} response", provider)))
}

/// The first `[` ... last `]` span of a model response, if any.
///
/// Models often wrap JSON in prose or code fences; the span is returned
/// as-is and left for the caller to parse.
pub fn extract_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(name: &str, base_url: &str, priority: u8) -> LlmProviderConfig {
        LlmProviderConfig {
            name: name.to_string(),
            base_url: base_url.to_string(),
            model: default_model(name),
            api_key: "test-key".to_string(),
            priority,
        }
    }

    fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("You extract facts."),
            ChatMessage::user("Acme Corp has a budget of $50,000"),
        ]
    }

    #[test]
    fn test_extract_json_array() {
        let text = "Here you go:\n```json\n[{\"type\":\"CLIENT_CONTEXT\"}]\n```";
        assert_eq!(
            extract_json_array(text),
            Some("[{\"type\":\"CLIENT_CONTEXT\"}]")
        );
        assert_eq!(extract_json_array("no json here"), None);
        assert_eq!(extract_json_array("] backwards ["), None);
    }

    #[test]
    fn test_default_endpoints() {
        assert_eq!(
            default_endpoint("gemini"),
            "https://generativelanguage.googleapis.com/v1beta"
        );
        assert_eq!(default_endpoint("anthropic"), "https://api.anthropic.com/v1");
        assert_eq!(default_endpoint("openai"), "https://api.openai.com/v1");
    }

    async fn collect_events(chunks: Vec<&'static str>) -> Vec<StreamEvent> {
        let bytes = stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, std::io::Error>(c.as_bytes().to_vec())),
        );
        completion_events(bytes).map(|e| e.unwrap()).collect().await
    }

    #[tokio::test]
    async fn test_events_split_across_chunks() {
        let events = collect_events(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\ndata: {\"choi",
            "ces\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        ])
        .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("Hel".to_string()),
                StreamEvent::Delta("lo".to_string()),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_multi_line_data_and_other_fields() {
        let events = collect_events(vec![
            ": keep-alive\n\n",
            "event: chunk\nid: 7\ndata: {\"choices\":\ndata: [{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{}}]}\n\n",
            "data: [DONE]\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n",
        ])
        .await;

        assert_eq!(events, vec![StreamEvent::Delta("Hi".to_string()), StreamEvent::Done]);
    }

    #[tokio::test]
    async fn test_stream_without_done_marker_still_finishes() {
        let events =
            collect_events(vec!["data: {\"choices\":[{\"delta\":{\"content\":\"cut\"}}]}\n\n"]).await;

        assert_eq!(events, vec![StreamEvent::Delta("cut".to_string()), StreamEvent::Done]);
    }

    #[test]
    fn test_anthropic_request_lifts_system_prompt() {
        let p = Provider::from(&provider("anthropic", "http://x", 1));
        let (url, body) = build_anthropic_request(&p, &conversation(), &CompletionOptions::default());

        assert_eq!(url, "http://x/messages");
        assert_eq!(body["system"], "You extract facts.");
        assert_eq!(body["messages"].as_array().map(|m| m.len()), Some(1));
    }

    #[test]
    fn test_gemini_request_maps_roles() {
        let p = Provider::from(&provider("gemini", "http://x", 1));
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ];
        let (_, body) = build_gemini_request(&p, &messages, &CompletionOptions::default());

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
    }

    #[tokio::test]
    async fn test_no_providers() {
        let service = LlmService::new(&LlmConfig::default()).unwrap();

        assert!(!service.is_available().await);
        let err = service
            .complete(&conversation(), &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoProviders));
    }

    #[tokio::test]
    async fn test_complete_openai() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .and(body_partial_json(json!({ "max_tokens": 256 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "[]" } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let service = LlmService::new(&LlmConfig {
            providers: vec![provider("openai", &server.uri(), 1)],
        })
        .unwrap();

        let options = CompletionOptions {
            temperature: 0.2,
            max_tokens: 256,
        };
        let text = service.complete(&conversation(), &options).await.unwrap();
        assert_eq!(text, "[]");
    }

    #[tokio::test]
    async fn test_falls_back_to_next_provider() {
        let failing = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&failing)
            .await;

        let healthy = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{ "type": "text", "text": "from anthropic" }]
            })))
            .mount(&healthy)
            .await;

        let service = LlmService::new(&LlmConfig {
            providers: vec![
                provider("anthropic", &healthy.uri(), 2),
                provider("openai", &failing.uri(), 1),
            ],
        })
        .unwrap();

        assert_eq!(service.providers(), vec!["openai", "anthropic"]);
        let text = service
            .complete(&conversation(), &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(text, "from anthropic");
        assert!(service.get_error_info().await.is_none());
    }

    #[tokio::test]
    async fn test_all_providers_fail_records_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let service = LlmService::new(&LlmConfig {
            providers: vec![provider("openai", &server.uri(), 1)],
        })
        .unwrap();

        assert!(service
            .complete(&conversation(), &CompletionOptions::default())
            .await
            .is_err());
        let (message, count) = service.get_error_info().await.unwrap();
        assert!(message.contains("400"));
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_stream_openai_sse() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\", world\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(json!({ "stream": true })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let service = LlmService::new(&LlmConfig {
            providers: vec![provider("openai", &server.uri(), 1)],
        })
        .unwrap();

        let events: Vec<StreamEvent> = service
            .stream(&conversation(), &CompletionOptions::default())
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("Hello".to_string()),
                StreamEvent::Delta(", world".to_string()),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_non_sse_provider_yields_single_chunk() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-1.5-flash:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [{ "text": "whole answer" }] } }]
            })))
            .mount(&server)
            .await;

        let service = LlmService::new(&LlmConfig {
            providers: vec![provider("gemini", &server.uri(), 1)],
        })
        .unwrap();

        let events: Vec<StreamEvent> = service
            .stream(&conversation(), &CompletionOptions::default())
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(
            events,
            vec![StreamEvent::Delta("whole answer".to_string()), StreamEvent::Done]
        );
    }
}
